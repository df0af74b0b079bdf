use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use tessera_core::network::Message;
use tessera_core::utils::Saveable;
use tessera_core::{
    Block, BlockHeader, ChainLinked, Consensus, ConsensusSelector, LedgerError, LedgerResult,
};
use tokio::net::TcpStream;
use tokio::time;
use uuid::Uuid;

use crate::node::Node;

/// One request/reply round trip with a single peer, bounded by `timeout`.
pub async fn request(peer: &str, message: &Message, timeout: Duration) -> Result<Message> {
    let mut stream = time::timeout(timeout, TcpStream::connect(peer))
        .await
        .with_context(|| format!("Timeout connecting to {}", peer))?
        .with_context(|| format!("Failed to connect to {}", peer))?;

    time::timeout(timeout, async {
        message.send_async(&mut stream).await?;
        Message::receive_async(&mut stream).await
    })
    .await
    .with_context(|| format!("Timeout waiting for {}", peer))?
    .with_context(|| format!("Exchange with {} failed", peer))
}

/// Asks every peer in turn and keeps one slot per peer. Peers that time out,
/// fail or answer with the wrong message count as having no answer. When not
/// a single exchange succeeded the result is `PeerUnavailable`.
pub async fn query_peers<T, F>(
    peers: &[String],
    message: &Message,
    timeout: Duration,
    extract: F,
) -> LedgerResult<Vec<Option<T>>>
where
    F: Fn(Message) -> Option<T>,
{
    let mut replies = Vec::with_capacity(peers.len());
    let mut reachable = 0;
    for peer in peers {
        debug!("Querying {} with {:?}", peer, message);
        let reply = match request(peer, message, timeout).await {
            Ok(reply) => {
                reachable += 1;
                extract(reply)
            }
            Err(e) => {
                warn!("{:#}", e);
                None
            }
        };
        replies.push(reply);
    }

    if reachable == 0 {
        return Err(LedgerError::PeerUnavailable);
    }
    Ok(replies)
}

/// Asks all peers the same question and settles on one answer.
pub async fn fetch_with_consensus<T, F>(
    node: &Node,
    message: Message,
    extract: F,
) -> LedgerResult<Consensus<T>>
where
    T: ChainLinked + PartialEq + Clone,
    F: Fn(Message) -> Option<T>,
{
    let replies = query_peers(
        &node.peers,
        &message,
        node.params.peer_query_timeout(),
        extract,
    )
    .await?;
    let chain = node.chain.read().await;
    let outcome = ConsensusSelector::new(&*chain).select(&replies);
    debug!(
        "{} of {} peers answered {:?}",
        replies.iter().flatten().count(),
        replies.len(),
        message
    );
    Ok(outcome)
}

pub async fn fetch_block(node: &Node, number: u64) -> LedgerResult<Consensus<Block>> {
    fetch_with_consensus(node, Message::FetchBlockByNumber(number), |reply| match reply {
        Message::BlockReply(block) => block,
        _ => None,
    })
    .await
}

pub async fn fetch_head(node: &Node) -> LedgerResult<Consensus<BlockHeader>> {
    fetch_with_consensus(node, Message::FetchHead, |reply| match reply {
        Message::HeadReply(header) => header,
        _ => None,
    })
    .await
}

/// Pulls blocks past the local head from peers until they run out or send
/// something that doesn't validate. Returns how many blocks were added.
pub async fn sync_from_peers(node: &Node) -> Result<u64> {
    if node.peers.is_empty() {
        info!("No peers given, starting from the local chain.");
        return Ok(0);
    }

    match fetch_head(node).await {
        Ok(remote) => {
            if let Some(head) = remote.value() {
                info!("Peers report head at block #{}", head.block_number());
            }
        }
        Err(e) => {
            warn!("Skipping sync: {}", e);
            return Ok(0);
        }
    }

    let mut added = 0;
    loop {
        let next = node.chain.read().await.height();
        let block = match fetch_block(node, next).await {
            Ok(outcome) => outcome.into_value(),
            Err(e) => {
                warn!("Stopping sync at block #{}: {}", next, e);
                None
            }
        };
        let Some(block) = block else {
            debug!("No peer has block #{}", next);
            break;
        };
        if let Err(reason) = node.accept_block(block, false).await {
            warn!("Block #{} from peers failed validation: {}", next, reason);
            break;
        }
        added += 1;
    }

    info!("Synchronized {} block(s) from peers", added);
    Ok(added)
}

/// Checks a peer is alive; the reply must echo the ping's id.
pub async fn ping(peer: &str, timeout: Duration) -> Result<Duration> {
    let id = Uuid::new_v4();
    let started = time::Instant::now();
    match request(peer, &Message::Ping(id), timeout).await? {
        Message::Pong(echoed) if echoed == id => Ok(started.elapsed()),
        other => Err(anyhow!("Unexpected ping reply from {}: {:?}", peer, other)),
    }
}

/// Sends `message` to every peer, logging instead of failing.
pub async fn broadcast(peers: &[String], message: Message, timeout: Duration) {
    for peer in peers {
        match request(peer, &message, timeout).await {
            Ok(Message::BlockRejected(reason)) | Ok(Message::TransactionRejected(reason)) => {
                warn!("{} rejected broadcast: {}", peer, reason)
            }
            Ok(_) => debug!("Broadcast delivered to {}", peer),
            Err(e) => warn!("Failed to broadcast to {}: {:#}", peer, e),
        }
    }
}

pub async fn save(node: Arc<Node>, path: String) {
    let mut interval = time::interval(time::Duration::from_secs(15));
    loop {
        interval.tick().await;
        if let Err(e) = save_now(&node, &path).await {
            error!("Failed to save chain to {}: {:#}", path, e);
        }
    }
}

pub async fn save_now(node: &Node, path: &str) -> Result<()> {
    let chain = node.chain.read().await;
    chain
        .save_to_file(path)
        .with_context(|| format!("Failed to save chain to {}", path))?;
    debug!("Saved {} block(s) to {}", chain.height(), path);
    Ok(())
}
