use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tessera_core::network::Message;
use tessera_core::{ChainStorage, CompactBlock};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::node::Node;

pub async fn handle_connection<S>(node: Arc<Node>, mut socket: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = match Message::receive_async(&mut socket).await {
            Ok(message) => message,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("Peer disconnected.");
                return Ok(());
            }
            Err(e) => {
                warn!("Error receiving message from peer: {}, closing connection.", e);
                return Err(anyhow::Error::new(e).context("Error receiving message"));
            }
        };

        let Some(reply) = respond(&node, message).await else {
            return Ok(());
        };
        reply
            .send_async(&mut socket)
            .await
            .context("Failed to send reply")?;
    }
}

/// The reply to one request. `None` closes the connection.
async fn respond(node: &Arc<Node>, message: Message) -> Option<Message> {
    use tessera_core::network::Message::*;
    match message {
        FetchBlockByNumber(number) => {
            let chain = node.chain.read().await;
            Some(BlockReply(chain.block_by_number(number)))
        }
        FetchBlockByHash(hash) => {
            let chain = node.chain.read().await;
            Some(BlockReply(chain.block_by_hash(&hash).cloned()))
        }
        FetchHead => {
            let chain = node.chain.read().await;
            Some(HeadReply(chain.head().map(|b| b.header().clone())))
        }
        FetchCompactBlock {
            block_number,
            transaction,
        } => {
            let chain = node.chain.read().await;
            let compact = chain
                .block_by_number(block_number)
                .and_then(|block| CompactBlock::from_block(&block, &transaction).ok());
            Some(CompactBlockReply(compact))
        }
        NewBlock(block) => {
            let number = block.block_number();
            let hash = block.hash().clone();
            info!("Received block #{} ({})", number, hash);

            match node.accept_block(block, true).await {
                Ok(()) => {
                    if node.is_mining() {
                        if let Err(e) = node.restart_mining().await {
                            error!("Failed to restart mining after block #{}: {}", number, e);
                        }
                    }
                    Some(BlockAccepted)
                }
                Err(reason) => {
                    warn!("Block #{} ({}) rejected: {}", number, hash, reason);
                    Some(BlockRejected(reason))
                }
            }
        }
        NewTransaction(transaction) => match node.add_transaction(transaction) {
            Ok(_) => Some(TransactionAccepted),
            Err(e) => {
                warn!("Transaction rejected: {}", e);
                Some(TransactionRejected(e.to_string()))
            }
        },
        Ping(id) => Some(Pong(id)),
        BlockReply(_)
        | HeadReply(_)
        | CompactBlockReply(_)
        | BlockAccepted
        | BlockRejected(_)
        | TransactionAccepted
        | TransactionRejected(_)
        | Pong(_) => {
            warn!("Received unexpected message, closing connection.");
            None
        }
    }
}
