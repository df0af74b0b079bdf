use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use tessera_core::network::Message;
use tokio::time;

use crate::node::Node;
use crate::utils;

/// How often the monitor looks at a placeholder-only search.
const MONITOR_PERIOD: Duration = Duration::from_secs(5);

/// Appends every block the local searches find, announces it to peers and
/// starts mining the next one.
pub async fn run(node: Arc<Node>) -> Result<()> {
    let found = node
        .found_blocks()
        .ok_or_else(|| anyhow!("node was started without a miner"))?;
    node.restart_mining().await?;

    while let Ok(block) = found.recv_async().await {
        let number = block.block_number();
        match node.accept_block(block.clone(), true).await {
            Ok(()) => {
                info!("Mined block #{} ({})", number, block.hash());
                let peers = node.peers.clone();
                let timeout = node.params.peer_query_timeout();
                tokio::spawn(async move {
                    utils::broadcast(&peers, Message::NewBlock(block), timeout).await;
                });
            }
            // A peer's block for the same height got in first.
            Err(reason) => warn!("Discarding mined block #{}: {}", number, reason),
        }

        if let Err(e) = node.restart_mining().await {
            error!("Failed to start the next search: {:#}", e);
        }
    }
    Ok(())
}

/// Swaps a placeholder-only search for a real one once transactions arrive,
/// or refreshes it after it has run for too long.
pub async fn monitor_placeholder(node: Arc<Node>) {
    let mut interval = time::interval(MONITOR_PERIOD);
    loop {
        interval.tick().await;
        if node.placeholder_needs_restart().await {
            info!(
                "Restarting placeholder search ({} transaction(s) pending)",
                node.pending.len()
            );
            if let Err(e) = node.restart_mining().await {
                error!("Failed to restart placeholder search: {:#}", e);
            }
        }
    }
}
