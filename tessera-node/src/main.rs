mod connection_handler;
mod miner;
mod node;
mod utils;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use log::{error, info, warn};
use tessera_core::utils::Saveable;
use tessera_core::{Block, ChainParams, MemoryChain, MiningCoordinator};
use tokio::net::TcpListener;

use crate::node::Node;

#[derive(FromArgs)]
/// A Tessera ledger full node
struct Args {
    #[argh(option, default = "9000")]
    /// port number
    port: u16,

    #[argh(option, default = "String::from(\"./tessera.toml\")")]
    /// chain parameter file location
    config: String,

    #[argh(option, default = "String::from(\"./chain.json\")")]
    /// chain file location
    chain_file: String,

    #[argh(switch)]
    /// mine blocks on top of the local head
    mine: bool,

    #[argh(option, default = "String::from(\"tessera-node\")")]
    /// miner signature written into mined headers
    signature: String,

    #[argh(positional)]
    /// addresses of peer nodes
    peers: Vec<String>,
}

fn load_chain(path: &str, params: &ChainParams) -> Result<MemoryChain> {
    if Path::new(path).exists() {
        info!("Loading chain from {}.", path);
        let chain = MemoryChain::load_from_file(path)
            .with_context(|| format!("Failed to load chain from {}", path))?;
        let genesis = Block::genesis(params)?;
        if chain.blocks().first() != Some(&genesis) {
            anyhow::bail!(
                "Chain in {} does not start with the genesis block of {}",
                path,
                params.chain_name
            );
        }
        Ok(chain)
    } else {
        info!("Chain file not found at {}. Creating new genesis chain.", path);
        Ok(MemoryChain::with_genesis(Block::genesis(params)?)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();

    let params = ChainParams::load_from_file(&args.config)?;
    info!("Chain {} with parameters from {}", params.chain_name, args.config);
    let chain = load_chain(&args.chain_file, &params)?;

    let coordinator = args
        .mine
        .then(|| MiningCoordinator::new(params.clone(), args.signature.clone()));
    let node = Arc::new(Node::new(params, chain, args.peers, coordinator));

    for peer in &node.peers {
        match utils::ping(peer, node.params.peer_query_timeout()).await {
            Ok(latency) => info!("Peer {} is up ({:?})", peer, latency),
            Err(e) => warn!("Peer {} did not answer: {:#}", peer, e),
        }
    }
    utils::sync_from_peers(&node).await?;

    {
        let chain = node.chain.read().await;
        if let Some(head) = chain.head() {
            info!("Head is block #{} ({})", head.block_number(), head.hash());
        }
    }

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    tokio::spawn(utils::save(node.clone(), args.chain_file.clone()));

    if node.is_mining() {
        let mining_node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = miner::run(mining_node).await {
                error!("Miner stopped: {:#}", e);
            }
        });
        tokio::spawn(miner::monitor_placeholder(node.clone()));
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let node = node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connection_handler::handle_connection(node, socket).await {
                            error!("Error in connection handler for {}: {:?}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down.");
                node.halt_mining().await;
                return utils::save_now(&node, &args.chain_file).await;
            }
        }
    }
}
