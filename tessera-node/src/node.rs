use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use tessera_core::utils::now_millis;
use tessera_core::{
    Block, BlockHeader, BlockValidator, ChainParams, DifficultyPolicy, HashValue, MemoryChain,
    MiningCoordinator, Transaction,
};
use tokio::sync::{Mutex, RwLock};

/// Everything the node's tasks share. Built once in `main` and handed around
/// behind an `Arc`.
pub struct Node {
    pub params: ChainParams,
    pub chain: RwLock<MemoryChain>,
    /// Transactions waiting for a block, keyed by their hash.
    pub pending: DashMap<HashValue, Transaction>,
    pub peers: Vec<String>,
    miner: Option<Arc<Mutex<MiningCoordinator>>>,
    found: Option<flume::Receiver<Block>>,
}

impl Node {
    pub fn new(
        params: ChainParams,
        chain: MemoryChain,
        peers: Vec<String>,
        miner: Option<MiningCoordinator>,
    ) -> Self {
        Node {
            params,
            chain: RwLock::new(chain),
            pending: DashMap::new(),
            peers,
            found: miner.as_ref().map(|coordinator| coordinator.found_blocks()),
            miner: miner.map(|coordinator| Arc::new(Mutex::new(coordinator))),
        }
    }

    pub fn is_mining(&self) -> bool {
        self.miner.is_some()
    }

    /// Validates `block` against the current head and appends it under a single
    /// write lock. The error is the rejection reason sent back to peers.
    pub async fn accept_block(&self, block: Block, check_timestamp: bool) -> Result<(), String> {
        let mut chain = self.chain.write().await;
        let head = chain
            .head()
            .map(|b| b.header().clone())
            .ok_or_else(|| "local chain has no genesis block".to_string())?;

        // Enough history for the retarget lookback, so it never hits storage.
        let window = chain.recent_headers(self.params.retarget_interval.saturating_add(1) as usize);
        let validator = BlockValidator::new(&self.params, &*chain);
        validator
            .check(&block, Some(&head), check_timestamp, Utc::now(), Some(&window))
            .map_err(|failure| failure.to_string())?;

        let number = block.block_number();
        let included = block.transactions().to_vec();
        chain.append(block).map_err(|e| e.to_string())?;
        drop(chain);

        self.prune_pending(&included);
        info!("Block #{} appended to the chain", number);
        Ok(())
    }

    /// Adds a transaction to the pool. False if it was already pending.
    pub fn add_transaction(&self, transaction: Transaction) -> Result<bool> {
        if transaction.is_placeholder() {
            return Err(anyhow!("the placeholder transaction cannot be submitted"));
        }
        let hash = transaction.hash()?;
        if self.pending.contains_key(&hash) {
            debug!("Transaction {} is already pending", hash);
            return Ok(false);
        }
        self.pending.insert(hash.clone(), transaction);
        debug!("Transaction {} added to the pool ({} pending)", hash, self.pending.len());
        Ok(true)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        let mut transactions: Vec<(HashValue, Transaction)> = self
            .pending
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        // DashMap iteration order is arbitrary; keep the Merkle root stable.
        transactions.sort_by(|a, b| a.0.cmp(&b.0));
        transactions.into_iter().map(|(_, t)| t).collect()
    }

    fn prune_pending(&self, included: &[Transaction]) {
        for transaction in included.iter().filter(|t| !t.is_placeholder()) {
            match transaction.hash() {
                Ok(hash) => {
                    self.pending.remove(&hash);
                }
                Err(e) => warn!("Could not hash included transaction: {}", e),
            }
        }
    }

    /// Replaces any running search with one on top of the current head.
    ///
    /// The coordinator lock is held from reading the head until the new search
    /// is running, so concurrent restarts start in the order they saw the chain.
    pub async fn restart_mining(&self) -> Result<()> {
        let Some(miner) = &self.miner else {
            return Ok(());
        };
        let mut coordinator = miner.clone().lock_owned().await;

        let (head, difficulty) = {
            let chain = self.chain.read().await;
            let head: BlockHeader = chain
                .head()
                .map(|b| b.header().clone())
                .ok_or_else(|| anyhow!("cannot mine without a genesis block"))?;
            let difficulty =
                DifficultyPolicy::new(&self.params, &*chain).next_difficulty(&head, None)?;
            (head, difficulty)
        };
        let transactions = self.pending_transactions();

        // Starting joins the previous worker thread.
        tokio::task::spawn_blocking(move || {
            coordinator.start(&head, transactions, difficulty, now_millis())
        })
        .await
        .context("Mining restart task failed")??;
        Ok(())
    }

    pub async fn placeholder_needs_restart(&self) -> bool {
        match &self.miner {
            Some(miner) => miner
                .lock()
                .await
                .placeholder_needs_restart(!self.pending.is_empty()),
            None => false,
        }
    }

    pub async fn halt_mining(&self) {
        let Some(miner) = &self.miner else {
            return;
        };
        let mut coordinator = miner.clone().lock_owned().await;
        if let Err(e) = tokio::task::spawn_blocking(move || coordinator.halt()).await {
            warn!("Failed to halt mining: {}", e);
        }
    }

    pub fn found_blocks(&self) -> Option<flume::Receiver<Block>> {
        self.found.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tessera_core::ProofOfWorkSearch;

    pub(crate) fn test_node() -> Node {
        let params = ChainParams::testing();
        let chain = MemoryChain::with_genesis(Block::genesis(&params).unwrap()).unwrap();
        Node::new(params, chain, Vec::new(), None)
    }

    pub(crate) fn tx(n: u64) -> Transaction {
        Transaction::new(1, format!("node-test-{}", n), n, 2, vec![9, n as u8]).unwrap()
    }

    pub(crate) async fn mine_next(node: &Node, transactions: Vec<Transaction>) -> Block {
        let chain = node.chain.read().await;
        let head = chain.head().unwrap().header().clone();
        let difficulty = DifficultyPolicy::new(&node.params, &*chain)
            .next_difficulty(&head, None)
            .unwrap();
        ProofOfWorkSearch::new(
            &node.params,
            &head,
            transactions,
            difficulty,
            now_millis(),
            "node-test",
        )
        .unwrap()
        .run()
        .unwrap()
    }

    #[tokio::test]
    async fn accepted_block_prunes_the_pool() {
        let node = test_node();
        assert!(node.add_transaction(tx(1)).unwrap());
        assert!(node.add_transaction(tx(2)).unwrap());
        assert!(!node.add_transaction(tx(1)).unwrap());

        let block = mine_next(&node, vec![tx(1)]).await;
        node.accept_block(block, true).await.unwrap();

        assert_eq!(node.chain.read().await.height(), 2);
        assert_eq!(node.pending_transactions(), vec![tx(2)]);
    }

    #[tokio::test]
    async fn stale_block_is_rejected_with_a_reason() {
        let node = test_node();
        let block = mine_next(&node, vec![tx(1)]).await;
        node.accept_block(block.clone(), true).await.unwrap();

        let reason = node.accept_block(block, true).await.unwrap_err();
        assert!(reason.contains("does not follow"), "{}", reason);
        assert_eq!(node.chain.read().await.height(), 2);
    }

    #[test]
    fn placeholder_cannot_be_pooled() {
        let node = test_node();
        assert!(node.add_transaction(Transaction::placeholder()).is_err());
        assert!(node.pending.is_empty());
    }

    #[test]
    fn pending_order_is_stable() {
        let node = test_node();
        for n in [5, 1, 3, 2, 4] {
            node.add_transaction(tx(n)).unwrap();
        }
        assert_eq!(node.pending_transactions(), node.pending_transactions());
        assert_eq!(node.pending_transactions().len(), 5);
    }

    fn stalled_miner_node() -> Node {
        let params = ChainParams::testing();
        let chain = MemoryChain::with_genesis(Block::genesis(&params).unwrap()).unwrap();
        // A target no hash can meet keeps every search running.
        let unsolvable = ChainParams {
            max_zero_bits: 400,
            ..params.clone()
        };
        let coordinator = MiningCoordinator::new(unsolvable, "node-test");
        Node::new(params, chain, Vec::new(), Some(coordinator))
    }

    async fn mined_height(node: &Node) -> Option<u64> {
        let coordinator = node.miner.as_ref().unwrap().lock().await;
        coordinator.current().map(|search| search.block_number())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_restarts_mine_on_the_latest_head() {
        let node = Arc::new(stalled_miner_node());
        node.restart_mining().await.unwrap();
        assert_eq!(mined_height(&node).await, Some(1));

        let block = mine_next(&node, vec![tx(1)]).await;
        node.accept_block(block, true).await.unwrap();

        let (first, second) = tokio::join!(node.restart_mining(), node.restart_mining());
        first.unwrap();
        second.unwrap();
        assert_eq!(mined_height(&node).await, Some(2));

        node.halt_mining().await;
        assert_eq!(mined_height(&node).await, None);
    }

    #[tokio::test]
    async fn accepted_block_past_a_retarget_uses_the_recent_window() {
        let node = test_node();
        for n in 1..=3 {
            let block = mine_next(&node, vec![tx(n)]).await;
            node.accept_block(block, true).await.unwrap();
        }
        let chain = node.chain.read().await;
        assert_eq!(chain.height(), 4);
        assert_eq!(
            chain.recent_headers(node.params.retarget_interval as usize + 1).len(),
            3
        );
    }
}
