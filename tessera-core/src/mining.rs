//! Proof-of-work search on a dedicated worker thread, and the coordinator that
//! owns at most one such search at a time.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bigdecimal::BigDecimal;
use log::{debug, error, info, warn};

use crate::block::{Block, BlockHeader, UnsealedHeader};
use crate::difficulty::DifficultyPolicy;
use crate::error::LedgerResult;
use crate::hash::HashValue;
use crate::merkle::MerkleTree;
use crate::params::ChainParams;
use crate::transaction::Transaction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchState {
    Created,
    Running,
    Found,
    Halted,
}

impl SearchState {
    fn to_u8(self) -> u8 {
        match self {
            SearchState::Created => 0,
            SearchState::Running => 1,
            SearchState::Found => 2,
            SearchState::Halted => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SearchState::Created,
            1 => SearchState::Running,
            2 => SearchState::Found,
            _ => SearchState::Halted,
        }
    }
}

/// Search state shared between the worker and whoever may stop it. Every
/// transition is a compare-and-swap, so a stop and a solution can't both win.
#[derive(Clone, Debug)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        SharedState(Arc::new(AtomicU8::new(SearchState::Created.to_u8())))
    }

    fn get(&self) -> SearchState {
        SearchState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: SearchState, to: SearchState) -> bool {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves a created or running search to `Halted`. False when it already ended.
    fn halt(&self) -> bool {
        self.transition(SearchState::Running, SearchState::Halted)
            || self.transition(SearchState::Created, SearchState::Halted)
    }
}

/// Tries nonces on `template` until its hash passes `target` or `keep_going`
/// returns false. `keep_going` is polled before every attempt. When the 32-bit
/// nonce space runs out the timestamp moves forward one millisecond and the
/// nonces start over.
pub fn solve_header(
    mut template: UnsealedHeader,
    target: &HashValue,
    keep_going: impl Fn() -> bool,
) -> LedgerResult<Option<BlockHeader>> {
    template.nonce = 0;
    loop {
        if !keep_going() {
            return Ok(None);
        }

        let hash = template.hash()?;
        if DifficultyPolicy::satisfies_target(&hash, target) {
            return Ok(Some(BlockHeader::from_solved(template, hash)));
        }

        match template.nonce.checked_add(1) {
            Some(nonce) => template.nonce = nonce,
            None => {
                template.nonce = 0;
                template.timestamp += 1;
            }
        }
    }
}

/// A cancellable search for the block following `previous`.
pub struct ProofOfWorkSearch {
    template: UnsealedHeader,
    transactions: Vec<Transaction>,
    target: HashValue,
    state: SharedState,
}

impl ProofOfWorkSearch {
    /// Prepares a search over `transactions`. The placeholder is dropped when
    /// real transactions are present, and used alone when there are none.
    pub fn new(
        params: &ChainParams,
        previous: &BlockHeader,
        transactions: Vec<Transaction>,
        difficulty: BigDecimal,
        timestamp: i64,
        miner_signature: &str,
    ) -> LedgerResult<Self> {
        let transactions = Self::candidate_set(transactions);
        let template = UnsealedHeader {
            version: params.header_version,
            chain_name: params.chain_name.clone(),
            block_number: previous.block_number() + 1,
            previous_hash: previous.hash().clone(),
            merkle_root: MerkleTree::root(&transactions)?,
            timestamp,
            difficulty,
            nonce: 0,
            miner_signature: miner_signature.to_string(),
        };
        // Reject an oversized signature now rather than after the search.
        template.clone().seal()?;
        let target = DifficultyPolicy::target_mask_for(params, &template.difficulty);

        Ok(ProofOfWorkSearch {
            template,
            transactions,
            target,
            state: SharedState::new(),
        })
    }

    fn candidate_set(mut transactions: Vec<Transaction>) -> Vec<Transaction> {
        if transactions.len() > 1 {
            transactions.retain(|t| !t.is_placeholder());
        }
        if transactions.is_empty() {
            transactions.push(Transaction::placeholder());
        }
        transactions
    }

    pub fn state(&self) -> SearchState {
        self.state.get()
    }

    pub fn block_number(&self) -> u64 {
        self.template.block_number
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn is_placeholder_only(&self) -> bool {
        self.transactions.iter().all(|t| t.is_placeholder())
    }

    /// Halts the search. False when it already found a block or was halted.
    pub fn stop(&self) -> bool {
        self.state.halt()
    }

    /// Runs the search on the calling thread. `None` once halted.
    pub fn run(&self) -> Option<Block> {
        if !self.state.transition(SearchState::Created, SearchState::Running) {
            debug!("Search for block #{} was stopped before it started", self.block_number());
            return None;
        }

        let state = self.state.clone();
        let solved = solve_header(self.template.clone(), &self.target, || {
            state.get() == SearchState::Running
        });

        match solved {
            Ok(Some(header)) => {
                if self.state.transition(SearchState::Running, SearchState::Found) {
                    info!(
                        "Found block #{} with nonce {}: {}",
                        header.block_number(),
                        header.nonce(),
                        header.hash()
                    );
                    Some(Block::new(header, self.transactions.clone()))
                } else {
                    debug!("Solution for block #{} arrived after stop", self.block_number());
                    None
                }
            }
            Ok(None) => {
                debug!("Search for block #{} halted", self.block_number());
                None
            }
            Err(e) => {
                error!("Search for block #{} failed: {}", self.block_number(), e);
                self.state.halt();
                None
            }
        }
    }

    /// Moves the search onto its own thread. A found block is sent on `found`.
    pub fn spawn(self, found: flume::Sender<Block>) -> SearchHandle {
        let state = self.state.clone();
        let block_number = self.block_number();
        let placeholder_only = self.is_placeholder_only();

        let worker = thread::spawn(move || {
            if let Some(block) = self.run() {
                if let Err(e) = found.send(block) {
                    warn!("Nobody is listening for mined blocks: {}", e);
                }
            }
        });

        SearchHandle {
            state,
            worker: Some(worker),
            block_number,
            placeholder_only,
            started_at: Instant::now(),
        }
    }
}

pub struct SearchHandle {
    state: SharedState,
    worker: Option<thread::JoinHandle<()>>,
    block_number: u64,
    placeholder_only: bool,
    started_at: Instant,
}

impl SearchHandle {
    pub fn state(&self) -> SearchState {
        self.state.get()
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn is_placeholder_only(&self) -> bool {
        self.placeholder_only
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn stop(&self) -> bool {
        self.state.halt()
    }

    /// Stops the search and waits for the worker to exit. Returns the terminal
    /// state: `Found` if a block was published before the stop landed.
    pub fn halt(mut self) -> SearchState {
        self.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Search worker for block #{} panicked", self.block_number);
            }
        }
        self.state.get()
    }
}

impl Drop for SearchHandle {
    fn drop(&mut self) {
        self.state.halt();
    }
}

/// Owns the single active search. A new search only starts after the previous
/// one has been halted and its worker joined.
pub struct MiningCoordinator {
    params: ChainParams,
    miner_signature: String,
    current: Option<SearchHandle>,
    found_sender: flume::Sender<Block>,
    found_receiver: flume::Receiver<Block>,
}

impl MiningCoordinator {
    pub fn new(params: ChainParams, miner_signature: impl Into<String>) -> Self {
        let (found_sender, found_receiver) = flume::unbounded();
        MiningCoordinator {
            params,
            miner_signature: miner_signature.into(),
            current: None,
            found_sender,
            found_receiver,
        }
    }

    /// Blocks found by the searches this coordinator started.
    pub fn found_blocks(&self) -> flume::Receiver<Block> {
        self.found_receiver.clone()
    }

    pub fn current(&self) -> Option<&SearchHandle> {
        self.current.as_ref()
    }

    /// Halts the active search, if any, and reports how it ended.
    pub fn halt(&mut self) -> Option<SearchState> {
        self.current.take().map(|search| {
            let block_number = search.block_number();
            let state = search.halt();
            debug!("Search for block #{} ended as {:?}", block_number, state);
            state
        })
    }

    pub fn start(
        &mut self,
        previous: &BlockHeader,
        transactions: Vec<Transaction>,
        difficulty: BigDecimal,
        timestamp: i64,
    ) -> LedgerResult<()> {
        self.halt();

        let search = ProofOfWorkSearch::new(
            &self.params,
            previous,
            transactions,
            difficulty,
            timestamp,
            &self.miner_signature,
        )?;
        info!(
            "Mining block #{} with {} transaction(s){}",
            search.block_number(),
            search.transactions().len(),
            if search.is_placeholder_only() {
                " (placeholder)"
            } else {
                ""
            }
        );
        self.current = Some(search.spawn(self.found_sender.clone()));
        Ok(())
    }

    /// Whether a placeholder-only search should make way for a fresh one,
    /// either because real transactions are waiting or because it ran too long.
    pub fn placeholder_needs_restart(&self, real_transactions_pending: bool) -> bool {
        match &self.current {
            Some(search)
                if search.is_placeholder_only()
                    && matches!(search.state(), SearchState::Created | SearchState::Running) =>
            {
                real_transactions_pending || search.elapsed() >= self.params.max_placeholder_wait()
            }
            _ => false,
        }
    }
}

impl Drop for MiningCoordinator {
    fn drop(&mut self) {
        self.halt();
    }
}
