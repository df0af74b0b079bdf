pub mod block;
pub mod consensus;
pub mod difficulty;
pub mod error;
pub mod hash;
pub mod merkle;
pub mod mining;
pub mod network;
pub mod params;
pub mod storage;
pub mod transaction;
pub mod utils;
pub mod validator;

use uint::construct_uint;

construct_uint! {
    /// Big-endian view of a 64-byte digest, used for target arithmetic.
    pub struct U512(8);
}

pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10 MB

pub use block::{Block, BlockHeader, CompactBlock, UnsealedHeader};
pub use consensus::{ChainLinked, Consensus, ConsensusSelector};
pub use difficulty::DifficultyPolicy;
pub use error::{LedgerError, LedgerResult};
pub use hash::{HashEngine, HashValue};
pub use merkle::{AuditPath, MerkleTree};
pub use mining::{MiningCoordinator, ProofOfWorkSearch, SearchState};
pub use params::ChainParams;
pub use storage::{ChainStorage, MemoryChain};
pub use transaction::Transaction;
pub use validator::{BlockValidator, ValidationFailure};
