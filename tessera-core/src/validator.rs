use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use log::debug;
use thiserror::Error;

use crate::block::{Block, BlockHeader};
use crate::difficulty::DifficultyPolicy;
use crate::hash::{HashEngine, HashValue};
use crate::merkle::MerkleTree;
use crate::params::ChainParams;
use crate::storage::ChainStorage;
use crate::utils::millis;

/// The first rule a block broke. Rejection is an expected outcome for stale or
/// hostile data, not a fault.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationFailure {
    #[error("merkle root mismatch: stored {stored}, computed {computed}")]
    MerkleRoot { stored: HashValue, computed: HashValue },

    #[error("chain name {found:?} is not {expected:?}")]
    ChainName { expected: String, found: String },

    #[error("stored header hash {stored} does not match computed {computed}")]
    HeaderHash { stored: HashValue, computed: HashValue },

    #[error("block #{0} has no previous header to link to")]
    MissingPrevious(u64),

    #[error("block #{found} does not follow block #{previous}")]
    BlockNumber { previous: u64, found: u64 },

    #[error("previous hash {found} does not match {expected}")]
    PreviousHash { expected: HashValue, found: HashValue },

    #[error("declared difficulty {found} differs from expected {expected}")]
    Difficulty { expected: BigDecimal, found: BigDecimal },

    #[error("expected difficulty for block #{0} could not be computed: {1}")]
    DifficultyUnavailable(u64, String),

    #[error("header hash {0} does not meet its target")]
    ProofOfWork(HashValue),

    #[error("timestamp {timestamp} is {skew_ms}ms away from local time")]
    Timestamp { timestamp: i64, skew_ms: u64 },

    #[error("block could not be encoded for hashing: {0}")]
    Encoding(String),
}

pub struct BlockValidator<'a> {
    params: &'a ChainParams,
    difficulty: DifficultyPolicy<'a>,
}

impl<'a> BlockValidator<'a> {
    pub fn new(params: &'a ChainParams, storage: &'a dyn ChainStorage) -> Self {
        BlockValidator {
            params,
            difficulty: DifficultyPolicy::new(params, storage),
        }
    }

    /// Whether `candidate` is acceptable after `previous`. Rejections are logged
    /// at debug level.
    pub fn validate(
        &self,
        candidate: &Block,
        previous: Option<&BlockHeader>,
        check_timestamp: bool,
        now: DateTime<Utc>,
        window: Option<&[BlockHeader]>,
    ) -> bool {
        match self.check(candidate, previous, check_timestamp, now, window) {
            Ok(()) => true,
            Err(failure) => {
                debug!(
                    "Block #{} ({}) rejected: {}",
                    candidate.block_number(),
                    candidate.hash(),
                    failure
                );
                false
            }
        }
    }

    /// Runs every rule in order and stops at the first failure.
    pub fn check(
        &self,
        candidate: &Block,
        previous: Option<&BlockHeader>,
        check_timestamp: bool,
        now: DateTime<Utc>,
        window: Option<&[BlockHeader]>,
    ) -> Result<(), ValidationFailure> {
        let header = candidate.header();

        let computed = MerkleTree::root(candidate.transactions())
            .map_err(|e| ValidationFailure::Encoding(e.to_string()))?;
        if &computed != header.merkle_root() {
            return Err(ValidationFailure::MerkleRoot {
                stored: header.merkle_root().clone(),
                computed,
            });
        }
        debug!("Merkle root validation passed.");

        if header.chain_name() != self.params.chain_name {
            return Err(ValidationFailure::ChainName {
                expected: self.params.chain_name.clone(),
                found: header.chain_name().to_string(),
            });
        }

        let computed = HashEngine::hash_block_header(header)
            .map_err(|e| ValidationFailure::Encoding(e.to_string()))?;
        if &computed != header.hash() {
            return Err(ValidationFailure::HeaderHash {
                stored: header.hash().clone(),
                computed,
            });
        }
        debug!("Header hash validation passed.");

        if header.block_number() > 0 {
            self.check_linkage(header, previous, window)?;
            debug!("Linkage and difficulty validation passed.");
        }

        if !self.difficulty.header_meets_target(header) {
            return Err(ValidationFailure::ProofOfWork(header.hash().clone()));
        }
        debug!("Proof of work validation passed.");

        if check_timestamp {
            let skew_ms = millis(now).abs_diff(header.timestamp());
            if skew_ms > self.params.max_timestamp_skew_ms().unsigned_abs() {
                return Err(ValidationFailure::Timestamp {
                    timestamp: header.timestamp(),
                    skew_ms,
                });
            }
            debug!("Timestamp validation passed.");
        }

        Ok(())
    }

    fn check_linkage(
        &self,
        header: &BlockHeader,
        previous: Option<&BlockHeader>,
        window: Option<&[BlockHeader]>,
    ) -> Result<(), ValidationFailure> {
        let previous = previous.ok_or(ValidationFailure::MissingPrevious(header.block_number()))?;

        if header.block_number() != previous.block_number() + 1 {
            return Err(ValidationFailure::BlockNumber {
                previous: previous.block_number(),
                found: header.block_number(),
            });
        }

        if header.previous_hash() != previous.hash() {
            return Err(ValidationFailure::PreviousHash {
                expected: previous.hash().clone(),
                found: header.previous_hash().clone(),
            });
        }

        let expected = self
            .difficulty
            .next_difficulty(previous, window)
            .map_err(|e| {
                ValidationFailure::DifficultyUnavailable(header.block_number(), e.to_string())
            })?;
        if &expected != header.difficulty() {
            return Err(ValidationFailure::Difficulty {
                expected,
                found: header.difficulty().clone(),
            });
        }

        Ok(())
    }
}
