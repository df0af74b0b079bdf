use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockHeader, GENESIS_BLOCK_NUMBER};
use crate::error::{LedgerError, LedgerResult};
use crate::hash::HashValue;
use crate::utils::Saveable;

/// Read access to stored blocks, injected wherever history is needed.
pub trait ChainStorage: Send + Sync {
    fn block_by_number(&self, number: u64) -> Option<Block>;

    fn header_by_number(&self, number: u64) -> Option<BlockHeader> {
        self.block_by_number(number).map(|b| b.header().clone())
    }
}

/// Contiguous chain held in memory and persisted as JSON.
///
/// A block's header and transactions are always stored together by
/// [`MemoryChain::append`].
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MemoryChain {
    blocks: Vec<Block>,
    #[serde(skip)]
    by_hash: HashMap<HashValue, u64>,
}

impl MemoryChain {
    pub fn new() -> Self {
        MemoryChain::default()
    }

    pub fn with_genesis(genesis: Block) -> LedgerResult<Self> {
        let mut chain = MemoryChain::new();
        chain.append(genesis)?;
        Ok(chain)
    }

    /// Appends the next block. Only numbering is checked here; callers run the
    /// validator first.
    pub fn append(&mut self, block: Block) -> LedgerResult<()> {
        let expected = self.blocks.len() as u64;
        if block.block_number() != expected {
            return Err(LedgerError::IllegalArgument(format!(
                "block #{} cannot follow a chain of {} blocks",
                block.block_number(),
                expected
            )));
        }
        if expected > GENESIS_BLOCK_NUMBER {
            if let Some(head) = self.head() {
                if block.header().previous_hash() != head.hash() {
                    return Err(LedgerError::IllegalArgument(format!(
                        "block #{} does not link to head {}",
                        block.block_number(),
                        head.hash()
                    )));
                }
            }
        }

        debug!("Storing block #{} ({})", block.block_number(), block.hash());
        self.by_hash.insert(block.hash().clone(), block.block_number());
        self.blocks.push(block);
        Ok(())
    }

    pub fn head(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_by_hash(&self, hash: &HashValue) -> Option<&Block> {
        self.by_hash
            .get(hash)
            .and_then(|number| self.blocks.get(*number as usize))
    }

    /// The last `count` headers, oldest first. Enough history for a retarget
    /// check when `count` is at least the retarget interval plus one.
    pub fn recent_headers(&self, count: usize) -> Vec<BlockHeader> {
        let start = self.blocks.len().saturating_sub(count);
        self.blocks[start..]
            .iter()
            .map(|b| b.header().clone())
            .collect()
    }

    fn rebuild_index(&mut self) {
        self.by_hash = self
            .blocks
            .iter()
            .map(|b| (b.hash().clone(), b.block_number()))
            .collect();
    }
}

impl ChainStorage for MemoryChain {
    fn block_by_number(&self, number: u64) -> Option<Block> {
        self.blocks.get(number as usize).cloned()
    }

    fn header_by_number(&self, number: u64) -> Option<BlockHeader> {
        self.blocks
            .get(number as usize)
            .map(|b| b.header().clone())
    }
}

impl Saveable for MemoryChain {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        let mut chain: MemoryChain = serde_json::from_reader(reader).map_err(|e| {
            IoError::new(
                IoErrorKind::InvalidData,
                format!("Failed to deserialize chain: {}", e),
            )
        })?;
        chain.rebuild_index();
        Ok(chain)
    }

    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        serde_json::to_writer(writer, self).map_err(|e| {
            IoError::new(
                IoErrorKind::InvalidData,
                format!("Failed to serialize chain: {}", e),
            )
        })
    }
}
