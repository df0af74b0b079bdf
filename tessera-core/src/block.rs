use bigdecimal::BigDecimal;
use log::info;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};

use crate::{
    difficulty::DifficultyPolicy,
    error::{LedgerError, LedgerResult},
    hash::{HashEngine, HashValue},
    merkle::{AuditPath, MerkleTree},
    mining,
    params::{ChainParams, MAX_MINER_SIGNATURE_LENGTH},
    transaction::Transaction,
    utils::Saveable,
};

pub const GENESIS_BLOCK_NUMBER: u64 = 0;
const GENESIS_SIGNATURE: &str = "genesis";

/// Every hashable field of a header. Sealing it computes the header's own hash.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UnsealedHeader {
    pub version: u32,
    pub chain_name: String,
    pub block_number: u64,
    pub previous_hash: HashValue,
    pub merkle_root: HashValue,
    /// Milliseconds since the Unix epoch, UTC.
    pub timestamp: i64,
    #[serde_as(as = "DisplayFromStr")]
    pub difficulty: BigDecimal,
    pub nonce: u32,
    pub miner_signature: String,
}

impl UnsealedHeader {
    pub fn hashable_bytes(&self) -> LedgerResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn hash(&self) -> LedgerResult<HashValue> {
        HashEngine::hash_encoded(self)
    }

    fn check_signature(&self) -> LedgerResult<()> {
        let length = self.miner_signature.chars().count();
        if length > MAX_MINER_SIGNATURE_LENGTH {
            return Err(LedgerError::IllegalArgument(format!(
                "miner signature is {} characters, at most {} allowed",
                length, MAX_MINER_SIGNATURE_LENGTH
            )));
        }
        Ok(())
    }

    pub fn seal(self) -> LedgerResult<BlockHeader> {
        self.check_signature()?;
        let hash = self.hash()?;
        Ok(BlockHeader { fields: self, hash })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    fields: UnsealedHeader,
    hash: HashValue,
}

impl BlockHeader {
    /// Rebuilds a header read back from storage or the network. The stored hash
    /// is kept as is; [`crate::validator::BlockValidator`] checks it.
    pub fn from_stored(fields: UnsealedHeader, hash: HashValue) -> LedgerResult<Self> {
        fields.check_signature()?;
        Ok(BlockHeader { fields, hash })
    }

    pub(crate) fn from_solved(fields: UnsealedHeader, hash: HashValue) -> Self {
        BlockHeader { fields, hash }
    }

    pub fn from_bytes(bytes: &[u8]) -> LedgerResult<Self> {
        let header: BlockHeader = bincode::deserialize(bytes)?;
        header.fields.check_signature()?;
        Ok(header)
    }

    pub fn to_bytes(&self) -> LedgerResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Everything except the header's own hash.
    pub fn hashable_bytes(&self) -> LedgerResult<Vec<u8>> {
        self.fields.hashable_bytes()
    }

    pub fn to_unsealed(&self) -> UnsealedHeader {
        self.fields.clone()
    }

    pub fn hash(&self) -> &HashValue {
        &self.hash
    }

    pub fn version(&self) -> u32 {
        self.fields.version
    }

    pub fn chain_name(&self) -> &str {
        &self.fields.chain_name
    }

    pub fn block_number(&self) -> u64 {
        self.fields.block_number
    }

    pub fn previous_hash(&self) -> &HashValue {
        &self.fields.previous_hash
    }

    pub fn merkle_root(&self) -> &HashValue {
        &self.fields.merkle_root
    }

    pub fn timestamp(&self) -> i64 {
        self.fields.timestamp
    }

    pub fn difficulty(&self) -> &BigDecimal {
        &self.fields.difficulty
    }

    pub fn nonce(&self) -> u32 {
        self.fields.nonce
    }

    pub fn miner_signature(&self) -> &str {
        &self.fields.miner_signature
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    /// Mines the genesis block for `params`. Deterministic: the timestamp is
    /// fixed by the parameters and the nonce search always starts from zero.
    pub fn genesis(params: &ChainParams) -> LedgerResult<Block> {
        let transactions = vec![Transaction::placeholder()];
        let template = UnsealedHeader {
            version: params.header_version,
            chain_name: params.chain_name.clone(),
            block_number: GENESIS_BLOCK_NUMBER,
            previous_hash: HashValue::zero(),
            merkle_root: MerkleTree::root(&transactions)?,
            timestamp: params.genesis_timestamp_ms,
            difficulty: params.initial_difficulty.clone(),
            nonce: 0,
            miner_signature: GENESIS_SIGNATURE.to_string(),
        };
        let target = DifficultyPolicy::target_mask_for(params, &template.difficulty);

        let header = mining::solve_header(template, &target, || true)?.ok_or_else(|| {
            LedgerError::IllegalArgument("genesis search ended without a solution".to_string())
        })?;
        info!("Genesis block hash: {}", header.hash());

        Ok(Block::new(header, transactions))
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn hash(&self) -> &HashValue {
        self.header.hash()
    }

    pub fn block_number(&self) -> u64 {
        self.header.block_number()
    }

    pub fn contains(&self, transaction: &Transaction) -> bool {
        self.transactions.contains(transaction)
    }
}

impl Saveable for Block {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        serde_json::from_reader(reader).map_err(|e| {
            IoError::new(
                IoErrorKind::InvalidData,
                format!("Failed to deserialize Block: {}", e),
            )
        })
    }

    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        serde_json::to_writer_pretty(writer, self).map_err(|e| {
            IoError::new(
                IoErrorKind::InvalidData,
                format!("Failed to serialize Block: {}", e),
            )
        })
    }
}

/// A header plus one of its transactions and the audit path proving membership.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompactBlock {
    header: BlockHeader,
    transaction: Transaction,
    audit_path: AuditPath,
}

impl CompactBlock {
    pub fn from_block(block: &Block, transaction: &Transaction) -> LedgerResult<Self> {
        let audit_path = MerkleTree::audit_path(transaction, block)?;
        Ok(CompactBlock {
            header: block.header.clone(),
            transaction: transaction.clone(),
            audit_path,
        })
    }

    pub fn new(header: BlockHeader, transaction: Transaction, audit_path: AuditPath) -> Self {
        CompactBlock {
            header,
            transaction,
            audit_path,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn audit_path(&self) -> &AuditPath {
        &self.audit_path
    }

    /// True when the audit path rebuilds the header's Merkle root.
    pub fn verify(&self) -> LedgerResult<bool> {
        if self.audit_path.block_number() != self.header.block_number() {
            return Ok(false);
        }
        let root = MerkleTree::root_from_audit_path(&self.transaction, &self.audit_path)?;
        Ok(&root == self.header.merkle_root())
    }
}
