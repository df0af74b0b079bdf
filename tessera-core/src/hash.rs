use crate::error::LedgerResult;
use serde::Serialize;
use sha2::{Digest, Sha512};
use std::{convert::TryFrom, fmt};

/// Width in bytes of every digest produced by [`HashEngine`].
pub const HASH_LENGTH: usize = 64;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashValue(Vec<u8>);

impl serde::Serialize for HashValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = self.to_string();
        serializer.serialize_str(&s)
    }
}

impl<'de> serde::Deserialize<'de> for HashValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        HashValue::try_from(s.as_str()).map_err(|e| {
            serde::de::Error::custom(format!(
                "Failed to deserialize HashValue from hex string: {}",
                e
            ))
        })
    }
}

impl HashValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        HashValue(bytes)
    }

    /// The all-zero digest, used as the previous hash of the genesis block.
    pub fn zero() -> Self {
        HashValue(vec![0u8; HASH_LENGTH])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn change_endianness(&self) -> HashValue {
        let mut bytes = self.0.clone();
        bytes.reverse();
        HashValue(bytes)
    }

    /// Bitwise AND against `mask`, always sized like `self`.
    ///
    /// Operands are aligned on their last byte: when one side is shorter it is
    /// zero-extended on its leading side, the way two big-endian numbers of
    /// different widths would be.
    pub fn mask_with(&self, mask: &HashValue) -> HashValue {
        let mut out = vec![0u8; self.0.len()];
        for ((o, a), b) in out
            .iter_mut()
            .rev()
            .zip(self.0.iter().rev())
            .zip(mask.0.iter().rev())
        {
            *o = a & b;
        }
        HashValue(out)
    }
}

impl From<HashValue> for String {
    fn from(hash: HashValue) -> Self {
        hex::encode(hash.as_bytes())
    }
}

impl TryFrom<&str> for HashValue {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        Ok(HashValue(bytes))
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HashValue({})", self)
    }
}

/// Double SHA-512 digests over raw bytes and ledger entities.
pub struct HashEngine;

impl HashEngine {
    pub fn hash_length() -> usize {
        HASH_LENGTH
    }

    pub fn hash_bytes(bytes: &[u8]) -> HashValue {
        let first = Sha512::digest(bytes);
        let second = Sha512::digest(first);
        HashValue(second.to_vec())
    }

    /// Hashes the concatenation of `hashes`, in argument order.
    pub fn hash_hashes(hashes: &[&HashValue]) -> HashValue {
        let mut buffer = Vec::with_capacity(hashes.iter().map(|h| h.len()).sum());
        for hash in hashes {
            buffer.extend_from_slice(hash.as_bytes());
        }
        Self::hash_bytes(&buffer)
    }

    /// Hashes the canonical (bincode) encoding of `value`.
    pub fn hash_encoded<T: Serialize>(value: &T) -> LedgerResult<HashValue> {
        let encoded = bincode::serialize(value)?;
        Ok(Self::hash_bytes(&encoded))
    }

    pub fn hash_transaction(transaction: &crate::transaction::Transaction) -> LedgerResult<HashValue> {
        Self::hash_encoded(transaction)
    }

    pub fn hash_block_header(header: &crate::block::BlockHeader) -> LedgerResult<HashValue> {
        Ok(Self::hash_bytes(&header.hashable_bytes()?))
    }
}
