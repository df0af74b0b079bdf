use crate::error::{LedgerError, LedgerResult};
use crate::hash::{HashEngine, HashValue};
use crate::utils::Saveable;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};

pub const TRANSACTION_VERSION: u32 = 1;

const PLACEHOLDER_IDENTITY: &str = "tessera-placeholder";
const PLACEHOLDER_PUBLIC_KEY: [u8; 32] = [0u8; 32];

/// An identity authorization record.
///
/// The nonce proves work against the external identity for the given seed
/// epoch; checking that proof belongs to the identity subsystem, so the ledger
/// only stores, compares and hashes these fields.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Transaction {
    version: u32,
    identity: String,
    nonce: u64,
    seed: u64,
    #[serde_as(as = "Hex")]
    public_key: Vec<u8>,
}

impl Transaction {
    pub fn new(
        version: u32,
        identity: impl Into<String>,
        nonce: u64,
        seed: u64,
        public_key: Vec<u8>,
    ) -> LedgerResult<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(LedgerError::IllegalArgument(
                "transaction identity must not be empty".to_string(),
            ));
        }
        if public_key.is_empty() {
            return Err(LedgerError::IllegalArgument(
                "transaction public key must not be empty".to_string(),
            ));
        }

        Ok(Transaction {
            version,
            identity,
            nonce,
            seed,
            public_key,
        })
    }

    /// The stand-in transaction mined when nothing real is pending, and the
    /// only transaction of the genesis block.
    pub fn placeholder() -> Self {
        Transaction {
            version: TRANSACTION_VERSION,
            identity: PLACEHOLDER_IDENTITY.to_string(),
            nonce: 0,
            seed: 0,
            public_key: PLACEHOLDER_PUBLIC_KEY.to_vec(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        *self == Self::placeholder()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn to_bytes(&self) -> LedgerResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> LedgerResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn hash(&self) -> LedgerResult<HashValue> {
        HashEngine::hash_transaction(self)
    }
}

impl Saveable for Transaction {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        serde_json::from_reader(reader).map_err(|e| {
            IoError::new(
                IoErrorKind::InvalidData,
                format!("Failed to deserialize Transaction: {}", e),
            )
        })
    }

    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        serde_json::to_writer_pretty(writer, self).map_err(|e| {
            IoError::new(
                IoErrorKind::InvalidData,
                format!("Failed to serialize Transaction: {}", e),
            )
        })
    }
}
