use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The transaction is not part of the block or audit path it was looked up in.
    /// Callers usually recover by fetching the full block.
    #[error("transaction is not present in the audit context")]
    TransactionNotPresent,

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("block header #{0} not found")]
    HeaderNotFound(u64),

    /// No peer gave a usable answer. This is different from peers answering inconsistently.
    #[error("no peer returned a usable reply")]
    PeerUnavailable,

    #[error("failed to encode ledger entity: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
