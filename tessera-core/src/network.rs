use std::io::{Error as IoError, ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::block::{Block, BlockHeader, CompactBlock};
use crate::hash::HashValue;
use crate::transaction::Transaction;
use crate::MAX_MESSAGE_SIZE;

/// Every message exchanged between nodes. Frames are an 8-byte big-endian
/// length followed by the JSON body.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum Message {
    FetchBlockByNumber(u64),
    FetchBlockByHash(HashValue),
    FetchHead,
    /// Membership proof for `transaction` in the block at `block_number`.
    FetchCompactBlock {
        block_number: u64,
        transaction: Transaction,
    },
    BlockReply(Option<Block>),
    HeadReply(Option<BlockHeader>),
    CompactBlockReply(Option<CompactBlock>),
    NewBlock(Block),
    NewTransaction(Transaction),
    BlockAccepted,
    BlockRejected(String),
    TransactionAccepted,
    TransactionRejected(String),
    Ping(Uuid),
    Pong(Uuid),
}

fn invalid_data(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn check_length(len: u64) -> Result<usize, IoError> {
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    if len > MAX_MESSAGE_SIZE {
        return Err(invalid_data(format!(
            "Received message too large: {} bytes, max is {} bytes",
            len, MAX_MESSAGE_SIZE
        )));
    }
    Ok(len)
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, IoError> {
        serde_json::to_vec(self).map_err(|e| invalid_data(format!("Failed to encode message: {}", e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, IoError> {
        serde_json::from_slice(data)
            .map_err(|e| invalid_data(format!("Failed to decode message: {}", e)))
    }

    fn frame(&self) -> Result<(u64, Vec<u8>), IoError> {
        let bytes = self.encode()?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(invalid_data(format!(
                "Refusing to send {} byte message, max is {} bytes",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok((bytes.len() as u64, bytes))
    }

    pub fn send(&self, stream: &mut impl Write) -> Result<(), IoError> {
        let (len, bytes) = self.frame()?;
        stream.write_all(&len.to_be_bytes())?;
        stream.write_all(&bytes)?;
        stream.flush()
    }

    pub fn receive(stream: &mut impl Read) -> Result<Self, IoError> {
        let mut len_bytes = [0u8; 8];
        stream.read_exact(&mut len_bytes)?;
        let len = check_length(u64::from_be_bytes(len_bytes))?;

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data)?;
        Self::decode(&data)
    }

    pub async fn send_async(&self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<(), IoError> {
        let (len, bytes) = self.frame()?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await
    }

    pub async fn receive_async(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self, IoError> {
        let mut len_bytes = [0u8; 8];
        stream.read_exact(&mut len_bytes).await?;
        let len = check_length(u64::from_be_bytes(len_bytes))?;

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;
        Self::decode(&data)
    }
}
