use thiserror::Error;

use crate::block_stream::ItemCase;

/// Protocol and transport failures while acquiring a block
#[derive(Debug, Error)]
pub enum BlockStreamError {
    #[error("Received block items of a new block while the previous block is still pending")]
    PreviousBlockPending,

    #[error("Incorrect first block item case {0}")]
    IncorrectFirstItem(ItemCase),

    #[error("The first block item is record file and there are more than one block items")]
    RecordFileWithExtraItems,

    #[error("Too many block items in a pending block: received {received}, limit {limit}")]
    TooManyItems { received: usize, limit: usize },

    #[error("Received end of block {0} without any pending block items")]
    NoPendingItems(u64),

    #[error("Received status {0} from block node")]
    UnexpectedStatus(String),

    #[error("Unknown response case from block node")]
    UnknownResponse,

    #[error("Timed out waiting for block node {0}")]
    Timeout(String),

    #[error("No block node can provide block {0}")]
    NoNodeAvailable(u64),

    #[error("{0} doesn't support earliest available block number")]
    EarliestNotSupported(&'static str),

    #[error("Failed to download block file {filename}")]
    Download {
        filename: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("gRPC call failed: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Block node transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Integrity failures while verifying a block
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Non-consecutive block number, previous = {previous}, current = {current}")]
    NonConsecutive { previous: u64, current: u64 },

    #[error("Block number mismatch, from filename = {filename}, from content = {content}")]
    NumberMismatch { filename: u64, content: u64 },

    #[error("Failed to parse block number from filename {0}")]
    UnparsableFilename(String),

    #[error("Previous hash mismatch for block {index}, expected = {expected}, actual = {actual}")]
    HashMismatch {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("Block {0} is missing its block proof")]
    MissingProof(u64),

    #[error("Unsupported block proof for block {0}")]
    UnsupportedProof(u64),

    #[error("Number of merkle paths in block {0}'s StateProof is not 3")]
    InvalidPathCount(u64),

    #[error("Block {0}'s merkle path from the previous block root has less than 7 siblings")]
    TooFewSiblings(u64),

    #[error("Block {index} root hash mismatch: expected={expected}, actual={actual}")]
    RootHashMismatch {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("TSS signature verification failed for block {0}")]
    InvalidSignature(u64),

    #[error("Ledger id, history proof verification key and node contributions not found")]
    LedgerNotFound,

    #[error("Invalid block {index}: {reason}")]
    InvalidBlock { index: u64, reason: String },
}
