//! Legacy record file shape, the unit handed to the persistence pipeline

use crate::hash::Sha384Hash;
use crate::stream::BLOCK_STREAM_VERSION;
use serde::{Deserialize, Serialize};

/// A verified stream file in the legacy record file shape.
///
/// Block stream files are translated into this shape after verification, so
/// downstream consumers and the hash chain anchor see one format.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFile {
    /// Block number
    pub index: u64,

    /// Consensus timestamp of the first item, nanoseconds since epoch
    pub consensus_start: i64,

    /// Consensus timestamp of the last item, nanoseconds since epoch
    pub consensus_end: i64,

    /// Number of transactions
    pub count: u64,

    pub hash: Sha384Hash,
    pub previous_hash: Sha384Hash,

    /// Filename the file was read from
    pub name: String,

    /// Endpoint of the node, or "cloud"
    pub node: String,

    /// Stream format version
    pub version: u32,

    pub load_start: i64,
    pub load_end: i64,
    pub round_start: Option<u64>,
    pub round_end: Option<u64>,
    pub size: Option<usize>,

    #[serde(skip)]
    pub bytes: Option<Vec<u8>>,
}

impl RecordFile {
    /// Written in the block stream format
    pub fn is_block_stream(&self) -> bool {
        self.version >= BLOCK_STREAM_VERSION
    }

    /// Written in the legacy record stream format
    pub fn is_record_stream(&self) -> bool {
        self.version < BLOCK_STREAM_VERSION
    }
}
