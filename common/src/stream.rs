//! Stream types and block file naming

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::LazyLock};

/// Version of the block stream format. Record stream files are below this.
pub const BLOCK_STREAM_VERSION: u32 = 7;

/// Requests "start from whatever the source will serve earliest"
pub const EARLIEST_AVAILABLE_BLOCK_NUMBER: u64 = u64::MAX;

/// Open-ended subscription end
pub const INFINITE_END_BLOCK_NUMBER: u64 = u64::MAX;

const BASENAME_LENGTH: usize = 19;
const FILE_SUFFIX: &str = ".blk";
const COMPRESSED_FILE_SUFFIX: &str = ".blk.zstd";

static STREAMED_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{19}\.blk$").expect("infallible"));

/// Kind of stream file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamType {
    Record,
    Block,
}

impl StreamType {
    /// Folder name under the network folder in cloud storage
    pub fn path(&self) -> &'static str {
        match self {
            StreamType::Record => "recordstreams",
            StreamType::Block => "block",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            StreamType::Record => StreamType::Block,
            StreamType::Block => StreamType::Record,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Record => write!(f, "RECORD"),
            StreamType::Block => write!(f, "BLOCK"),
        }
    }
}

/// Where a block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockSourceType {
    File,
    BlockNode,
}

impl fmt::Display for BlockSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSourceType::File => write!(f, "FILE"),
            BlockSourceType::BlockNode => write!(f, "BLOCK_NODE"),
        }
    }
}

/// Filename of a block: the block number left padded with zeros to 19 digits,
/// `.blk` when streamed from a block node, `.blk.zstd` when stored compressed.
pub fn block_filename(block_number: u64, compressed: bool) -> String {
    let suffix = if compressed {
        COMPRESSED_FILE_SUFFIX
    } else {
        FILE_SUFFIX
    };
    format!("{block_number:0>width$}{suffix}", width = BASENAME_LENGTH)
}

/// Whether the filename is one a block node stream produces
pub fn is_streamed_filename(name: &str) -> bool {
    STREAMED_FILENAME.is_match(name)
}

/// Source type derived from a block filename, None when blank
pub fn source_type_of(name: &str) -> Option<BlockSourceType> {
    if name.trim().is_empty() {
        None
    } else if is_streamed_filename(name) {
        Some(BlockSourceType::BlockNode)
    } else {
        Some(BlockSourceType::File)
    }
}

/// Parse the block number from the part of a filename before its first '.'
pub fn block_number_from_filename(name: &str) -> Option<u64> {
    let base = name.split('.').next().unwrap_or(name);
    base.parse().ok()
}
