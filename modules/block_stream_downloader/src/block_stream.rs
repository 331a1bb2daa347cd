//! Assembled block streams and the verified block file shape

use std::fmt;

use mirror_common::{stream, BlockSourceType, Sha384Hash};

use crate::configuration::SoftwareVersion;
use crate::proto::{
    block_item::Item, BlockHeader, BlockItem, BlockProof, LedgerIdPublication, RecordFileItem,
};

/// Discriminant of a block item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemCase {
    BlockHeader,
    EventHeader,
    RoundHeader,
    SignedTransaction,
    TransactionResult,
    TransactionOutput,
    StateChanges,
    TraceData,
    BlockFooter,
    BlockProof,
    RecordFile,
    LedgerIdPublication,
    NotSet,
}

impl ItemCase {
    pub fn of(item: &BlockItem) -> Self {
        match &item.item {
            Some(Item::BlockHeader(_)) => ItemCase::BlockHeader,
            Some(Item::EventHeader(_)) => ItemCase::EventHeader,
            Some(Item::RoundHeader(_)) => ItemCase::RoundHeader,
            Some(Item::SignedTransaction(_)) => ItemCase::SignedTransaction,
            Some(Item::TransactionResult(_)) => ItemCase::TransactionResult,
            Some(Item::TransactionOutput(_)) => ItemCase::TransactionOutput,
            Some(Item::StateChanges(_)) => ItemCase::StateChanges,
            Some(Item::TraceData(_)) => ItemCase::TraceData,
            Some(Item::BlockFooter(_)) => ItemCase::BlockFooter,
            Some(Item::BlockProof(_)) => ItemCase::BlockProof,
            Some(Item::RecordFile(_)) => ItemCase::RecordFile,
            Some(Item::LedgerIdPublication(_)) => ItemCase::LedgerIdPublication,
            None => ItemCase::NotSet,
        }
    }

    /// Whether an item of this case starts a new block
    pub fn starts_block(&self) -> bool {
        matches!(self, ItemCase::BlockHeader | ItemCase::RecordFile)
    }
}

impl fmt::Display for ItemCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemCase::BlockHeader => "BLOCK_HEADER",
            ItemCase::EventHeader => "EVENT_HEADER",
            ItemCase::RoundHeader => "ROUND_HEADER",
            ItemCase::SignedTransaction => "SIGNED_TRANSACTION",
            ItemCase::TransactionResult => "TRANSACTION_RESULT",
            ItemCase::TransactionOutput => "TRANSACTION_OUTPUT",
            ItemCase::StateChanges => "STATE_CHANGES",
            ItemCase::TraceData => "TRACE_DATA",
            ItemCase::BlockFooter => "BLOCK_FOOTER",
            ItemCase::BlockProof => "BLOCK_PROOF",
            ItemCase::RecordFile => "RECORD_FILE",
            ItemCase::LedgerIdPublication => "LEDGER_ID_PUBLICATION",
            ItemCase::NotSet => "ITEM_NOT_SET",
        };
        f.write_str(name)
    }
}

/// The items of exactly one block, as received from a source
#[derive(Debug, Clone, Default)]
pub struct BlockStream {
    pub items: Vec<BlockItem>,

    /// Raw bytes as stored in cloud storage, when downloaded
    pub bytes: Option<Vec<u8>>,

    pub filename: String,

    /// When the last item arrived, milliseconds since the epoch
    pub block_complete_time: i64,

    /// When the first item arrived, milliseconds since the epoch
    pub load_start: i64,

    /// Endpoint of the supplying node, or "cloud"
    pub node: String,
}

/// A block read from a block stream, ready for verification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockFile {
    pub index: u64,
    pub consensus_start: i64,
    pub consensus_end: i64,
    pub count: u64,
    pub hash: Sha384Hash,
    pub previous_hash: Sha384Hash,

    /// Root hash as computed, kept when `hash` is reset for legacy blocks
    pub raw_hash: Sha384Hash,

    pub bytes: Option<Vec<u8>>,
    pub name: String,
    pub node: String,
    pub version: u32,
    pub software_version: Option<SoftwareVersion>,
    pub load_start: i64,
    pub load_end: i64,
    pub round_start: Option<u64>,
    pub round_end: Option<u64>,
    pub size: Option<usize>,
    pub block_header: Option<BlockHeader>,
    pub block_proof: Option<BlockProof>,
    pub record_file_item: Option<RecordFileItem>,
    pub ledger_id_publication: Option<LedgerIdPublication>,
}

impl BlockFile {
    pub fn source_type(&self) -> Option<BlockSourceType> {
        stream::source_type_of(&self.name)
    }

    pub fn is_streamed(&self) -> bool {
        stream::is_streamed_filename(&self.name)
    }

    pub fn on_new_round(&mut self, round: u64) {
        if self.round_start.is_none() {
            self.round_start = Some(round);
        }
        self.round_end = Some(round);
    }

    /// Drop the payload, keeping only what the hash chain needs
    pub fn clear(&mut self) {
        self.bytes = None;
        self.block_header = None;
        self.block_proof = None;
        self.record_file_item = None;
        self.ledger_id_publication = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{BlockFooter, RoundHeader};

    #[test]
    fn test_item_case() {
        let header = BlockItem {
            item: Some(Item::BlockHeader(BlockHeader::default())),
        };
        let footer = BlockItem {
            item: Some(Item::BlockFooter(BlockFooter::default())),
        };
        assert_eq!(ItemCase::of(&header), ItemCase::BlockHeader);
        assert!(ItemCase::of(&header).starts_block());
        assert!(!ItemCase::of(&footer).starts_block());
        assert_eq!(ItemCase::of(&BlockItem::default()), ItemCase::NotSet);
        assert_eq!(
            ItemCase::of(&BlockItem {
                item: Some(Item::RoundHeader(RoundHeader { round_number: 1 }))
            })
            .to_string(),
            "ROUND_HEADER"
        );
    }

    #[test]
    fn test_rounds() {
        let mut block_file = BlockFile::default();
        block_file.on_new_round(5);
        block_file.on_new_round(6);
        block_file.on_new_round(7);
        assert_eq!(block_file.round_start, Some(5));
        assert_eq!(block_file.round_end, Some(7));
    }

    #[test]
    fn test_source_type() {
        let block_file = BlockFile {
            name: stream::block_filename(3, false),
            ..Default::default()
        };
        assert!(block_file.is_streamed());
        assert_eq!(block_file.source_type(), Some(BlockSourceType::BlockNode));
    }
}
