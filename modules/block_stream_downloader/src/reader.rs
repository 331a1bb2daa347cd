//! Reads a block stream into a block file

use anyhow::{anyhow, bail, Result};
use mirror_common::{stream::BLOCK_STREAM_VERSION, Sha384Hash};
use prost::Message as _;

use crate::block_stream::{BlockFile, BlockStream, ItemCase};
use crate::configuration::SoftwareVersion;
use crate::hashing::BlockRootHashDigest;
use crate::proto::{block_item::Item, RecordFileItem, Timestamp};

fn hash_from(bytes: &[u8], what: &str, filename: &str) -> Result<Sha384Hash> {
    Sha384Hash::try_from(bytes)
        .map_err(|_| anyhow!("Invalid {what} of {} bytes in {filename}", bytes.len()))
}

fn nanos(timestamp: Option<&Timestamp>) -> i64 {
    timestamp.map(Timestamp::to_nanos).unwrap_or_default()
}

pub fn read(block_stream: BlockStream) -> Result<BlockFile> {
    let BlockStream {
        items,
        bytes,
        filename,
        load_start,
        node,
        ..
    } = block_stream;

    let size = bytes.as_ref().map(Vec::len).unwrap_or_else(|| {
        items.iter().map(|item| item.encoded_len()).sum()
    });
    let mut block_file = BlockFile {
        bytes,
        name: filename,
        node,
        load_start,
        size: Some(size),
        ..Default::default()
    };

    let Some(first) = items.first() else {
        bail!("Block stream {} has no block items", block_file.name);
    };
    match &first.item {
        Some(Item::RecordFile(record_file)) => read_record_file(block_file, record_file),
        Some(Item::BlockHeader(_)) => {
            let mut digest = BlockRootHashDigest::default();
            for item in &items {
                digest.add_item(item);
                read_item(&mut block_file, item.item.as_ref())?;
            }
            block_file.hash = digest.digest()?;
            block_file.raw_hash = block_file.hash;
            block_file.version = BLOCK_STREAM_VERSION;
            block_file.load_end = chrono::Utc::now().timestamp_millis();
            Ok(block_file)
        }
        _ => bail!(
            "Block stream {} starts with {}",
            block_file.name,
            ItemCase::of(first)
        ),
    }
}

fn read_item(block_file: &mut BlockFile, item: Option<&Item>) -> Result<()> {
    match item {
        Some(Item::BlockHeader(header)) => {
            block_file.index = header.number;
            block_file.consensus_start = nanos(header.block_timestamp.as_ref());
            block_file.consensus_end = block_file.consensus_start;
            block_file.software_version = header
                .software_version
                .as_ref()
                .map(|v| SoftwareVersion::new(v.major, v.minor, v.patch));
            block_file.block_header = Some(header.clone());
        }
        Some(Item::RoundHeader(round)) => block_file.on_new_round(round.round_number),
        Some(Item::SignedTransaction(_)) => block_file.count += 1,
        Some(Item::TransactionResult(result)) => {
            let timestamp = nanos(result.consensus_timestamp.as_ref());
            block_file.consensus_end = block_file.consensus_end.max(timestamp);
        }
        Some(Item::BlockFooter(footer)) => {
            block_file.previous_hash = hash_from(
                &footer.previous_block_root_hash,
                "previous block root hash",
                &block_file.name,
            )?;
        }
        Some(Item::BlockProof(proof)) => block_file.block_proof = Some(proof.clone()),
        Some(Item::LedgerIdPublication(publication)) => {
            block_file.ledger_id_publication = Some(publication.clone());
        }
        _ => {}
    }
    Ok(())
}

fn read_record_file(mut block_file: BlockFile, record_file: &RecordFileItem) -> Result<BlockFile> {
    block_file.index = record_file.index;
    block_file.consensus_start = nanos(record_file.consensus_start.as_ref());
    block_file.consensus_end = nanos(record_file.consensus_end.as_ref());
    block_file.count = record_file.count;
    block_file.hash = hash_from(&record_file.hash, "hash", &block_file.name)?;
    block_file.raw_hash = block_file.hash;
    block_file.previous_hash = hash_from(&record_file.previous_hash, "previous hash", &block_file.name)?;
    block_file.version = record_file.version;
    block_file.load_end = chrono::Utc::now().timestamp_millis();
    block_file.record_file_item = Some(record_file.clone());
    Ok(block_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{
        BlockFooter, BlockHeader, BlockItem, BlockProof, RoundHeader, SemanticVersion,
        SignedTransaction, TransactionResult,
    };

    fn item(item: Item) -> BlockItem {
        BlockItem { item: Some(item) }
    }

    fn block_items() -> Vec<BlockItem> {
        vec![
            item(Item::BlockHeader(BlockHeader {
                number: 21,
                block_timestamp: Some(Timestamp {
                    seconds: 100,
                    nanos: 1,
                }),
                software_version: Some(SemanticVersion {
                    major: 0,
                    minor: 65,
                    patch: 1,
                }),
                ..Default::default()
            })),
            item(Item::RoundHeader(RoundHeader { round_number: 8 })),
            item(Item::SignedTransaction(SignedTransaction::default())),
            item(Item::TransactionResult(TransactionResult {
                consensus_timestamp: Some(Timestamp {
                    seconds: 100,
                    nanos: 9,
                }),
                ..Default::default()
            })),
            item(Item::RoundHeader(RoundHeader { round_number: 9 })),
            item(Item::SignedTransaction(SignedTransaction::default())),
            item(Item::BlockFooter(BlockFooter {
                previous_block_root_hash: vec![4; 48],
                root_hash_of_all_block_hashes_tree: vec![5; 48],
                start_of_block_state_root_hash: vec![6; 48],
            })),
            item(Item::BlockProof(BlockProof {
                block: 21,
                proof: None,
            })),
        ]
    }

    #[test]
    fn test_read_block() {
        let items = block_items();
        let block_stream = BlockStream {
            items: items.clone(),
            filename: "0000000000000000021.blk".to_string(),
            load_start: 5,
            node: "node:1".to_string(),
            ..Default::default()
        };

        let block_file = read(block_stream).unwrap();
        assert_eq!(block_file.index, 21);
        assert_eq!(block_file.consensus_start, 100_000_000_001);
        assert_eq!(block_file.consensus_end, 100_000_000_009);
        assert_eq!(block_file.count, 2);
        assert_eq!(block_file.round_start, Some(8));
        assert_eq!(block_file.round_end, Some(9));
        assert_eq!(block_file.previous_hash, Sha384Hash::new([4; 48]));
        assert_eq!(block_file.software_version, Some(SoftwareVersion::new(0, 65, 1)));
        assert_eq!(block_file.version, BLOCK_STREAM_VERSION);
        assert_eq!(block_file.node, "node:1");
        assert!(block_file.block_proof.is_some());

        let mut digest = BlockRootHashDigest::default();
        items.iter().for_each(|i| digest.add_item(i));
        assert_eq!(block_file.hash, digest.digest().unwrap());
        assert_eq!(block_file.raw_hash, block_file.hash);
    }

    #[test]
    fn test_read_record_file_item() {
        let record_file = RecordFileItem {
            index: 4,
            consensus_start: Some(Timestamp {
                seconds: 1,
                nanos: 0,
            }),
            consensus_end: Some(Timestamp {
                seconds: 2,
                nanos: 0,
            }),
            hash: vec![1; 48],
            previous_hash: vec![2; 48],
            version: 6,
            count: 11,
            record_file_contents: vec![],
        };
        let block_stream = BlockStream {
            items: vec![item(Item::RecordFile(record_file))],
            filename: "0000000000000000004.blk".to_string(),
            ..Default::default()
        };

        let block_file = read(block_stream).unwrap();
        assert_eq!(block_file.index, 4);
        assert_eq!(block_file.version, 6);
        assert_eq!(block_file.count, 11);
        assert_eq!(block_file.hash, Sha384Hash::new([1; 48]));
        assert_eq!(block_file.consensus_end, 2_000_000_000);
        assert!(block_file.record_file_item.is_some());
    }

    #[test]
    fn test_read_errors() {
        assert!(read(BlockStream::default()).is_err());

        let mut items = block_items();
        items.remove(0);
        let block_stream = BlockStream {
            items,
            ..Default::default()
        };
        assert!(read(block_stream).is_err());

        // Footer with a truncated previous hash
        let mut items = block_items();
        items[6] = item(Item::BlockFooter(BlockFooter {
            previous_block_root_hash: vec![4; 10],
            ..Default::default()
        }));
        let block_stream = BlockStream {
            items,
            ..Default::default()
        };
        assert!(read(block_stream).is_err());
    }
}
