use mirror_common::RecordFile;

use crate::block_stream::BlockFile;

/// Translate a verified block into the legacy record file shape
pub fn to_record_file(block_file: &BlockFile) -> RecordFile {
    RecordFile {
        index: block_file.index,
        consensus_start: block_file.consensus_start,
        consensus_end: block_file.consensus_end,
        count: block_file.count,
        hash: block_file.hash,
        previous_hash: block_file.previous_hash,
        name: block_file.name.clone(),
        node: block_file.node.clone(),
        version: block_file.version,
        load_start: block_file.load_start,
        load_end: block_file.load_end,
        round_start: block_file.round_start,
        round_end: block_file.round_end,
        size: block_file.size,
        bytes: block_file.bytes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_common::{stream::BLOCK_STREAM_VERSION, Sha384Hash};

    #[test]
    fn test_to_record_file() {
        let block_file = BlockFile {
            index: 12,
            consensus_start: 100,
            consensus_end: 200,
            count: 3,
            hash: Sha384Hash::digest(b"12"),
            previous_hash: Sha384Hash::digest(b"11"),
            name: "0000000000000000012.blk".to_string(),
            node: "localhost:40840".to_string(),
            version: BLOCK_STREAM_VERSION,
            round_start: Some(4),
            round_end: Some(5),
            size: Some(1024),
            ..Default::default()
        };

        let record_file = to_record_file(&block_file);
        assert_eq!(record_file.index, 12);
        assert_eq!(record_file.hash, block_file.hash);
        assert_eq!(record_file.previous_hash, block_file.previous_hash);
        assert_eq!(record_file.consensus_end, 200);
        assert_eq!(record_file.round_end, Some(5));
        assert!(record_file.is_block_stream());
    }
}
