//! SHA-384 merkle hashing of block contents and block state proofs

use anyhow::{bail, Result};
use mirror_common::{hash::SHA384_HASH_SIZE, Sha384Hash};
use prost::Message as _;
use sha2::{Digest, Sha384};

use crate::error::VerificationError;
use crate::proto::{block_item::Item, BlockItem, MerklePath, Timestamp};

const LEAF_PREFIX: u8 = 0x00;
const SINGLE_CHILD_PREFIX: u8 = 0x01;
const INTERNAL_PREFIX: u8 = 0x02;

const SIBLING_GROUP_SIZE: usize = 4;
const DEPTH3_RIGHT_SIBLING_INDEX: usize = 2;
const MIN_PREVIOUS_BLOCK_ROOT_SIBLINGS: usize = 7;

fn finish(hasher: Sha384) -> Sha384Hash {
    let mut bytes = [0u8; SHA384_HASH_SIZE];
    bytes.copy_from_slice(&hasher.finalize());
    Sha384Hash::new(bytes)
}

pub fn hash_leaf(data: &[u8]) -> Sha384Hash {
    let mut hasher = Sha384::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    finish(hasher)
}

pub fn hash_internal_node(left: &[u8], right: &[u8]) -> Sha384Hash {
    let mut hasher = Sha384::new();
    hasher.update([INTERNAL_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    finish(hasher)
}

/// Hash of an internal node whose only child is `child`
pub fn hash_single_child(child: &[u8]) -> Sha384Hash {
    let mut hasher = Sha384::new();
    hasher.update([SINGLE_CHILD_PREFIX]);
    hasher.update(child);
    finish(hasher)
}

/// Merkle tree built one leaf at a time, keeping only the roots of complete subtrees
#[derive(Debug, Default, Clone)]
pub struct IncrementalStreamingHasher {
    hashes: Vec<Sha384Hash>,
    leaf_count: u64,
}

impl IncrementalStreamingHasher {
    pub fn add_leaf(&mut self, data: &[u8]) {
        let mut hash = hash_leaf(data);
        let mut n = self.leaf_count;
        while n & 1 == 1 {
            let Some(left) = self.hashes.pop() else {
                break;
            };
            hash = hash_internal_node(left.as_ref(), hash.as_ref());
            n >>= 1;
        }
        self.hashes.push(hash);
        self.leaf_count += 1;
    }

    pub fn root_hash(&self) -> Sha384Hash {
        let Some((last, rest)) = self.hashes.split_last() else {
            // Precomputed empty tree root, not a leaf hash
            return Sha384Hash::digest(&[0x00]);
        };
        rest.iter()
            .rev()
            .fold(*last, |acc, hash| hash_internal_node(hash.as_ref(), acc.as_ref()))
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }
}

/// Computes a block's root hash from its items.
///
/// ```text
///                 root
///                /    \
///        timestamp    [single child]
///                          |
///          8 subtree roots combined pairwise
/// ```
///
/// The subtree roots are, in order: previous block root, root of all previous
/// block hashes, start of block state root, consensus headers, inputs, outputs,
/// state changes, and trace data.
#[derive(Debug, Default)]
pub struct BlockRootHashDigest {
    consensus_headers: IncrementalStreamingHasher,
    inputs: IncrementalStreamingHasher,
    outputs: IncrementalStreamingHasher,
    state_changes: IncrementalStreamingHasher,
    trace_data: IncrementalStreamingHasher,
    block_timestamp: Option<Timestamp>,
    previous_hash: Option<Vec<u8>>,
    previous_blocks_tree_hash: Option<Vec<u8>>,
    start_of_block_state_hash: Option<Vec<u8>>,
}

impl BlockRootHashDigest {
    pub fn add_item(&mut self, item: &BlockItem) {
        let hasher = match &item.item {
            Some(Item::BlockHeader(header)) => {
                self.block_timestamp = Some(header.block_timestamp.clone().unwrap_or_default());
                &mut self.outputs
            }
            Some(Item::BlockFooter(footer)) => {
                self.previous_hash = Some(footer.previous_block_root_hash.clone());
                self.previous_blocks_tree_hash =
                    Some(footer.root_hash_of_all_block_hashes_tree.clone());
                self.start_of_block_state_hash = Some(footer.start_of_block_state_root_hash.clone());
                return;
            }
            Some(Item::EventHeader(_)) | Some(Item::RoundHeader(_)) => &mut self.consensus_headers,
            Some(Item::TransactionOutput(_)) | Some(Item::TransactionResult(_)) => &mut self.outputs,
            Some(Item::SignedTransaction(_)) => &mut self.inputs,
            Some(Item::StateChanges(_)) => &mut self.state_changes,
            Some(Item::TraceData(_)) => &mut self.trace_data,
            _ => return,
        };
        hasher.add_leaf(&item.encode_to_vec());
    }

    pub fn digest(&self) -> Result<Sha384Hash> {
        let (timestamp, leaves) = self.leaves()?;
        let depth2_left = combine(leaves);
        let depth1_right = hash_single_child(&depth2_left);
        let depth1_left = hash_leaf(&timestamp.encode_to_vec());
        Ok(hash_internal_node(depth1_left.as_ref(), depth1_right.as_ref()))
    }

    fn leaves(&self) -> Result<(Timestamp, Vec<Vec<u8>>)> {
        let (Some(timestamp), Some(previous), Some(tree), Some(state)) = (
            self.block_timestamp.clone(),
            &self.previous_hash,
            &self.previous_blocks_tree_hash,
            &self.start_of_block_state_hash,
        ) else {
            bail!("Block timestamp, previous hash, previous blocks tree hash or start of block state hash is not set");
        };

        let leaves = vec![
            previous.clone(),
            tree.clone(),
            state.clone(),
            self.consensus_headers.root_hash().to_vec(),
            self.inputs.root_hash().to_vec(),
            self.outputs.root_hash().to_vec(),
            self.state_changes.root_hash().to_vec(),
            self.trace_data.root_hash().to_vec(),
        ];
        Ok((timestamp, leaves))
    }
}

/// Pairwise combine a power of two count of nodes into their root
fn combine(mut nodes: Vec<Vec<u8>>) -> Vec<u8> {
    while nodes.len() > 1 {
        nodes = nodes
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_internal_node(left, right).to_vec(),
                [single] => single.clone(),
                _ => Vec::new(),
            })
            .collect();
    }
    nodes.pop().unwrap_or_default()
}

/// Recompute the signed root hash from a block state proof.
///
/// The second path leads from the previous block root through the block's own
/// root (checked after the first 4 siblings) up to the signed root.
pub fn state_proof_root_hash(
    block_number: u64,
    current_root_hash: &Sha384Hash,
    paths: &[MerklePath],
) -> Result<Sha384Hash, VerificationError> {
    let [timestamp_path, previous_root_path, _] = paths else {
        return Err(VerificationError::InvalidPathCount(block_number));
    };

    let siblings = &previous_root_path.siblings;
    if siblings.len() < MIN_PREVIOUS_BLOCK_ROOT_SIBLINGS {
        return Err(VerificationError::TooFewSiblings(block_number));
    }

    let mut hash = previous_root_path.hash.clone();
    for (i, sibling) in siblings.iter().enumerate() {
        let node = if sibling.is_left {
            hash_internal_node(&sibling.hash, &hash)
        } else {
            hash_internal_node(&hash, &sibling.hash)
        };
        hash = node.to_vec();

        if i % SIBLING_GROUP_SIZE == DEPTH3_RIGHT_SIBLING_INDEX {
            // Implicit single child of the depth 1 right node
            hash = hash_single_child(&hash).to_vec();
        }

        if i == SIBLING_GROUP_SIZE - 1 && current_root_hash != hash.as_slice() {
            return Err(VerificationError::RootHashMismatch {
                index: block_number,
                expected: current_root_hash.to_string(),
                actual: hex::encode(&hash),
            });
        }
    }

    let depth1_left = hash_leaf(&timestamp_path.timestamp_leaf);
    Ok(hash_internal_node(depth1_left.as_ref(), &hash))
}
