//! Reassembles one block from the item batches of a block node subscription

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use mirror_common::stream::block_filename;
use tracing::{debug, warn};

use crate::block_stream::{BlockStream, ItemCase};
use crate::error::BlockStreamError;
use crate::proto::{block_item::Item, BlockItem};

/// Receives each completed block.
///
/// Returning `true` asks the stream to stop after this block so the caller can
/// reschedule, `false` keeps it streaming.
#[async_trait]
pub trait BlockStreamConsumer: Send {
    async fn on_block_stream(&mut self, block_stream: BlockStream) -> Result<bool>;
}

/// Per-block read deadline. The clock starts on the first query after a reset,
/// so a trickle of small batches shares one budget.
#[derive(Debug)]
pub struct TimeoutContext {
    timeout: Duration,
    started: Option<Instant>,
}

impl TimeoutContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: None,
        }
    }

    pub fn remaining(&mut self) -> Duration {
        let started = *self.started.get_or_insert_with(Instant::now);
        self.timeout.saturating_sub(started.elapsed())
    }

    pub fn reset(&mut self) {
        self.started = None;
    }
}

pub struct BlockAssembler {
    node: String,
    max_block_items: usize,
    pending: Vec<Vec<BlockItem>>,
    pending_count: usize,
    load_start: i64,
    timeout: TimeoutContext,
}

impl BlockAssembler {
    pub fn new(node: &str, max_block_items: usize, timeout: Duration) -> Self {
        Self {
            node: node.to_string(),
            max_block_items,
            pending: Vec::new(),
            pending_count: 0,
            load_start: 0,
            timeout: TimeoutContext::new(timeout),
        }
    }

    pub fn on_item_batch(&mut self, items: Vec<BlockItem>) -> Result<(), BlockStreamError> {
        let Some(first) = items.first() else {
            warn!("Received empty block item set from {}", self.node);
            return Ok(());
        };

        let first_case = ItemCase::of(first);
        if first_case.starts_block() {
            if !self.pending.is_empty() {
                return Err(BlockStreamError::PreviousBlockPending);
            }
            if first_case == ItemCase::RecordFile && items.len() > 1 {
                return Err(BlockStreamError::RecordFileWithExtraItems);
            }
            self.load_start = chrono::Utc::now().timestamp_millis();
        } else if self.pending.is_empty() {
            return Err(BlockStreamError::IncorrectFirstItem(first_case));
        }

        self.pending_count += items.len();
        if self.pending_count > self.max_block_items {
            return Err(BlockStreamError::TooManyItems {
                received: self.pending_count,
                limit: self.max_block_items,
            });
        }
        self.pending.push(items);
        Ok(())
    }

    /// Completes the pending block and hands it to the consumer, returning the consumer's answer
    pub async fn on_end_of_block(
        &mut self,
        block_number: u64,
        consumer: &mut dyn BlockStreamConsumer,
    ) -> Result<bool> {
        if self.pending.is_empty() {
            return Err(BlockStreamError::NoPendingItems(block_number).into());
        }

        if let Some(Item::BlockHeader(header)) =
            self.pending.first().and_then(|batch| batch.first()).and_then(|item| item.item.as_ref())
        {
            if header.number != block_number {
                warn!(
                    "Block number mismatch in end of block from {}, header = {}, end of block = {}",
                    self.node, header.number, block_number
                );
            }
        }

        let mut items = Vec::with_capacity(self.pending_count);
        for batch in self.pending.drain(..) {
            items.extend(batch);
        }
        self.pending_count = 0;
        self.timeout.reset();

        let block_stream = BlockStream {
            items,
            bytes: None,
            filename: block_filename(block_number, false),
            block_complete_time: chrono::Utc::now().timestamp_millis(),
            load_start: self.load_start,
            node: self.node.clone(),
        };
        debug!("Assembled block {block_number} from {}", self.node);
        consumer.on_block_stream(block_stream).await
    }

    /// Time left to receive the rest of the current block
    pub fn remaining_timeout(&mut self) -> Duration {
        self.timeout.remaining()
    }
}
