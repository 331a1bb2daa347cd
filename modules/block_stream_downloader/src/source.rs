//! Common behaviour of the block sources

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use mirror_common::{stream::EARLIEST_AVAILABLE_BLOCK_NUMBER, StreamType};
use tracing::debug;

use crate::block_stream::{BlockFile, BlockStream};
use crate::cutover::CutoverService;
use crate::reader;
use crate::verifier::BlockStreamVerifier;

#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch and verify the next blocks, failing when the source is unhealthy
    async fn get(&self) -> Result<()>;
}

/// Gating and verification shared by the file source and the block node subscriber
pub struct SourceContext {
    pub verifier: Arc<BlockStreamVerifier>,
    pub cutover: Arc<CutoverService>,
    pub end_block_number: Option<u64>,
}

impl SourceContext {
    /// The block to fetch next, None when block streams are not wanted now or the end was reached
    pub async fn next_block_number(&self) -> Result<Option<u64>> {
        if !self.cutover.should_get_stream(StreamType::Block).await? {
            return Ok(None);
        }

        let block_number = self.verifier.next_block_number().await?;
        if let Some(end) = self.end_block_number {
            if block_number != EARLIEST_AVAILABLE_BLOCK_NUMBER && block_number > end {
                debug!("Reached end block number {end}");
                return Ok(None);
            }
        }
        Ok(Some(block_number))
    }

    pub async fn on_block_stream(&self, block_stream: BlockStream) -> Result<BlockFile> {
        let block_file = reader::read(block_stream)?;
        self.verifier.verify(block_file).await
    }
}
