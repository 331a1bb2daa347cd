//! Downloads block files from cloud storage

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::DateTime;
use mirror_common::{
    stream::{block_filename, EARLIEST_AVAILABLE_BLOCK_NUMBER},
    StreamType,
};
use prost::Message as _;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::block_stream::BlockStream;
use crate::configuration::DownloaderConfig;
use crate::error::BlockStreamError;
use crate::proto::Block;
use crate::provider::{StreamFileData, StreamFileProvider};
use crate::source::{BlockSource, SourceContext};

/// Node tag of blocks downloaded from cloud storage
pub const CLOUD_NODE: &str = "cloud";

pub struct BlockFileSource {
    context: Arc<SourceContext>,
    provider: Arc<dyn StreamFileProvider>,
    network: String,
    resettable: bool,
    write_files: bool,
    stream_path: PathBuf,
    discovered_network: OnceCell<String>,
}

impl BlockFileSource {
    pub fn new(
        context: Arc<SourceContext>,
        provider: Arc<dyn StreamFileProvider>,
        config: &DownloaderConfig,
    ) -> Self {
        Self {
            context,
            provider,
            network: config.network.clone(),
            resettable: config.bucket.resettable,
            write_files: config.write_files,
            stream_path: config.stream_path.clone(),
            discovered_network: OnceCell::new(),
        }
    }

    async fn network(&self) -> Result<&str> {
        self.discovered_network
            .get_or_try_init(|| self.discover_network())
            .await
            .map(String::as_str)
    }

    /// A resettable network lives in the latest `{network}-{instant}` folder
    async fn discover_network(&self) -> Result<String> {
        if !self.resettable {
            return Ok(self.network.clone());
        }

        let prefix = format!("{}-", self.network);
        let latest = self
            .provider
            .list_network()
            .await?
            .into_iter()
            .filter(|folder| {
                folder
                    .strip_prefix(&prefix)
                    .is_some_and(|instant| DateTime::parse_from_rfc3339(instant).is_ok())
            })
            .max()
            .ok_or_else(|| anyhow!("Failed to discover network folder for '{}'", self.network))?;
        info!("Discovered latest network folder '{latest}'");
        Ok(latest)
    }

    async fn download(&self, block_number: u64, filename: &str) -> Result<()> {
        let load_start = chrono::Utc::now().timestamp_millis();
        let network = self.network().await?;
        let path = format!("{network}/{}/{filename}", StreamType::Block.path());
        let data = self.provider.get(&path).await?;
        debug!("Downloaded block file {filename}");

        let block_stream = block_stream(&data, load_start)?;
        let block_file = self.context.on_block_stream(block_stream).await?;

        let consensus_end_ms = block_file.consensus_end / 1_000_000;
        info!(
            target: "mirror::metrics",
            block = block_number,
            cloud_latency_ms = data.last_modified.timestamp_millis() - consensus_end_ms,
            "Cloud storage latency"
        );

        if self.write_files {
            let archive = self.stream_path.join(&data.path);
            if let Some(parent) = archive.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&archive, &data.bytes).await?;
            debug!("Archived {filename} to {}", archive.display());
        }
        Ok(())
    }
}

fn block_stream(data: &StreamFileData, load_start: i64) -> Result<BlockStream> {
    let decompressed = zstd::decode_all(data.bytes.as_slice())?;
    let block = Block::decode(decompressed.as_slice())?;
    Ok(BlockStream {
        items: block.items,
        bytes: Some(data.bytes.clone()),
        filename: data.filename().to_string(),
        block_complete_time: chrono::Utc::now().timestamp_millis(),
        load_start,
        node: CLOUD_NODE.to_string(),
    })
}

#[async_trait]
impl BlockSource for BlockFileSource {
    async fn get(&self) -> Result<()> {
        let Some(block_number) = self.context.next_block_number().await? else {
            return Ok(());
        };
        if block_number == EARLIEST_AVAILABLE_BLOCK_NUMBER {
            return Err(BlockStreamError::EarliestNotSupported("BlockFileSource").into());
        }

        let filename = block_filename(block_number, true);
        match self.download(block_number, &filename).await {
            Ok(()) => Ok(()),
            Err(source) => Err(BlockStreamError::Download { filename, source }.into()),
        }
    }
}
