//! Top level block source, choosing between cloud storage and block nodes on every tick

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use mirror_common::{stream::is_streamed_filename, BlockSourceType};
use tracing::{error, info};

use crate::configuration::SourceType;
use crate::source::BlockSource;
use crate::verifier::BlockStreamVerifier;

/// Consecutive failures after which a source is unhealthy
const MAX_SOURCE_ERRORS: u32 = 3;

struct SourceHealth {
    source: Arc<dyn BlockSource>,
    source_type: BlockSourceType,
    errors: AtomicU32,
}

impl SourceHealth {
    fn new(source: Arc<dyn BlockSource>, source_type: BlockSourceType) -> Self {
        Self {
            source,
            source_type,
            errors: AtomicU32::new(0),
        }
    }

    fn is_healthy(&self) -> bool {
        self.errors.load(Ordering::SeqCst) < MAX_SOURCE_ERRORS
    }

    fn on_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.errors.store(0, Ordering::SeqCst);
    }
}

pub struct CompositeBlockSource {
    file: SourceHealth,
    block_node: SourceHealth,
    verifier: Arc<BlockStreamVerifier>,
    enabled: bool,
    source_type: SourceType,
    has_nodes: bool,
    current: Mutex<BlockSourceType>,
}

impl CompositeBlockSource {
    pub fn new(
        file: Arc<dyn BlockSource>,
        block_node: Arc<dyn BlockSource>,
        verifier: Arc<BlockStreamVerifier>,
        enabled: bool,
        source_type: SourceType,
        has_nodes: bool,
    ) -> Self {
        Self {
            file: SourceHealth::new(file, BlockSourceType::File),
            block_node: SourceHealth::new(block_node, BlockSourceType::BlockNode),
            verifier,
            enabled,
            source_type,
            has_nodes,
            current: Mutex::new(BlockSourceType::BlockNode),
        }
    }

    fn health(&self, source_type: BlockSourceType) -> &SourceHealth {
        match source_type {
            BlockSourceType::File => &self.file,
            BlockSourceType::BlockNode => &self.block_node,
        }
    }

    async fn select(&self) -> &SourceHealth {
        match self.source_type {
            SourceType::File => &self.file,
            SourceType::BlockNode => &self.block_node,
            SourceType::Auto => {
                // Once blocks arrive from block nodes, there is no going back to files
                let switched = self
                    .verifier
                    .last_block_filename()
                    .await
                    .ok()
                    .flatten()
                    .is_some_and(|name| is_streamed_filename(&name));
                if switched {
                    return &self.block_node;
                }
                if !self.has_nodes {
                    return &self.file;
                }

                let Ok(mut current) = self.current.lock() else {
                    return &self.file;
                };
                if !self.health(*current).is_healthy() {
                    let next = match *current {
                        BlockSourceType::BlockNode => BlockSourceType::File,
                        BlockSourceType::File => BlockSourceType::BlockNode,
                    };
                    info!("Switching from unhealthy {} source to {next}", *current);
                    *current = next;
                }
                self.health(*current)
            }
        }
    }

    /// Runs the selected source once, recording its health and never failing
    pub async fn get(&self) {
        if !self.enabled {
            return;
        }

        let health = self.select().await;
        match health.source.get().await {
            Ok(()) => health.reset(),
            Err(e) => {
                error!("Failed to get block from {} source: {e:#}", health.source_type);
                health.on_error();
            }
        }
    }
}
