//! Selection of the block node to stream from

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use mirror_common::stream::EARLIEST_AVAILABLE_BLOCK_NUMBER;
use tracing::{debug, info};

use crate::block_node::BlockNode;
use crate::block_stream::BlockFile;
use crate::configuration::SchedulingConfig;
use crate::error::BlockStreamError;
use crate::latency_service::LatencyService;

/// Milliseconds between a block's consensus end and its complete arrival
pub fn block_latency(block_file: &BlockFile, block_complete_time: i64) -> u64 {
    (block_complete_time - block_file.consensus_end / 1_000_000).max(0) as u64
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// The node to stream `block_number` from, with the block number to start at.
    ///
    /// The earliest available sentinel resolves to the first block the node has.
    async fn get_node(&self, block_number: u64) -> Result<(Arc<BlockNode>, u64)>;

    /// Called after every verified block, true stops the stream so it can be rescheduled
    fn should_reschedule(&self, block_file: &BlockFile, block_complete_time: i64) -> bool;
}

#[derive(Default)]
struct SchedulerState {
    current: Option<Arc<BlockNode>>,
    candidates: Vec<Arc<BlockNode>>,
    last_post_processing_latency: i64,
}

/// Prefers lower priority groups, then lower latency within a group.
///
/// Nodes ranked after the current one in its group are measured in the background,
/// and the stream is rescheduled once one of them is faster by the configured margin.
pub struct PriorityAndLatencyScheduler {
    groups: BTreeMap<i32, Vec<Arc<BlockNode>>>,
    config: SchedulingConfig,
    latency_service: Arc<LatencyService>,
    state: std::sync::Mutex<SchedulerState>,
}

impl PriorityAndLatencyScheduler {
    pub fn new(
        nodes: Vec<Arc<BlockNode>>,
        config: SchedulingConfig,
        latency_service: Arc<LatencyService>,
    ) -> Self {
        let mut groups: BTreeMap<i32, Vec<Arc<BlockNode>>> = BTreeMap::new();
        for node in nodes {
            groups.entry(node.priority()).or_default().push(node);
        }
        Self {
            groups,
            config,
            latency_service,
            state: std::sync::Mutex::new(SchedulerState::default()),
        }
    }

    fn sorted_group(&self, priority: i32) -> Vec<Arc<BlockNode>> {
        let mut group = self.groups.get(&priority).cloned().unwrap_or_default();
        group.sort_by(|a, b| a.compare(b));
        group
    }

    fn ordered_nodes(&self) -> Vec<Arc<BlockNode>> {
        self.groups.keys().flat_map(|priority| self.sorted_group(*priority)).collect()
    }

    fn select(&self, node: &Arc<BlockNode>) {
        let candidates: Vec<Arc<BlockNode>> = self
            .sorted_group(node.priority())
            .into_iter()
            .skip_while(|other| !Arc::ptr_eq(other, node))
            .skip(1)
            .collect();
        debug!("Selected block node {node} with {} candidates", candidates.len());

        if self.config.latency_enabled {
            self.latency_service.set_nodes(candidates.clone());
        }
        if let Ok(mut state) = self.state.lock() {
            state.current = Some(node.clone());
            state.candidates = candidates;
            state.last_post_processing_latency = 0;
        }
    }

    fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = SchedulerState::default();
        }
    }
}

async fn resolve_start(node: &BlockNode, block_number: u64) -> Option<u64> {
    let range = node.get_block_range().await?;
    if block_number == EARLIEST_AVAILABLE_BLOCK_NUMBER {
        Some(*range.start())
    } else {
        range.contains(&block_number).then_some(block_number)
    }
}

#[async_trait]
impl Scheduler for PriorityAndLatencyScheduler {
    async fn get_node(&self, block_number: u64) -> Result<(Arc<BlockNode>, u64)> {
        self.latency_service.cancel_all();

        let mut inactive = Vec::new();
        for node in self.ordered_nodes() {
            node.try_readmit(false);
            if !node.is_active() {
                inactive.push(node);
                continue;
            }
            if let Some(start) = resolve_start(&node, block_number).await {
                self.select(&node);
                return Ok((node, start));
            }
        }

        // Last resort, the first inactive node with the block
        for node in inactive {
            if let Some(start) = resolve_start(&node, block_number).await {
                node.try_readmit(true);
                self.select(&node);
                return Ok((node, start));
            }
        }

        self.clear();
        Err(BlockStreamError::NoNodeAvailable(block_number).into())
    }

    fn should_reschedule(&self, block_file: &BlockFile, block_complete_time: i64) -> bool {
        if !self.config.latency_enabled {
            return false;
        }
        let Ok(mut state) = self.state.lock() else {
            return false;
        };

        let now = chrono::Utc::now().timestamp_millis();
        let previous = std::mem::replace(
            &mut state.last_post_processing_latency,
            now - block_complete_time,
        );
        // Slow post-processing delays reading the stream and skews the latency
        let max_latency = self.config.max_post_processing_latency_ms;
        if previous > max_latency as i64 {
            return false;
        }

        let Some(current) = state.current.as_ref() else {
            return false;
        };
        current.record_latency(block_latency(block_file, block_complete_time));
        let latency = current.latency();
        let faster = state
            .candidates
            .iter()
            .find(|candidate| latency.saturating_sub(candidate.latency()) >= max_latency);
        if let Some(candidate) = faster {
            info!("Rescheduling from {current} to lower latency block node {candidate}");
            return true;
        }
        false
    }
}
