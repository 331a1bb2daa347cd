//! Background latency measurement of standby block nodes

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::assembler::BlockStreamConsumer;
use crate::block_node::BlockNode;
use crate::block_stream::BlockStream;
use crate::reader;
use crate::scheduler::block_latency;
use crate::verifier::BlockStreamVerifier;

/// Measurements started per tick, and running at once
const MAX_TASKS: usize = 2;

const MEASURE_TIMEOUT: Duration = Duration::from_secs(5);

struct Task {
    generation: u64,
    node: Arc<BlockNode>,
}

/// Streams the next block from each candidate node in turn and records its latency.
///
/// Setting new candidates bumps the generation, which retires every task of the
/// previous one.
pub struct LatencyService {
    verifier: Arc<BlockStreamVerifier>,
    generation: AtomicU64,
    tasks: Mutex<VecDeque<Task>>,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl LatencyService {
    pub fn new(verifier: Arc<BlockStreamVerifier>) -> Self {
        Self {
            verifier,
            generation: AtomicU64::new(0),
            tasks: Mutex::new(VecDeque::new()),
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel_all(&self) {
        if let Ok(mut running) = self.running.lock() {
            running.drain(..).for_each(|handle| handle.abort());
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.clear();
        }
    }

    pub fn set_nodes(&self, nodes: Vec<Arc<BlockNode>>) {
        self.cancel_all();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(nodes.into_iter().map(|node| Task { generation, node }));
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or_default()
    }

    /// Starts up to two pending measurements
    pub fn schedule_tasks(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock().map_err(|_| anyhow!("poisoned"))?;
        running.retain(|handle| !handle.is_finished());

        let mut tasks = self.tasks.lock().map_err(|_| anyhow!("poisoned"))?;
        for _ in 0..MAX_TASKS {
            if running.len() >= MAX_TASKS {
                break;
            }
            let Some(task) = tasks.pop_front() else {
                break;
            };
            let service = self.clone();
            running.push(tokio::spawn(async move { service.measure(task).await }));
        }
        Ok(())
    }

    /// Ticks forever at `interval`
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.schedule_tasks() {
                debug!("Failed to schedule latency measurements: {e:#}");
            }
        }
    }

    fn is_current(&self, task: &Task) -> bool {
        task.generation == self.generation.load(Ordering::SeqCst)
    }

    async fn measure(&self, task: Task) {
        if !self.is_current(&task) {
            return;
        }

        let next_block_number = match self.verifier.next_block_number().await {
            Ok(n) => n,
            Err(e) => {
                debug!("Failed to get next block number: {e:#}");
                return;
            }
        };
        if !task.node.has_block(next_block_number).await {
            return;
        }

        let mut measurement = LatencyMeasurement {
            node: task.node.clone(),
        };
        if let Err(e) = task
            .node
            .stream_blocks(next_block_number, Some(next_block_number), &mut measurement, MEASURE_TIMEOUT)
            .await
        {
            debug!("Failed to measure latency of {}: {e:#}", task.node);
        }

        if self.is_current(&task) {
            if let Ok(mut tasks) = self.tasks.lock() {
                tasks.push_back(task);
            }
        }
    }
}

struct LatencyMeasurement {
    node: Arc<BlockNode>,
}

#[async_trait]
impl BlockStreamConsumer for LatencyMeasurement {
    async fn on_block_stream(&mut self, block_stream: BlockStream) -> Result<bool> {
        let block_complete_time = block_stream.block_complete_time;
        let block_file = reader::read(block_stream)?;
        let latency = block_latency(&block_file, block_complete_time);
        debug!("Measured latency {latency}ms of {}", self.node);
        self.node.record_latency(latency);
        Ok(false)
    }
}
