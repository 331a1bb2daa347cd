//! Migration of a network from record streams to block streams
//!
//! While the last verified file is still a record file and block streams are not
//! enabled, the service alternates between the two stream types every cutover
//! threshold so each downloader gets a chance to find the network's first block.
//! Once the retained history is entirely in block format, block streams are
//! enabled and record streams disabled for the rest of the process lifetime.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use mirror_common::{RecordFile, StreamType};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::notifier::StreamFileNotifier;
use crate::repository::RecordFileRepository;

/// Runtime switches for each stream type, seeded from configuration
#[derive(Debug, Default)]
pub struct StreamToggles {
    block: AtomicBool,
    record: AtomicBool,
}

impl StreamToggles {
    pub fn new(block: bool, record: bool) -> Self {
        Self {
            block: AtomicBool::new(block),
            record: AtomicBool::new(record),
        }
    }

    pub fn is_enabled(&self, stream_type: StreamType) -> bool {
        match stream_type {
            StreamType::Block => self.block.load(Ordering::SeqCst),
            StreamType::Record => self.record.load(Ordering::SeqCst),
        }
    }

    pub fn set(&self, stream_type: StreamType, enabled: bool) {
        match stream_type {
            StreamType::Block => self.block.store(enabled, Ordering::SeqCst),
            StreamType::Record => self.record.store(enabled, Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
struct CutoverState {
    current: Option<StreamType>,
    last_switched_or_verified: Option<Instant>,
    first_record_file: Option<RecordFile>,
    last_record_file: Option<RecordFile>,
    loaded: bool,
    completion_logged: bool,
}

pub struct CutoverService {
    has_cutover: bool,
    network: String,
    threshold: Duration,
    toggles: Arc<StreamToggles>,
    repository: Arc<dyn RecordFileRepository>,
    downstream: Arc<dyn StreamFileNotifier>,
    state: Mutex<CutoverState>,
}

impl CutoverService {
    pub fn new(
        has_cutover: bool,
        network: &str,
        threshold: Duration,
        toggles: Arc<StreamToggles>,
        repository: Arc<dyn RecordFileRepository>,
        downstream: Arc<dyn StreamFileNotifier>,
    ) -> Self {
        Self {
            has_cutover,
            network: network.to_string(),
            threshold,
            toggles,
            repository,
            downstream,
            state: Mutex::new(CutoverState::default()),
        }
    }

    /// Whether the downloader of `stream_type` may fetch now
    pub async fn should_get_stream(&self, stream_type: StreamType) -> Result<bool> {
        if !self.has_cutover {
            return Ok(self.toggles.is_enabled(stream_type));
        }

        let block_enabled = self.toggles.is_enabled(StreamType::Block);
        if !block_enabled && !self.toggles.is_enabled(StreamType::Record) {
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        self.load(&mut state)?;
        let now = Instant::now();
        let last_switched = *state.last_switched_or_verified.get_or_insert(now);

        if state.last_record_file.as_ref().is_some_and(RecordFile::is_block_stream) {
            let completed =
                state.first_record_file.as_ref().is_some_and(RecordFile::is_block_stream);
            if completed && !block_enabled && !state.completion_logged {
                warn!(
                    "Cutover of {} has completed, enabling block stream and disabling record stream. \
                     Persist this in the configuration",
                    self.network
                );
                state.completion_logged = true;
                self.toggles.set(StreamType::Block, true);
                self.toggles.set(StreamType::Record, false);
                self.downstream.cutover_completed(&self.network, StreamType::Block).await?;
            }
            return Ok(self.toggles.is_enabled(stream_type));
        }

        if block_enabled {
            return Ok(stream_type == StreamType::Block);
        }

        let current = *state.current.get_or_insert(StreamType::Record);
        if now.duration_since(last_switched) >= self.threshold {
            let next = current.other();
            info!("Switching from {current} to {next}");
            state.current = Some(next);
            state.last_switched_or_verified = Some(now);
            return Ok(stream_type == next);
        }
        Ok(stream_type == current)
    }

    pub async fn last_record_file(&self) -> Result<Option<RecordFile>> {
        let mut state = self.state.lock().await;
        self.load(&mut state)?;
        Ok(state.last_record_file.clone())
    }

    fn load(&self, state: &mut CutoverState) -> Result<()> {
        if !state.loaded {
            state.first_record_file = self.repository.find_first()?;
            state.last_record_file = self.repository.find_latest()?;
            state.loaded = true;
        }
        Ok(())
    }
}

#[async_trait]
impl StreamFileNotifier for CutoverService {
    async fn verified(&self, record_file: RecordFile) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            self.load(&mut state)?;
            if state.first_record_file.is_none() {
                state.first_record_file = Some(record_file.clone());
            }
            let mut last = record_file.clone();
            last.bytes = None;
            state.last_record_file = Some(last);
            state.last_switched_or_verified = Some(Instant::now());
        }
        self.downstream.verified(record_file).await
    }

    async fn cutover_completed(&self, network: &str, enabled: StreamType) -> Result<()> {
        self.downstream.cutover_completed(network, enabled).await
    }
}
