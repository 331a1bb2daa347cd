//! Mirror node block stream downloader module for Caryatid
//! Acquires blocks from cloud storage or block nodes, verifies them and publishes
//! each verified block as a record file
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use caryatid_sdk::{module, Context, Module};
use config::Config;
use mirror_common::messages::Message;
use tokio::time::MissedTickBehavior;
use tracing::info;

pub mod assembler;
pub mod block_node;
pub mod block_stream;
pub mod composite;
pub mod configuration;
pub mod cutover;
pub mod error;
pub mod file_source;
pub mod hashing;
pub mod latency;
pub mod latency_service;
pub mod notifier;
pub mod proto;
pub mod provider;
pub mod reader;
pub mod repository;
pub mod scheduler;
pub mod source;
pub mod subscriber;
pub mod transformer;
pub mod tss;
pub mod verifier;

use block_node::create_nodes;
use composite::CompositeBlockSource;
use configuration::{BucketKind, DownloaderConfig};
use cutover::{CutoverService, StreamToggles};
use file_source::BlockFileSource;
use latency_service::LatencyService;
use notifier::BusStreamFileNotifier;
use provider::{HttpStreamFileProvider, LocalStreamFileProvider, StreamFileProvider};
use repository::{FjallRecordFileRepository, RecordFileRepository};
use scheduler::PriorityAndLatencyScheduler;
use source::SourceContext;
use subscriber::BlockNodeSubscriber;
use tss::WeightedEd25519Verifier;
use verifier::BlockStreamVerifier;

/// Block stream downloader module
#[module(
    message_type(Message),
    name = "block-stream-downloader",
    description = "Block stream acquisition, failover and verification"
)]
pub struct BlockStreamDownloader;

impl BlockStreamDownloader {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let config = DownloaderConfig::try_load(&config)?;
        info!(
            "Downloading {} blocks with source type {:?} from {} block nodes",
            config.network,
            config.source_type,
            config.nodes.len()
        );

        let repository: Arc<dyn RecordFileRepository> = Arc::new(FjallRecordFileRepository::new(
            &config.database_path,
            config.clear_on_start,
        )?);
        let bus_notifier = Arc::new(BusStreamFileNotifier::new(
            context.clone(),
            repository.clone(),
            &config.verified_topic,
            &config.cutover_topic,
        ));
        let toggles = Arc::new(StreamToggles::new(config.enabled, config.record_enabled));
        let cutover = Arc::new(CutoverService::new(
            config.has_cutover(),
            &config.network,
            config.cutover_threshold(),
            toggles,
            repository.clone(),
            bus_notifier,
        ));

        let tss = Arc::new(WeightedEd25519Verifier::new(repository.clone(), config.ledger.clone()));
        let verifier = Arc::new(BlockStreamVerifier::new(
            repository,
            cutover.clone(),
            tss,
            config.min_consensus_version()?,
        ));
        let source_context = Arc::new(SourceContext {
            verifier: verifier.clone(),
            cutover,
            end_block_number: config.end_block_number,
        });

        let provider: Arc<dyn StreamFileProvider> = match config.bucket.kind {
            BucketKind::Http => Arc::new(HttpStreamFileProvider::new(&config.bucket)?),
            BucketKind::Local => Arc::new(LocalStreamFileProvider::new(&config.bucket.path)),
        };
        let file_source = Arc::new(BlockFileSource::new(source_context.clone(), provider, &config));

        let nodes = create_nodes(&config.nodes, &config.stream)?;
        let latency_service = Arc::new(LatencyService::new(verifier.clone()));
        let scheduler = Arc::new(PriorityAndLatencyScheduler::new(
            nodes,
            config.scheduling.clone(),
            latency_service.clone(),
        ));
        let subscriber = Arc::new(BlockNodeSubscriber::new(
            source_context,
            scheduler,
            config.stream.response_timeout(),
        ));

        // With a cutover the sources stay scheduled, the cutover service decides whether they fetch
        let composite = CompositeBlockSource::new(
            file_source,
            subscriber,
            verifier,
            config.enabled || config.has_cutover(),
            config.source_type,
            !config.nodes.is_empty(),
        );

        if config.scheduling.latency_enabled && !config.nodes.is_empty() {
            let interval = Duration::from_millis(config.scheduling.latency_measure_interval_ms);
            context.run(latency_service.run(interval));
        }

        let frequency = config.frequency();
        context.run(async move {
            let mut interval = tokio::time::interval(frequency);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                composite.get().await;
            }
        });

        Ok(())
    }
}
