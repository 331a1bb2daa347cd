//! Streams live blocks from the scheduled block node

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::assembler::BlockStreamConsumer;
use crate::block_stream::BlockStream;
use crate::scheduler::Scheduler;
use crate::source::{BlockSource, SourceContext};

pub struct BlockNodeSubscriber {
    context: Arc<SourceContext>,
    scheduler: Arc<dyn Scheduler>,
    timeout: Duration,
}

impl BlockNodeSubscriber {
    pub fn new(context: Arc<SourceContext>, scheduler: Arc<dyn Scheduler>, timeout: Duration) -> Self {
        Self {
            context,
            scheduler,
            timeout,
        }
    }
}

#[async_trait]
impl BlockSource for BlockNodeSubscriber {
    async fn get(&self) -> Result<()> {
        let Some(block_number) = self.context.next_block_number().await? else {
            return Ok(());
        };

        let (node, start) = self.scheduler.get_node(block_number).await?;
        info!("Start streaming block {start} from {node}");
        let mut consumer = VerifyingConsumer {
            context: self.context.clone(),
            scheduler: self.scheduler.clone(),
        };
        node.stream_blocks(start, self.context.end_block_number, &mut consumer, self.timeout)
            .await
    }
}

/// Verifies each streamed block, then asks the scheduler whether to keep streaming
struct VerifyingConsumer {
    context: Arc<SourceContext>,
    scheduler: Arc<dyn Scheduler>,
}

#[async_trait]
impl BlockStreamConsumer for VerifyingConsumer {
    async fn on_block_stream(&mut self, block_stream: BlockStream) -> Result<bool> {
        let block_complete_time = block_stream.block_complete_time;
        let block_file = self.context.on_block_stream(block_stream).await?;
        Ok(self.scheduler.should_reschedule(&block_file, block_complete_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_node::{tests::TestBlockNode, BlockNode};
    use crate::block_stream::BlockFile;
    use crate::configuration::{SchedulingConfig, StreamConfig};
    use crate::latency_service::LatencyService;
    use crate::repository::RecordFileRepository;
    use crate::scheduler::PriorityAndLatencyScheduler;
    use crate::source::tests::test_context;
    use mirror_common::RecordFile;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn subscriber(
        servers: Vec<TestBlockNode>,
        end_block_number: Option<u64>,
    ) -> (
        BlockNodeSubscriber,
        Arc<crate::notifier::tests::CollectingNotifier>,
        Arc<crate::repository::InMemoryRecordFileRepository>,
    ) {
        let (context, repository, notifier) = test_context(end_block_number);
        let mut nodes = Vec::new();
        for (priority, server) in servers.into_iter().enumerate() {
            let properties = server.spawn(priority as i32).await;
            nodes.push(Arc::new(BlockNode::new(properties, StreamConfig::default()).unwrap()));
        }
        let latency_service = Arc::new(LatencyService::new(context.verifier.clone()));
        let scheduler = Arc::new(PriorityAndLatencyScheduler::new(
            nodes,
            SchedulingConfig::default(),
            latency_service,
        ));
        (BlockNodeSubscriber::new(context, scheduler, TIMEOUT), notifier, repository)
    }

    #[tokio::test]
    async fn test_streams_from_earliest_available() {
        let (subscriber, notifier, _) = subscriber(vec![TestBlockNode::with_blocks(0..=3)], None).await;
        subscriber.get().await.unwrap();

        let verified = notifier.verified.lock().await;
        assert_eq!(verified.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(verified.iter().all(|r| r.name.ends_with(".blk")));
    }

    #[tokio::test]
    async fn test_continues_after_last_verified() {
        let (subscriber, notifier, repository) =
            subscriber(vec![TestBlockNode::with_blocks(0..=5)], None).await;
        repository
            .save(&RecordFile {
                index: 3,
                ..Default::default()
            })
            .unwrap();
        subscriber.get().await.unwrap();

        let verified = notifier.verified.lock().await;
        assert_eq!(verified.iter().map(|r| r.index).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_respects_end_block_number() {
        let (subscriber, notifier, _) =
            subscriber(vec![TestBlockNode::with_blocks(0..=5)], Some(2)).await;
        subscriber.get().await.unwrap();
        assert_eq!(notifier.verified.lock().await.len(), 3);

        // Nothing left to fetch
        subscriber.get().await.unwrap();
        assert_eq!(notifier.verified.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_verification_failure_propagates() {
        // Two unrelated chains, the second node serves blocks not linked to the first
        let (subscriber, notifier, repository) = subscriber(
            vec![TestBlockNode::with_blocks(1..=2), TestBlockNode::with_blocks(1..=4)],
            None,
        )
        .await;
        repository
            .save(&RecordFile {
                index: 2,
                hash: mirror_common::Sha384Hash::digest(b"elsewhere"),
                ..Default::default()
            })
            .unwrap();

        let error = subscriber.get().await.unwrap_err();
        assert!(error.to_string().contains("block 3"), "{error:#}");
        assert!(notifier.verified.lock().await.is_empty());
    }

    struct StopEveryBlock;

    #[async_trait]
    impl Scheduler for StopEveryBlock {
        async fn get_node(&self, _block_number: u64) -> Result<(Arc<BlockNode>, u64)> {
            unreachable!()
        }

        fn should_reschedule(&self, _block_file: &BlockFile, _block_complete_time: i64) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_reschedule_stops_stream() {
        let (context, _, notifier) = test_context(None);
        let properties = TestBlockNode::with_blocks(0..=3).spawn(0).await;
        let node = BlockNode::new(properties, StreamConfig::default()).unwrap();
        let mut consumer = VerifyingConsumer {
            context,
            scheduler: Arc::new(StopEveryBlock),
        };
        node.stream_blocks(0, None, &mut consumer, TIMEOUT).await.unwrap();
        assert_eq!(notifier.verified.lock().await.len(), 1);
    }
}
