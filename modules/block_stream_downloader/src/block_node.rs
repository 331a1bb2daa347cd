//! Client of one upstream block node

use std::{
    cmp::Ordering,
    fmt,
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering},
        Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use mirror_common::stream::INFINITE_END_BLOCK_NUMBER;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, info, warn};

use crate::assembler::{BlockAssembler, BlockStreamConsumer};
use crate::configuration::{BlockNodeProperties, StreamConfig};
use crate::error::BlockStreamError;
use crate::latency::LatencyTracker;
use crate::proto::{
    block_node_service_client::BlockNodeServiceClient,
    block_stream_subscribe_service_client::BlockStreamSubscribeServiceClient,
    subscribe_stream_response::{Code, Response},
    ServerStatusRequest, SubscribeStreamRequest,
};

pub struct BlockNode {
    properties: BlockNodeProperties,
    config: StreamConfig,
    status_client: BlockNodeServiceClient<Channel>,
    streaming_client: BlockStreamSubscribeServiceClient<Channel>,
    active: AtomicBool,
    errors: AtomicU32,
    readmit_time: Mutex<Option<Instant>>,
    latency: Mutex<LatencyTracker>,
}

impl BlockNode {
    /// Creates the client; connections are established on first use
    pub fn new(properties: BlockNodeProperties, config: StreamConfig) -> Result<Self> {
        let status_channel = Self::channel(&properties, properties.status_uri(), &config)?;
        let streaming_channel = if properties.status_port == properties.streaming_port {
            status_channel.clone()
        } else {
            Self::channel(&properties, properties.streaming_uri(), &config)?
        };

        let status_client = BlockNodeServiceClient::new(status_channel);
        let streaming_client = BlockStreamSubscribeServiceClient::new(streaming_channel)
            .max_decoding_message_size(config.max_stream_response_size);

        Ok(Self {
            properties,
            config,
            status_client,
            streaming_client,
            active: AtomicBool::new(true),
            errors: AtomicU32::new(0),
            readmit_time: Mutex::new(None),
            latency: Mutex::new(LatencyTracker::new()),
        })
    }

    fn channel(properties: &BlockNodeProperties, uri: String, config: &StreamConfig) -> Result<Channel> {
        let endpoint = Endpoint::from_shared(uri)?.connect_timeout(config.status_timeout());
        match properties.socket_path() {
            Some(path) => Ok(endpoint.connect_with_connector_lazy(tower::service_fn(
                move |_: Uri| {
                    let path = path.clone();
                    async move {
                        Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(
                            UnixStream::connect(path).await?,
                        ))
                    }
                },
            ))),
            None => Ok(endpoint.connect_lazy()),
        }
    }

    pub fn properties(&self) -> &BlockNodeProperties {
        &self.properties
    }

    pub fn endpoint(&self) -> String {
        self.properties.endpoint()
    }

    pub fn priority(&self) -> i32 {
        self.properties.priority
    }

    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::SeqCst)
    }

    /// Block numbers the node claims to serve, None when it can't be reached
    pub async fn get_block_range(&self) -> Option<RangeInclusive<u64>> {
        let mut client = self.status_client.clone();
        let call = client.server_status(ServerStatusRequest {});
        match tokio::time::timeout(self.config.status_timeout(), call).await {
            Ok(Ok(response)) => {
                let status = response.into_inner();
                let range = status.first_available_block..=status.last_available_block;
                if range.is_empty() {
                    debug!("Block node {} has no blocks available", self);
                    None
                } else {
                    Some(range)
                }
            }
            Ok(Err(e)) => {
                warn!("Failed to get server status of block node {}: {e}", self);
                None
            }
            Err(_) => {
                warn!("Timed out getting server status of block node {}", self);
                None
            }
        }
    }

    pub async fn has_block(&self, block_number: u64) -> bool {
        self.get_block_range().await.is_some_and(|range| range.contains(&block_number))
    }

    /// Streams blocks from `start` until `end`, or without end, handing each to `consumer`.
    ///
    /// Each block must arrive within `timeout`. The stream ends when the node reports
    /// success or when the consumer asks to stop.
    pub async fn stream_blocks(
        &self,
        start: u64,
        end: Option<u64>,
        consumer: &mut dyn BlockStreamConsumer,
        timeout: Duration,
    ) -> Result<()> {
        let request = SubscribeStreamRequest {
            start_block_number: start,
            end_block_number: end.unwrap_or(INFINITE_END_BLOCK_NUMBER),
        };
        let mut assembler =
            BlockAssembler::new(&self.endpoint(), self.config.max_block_items, timeout);

        // The response stream is owned by `read_stream`, returning on any path cancels the call
        let result = self.read_stream(request, &mut assembler, consumer).await;

        match result {
            Ok(()) => {
                self.errors.store(0, AtomicOrdering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.on_error();
                Err(e)
            }
        }
    }

    async fn read_stream(
        &self,
        request: SubscribeStreamRequest,
        assembler: &mut BlockAssembler,
        consumer: &mut dyn BlockStreamConsumer,
    ) -> Result<()> {
        let mut client = self.streaming_client.clone();
        let subscribe = client.subscribe_block_stream(request);
        let mut stream = tokio::time::timeout(assembler.remaining_timeout(), subscribe)
            .await
            .map_err(|_| BlockStreamError::Timeout(self.endpoint()))?
            .map_err(BlockStreamError::from)?
            .into_inner();

        loop {
            let next = tokio::time::timeout(assembler.remaining_timeout(), stream.message());
            let Some(response) = next
                .await
                .map_err(|_| BlockStreamError::Timeout(self.endpoint()))?
                .map_err(BlockStreamError::from)?
            else {
                debug!("Block node {} closed the stream", self);
                return Ok(());
            };

            match response.response {
                Some(Response::BlockItems(set)) => assembler.on_item_batch(set.block_items)?,
                Some(Response::EndOfBlock(end)) => {
                    if assembler.on_end_of_block(end.block_number, consumer).await? {
                        debug!("Stopping stream from block node {} to reschedule", self);
                        return Ok(());
                    }
                }
                Some(Response::Status(code)) if code == Code::ReadStreamSuccess as i32 => {
                    return Ok(());
                }
                Some(Response::Status(code)) => {
                    let name = Code::try_from(code)
                        .map(|c| c.as_str_name().to_string())
                        .unwrap_or_else(|_| code.to_string());
                    return Err(BlockStreamError::UnexpectedStatus(name).into());
                }
                None => return Err(BlockStreamError::UnknownResponse.into()),
            }
        }
    }

    fn on_error(&self) {
        let errors = self.errors.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        if errors >= self.config.max_subscribe_attempts {
            self.active.store(false, AtomicOrdering::SeqCst);
            self.errors.store(0, AtomicOrdering::SeqCst);
            let readmit = Instant::now() + self.config.readmit_delay();
            if let Ok(mut readmit_time) = self.readmit_time.lock() {
                *readmit_time = Some(readmit);
            }
            warn!(
                "Marking block node {} inactive after {errors} errors, readmitting in {:?}",
                self,
                self.config.readmit_delay()
            );
        }
    }

    /// Reactivates an inactive node once its delay elapsed, or at once when forced
    pub fn try_readmit(&self, force: bool) {
        if self.is_active() {
            return;
        }
        let due = self
            .readmit_time
            .lock()
            .map(|t| t.map_or(true, |t| Instant::now() >= t))
            .unwrap_or(true);
        if force || due {
            self.active.store(true, AtomicOrdering::SeqCst);
            info!("Readmitted block node {}{}", self, if force { " forcibly" } else { "" });
        }
    }

    pub fn record_latency(&self, latency: u64) {
        if let Ok(mut tracker) = self.latency.lock() {
            tracker.record(latency);
        }
    }

    /// Rolling average latency in milliseconds, maximal while unknown
    pub fn latency(&self) -> u64 {
        self.latency
            .lock()
            .map(|tracker| tracker.average())
            .unwrap_or(crate::latency::UNKNOWN_LATENCY)
    }

    /// Selection order: priority, then latency, then address
    pub fn compare(&self, other: &BlockNode) -> Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| self.latency().cmp(&other.latency()))
            .then_with(|| self.properties.host.cmp(&other.properties.host))
            .then_with(|| self.properties.status_port.cmp(&other.properties.status_port))
            .then_with(|| self.properties.streaming_port.cmp(&other.properties.streaming_port))
    }
}

impl fmt::Display for BlockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.properties.endpoint())
    }
}

impl fmt::Debug for BlockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockNode")
            .field("endpoint", &self.endpoint())
            .field("active", &self.is_active())
            .field("latency", &self.latency())
            .finish()
    }
}

/// Fails when no configured node exists
pub fn create_nodes(
    nodes: &[BlockNodeProperties],
    config: &StreamConfig,
) -> Result<Vec<std::sync::Arc<BlockNode>>> {
    nodes
        .iter()
        .map(|properties| {
            BlockNode::new(properties.clone(), config.clone())
                .map(std::sync::Arc::new)
                .map_err(|e| anyhow!("Invalid block node {}: {e:#}", properties.endpoint()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::block_stream::BlockStream;
    use crate::proto::{
        block_node_service_server::{BlockNodeService, BlockNodeServiceServer},
        block_stream_subscribe_service_server::{
            BlockStreamSubscribeService, BlockStreamSubscribeServiceServer,
        },
        BlockEnd, BlockItem, BlockItemSet, ServerStatusResponse, SubscribeStreamResponse,
    };
    use crate::verifier::tests::signed_block;
    use async_trait::async_trait;
    use mirror_common::Sha384Hash;
    use std::{collections::BTreeMap, pin::Pin, sync::Arc};
    use tokio::net::TcpListener;
    use tokio_stream::{wrappers::TcpListenerStream, Stream, StreamExt};
    use tonic::{transport::Server, Request, Status};

    /// In-process block node serving a fixed set of blocks
    #[derive(Clone)]
    pub(crate) struct TestBlockNode {
        pub blocks: Arc<BTreeMap<u64, Vec<BlockItem>>>,
        pub terminal: Code,
        /// Send the first batch, then nothing
        pub stall: bool,
        pub subscriptions: Arc<std::sync::atomic::AtomicU32>,
    }

    impl TestBlockNode {
        /// Chained signed blocks `range`, starting from a fixed previous hash
        pub(crate) fn with_blocks(range: RangeInclusive<u64>) -> Self {
            let mut blocks = BTreeMap::new();
            let mut previous = Sha384Hash::digest(b"genesis");
            for number in range {
                let (items, root) = signed_block(number, &previous);
                blocks.insert(number, items);
                previous = root;
            }
            Self {
                blocks: Arc::new(blocks),
                terminal: Code::ReadStreamSuccess,
                stall: false,
                subscriptions: Arc::default(),
            }
        }

        /// Serves on a random local port and returns the node's properties
        pub(crate) async fn spawn(self, priority: i32) -> BlockNodeProperties {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            tokio::spawn(async move {
                Server::builder()
                    .add_service(BlockNodeServiceServer::new(self.clone()))
                    .add_service(BlockStreamSubscribeServiceServer::new(self))
                    .serve_with_incoming(TcpListenerStream::new(listener))
                    .await
                    .unwrap();
            });
            BlockNodeProperties::new("127.0.0.1", port, port, priority)
        }
    }

    #[tonic::async_trait]
    impl BlockNodeService for TestBlockNode {
        async fn server_status(
            &self,
            _request: Request<ServerStatusRequest>,
        ) -> Result<tonic::Response<ServerStatusResponse>, Status> {
            let first = self.blocks.keys().next().copied();
            let last = self.blocks.keys().next_back().copied();
            Ok(tonic::Response::new(ServerStatusResponse {
                first_available_block: first.unwrap_or(u64::MAX),
                last_available_block: last.unwrap_or(0),
            }))
        }
    }

    type ResponseStream = Pin<Box<dyn Stream<Item = Result<SubscribeStreamResponse, Status>> + Send>>;

    #[tonic::async_trait]
    impl BlockStreamSubscribeService for TestBlockNode {
        type subscribeBlockStreamStream = ResponseStream;

        async fn subscribe_block_stream(
            &self,
            request: Request<SubscribeStreamRequest>,
        ) -> Result<tonic::Response<Self::subscribeBlockStreamStream>, Status> {
            self.subscriptions.fetch_add(1, AtomicOrdering::SeqCst);
            let request = request.into_inner();
            let mut responses = Vec::new();
            if request.start_block_number <= request.end_block_number {
                for (number, items) in
                    self.blocks.range(request.start_block_number..=request.end_block_number)
                {
                    // Split each block over two batches
                    let (head, tail) = items.split_at(1);
                    for batch in [head, tail] {
                        responses.push(Ok(SubscribeStreamResponse {
                            response: Some(Response::BlockItems(BlockItemSet {
                                block_items: batch.to_vec(),
                            })),
                        }));
                    }
                    responses.push(Ok(SubscribeStreamResponse {
                        response: Some(Response::EndOfBlock(BlockEnd {
                            block_number: *number,
                        })),
                    }));
                }
            }
            if self.stall {
                responses.truncate(1);
                let stalled = tokio_stream::iter(responses).chain(tokio_stream::pending());
                return Ok(tonic::Response::new(Box::pin(stalled)));
            }
            responses.push(Ok(SubscribeStreamResponse {
                response: Some(Response::Status(self.terminal as i32)),
            }));
            Ok(tonic::Response::new(Box::pin(tokio_stream::iter(responses))))
        }
    }

    /// Collects blocks, asking to stop after `stop_after` blocks
    #[derive(Default)]
    pub(crate) struct Collector {
        pub blocks: Vec<BlockStream>,
        pub stop_after: Option<usize>,
    }

    #[async_trait]
    impl BlockStreamConsumer for Collector {
        async fn on_block_stream(&mut self, block_stream: BlockStream) -> Result<bool> {
            self.blocks.push(block_stream);
            Ok(self.stop_after.is_some_and(|n| self.blocks.len() >= n))
        }
    }

    fn stream_config() -> StreamConfig {
        StreamConfig {
            readmit_delay_ms: 100,
            ..Default::default()
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_block_range_and_streaming() {
        let properties = TestBlockNode::with_blocks(5..=9).spawn(0).await;
        let node = BlockNode::new(properties, stream_config()).unwrap();

        assert_eq!(node.get_block_range().await, Some(5..=9));
        assert!(node.has_block(7).await);
        assert!(!node.has_block(10).await);

        let mut collector = Collector::default();
        node.stream_blocks(6, None, &mut collector, TIMEOUT).await.unwrap();
        let numbers: Vec<String> = collector.blocks.iter().map(|b| b.filename.clone()).collect();
        assert_eq!(
            numbers,
            vec![
                "0000000000000000006.blk",
                "0000000000000000007.blk",
                "0000000000000000008.blk",
                "0000000000000000009.blk"
            ]
        );
        assert_eq!(collector.blocks[0].items.len(), 5);
        assert_eq!(collector.blocks[0].node, node.endpoint());
    }

    #[tokio::test]
    async fn test_consumer_stop_ends_stream() {
        let properties = TestBlockNode::with_blocks(1..=5).spawn(0).await;
        let node = BlockNode::new(properties, stream_config()).unwrap();
        let mut collector = Collector {
            stop_after: Some(2),
            ..Default::default()
        };
        node.stream_blocks(1, Some(5), &mut collector, TIMEOUT).await.unwrap();
        assert_eq!(collector.blocks.len(), 2);
        assert!(node.is_active());
    }

    #[tokio::test]
    async fn test_error_status_marks_inactive_after_attempts() {
        let mut server = TestBlockNode::with_blocks(1..=1);
        server.terminal = Code::ReadStreamNotAvailable;
        let properties = server.spawn(0).await;
        let node = BlockNode::new(properties, stream_config()).unwrap();

        for attempt in 1..=3 {
            let mut collector = Collector::default();
            let error = node.stream_blocks(1, None, &mut collector, TIMEOUT).await.unwrap_err();
            assert_eq!(
                error.to_string(),
                "Received status READ_STREAM_NOT_AVAILABLE from block node"
            );
            assert_eq!(node.is_active(), attempt < 3);
        }

        // Not yet due
        node.try_readmit(false);
        assert!(!node.is_active());

        tokio::time::sleep(Duration::from_millis(150)).await;
        node.try_readmit(false);
        assert!(node.is_active());
    }

    #[tokio::test]
    async fn test_stalled_block_times_out() {
        let mut server = TestBlockNode::with_blocks(1..=3);
        server.stall = true;
        let properties = server.spawn(0).await;
        let node = BlockNode::new(properties, stream_config()).unwrap();

        let timeout = Duration::from_millis(300);
        let started = Instant::now();
        let mut collector = Collector::default();
        let error = node.stream_blocks(1, None, &mut collector, timeout).await.unwrap_err();

        assert!(matches!(
            error.downcast_ref::<BlockStreamError>(),
            Some(BlockStreamError::Timeout(_))
        ));
        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(collector.blocks.is_empty());
        assert_eq!(node.errors.load(AtomicOrdering::SeqCst), 1);
        assert!(node.is_active());
    }

    #[tokio::test]
    async fn test_force_readmit() {
        let mut server = TestBlockNode::with_blocks(1..=1);
        server.terminal = Code::ReadStreamError;
        let properties = server.spawn(0).await;
        let config = StreamConfig {
            max_subscribe_attempts: 1,
            readmit_delay_ms: 60_000,
            ..Default::default()
        };
        let node = BlockNode::new(properties, config).unwrap();

        let mut collector = Collector::default();
        assert!(node.stream_blocks(1, None, &mut collector, TIMEOUT).await.is_err());
        assert!(!node.is_active());
        node.try_readmit(false);
        assert!(!node.is_active());
        node.try_readmit(true);
        assert!(node.is_active());
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let properties = BlockNodeProperties::new("127.0.0.1", 1, 1, 0);
        let config = StreamConfig {
            status_timeout_ms: 500,
            ..Default::default()
        };
        let node = BlockNode::new(properties, config).unwrap();
        assert_eq!(node.get_block_range().await, None);

        let mut collector = Collector::default();
        let result = node.stream_blocks(1, None, &mut collector, Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ordering() {
        let config = StreamConfig::default();
        let a = BlockNode::new(BlockNodeProperties::new("a", 1, 1, 1), config.clone()).unwrap();
        let b = BlockNode::new(BlockNodeProperties::new("b", 1, 1, 0), config.clone()).unwrap();
        let c = BlockNode::new(BlockNodeProperties::new("c", 1, 1, 0), config.clone()).unwrap();
        assert_eq!(b.compare(&a), Ordering::Less);
        // Same priority and unknown latency falls back to the host
        assert_eq!(b.compare(&c), Ordering::Less);

        for _ in 0..5 {
            c.record_latency(10);
        }
        assert_eq!(c.latency(), 10);
        assert_eq!(c.compare(&b), Ordering::Less);
    }
}
