//! Hand-off of verified stream files to the persistence pipeline

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use caryatid_sdk::Context;
use mirror_common::{
    messages::{CutoverCompletedMessage, Message, RecordFileVerifiedMessage},
    RecordFile, StreamType,
};
use tracing::{debug, info};

use crate::repository::RecordFileRepository;

#[async_trait]
pub trait StreamFileNotifier: Send + Sync {
    async fn verified(&self, record_file: RecordFile) -> Result<()>;

    /// The network finished migrating, only `enabled` streams are fetched from now on
    async fn cutover_completed(&self, _network: &str, _enabled: StreamType) -> Result<()> {
        Ok(())
    }
}

/// Persists verified files and publishes them on the message bus
pub struct BusStreamFileNotifier {
    context: Arc<Context<Message>>,
    repository: Arc<dyn RecordFileRepository>,
    verified_topic: String,
    cutover_topic: String,
}

impl BusStreamFileNotifier {
    pub fn new(
        context: Arc<Context<Message>>,
        repository: Arc<dyn RecordFileRepository>,
        verified_topic: &str,
        cutover_topic: &str,
    ) -> Self {
        Self {
            context,
            repository,
            verified_topic: verified_topic.to_string(),
            cutover_topic: cutover_topic.to_string(),
        }
    }
}

#[async_trait]
impl StreamFileNotifier for BusStreamFileNotifier {
    async fn verified(&self, record_file: RecordFile) -> Result<()> {
        self.repository.save(&record_file)?;
        debug!("Publishing verified {} on {}", record_file.name, self.verified_topic);
        let message = Message::RecordFileVerified(RecordFileVerifiedMessage { record_file });
        self.context.message_bus.publish(&self.verified_topic, Arc::new(message)).await
    }

    async fn cutover_completed(&self, network: &str, enabled: StreamType) -> Result<()> {
        info!("Publishing cutover completion of {network} on {}", self.cutover_topic);
        let message = Message::CutoverCompleted(CutoverCompletedMessage {
            network: network.to_string(),
            enabled,
        });
        self.context.message_bus.publish(&self.cutover_topic, Arc::new(message)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Keeps everything it is notified of
    #[derive(Default)]
    pub(crate) struct CollectingNotifier {
        pub verified: Mutex<Vec<RecordFile>>,
        pub cutovers: Mutex<Vec<StreamType>>,
    }

    #[async_trait]
    impl StreamFileNotifier for CollectingNotifier {
        async fn verified(&self, record_file: RecordFile) -> Result<()> {
            self.verified.lock().await.push(record_file);
            Ok(())
        }

        async fn cutover_completed(&self, _network: &str, enabled: StreamType) -> Result<()> {
            self.cutovers.lock().await.push(enabled);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_cutover_completed_is_noop() {
        struct Quiet;

        #[async_trait]
        impl StreamFileNotifier for Quiet {
            async fn verified(&self, _record_file: RecordFile) -> Result<()> {
                Ok(())
            }
        }

        assert!(Quiet.cutover_completed("testnet", StreamType::Block).await.is_ok());
    }
}
