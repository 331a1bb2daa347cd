use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use config::Config;
use mirror_common::Ledger;

/// Networks which migrate from record streams to block streams
const CUTOVER_NETWORKS: [&str; 3] = ["mainnet", "testnet", "previewnet"];

// Source selection mode for each polling tick.
//
// - File: always download block files from cloud storage.
// - BlockNode: always stream from block nodes.
// - Auto: prefer block nodes, fail over to cloud storage while they are unhealthy.
#[derive(Clone, Copy, Debug, Default, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    File,
    BlockNode,
    #[default]
    Auto,
}

#[derive(Clone, Copy, Debug, Default, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BucketKind {
    #[default]
    Http,
    Local,
}

/// Static configuration of one upstream block node
#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BlockNodeProperties {
    pub host: String,
    #[serde(default = "default_block_node_port")]
    pub status_port: u16,
    #[serde(default = "default_block_node_port")]
    pub streaming_port: u16,
    /// Lower is preferred
    #[serde(default)]
    pub priority: i32,
}

const IN_PROCESS_PREFIX: &str = "in-process:";

fn default_block_node_port() -> u16 {
    40840
}

impl BlockNodeProperties {
    pub fn new(host: &str, status_port: u16, streaming_port: u16, priority: i32) -> Self {
        Self {
            host: host.to_string(),
            status_port,
            streaming_port,
            priority,
        }
    }

    /// An in-process node is reached over a local socket named by the host, ports are unused
    pub fn is_in_process(&self) -> bool {
        self.host.starts_with(IN_PROCESS_PREFIX)
    }

    /// Local socket path of an in-process node
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.host.strip_prefix(IN_PROCESS_PREFIX).map(PathBuf::from)
    }

    /// Combined endpoint string, used for logging and as the block's node tag
    pub fn endpoint(&self) -> String {
        if self.is_in_process() {
            self.host.clone()
        } else if self.status_port == self.streaming_port {
            format!("{}:{}", self.host, self.streaming_port)
        } else {
            format!("{}:{}/{}", self.host, self.status_port, self.streaming_port)
        }
    }

    pub fn status_uri(&self) -> String {
        self.uri(self.status_port)
    }

    pub fn streaming_uri(&self) -> String {
        self.uri(self.streaming_port)
    }

    fn uri(&self, port: u16) -> String {
        if self.is_in_process() {
            // Placeholder authority, the connector ignores it
            "http://in-process.local".to_string()
        } else {
            format!("http://{}:{}", self.host, port)
        }
    }
}

/// Stream protocol limits and health policy
#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    pub max_block_items: usize,
    pub max_stream_response_size: usize,
    pub max_subscribe_attempts: u32,
    pub readmit_delay_ms: u64,
    pub response_timeout_ms: u64,
    pub status_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_block_items: 800_000,
            max_stream_response_size: 36_700_160,
            max_subscribe_attempts: 3,
            readmit_delay_ms: 60_000,
            response_timeout_ms: 5_000,
            status_timeout_ms: 5_000,
        }
    }
}

impl StreamConfig {
    pub fn readmit_delay(&self) -> Duration {
        Duration::from_millis(self.readmit_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulingConfig {
    pub latency_enabled: bool,
    pub max_post_processing_latency_ms: u64,
    pub latency_measure_interval_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            latency_enabled: true,
            max_post_processing_latency_ms: 500,
            latency_measure_interval_ms: 5_000,
        }
    }
}

/// Cloud storage bucket
#[derive(Clone, Debug, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BucketConfig {
    #[serde(default)]
    pub kind: BucketKind,
    pub url: String,
    pub path: PathBuf,
    pub resettable: bool,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            kind: BucketKind::Http,
            url: String::new(),
            path: PathBuf::from("./data/bucket"),
            resettable: false,
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl BucketConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DownloaderConfig {
    pub enabled: bool,
    pub record_enabled: bool,
    #[serde(default)]
    pub cutover: Option<bool>,
    pub network: String,
    pub frequency_ms: u64,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub end_block_number: Option<u64>,
    pub write_files: bool,
    pub stream_path: PathBuf,
    pub verified_topic: String,
    pub cutover_topic: String,
    pub database_path: PathBuf,
    pub clear_on_start: bool,
    pub cutover_threshold_secs: u64,
    pub min_consensus_version: String,
    #[serde(default)]
    pub nodes: Vec<BlockNodeProperties>,
    pub stream: StreamConfig,
    pub scheduling: SchedulingConfig,
    pub bucket: BucketConfig,
    #[serde(default)]
    pub ledger: Option<Ledger>,
}

impl DownloaderConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    /// Whether the network migrates from record streams to block streams
    pub fn has_cutover(&self) -> bool {
        self.cutover.unwrap_or_else(|| CUTOVER_NETWORKS.contains(&self.network.as_str()))
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }

    pub fn cutover_threshold(&self) -> Duration {
        Duration::from_secs(self.cutover_threshold_secs)
    }

    pub fn min_consensus_version(&self) -> Result<SoftwareVersion> {
        self.min_consensus_version.parse()
    }
}

/// Consensus node software version, compared lexicographically
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SoftwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SoftwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::str::FromStr for SoftwareVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().trim_start_matches('v').split('.');
        let mut next = || -> Result<u32> {
            let part = parts.next().unwrap_or("0");
            part.parse().map_err(|_| anyhow!("Invalid software version '{s}'"))
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(anyhow!("Invalid software version '{s}'"));
        }
        Ok(version)
    }
}

impl std::fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let config = DownloaderConfig::try_load(&Config::default()).unwrap();
        assert!(!config.enabled);
        assert!(config.record_enabled);
        assert_eq!(config.source_type, SourceType::Auto);
        assert_eq!(config.stream.max_subscribe_attempts, 3);
        assert!(config.nodes.is_empty());
        assert_eq!(config.min_consensus_version().unwrap(), SoftwareVersion::new(0, 64, 0));
    }

    #[test]
    fn test_overrides_and_nodes() {
        let source = Config::builder()
            .set_override("network", "devnet")
            .unwrap()
            .set_override("source-type", "block-node")
            .unwrap()
            .add_source(config::File::from_str(
                r#"
                [[nodes]]
                host = "node-a"
                status-port = 1000
                streaming-port = 1001
                priority = 1

                [[nodes]]
                host = "node-b"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config = DownloaderConfig::try_load(&source).unwrap();
        assert_eq!(config.source_type, SourceType::BlockNode);
        assert!(!config.has_cutover());
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].endpoint(), "node-a:1000/1001");
        assert_eq!(config.nodes[1].endpoint(), "node-b:40840");
        assert_eq!(config.nodes[1].priority, 0);
    }

    #[test]
    fn test_has_cutover_network_default() {
        let mut config = DownloaderConfig::try_load(&Config::default()).unwrap();
        config.network = "mainnet".to_string();
        assert!(config.has_cutover());
        config.cutover = Some(false);
        assert!(!config.has_cutover());
    }

    #[test]
    fn test_in_process_node() {
        let node = BlockNodeProperties::new("in-process:/tmp/node.sock", 0, 0, 0);
        assert!(node.is_in_process());
        assert_eq!(node.socket_path(), Some(PathBuf::from("/tmp/node.sock")));
        assert_eq!(node.endpoint(), "in-process:/tmp/node.sock");

        let node = BlockNodeProperties::new("localhost", 8080, 8080, 0);
        assert!(!node.is_in_process());
        assert_eq!(node.streaming_uri(), "http://localhost:8080");
    }

    #[test]
    fn test_software_version_parse() {
        assert_eq!(
            "0.65.2".parse::<SoftwareVersion>().unwrap(),
            SoftwareVersion::new(0, 65, 2)
        );
        assert_eq!("v1.2".parse::<SoftwareVersion>().unwrap(), SoftwareVersion::new(1, 2, 0));
        assert!("1.2.3.4".parse::<SoftwareVersion>().is_err());
        assert!("x.1".parse::<SoftwareVersion>().is_err());
        assert!(SoftwareVersion::new(0, 63, 9) < SoftwareVersion::new(0, 64, 0));
    }
}
