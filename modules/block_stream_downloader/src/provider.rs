//! Cloud storage access for stream files

use std::{
    io,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{header::LAST_MODIFIED, Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::configuration::BucketConfig;

static COMMON_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Prefix>([^<]+?)/?</Prefix>").expect("infallible"));

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to initialize HTTP client: {0}")]
    ClientInit(#[from] reqwest::Error),

    #[error("Failed to fetch {0}: {1}")]
    RequestFailed(String, reqwest::Error),

    #[error("Fetching {0} failed: HTTP status {1}")]
    InvalidStatusCode(String, StatusCode),

    #[error("Stream file {0} not found")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Contents of one stream file
#[derive(Debug, Clone)]
pub struct StreamFileData {
    /// Path relative to the bucket root
    pub path: String,
    pub bytes: Vec<u8>,
    pub last_modified: DateTime<Utc>,
}

impl StreamFileData {
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[async_trait]
pub trait StreamFileProvider: Send + Sync {
    /// Fetch the file at `path`, relative to the bucket root
    async fn get(&self, path: &str) -> Result<StreamFileData, ProviderError>;

    /// Folder names at the bucket root
    async fn list_network(&self) -> Result<Vec<String>, ProviderError>;
}

/// Reads an S3 compatible bucket over HTTP
pub struct HttpStreamFileProvider {
    client: Client,
    url: String,
}

impl HttpStreamFileProvider {
    pub fn new(config: &BucketConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StreamFileProvider for HttpStreamFileProvider {
    async fn get(&self, path: &str) -> Result<StreamFileData, ProviderError> {
        let url = format!("{}/{path}", self.url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(url.clone(), e))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(ProviderError::NotFound(path.to_string())),
            status if !status.is_success() => {
                return Err(ProviderError::InvalidStatusCode(url, status))
            }
            _ => {}
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::RequestFailed(url.clone(), e))?
            .to_vec();

        debug!("Fetched {} bytes from {url}", bytes.len());
        Ok(StreamFileData {
            path: path.to_string(),
            bytes,
            last_modified,
        })
    }

    async fn list_network(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/?list-type=2&delimiter=/", self.url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(url.clone(), e))?;
        if !response.status().is_success() {
            return Err(ProviderError::InvalidStatusCode(url, response.status()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::RequestFailed(url.clone(), e))?;
        Ok(COMMON_PREFIX
            .captures_iter(&body)
            .map(|captures| captures[1].to_string())
            .filter(|prefix| !prefix.is_empty())
            .collect())
    }
}

/// Reads a bucket mirrored to a local directory
pub struct LocalStreamFileProvider {
    root: PathBuf,
}

impl LocalStreamFileProvider {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl StreamFileProvider for LocalStreamFileProvider {
    async fn get(&self, path: &str) -> Result<StreamFileData, ProviderError> {
        let file = self.root.join(path);
        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProviderError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let last_modified = tokio::fs::metadata(&file).await?.modified()?.into();

        Ok(StreamFileData {
            path: path.to_string(),
            bytes,
            last_modified,
        })
    }

    async fn list_network(&self) -> Result<Vec<String>, ProviderError> {
        let mut networks = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                networks.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        networks.sort();
        Ok(networks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> BucketConfig {
        BucketConfig {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_http_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/testnet/block/0000000000000000001.blk.zstd"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Tue, 14 Nov 2023 22:13:20 GMT")
                    .set_body_bytes(vec![1, 2, 3]),
            )
            .mount(&server)
            .await;

        let provider = HttpStreamFileProvider::new(&config(&server.uri())).unwrap();
        let data = provider.get("testnet/block/0000000000000000001.blk.zstd").await.unwrap();
        assert_eq!(data.bytes, vec![1, 2, 3]);
        assert_eq!(data.filename(), "0000000000000000001.blk.zstd");
        assert_eq!(data.last_modified.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_http_not_found_and_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = HttpStreamFileProvider::new(&config(&server.uri())).unwrap();
        assert!(matches!(
            provider.get("missing").await,
            Err(ProviderError::NotFound(_))
        ));
        assert!(matches!(
            provider.get("broken").await,
            Err(ProviderError::InvalidStatusCode(_, StatusCode::INTERNAL_SERVER_ERROR))
        ));
    }

    #[tokio::test]
    async fn test_http_list_network() {
        let server = MockServer::start().await;
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <ListBucketResult>
              <Name>streams</Name>
              <Prefix></Prefix>
              <CommonPrefixes><Prefix>previewnet/</Prefix></CommonPrefixes>
              <CommonPrefixes><Prefix>testnet-2024-01-01T00:00:00Z/</Prefix></CommonPrefixes>
            </ListBucketResult>"#;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("delimiter", "/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = HttpStreamFileProvider::new(&config(&server.uri())).unwrap();
        assert_eq!(
            provider.list_network().await.unwrap(),
            vec!["previewnet", "testnet-2024-01-01T00:00:00Z"]
        );
    }

    #[tokio::test]
    async fn test_local_provider() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("testnet/block")).unwrap();
        std::fs::create_dir_all(dir.path().join("mainnet")).unwrap();
        std::fs::write(dir.path().join("testnet/block/a.blk.zstd"), b"abc").unwrap();

        let provider = LocalStreamFileProvider::new(dir.path());
        let data = provider.get("testnet/block/a.blk.zstd").await.unwrap();
        assert_eq!(data.bytes, b"abc");
        assert!(matches!(
            provider.get("testnet/block/b.blk.zstd").await,
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(provider.list_network().await.unwrap(), vec!["mainnet", "testnet"]);
    }
}
