//! Byte transport
//!
//! The orchestrator only needs a metadata probe and a resumable byte
//! stream; [`HttpTransport`] provides both over reqwest.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

use crate::error::DownloadError;
use crate::Result;

/// Connections allowed per host at once.
pub const DEFAULT_CONNECTIONS_PER_HOST: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub content_type: Option<String>,
    /// Total size of the resource, not of the remaining range.
    pub content_length: Option<u64>,
}

impl ResourceInfo {
    pub fn is_complete(&self) -> bool {
        self.content_type.is_some() && self.content_length.is_some()
    }

    /// Fill gaps in `self` from `other`.
    pub fn or(self, other: ResourceInfo) -> ResourceInfo {
        ResourceInfo {
            content_type: self.content_type.or(other.content_type),
            content_length: self.content_length.or(other.content_length),
        }
    }
}

pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

pub struct TransferStream {
    pub info: ResourceInfo,
    /// Byte offset the stream starts at. Zero when the server ignored the
    /// requested range.
    pub offset: u64,
    pub chunks: ChunkStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn probe(&self, url: &Url) -> Result<ResourceInfo>;

    async fn open(&self, url: &Url, offset: u64) -> Result<TransferStream>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    connections_per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        Ok(Self {
            client,
            connections_per_host: DEFAULT_CONNECTIONS_PER_HOST,
            hosts: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_connections_per_host(mut self, limit: usize) -> Self {
        self.connections_per_host = limit.max(1);
        self
    }

    fn host_limit(&self, url: &Url) -> Arc<Semaphore> {
        let host = url.host_str().unwrap_or_default().to_string();
        self.hosts
            .lock()
            .entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.connections_per_host)))
            .clone()
    }
}

fn content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn check_status(response: &reqwest::Response) -> Result<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(DownloadError::Http(response.status().as_u16()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, url: &Url) -> Result<ResourceInfo> {
        let limit = self.host_limit(url);
        let _permit = limit
            .acquire_owned()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        check_status(&response)?;

        Ok(ResourceInfo {
            content_type: content_type(&response),
            content_length: response.content_length(),
        })
    }

    async fn open(&self, url: &Url, offset: u64) -> Result<TransferStream> {
        let limit = self.host_limit(url);
        // Held by the stream until the body is finished or dropped
        let permit = limit
            .acquire_owned()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        check_status(&response)?;

        let offset = if offset > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };

        let info = ResourceInfo {
            content_type: content_type(&response),
            content_length: response.content_length().map(|len| len.saturating_add(offset)),
        };

        tracing::debug!(
            url = %url,
            offset,
            total = ?info.content_length,
            "Opened transfer stream"
        );

        let chunks = response
            .bytes_stream()
            .map(move |chunk| {
                let _held = &permit;
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| DownloadError::Network(e.to_string()))
            })
            .boxed();

        Ok(TransferStream {
            info,
            offset,
            chunks,
        })
    }
}
