//! In-memory stream metadata: identity, stream key and published URLs.
//!
//! Ingest sessions are keyed by the stream key, which is what the producer's
//! WebSocket URL carries.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;

/// Length of the derived stream key, in hex characters.
const STREAM_KEY_LEN: usize = 16;

/// Client type that receives a WebSocket ingest URL.
pub const BROWSER_CLIENT: &str = "browser";

/// Errors from stream metadata operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamStoreError {
    #[error("userId is required")]
    MissingUserId,

    #[error("Stream not found: {stream_id}")]
    NotFound { stream_id: String },
}

/// Hosts and ports used to build the URLs handed to clients.
#[derive(Debug, Clone)]
pub struct StreamUrls {
    pub public_host: String,
    pub rtmp_port: u16,
    pub rtmp_app: String,
    pub playback_port: u16,
    pub ws_port: u16,
}

impl Default for StreamUrls {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            rtmp_port: 1935,
            rtmp_app: "live".to_string(),
            playback_port: 8080,
            ws_port: 8080,
        }
    }
}

/// A registered stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub id: String,
    pub stream_key: String,
    pub user_id: String,
    pub started_at_unix: u64,
    pub active: bool,
    pub client_type: String,
}

/// Response to a stream start request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    pub stream_id: String,
    pub stream_key: String,
    pub rtmp_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    pub playback_url: String,
}

/// Derive the public stream key: first 16 hex chars of `sha256(id ++ secret)`.
pub fn derive_stream_key(stream_id: &str, secret: &str) -> String {
    let digest = Sha256::new()
        .chain_update(stream_id.as_bytes())
        .chain_update(secret.as_bytes())
        .finalize();
    let mut key = String::with_capacity(STREAM_KEY_LEN);
    for byte in digest.iter().take(STREAM_KEY_LEN / 2) {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

/// Concurrency-safe store of registered streams keyed by stream id.
#[derive(Clone)]
pub struct StreamStore {
    streams: Arc<RwLock<HashMap<String, StreamRecord>>>,
    secret: Arc<str>,
    urls: Arc<StreamUrls>,
}

impl StreamStore {
    pub fn new(secret: &str, urls: StreamUrls) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            secret: Arc::from(secret),
            urls: Arc::new(urls),
        }
    }

    /// Register a new stream for `user_id`.
    pub async fn start(
        &self,
        user_id: &str,
        client_type: Option<&str>,
    ) -> Result<StreamDescriptor, StreamStoreError> {
        if user_id.trim().is_empty() {
            return Err(StreamStoreError::MissingUserId);
        }
        let client_type = client_type.unwrap_or(BROWSER_CLIENT);
        let stream_id = uuid::Uuid::new_v4().to_string();
        let stream_key = derive_stream_key(&stream_id, &self.secret);

        let record = StreamRecord {
            id: stream_id.clone(),
            stream_key: stream_key.clone(),
            user_id: user_id.to_string(),
            started_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            active: true,
            client_type: client_type.to_string(),
        };
        self.streams.write().await.insert(stream_id.clone(), record);
        info!(stream_id = %stream_id, user_id, client_type, "Stream registered");

        let urls = &self.urls;
        Ok(StreamDescriptor {
            rtmp_url: format!(
                "rtmp://{}:{}/{}/{stream_key}",
                urls.public_host, urls.rtmp_port, urls.rtmp_app
            ),
            playback_url: format!(
                "http://{}:{}/{}/{stream_key}/index.m3u8",
                urls.public_host, urls.playback_port, urls.rtmp_app
            ),
            ws_url: (client_type == BROWSER_CLIENT)
                .then(|| format!("ws://{}:{}/ws/{stream_key}", urls.public_host, urls.ws_port)),
            stream_id,
            stream_key,
        })
    }

    /// Remove a stream and return its final record.
    pub async fn end(&self, stream_id: &str) -> Result<StreamRecord, StreamStoreError> {
        let mut record = self
            .streams
            .write()
            .await
            .remove(stream_id)
            .ok_or_else(|| StreamStoreError::NotFound {
                stream_id: stream_id.to_string(),
            })?;
        record.active = false;
        info!(stream_id, "Stream ended");
        Ok(record)
    }

    /// Whether an active stream carries `stream_key`.
    pub async fn verify(&self, stream_key: &str) -> bool {
        self.streams
            .read()
            .await
            .values()
            .any(|s| s.active && s.stream_key == stream_key)
    }

    pub async fn get(&self, stream_id: &str) -> Option<StreamRecord> {
        self.streams.read().await.get(stream_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.streams.read().await.len()
    }
}
