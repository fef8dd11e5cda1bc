//! Precaching of versioned assets
//!
//! This module provides the storage abstractions and the precache manager
//! that installs a fixed manifest of assets into a named cache, removes
//! stale revisions on activation, and answers fetches from that cache.

pub mod fetcher;
pub mod hash;
pub mod local;
pub mod manager;
pub mod manifest;
pub mod routing;
pub mod sqlite;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::lifecycle::WorkerState;

pub use fetcher::{FetchRequest, FetchResponse, HttpNetwork, Network, RequestMode, ResponseSource};
pub use manager::{ActivateReport, InstallReport, PrecacheManager, PrecacheOptions};
pub use manifest::{AssetEntry, Manifest, ManifestEntry};

/// Error type for precache operations
#[derive(Error, Debug)]
pub enum PrecacheError {
    #[error("Fetch error for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Conflicting manifest entries for {url}: revision {first:?} and {second:?}")]
    ConflictingEntries {
        url: String,
        first: Option<String>,
        second: Option<String>,
    },

    #[error("Install failed: {} of {total} entries could not be precached", errors.len())]
    InstallFailed {
        total: usize,
        errors: Vec<PrecacheError>,
    },

    #[error("Worker {worker} cannot {operation} while {state}")]
    InvalidState {
        worker: String,
        operation: &'static str,
        state: WorkerState,
    },
}

impl From<rusqlite::Error> for PrecacheError {
    fn from(e: rusqlite::Error) -> Self {
        PrecacheError::Database(e.to_string())
    }
}

impl PrecacheError {
    /// Whether the error came from the cache store rather than the network
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            PrecacheError::Storage(_) | PrecacheError::Database(_) | PrecacheError::Io(_)
        )
    }
}

/// A response stored under a cache key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// The storage key, derived from (url, revision)
    pub cache_key: String,
    /// The absolute asset URL without revision information
    pub url: String,
    /// The manifest revision, if the entry had one
    pub revision: Option<String>,
    /// SHA-256 of the body, used as the body store key
    pub content_hash: String,
    /// HTTP status of the stored response
    pub status: u16,
    /// Response headers worth replaying
    pub headers: Vec<(String, String)>,
    /// Body size in bytes
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

/// Index of stored responses, keyed by cache name and cache key
///
/// This abstraction allows for different index backends (SQLite, in-memory, etc.)
/// while keeping bodies in a separate [`BodyStore`].
#[async_trait::async_trait]
pub trait CacheIndex: Send + Sync {
    /// Look up the entry stored under `cache_key`
    async fn lookup(&self, cache_name: &str, cache_key: &str) -> Result<Option<StoredEntry>, PrecacheError>;

    /// Insert or replace an entry
    async fn insert(&self, cache_name: &str, entry: StoredEntry) -> Result<(), PrecacheError>;

    /// All cache keys in the named cache
    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, PrecacheError>;

    /// Cache keys stored for one URL (one per revision seen)
    async fn keys_for_url(&self, cache_name: &str, url: &str) -> Result<Vec<String>, PrecacheError>;

    /// Remove an entry, returning it if it existed
    async fn remove(&self, cache_name: &str, cache_key: &str) -> Result<Option<StoredEntry>, PrecacheError>;

    /// Whether any entry in any cache still references a body
    async fn is_referenced(&self, content_hash: &str) -> Result<bool, PrecacheError>;
}

/// Physical storage of response bodies, addressed by content hash
#[async_trait::async_trait]
pub trait BodyStore: Send + Sync {
    /// Store a body. Either the body is fully stored or not at all.
    async fn put(&self, hash: &str, data: &[u8]) -> Result<(), PrecacheError>;

    async fn exists(&self, hash: &str) -> Result<bool, PrecacheError>;

    async fn get(&self, hash: &str) -> Result<Vec<u8>, PrecacheError>;

    /// Delete a body. Deleting a missing body is not an error.
    async fn delete(&self, hash: &str) -> Result<(), PrecacheError>;

    /// Get the storage type identifier (e.g., "local")
    fn storage_type(&self) -> &str;
}

/// A named cache combining an index with a body store
#[derive(Clone)]
pub struct CacheStorage {
    cache_name: String,
    index: Arc<dyn CacheIndex>,
    bodies: Arc<dyn BodyStore>,
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage")
            .field("cache_name", &self.cache_name)
            .field("index", &"<dyn CacheIndex>")
            .field("bodies", &self.bodies.storage_type())
            .finish()
    }
}

impl CacheStorage {
    pub fn new(cache_name: impl Into<String>, index: Arc<dyn CacheIndex>, bodies: Arc<dyn BodyStore>) -> Self {
        Self {
            cache_name: cache_name.into(),
            index,
            bodies,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Whether a complete response (index row and body) is stored under `cache_key`
    pub async fn contains(&self, cache_key: &str) -> Result<bool, PrecacheError> {
        match self.index.lookup(&self.cache_name, cache_key).await? {
            Some(entry) => {
                if self.bodies.exists(&entry.content_hash).await? {
                    Ok(true)
                } else {
                    error!(
                        "❌ Inconsistent state: entry {} references missing body {}",
                        cache_key,
                        short_hash(&entry.content_hash)
                    );
                    Ok(false)
                }
            }
            None => Ok(false),
        }
    }

    /// Store a response under `cache_key`
    ///
    /// The body goes in first so an interrupted write never leaves an index
    /// row pointing at nothing.
    pub async fn put(
        &self,
        cache_key: &str,
        url: &str,
        revision: Option<&str>,
        response: &FetchResponse,
    ) -> Result<StoredEntry, PrecacheError> {
        let content_hash = hash::sha256(&response.body);

        if !self.bodies.exists(&content_hash).await? {
            self.bodies.put(&content_hash, &response.body).await?;
        }

        let entry = StoredEntry {
            cache_key: cache_key.to_string(),
            url: url.to_string(),
            revision: revision.map(str::to_string),
            content_hash,
            status: response.status.as_u16(),
            headers: storable_headers(&response.headers),
            size: response.body.len() as u64,
            stored_at: Utc::now(),
        };
        self.index.insert(&self.cache_name, entry.clone()).await?;

        debug!(
            "💾 Stored {} ({} bytes, body {})",
            cache_key,
            entry.size,
            short_hash(&entry.content_hash)
        );
        Ok(entry)
    }

    /// Read back the response stored under `cache_key`
    pub async fn match_key(&self, cache_key: &str) -> Result<Option<FetchResponse>, PrecacheError> {
        let Some(entry) = self.index.lookup(&self.cache_name, cache_key).await? else {
            return Ok(None);
        };

        let body = self.bodies.get(&entry.content_hash).await?;
        let status = StatusCode::from_u16(entry.status)
            .map_err(|e| PrecacheError::Storage(format!("stored status {} is invalid: {}", entry.status, e)))?;

        Ok(Some(FetchResponse {
            status,
            headers: restore_headers(&entry.headers),
            body,
            source: ResponseSource::Precache,
        }))
    }

    pub async fn keys(&self) -> Result<Vec<String>, PrecacheError> {
        self.index.keys(&self.cache_name).await
    }

    pub async fn keys_for_url(&self, url: &str) -> Result<Vec<String>, PrecacheError> {
        self.index.keys_for_url(&self.cache_name, url).await
    }

    /// Delete the entry under `cache_key` and its body once nothing references it
    pub async fn delete(&self, cache_key: &str) -> Result<bool, PrecacheError> {
        let Some(entry) = self.index.remove(&self.cache_name, cache_key).await? else {
            return Ok(false);
        };

        if !self.index.is_referenced(&entry.content_hash).await? {
            if let Err(e) = self.bodies.delete(&entry.content_hash).await {
                // The index row is already gone; an orphan body is harmless.
                warn!("Failed to delete body {}: {}", short_hash(&entry.content_hash), e);
            }
        }
        Ok(true)
    }
}

/// Headers that describe a connection rather than the response itself
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

fn storable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && name.as_str() != "content-length")
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn restore_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => warn!("Skipping unrestorable stored header {}", name),
        }
    }
    map
}

pub(crate) fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}
