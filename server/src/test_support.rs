//! Fixtures shared by unit tests

use crate::precache::local::LocalBodyStore;
use crate::precache::sqlite::SqliteCacheIndex;
use crate::precache::{
    BodyStore, CacheIndex, CacheStorage, FetchRequest, FetchResponse, Network, PrecacheError, ResponseSource,
    StoredEntry,
};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use url::Url;

pub fn origin() -> Url {
    Url::parse("https://example.com/").unwrap()
}

/// A SQLite + filesystem store in a temporary directory
pub fn temp_storage() -> (CacheStorage, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let index = SqliteCacheIndex::new(temp_dir.path().join("precache.db")).unwrap();
    let bodies = LocalBodyStore::new(temp_dir.path().join("bodies")).unwrap();
    let storage = CacheStorage::new("precache-test", Arc::new(index), Arc::new(bodies));
    (storage, temp_dir)
}

/// Like [`temp_storage`], with an index whose removals can be made to fail
pub fn flaky_storage() -> (CacheStorage, Arc<FlakyIndex>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let index = Arc::new(FlakyIndex {
        inner: SqliteCacheIndex::new(temp_dir.path().join("precache.db")).unwrap(),
        fail_removals: AtomicBool::new(false),
    });
    let bodies = LocalBodyStore::new(temp_dir.path().join("bodies")).unwrap();
    let storage = CacheStorage::new("precache-test", index.clone(), Arc::new(bodies));
    (storage, index, temp_dir)
}

pub struct FlakyIndex {
    inner: SqliteCacheIndex,
    fail_removals: AtomicBool,
}

impl FlakyIndex {
    pub fn fail_removals(&self) {
        self.fail_removals.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl CacheIndex for FlakyIndex {
    async fn lookup(&self, cache_name: &str, cache_key: &str) -> Result<Option<StoredEntry>, PrecacheError> {
        self.inner.lookup(cache_name, cache_key).await
    }
    async fn insert(&self, cache_name: &str, entry: StoredEntry) -> Result<(), PrecacheError> {
        self.inner.insert(cache_name, entry).await
    }
    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, PrecacheError> {
        self.inner.keys(cache_name).await
    }
    async fn keys_for_url(&self, cache_name: &str, url: &str) -> Result<Vec<String>, PrecacheError> {
        self.inner.keys_for_url(cache_name, url).await
    }
    async fn remove(&self, cache_name: &str, cache_key: &str) -> Result<Option<StoredEntry>, PrecacheError> {
        if self.fail_removals.load(Ordering::SeqCst) {
            return unavailable();
        }
        self.inner.remove(cache_name, cache_key).await
    }
    async fn is_referenced(&self, content_hash: &str) -> Result<bool, PrecacheError> {
        self.inner.is_referenced(content_hash).await
    }
}

/// A store whose every operation fails
pub fn failing_storage() -> CacheStorage {
    CacheStorage::new("precache-test", Arc::new(FailingStore), Arc::new(FailingStore))
}

struct FailingStore;

fn unavailable<T>() -> Result<T, PrecacheError> {
    Err(PrecacheError::Storage("store unavailable".to_string()))
}

#[async_trait::async_trait]
impl CacheIndex for FailingStore {
    async fn lookup(&self, _: &str, _: &str) -> Result<Option<StoredEntry>, PrecacheError> {
        unavailable()
    }
    async fn insert(&self, _: &str, _: StoredEntry) -> Result<(), PrecacheError> {
        unavailable()
    }
    async fn keys(&self, _: &str) -> Result<Vec<String>, PrecacheError> {
        unavailable()
    }
    async fn keys_for_url(&self, _: &str, _: &str) -> Result<Vec<String>, PrecacheError> {
        unavailable()
    }
    async fn remove(&self, _: &str, _: &str) -> Result<Option<StoredEntry>, PrecacheError> {
        unavailable()
    }
    async fn is_referenced(&self, _: &str) -> Result<bool, PrecacheError> {
        unavailable()
    }
}

#[async_trait::async_trait]
impl BodyStore for FailingStore {
    async fn put(&self, _: &str, _: &[u8]) -> Result<(), PrecacheError> {
        unavailable()
    }
    async fn exists(&self, _: &str) -> Result<bool, PrecacheError> {
        unavailable()
    }
    async fn get(&self, _: &str) -> Result<Vec<u8>, PrecacheError> {
        unavailable()
    }
    async fn delete(&self, _: &str) -> Result<(), PrecacheError> {
        unavailable()
    }
    fn storage_type(&self) -> &str {
        "failing"
    }
}

#[derive(Clone)]
struct Route {
    status: u16,
    content_type: String,
    body: Vec<u8>,
}

/// In-process network that records every request it answers
#[derive(Default)]
pub struct StubNetwork {
    routes: Mutex<HashMap<String, Route>>,
    // URL -> remaining failures; u32::MAX fails forever
    failures: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<String>>,
}

impl StubNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, content_type: &str, body: &str) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                status: 200,
                content_type: content_type.to_string(),
                body: body.as_bytes().to_vec(),
            },
        );
    }

    pub fn serve_status(&self, url: &str, status: u16, body: &str) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                status,
                content_type: "text/plain".to_string(),
                body: body.as_bytes().to_vec(),
            },
        );
    }

    pub fn fail(&self, url: &str) {
        self.fail_times(url, u32::MAX);
    }

    pub fn fail_times(&self, url: &str, times: u32) {
        self.failures.lock().unwrap().insert(url.to_string(), times);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<String> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl Network for StubNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, PrecacheError> {
        let url = request.url.to_string();
        self.requests.lock().unwrap().push(url.clone());

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&url) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(PrecacheError::Fetch {
                    url,
                    reason: "connection refused".to_string(),
                });
            }
        }

        let route = self.routes.lock().unwrap().get(&url).cloned();
        let route = route.unwrap_or(Route {
            status: 404,
            content_type: "text/plain".to_string(),
            body: b"not found".to_vec(),
        });

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(&route.content_type).unwrap());
        Ok(FetchResponse {
            status: StatusCode::from_u16(route.status).unwrap(),
            headers,
            body: route.body,
            source: ResponseSource::Network,
        })
    }
}
