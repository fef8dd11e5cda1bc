//! Precache manager: install, activate and fetch handling for one manifest

use crate::precache::routing::{NavigationRoute, url_variations};
use crate::precache::{
    CacheStorage, FetchRequest, FetchResponse, Manifest, ManifestEntry, Network, PrecacheError,
};
use futures::stream::{self, StreamExt};
use regex::Regex;
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default limit for concurrent install fetches
const DEFAULT_INSTALL_CONCURRENCY: usize = 8;

/// Base delay between install fetch attempts, multiplied by the attempt number
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Longest wait between install fetch attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

fn retry_delay(attempt: u32) -> Duration {
    RETRY_BACKOFF.saturating_mul(attempt).min(MAX_RETRY_DELAY)
}

/// Matching and install behaviour of a precache manager
#[derive(Debug, Clone)]
pub struct PrecacheOptions {
    /// Path answered for every navigation, resolved against the origin
    pub navigation_url: Option<String>,
    pub navigation_route: NavigationRoute,
    /// Query parameters dropped before matching
    pub ignore_url_parameters: Vec<Regex>,
    /// File tried for URLs ending in `/`
    pub directory_index: Option<String>,
    /// Try `<path>.html` for extensionless URLs
    pub clean_urls: bool,
    pub install_concurrency: usize,
    /// Extra attempts per asset during install
    pub fetch_retries: u32,
}

impl Default for PrecacheOptions {
    fn default() -> Self {
        Self {
            navigation_url: Some("/index.html".to_string()),
            navigation_route: NavigationRoute::default(),
            ignore_url_parameters: vec![Regex::new("^utm_").expect("static regex")],
            directory_index: Some("index.html".to_string()),
            clean_urls: true,
            install_concurrency: DEFAULT_INSTALL_CONCURRENCY,
            fetch_retries: 2,
        }
    }
}

/// Outcome of a successful install
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Keys fetched from the network and stored
    pub fetched: Vec<String>,
    /// Keys already present, not refetched
    pub reused: Vec<String>,
    /// Older keys for manifest URLs, removed on activation
    pub scheduled_for_removal: Vec<String>,
}

/// Outcome of a successful activation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    pub deleted: Vec<String>,
}

enum EntryOutcome {
    Fetched,
    Reused,
}

/// Keeps one manifest's assets precached and answers fetches from them
pub struct PrecacheManager {
    manifest: Manifest,
    navigation_key: Option<String>,
    options: PrecacheOptions,
    storage: CacheStorage,
    network: Arc<dyn Network>,
}

impl std::fmt::Debug for PrecacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecacheManager")
            .field("entries", &self.manifest.len())
            .field("navigation_key", &self.navigation_key)
            .field("storage", &self.storage)
            .field("network", &"<dyn Network>")
            .finish()
    }
}

impl PrecacheManager {
    /// Create a manager for `manifest`
    ///
    /// `origin` resolves the navigation URL. A navigation URL that is not in
    /// the manifest disables navigation handling.
    pub fn new(
        manifest: Manifest,
        origin: &Url,
        options: PrecacheOptions,
        storage: CacheStorage,
        network: Arc<dyn Network>,
    ) -> Self {
        let navigation_key = options.navigation_url.as_deref().and_then(|path| {
            let key = origin
                .join(path)
                .ok()
                .and_then(|url| manifest.get(&url))
                .map(|entry| entry.cache_key.clone());
            if key.is_none() {
                warn!("Navigation URL {} is not in the manifest, navigations pass through", path);
            }
            key
        });

        Self {
            manifest,
            navigation_key,
            options,
            storage,
            network,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    /// The storage key of the manifest entry for `url`, if any
    pub fn cache_key_for_url(&self, url: &Url) -> Option<&str> {
        self.manifest.get(url).map(|entry| entry.cache_key.as_str())
    }

    /// Fetch and store every manifest entry that is not already stored
    ///
    /// Entries are independent: one failing does not stop the others, but
    /// any failure fails the install as a whole.
    pub async fn install(&self) -> Result<InstallReport, PrecacheError> {
        info!(
            "📦 Installing {} entries into {}",
            self.manifest.len(),
            self.storage.cache_name()
        );

        let concurrency = self.options.install_concurrency.max(1);
        // Owned entries keep the stream's futures free of borrowed-item lifetimes
        let outcomes: Vec<(ManifestEntry, Result<EntryOutcome, PrecacheError>)> =
            stream::iter(self.manifest.entries().to_vec())
                .map(|entry| async move {
                    let outcome = self.install_entry(&entry).await;
                    (entry, outcome)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut report = InstallReport::default();
        let mut errors = Vec::new();
        for (entry, outcome) in outcomes {
            match outcome {
                Ok(EntryOutcome::Fetched) => report.fetched.push(entry.cache_key),
                Ok(EntryOutcome::Reused) => report.reused.push(entry.cache_key),
                Err(e) => {
                    warn!("Failed to precache {}: {}", entry.url, e);
                    errors.push(e);
                }
            }
        }

        if !errors.is_empty() {
            return Err(PrecacheError::InstallFailed {
                total: self.manifest.len(),
                errors,
            });
        }

        for entry in self.manifest.entries() {
            for key in self.storage.keys_for_url(entry.url.as_str()).await? {
                if key != entry.cache_key {
                    report.scheduled_for_removal.push(key);
                }
            }
        }

        report.fetched.sort();
        report.reused.sort();
        info!(
            "✅ Install complete: {} fetched, {} reused, {} scheduled for removal",
            report.fetched.len(),
            report.reused.len(),
            report.scheduled_for_removal.len()
        );
        Ok(report)
    }

    async fn install_entry(&self, entry: &ManifestEntry) -> Result<EntryOutcome, PrecacheError> {
        if self.storage.contains(&entry.cache_key).await? {
            debug!("♻️  Already precached: {}", entry.cache_key);
            return Ok(EntryOutcome::Reused);
        }

        let response = self.fetch_for_install(&entry.url).await?;
        self.storage
            .put(
                &entry.cache_key,
                entry.url.as_str(),
                entry.revision.as_deref(),
                &response,
            )
            .await?;
        Ok(EntryOutcome::Fetched)
    }

    async fn fetch_for_install(&self, url: &Url) -> Result<FetchResponse, PrecacheError> {
        let request = FetchRequest::get(url.clone());
        let attempts = self.options.fetch_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let error = match self.network.fetch(&request).await {
                Ok(response) if response.status.is_success() => return Ok(response),
                Ok(response) => PrecacheError::Fetch {
                    url: url.to_string(),
                    reason: format!("HTTP error: {}", response.status),
                },
                Err(e) => e,
            };

            if attempt >= attempts {
                return Err(error);
            }
            debug!("Attempt {}/{} for {} failed: {}", attempt, attempts, url, error);
            tokio::time::sleep(retry_delay(attempt)).await;
            attempt += 1;
        }
    }

    /// Delete every stored key that is not part of this manifest
    ///
    /// A deletion failure stops activation. Keys deleted before it stay
    /// deleted, and whichever version still serves answers them from the
    /// network.
    pub async fn activate(&self) -> Result<ActivateReport, PrecacheError> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|key| !self.manifest.contains_key(key))
            .collect();
        debug!("{} stale entries to delete", stale.len());

        let mut report = ActivateReport::default();
        for key in &stale {
            match self.storage.delete(key).await {
                Ok(true) => {
                    debug!("🗑️  Deleted stale entry {}", key);
                    report.deleted.push(key.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Activation of {} stopped after deleting {} of {} stale entries: {:?}",
                        self.storage.cache_name(),
                        report.deleted.len(),
                        stale.len(),
                        report.deleted
                    );
                    return Err(e);
                }
            }
        }

        info!(
            "Activated {} with {} entries, {} stale entries deleted",
            self.storage.cache_name(),
            self.manifest.len(),
            report.deleted.len()
        );
        Ok(report)
    }

    /// Answer a request from the precache, or pass it through to the network
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchResponse, PrecacheError> {
        if let Some(cache_key) = self.route(request) {
            match self.storage.match_key(&cache_key).await {
                Ok(Some(response)) => {
                    debug!("Precache hit for {} ({})", request.url, cache_key);
                    return Ok(response);
                }
                Ok(None) => warn!("Precached entry {} missing, using network", cache_key),
                Err(e) => warn!("Precache lookup for {} failed, using network: {}", cache_key, e),
            }
        }

        self.network.fetch(request).await
    }

    /// The cache key a request should be answered from, if any
    fn route(&self, request: &FetchRequest) -> Option<String> {
        if request.method != Method::GET {
            return None;
        }

        if request.is_navigation() {
            if let Some(key) = &self.navigation_key {
                if self.options.navigation_route.matches(&request.url) {
                    return Some(key.clone());
                }
            }
        }

        url_variations(
            &request.url,
            &self.options.ignore_url_parameters,
            self.options.directory_index.as_deref(),
            self.options.clean_urls,
        )
        .iter()
        .find_map(|url| self.cache_key_for_url(url))
        .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precache::{AssetEntry, ResponseSource};
    use crate::test_support::{StubNetwork, failing_storage, flaky_storage, origin, temp_storage};

    fn build_manager(entries: Vec<AssetEntry>, storage: CacheStorage, network: Arc<StubNetwork>) -> PrecacheManager {
        let manifest = Manifest::resolve(entries, &origin()).unwrap();
        let options = PrecacheOptions {
            fetch_retries: 0,
            ..PrecacheOptions::default()
        };
        PrecacheManager::new(manifest, &origin(), options, storage, network)
    }

    fn site_network() -> Arc<StubNetwork> {
        let network = StubNetwork::new();
        network.serve("https://example.com/index.html", "text/html", "<html>home</html>");
        network.serve("https://example.com/a.js", "application/javascript", "console.log('a')");
        network.serve("https://example.com/b.css", "text/css", "body {}");
        Arc::new(network)
    }

    fn site_entries() -> Vec<AssetEntry> {
        vec![
            AssetEntry::new("/index.html", "i1"),
            AssetEntry::new("a.js", "r1"),
            AssetEntry::new("b.css", "c1"),
        ]
    }

    #[tokio::test]
    async fn test_install_stores_every_entry() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        let manager = build_manager(site_entries(), storage.clone(), network.clone());

        let report = manager.install().await.unwrap();
        assert_eq!(report.fetched.len(), 3);
        assert!(report.reused.is_empty());

        let mut expected: Vec<String> =
            manager.manifest().entries().iter().map(|e| e.cache_key.clone()).collect();
        expected.sort();
        assert_eq!(storage.keys().await.unwrap(), expected);

        let stored = storage
            .match_key("https://example.com/a.js?__precache_rev=r1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.body, b"console.log('a')");
        assert_eq!(stored.content_type(), Some("application/javascript"));
    }

    #[tokio::test]
    async fn test_install_twice_does_not_refetch() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        let manager = build_manager(site_entries(), storage, network.clone());

        manager.install().await.unwrap();
        assert_eq!(network.request_count(), 3);

        let report = manager.install().await.unwrap();
        assert_eq!(network.request_count(), 3);
        assert!(report.fetched.is_empty());
        assert_eq!(report.reused.len(), 3);
    }

    #[tokio::test]
    async fn test_revision_change_replaces_entry() {
        let (storage, _dir) = temp_storage();
        let network = site_network();

        let v1 = build_manager(vec![AssetEntry::new("a.js", "r1")], storage.clone(), network.clone());
        v1.install().await.unwrap();
        v1.activate().await.unwrap();

        network.serve("https://example.com/a.js", "application/javascript", "console.log('a2')");
        let v2 = build_manager(vec![AssetEntry::new("a.js", "r2")], storage.clone(), network.clone());

        let report = v2.install().await.unwrap();
        assert_eq!(
            report.scheduled_for_removal,
            vec!["https://example.com/a.js?__precache_rev=r1".to_string()]
        );
        // The old revision survives until activation
        assert_eq!(storage.keys().await.unwrap().len(), 2);

        let activated = v2.activate().await.unwrap();
        assert_eq!(activated.deleted, vec!["https://example.com/a.js?__precache_rev=r1".to_string()]);
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["https://example.com/a.js?__precache_rev=r2".to_string()]
        );

        let served = v2
            .handle_fetch(&FetchRequest::get(Url::parse("https://example.com/a.js").unwrap()))
            .await
            .unwrap();
        assert_eq!(served.source, ResponseSource::Precache);
        assert_eq!(served.body, b"console.log('a2')");
    }

    #[tokio::test]
    async fn test_activate_removes_keys_outside_manifest() {
        let (storage, _dir) = temp_storage();
        let network = site_network();

        let v1 = build_manager(site_entries(), storage.clone(), network.clone());
        v1.install().await.unwrap();

        let v2 = build_manager(vec![AssetEntry::new("a.js", "r1")], storage.clone(), network);
        v2.install().await.unwrap();
        let report = v2.activate().await.unwrap();

        assert_eq!(report.deleted.len(), 2);
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["https://example.com/a.js?__precache_rev=r1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_entry_fails_install_but_keeps_others() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        network.fail("https://example.com/b.css");
        let manager = build_manager(site_entries(), storage.clone(), network);

        let err = manager.install().await.unwrap_err();
        match err {
            PrecacheError::InstallFailed { total, errors } => {
                assert_eq!(total, 3);
                assert_eq!(errors.len(), 1);
                assert!(matches!(errors[0], PrecacheError::Fetch { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(storage.contains("https://example.com/a.js?__precache_rev=r1").await.unwrap());
        assert!(!storage.contains("https://example.com/b.css?__precache_rev=c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_status_is_a_fetch_error() {
        let (storage, _dir) = temp_storage();
        let network = Arc::new(StubNetwork::new());
        network.serve_status("https://example.com/a.js", 404, "not found");
        let manager = build_manager(vec![AssetEntry::new("a.js", "r1")], storage.clone(), network);

        assert!(manager.install().await.is_err());
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        network.fail_times("https://example.com/a.js", 1);

        let manifest = Manifest::resolve(vec![AssetEntry::new("a.js", "r1")], &origin()).unwrap();
        let options = PrecacheOptions {
            fetch_retries: 1,
            ..PrecacheOptions::default()
        };
        let manager = PrecacheManager::new(manifest, &origin(), options, storage, network.clone());

        let report = manager.install().await.unwrap();
        assert_eq!(report.fetched.len(), 1);
        assert_eq!(network.request_count(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_retries_do_not_overflow() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        network.fail_times("https://example.com/a.js", 1);

        let manifest = Manifest::resolve(vec![AssetEntry::new("a.js", "r1")], &origin()).unwrap();
        let options = PrecacheOptions {
            fetch_retries: u32::MAX,
            ..PrecacheOptions::default()
        };
        let manager = PrecacheManager::new(manifest, &origin(), options, storage, network.clone());

        manager.install().await.unwrap();
        assert_eq!(network.request_count(), 2);
        assert_eq!(retry_delay(1), RETRY_BACKOFF);
        assert_eq!(retry_delay(u32::MAX), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_activate_stops_on_delete_failure() {
        let (storage, index, _dir) = flaky_storage();
        let network = site_network();

        let v1 = build_manager(site_entries(), storage.clone(), network.clone());
        v1.install().await.unwrap();
        v1.activate().await.unwrap();

        let v2 = build_manager(vec![AssetEntry::new("a.js", "r1")], storage.clone(), network);
        v2.install().await.unwrap();

        index.fail_removals();
        let err = v2.activate().await.unwrap_err();
        assert!(err.is_storage());

        // Nothing was deleted, so v1 still answers its whole manifest from the store
        assert_eq!(storage.keys().await.unwrap().len(), 3);
        let css = v1
            .handle_fetch(&FetchRequest::get(Url::parse("https://example.com/b.css").unwrap()))
            .await
            .unwrap();
        assert_eq!(css.source, ResponseSource::Precache);
    }

    #[tokio::test]
    async fn test_navigation_served_from_navigation_key() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        let manager = build_manager(site_entries(), storage, network.clone());
        manager.install().await.unwrap();
        manager.activate().await.unwrap();
        let fetched = network.request_count();

        let deep = manager
            .handle_fetch(&FetchRequest::navigate(Url::parse("https://example.com/foo/bar").unwrap()))
            .await
            .unwrap();
        let root = manager
            .handle_fetch(&FetchRequest::navigate(Url::parse("https://example.com/").unwrap()))
            .await
            .unwrap();

        assert_eq!(deep.source, ResponseSource::Precache);
        assert_eq!(deep.body, root.body);
        assert_eq!(deep.body, b"<html>home</html>");
        assert_eq!(network.request_count(), fetched);
    }

    #[tokio::test]
    async fn test_navigation_denylist_passes_through() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        network.serve("https://example.com/api/health", "application/json", "{}");

        let manifest = Manifest::resolve(site_entries(), &origin()).unwrap();
        let options = PrecacheOptions {
            navigation_route: NavigationRoute::new(vec![], vec![Regex::new("^/api/").unwrap()]),
            fetch_retries: 0,
            ..PrecacheOptions::default()
        };
        let manager = PrecacheManager::new(manifest, &origin(), options, storage, network);
        manager.install().await.unwrap();

        let response = manager
            .handle_fetch(&FetchRequest::navigate(Url::parse("https://example.com/api/health").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.body, b"{}");
    }

    #[tokio::test]
    async fn test_unmatched_request_passes_through_uncached() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        network.serve("https://example.com/data.json", "application/json", "[1,2,3]");
        let manager = build_manager(site_entries(), storage.clone(), network.clone());
        manager.install().await.unwrap();
        let keys_before = storage.keys().await.unwrap();

        let response = manager
            .handle_fetch(&FetchRequest::get(Url::parse("https://example.com/data.json").unwrap()))
            .await
            .unwrap();

        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.body, b"[1,2,3]");
        assert_eq!(network.last_request().unwrap(), "https://example.com/data.json");
        assert_eq!(storage.keys().await.unwrap(), keys_before);
    }

    #[tokio::test]
    async fn test_ignored_parameters_and_clean_urls_match() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        let manager = build_manager(site_entries(), storage, network.clone());
        manager.install().await.unwrap();
        let fetched = network.request_count();

        let tracked = manager
            .handle_fetch(&FetchRequest::get(
                Url::parse("https://example.com/a.js?utm_source=newsletter").unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(tracked.source, ResponseSource::Precache);

        let clean = manager
            .handle_fetch(&FetchRequest::get(Url::parse("https://example.com/index").unwrap()))
            .await
            .unwrap();
        assert_eq!(clean.source, ResponseSource::Precache);
        assert_eq!(network.request_count(), fetched);
    }

    #[tokio::test]
    async fn test_non_get_passes_through() {
        let (storage, _dir) = temp_storage();
        let network = site_network();
        let manager = build_manager(site_entries(), storage, network.clone());
        manager.install().await.unwrap();

        let mut request = FetchRequest::get(Url::parse("https://example.com/a.js").unwrap());
        request.method = Method::POST;
        let response = manager.handle_fetch(&request).await.unwrap();
        assert_eq!(response.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn test_storage_failure_falls_back_to_network() {
        let network = site_network();
        let manager = build_manager(site_entries(), failing_storage(), network.clone());

        let response = manager
            .handle_fetch(&FetchRequest::get(Url::parse("https://example.com/a.js").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.body, b"console.log('a')");
    }

    #[tokio::test]
    async fn test_install_surfaces_storage_failure() {
        let network = site_network();
        let manager = build_manager(site_entries(), failing_storage(), network);

        match manager.install().await.unwrap_err() {
            PrecacheError::InstallFailed { errors, .. } => {
                assert!(errors.iter().all(PrecacheError::is_storage));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_navigation_url_outside_manifest_disables_navigation() {
        let (storage, _dir) = temp_storage();
        let manifest = Manifest::resolve(vec![AssetEntry::new("a.js", "r1")], &origin()).unwrap();
        let manager = PrecacheManager::new(
            manifest,
            &origin(),
            PrecacheOptions::default(),
            storage,
            Arc::new(StubNetwork::new()),
        );
        assert!(manager.navigation_key.is_none());
        assert_eq!(
            manager.cache_key_for_url(&Url::parse("https://example.com/a.js").unwrap()),
            Some("https://example.com/a.js?__precache_rev=r1")
        );
    }
}
