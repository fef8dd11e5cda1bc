//! Precache manifest parsing and resolution

use crate::precache::PrecacheError;
use crate::precache::hash::{cache_key, fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

/// One asset as written in a manifest file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    /// The asset URL, usually relative to the origin
    pub url: String,
    /// Content fingerprint. `None` means the URL itself is versioned.
    #[serde(default)]
    pub revision: Option<String>,
}

impl AssetEntry {
    pub fn new(url: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            revision: Some(revision.into()),
        }
    }
}

/// Manifest files may list bare URLs next to `{url, revision}` objects
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Url(String),
    Entry(AssetEntry),
}

impl From<RawEntry> for AssetEntry {
    fn from(raw: RawEntry) -> Self {
        match raw {
            RawEntry::Url(url) => AssetEntry { url, revision: None },
            RawEntry::Entry(entry) => entry,
        }
    }
}

/// An asset resolved against the origin, with its storage key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub url: Url,
    pub revision: Option<String>,
    pub cache_key: String,
}

/// An immutable, validated set of assets for one worker version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    // Absolute URL (no fragment) -> index into `entries`
    by_url: HashMap<String, usize>,
}

impl Manifest {
    /// Resolve asset entries against `base`
    ///
    /// Identical duplicates collapse into one entry. The same URL listed with
    /// two different revisions is rejected.
    pub fn resolve<I>(entries: I, base: &Url) -> Result<Self, PrecacheError>
    where
        I: IntoIterator<Item = AssetEntry>,
    {
        let mut resolved: Vec<ManifestEntry> = Vec::new();
        let mut by_url: HashMap<String, usize> = HashMap::new();

        for entry in entries {
            let mut url = base
                .join(&entry.url)
                .map_err(|e| PrecacheError::InvalidUrl(format!("{}: {}", entry.url, e)))?;
            url.set_fragment(None);

            if let Some(&existing) = by_url.get(url.as_str()) {
                let existing: &ManifestEntry = &resolved[existing];
                if existing.revision != entry.revision {
                    return Err(PrecacheError::ConflictingEntries {
                        url: url.to_string(),
                        first: existing.revision.clone(),
                        second: entry.revision,
                    });
                }
                debug!("Skipping duplicate manifest entry {}", url);
                continue;
            }

            let cache_key = cache_key(&url, entry.revision.as_deref());
            by_url.insert(url.to_string(), resolved.len());
            resolved.push(ManifestEntry {
                url,
                revision: entry.revision,
                cache_key,
            });
        }

        Ok(Self {
            entries: resolved,
            by_url,
        })
    }

    /// Parse a JSON manifest and resolve it against `base`
    pub fn from_json(json: &str, base: &Url) -> Result<Self, PrecacheError> {
        let raw: Vec<RawEntry> =
            serde_json::from_str(json).map_err(|e| PrecacheError::Manifest(e.to_string()))?;
        Self::resolve(raw.into_iter().map(AssetEntry::from), base)
    }

    /// Load a JSON manifest file
    pub async fn load(path: &Path, base: &Url) -> Result<Self, PrecacheError> {
        let json = tokio::fs::read_to_string(path).await?;
        let manifest = Self::from_json(&json, base)?;
        info!("Loaded manifest {} with {} entries", path.display(), manifest.len());
        Ok(manifest)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry for an absolute URL, ignoring any fragment
    pub fn get(&self, url: &Url) -> Option<&ManifestEntry> {
        let mut url = url.clone();
        url.set_fragment(None);
        self.by_url.get(url.as_str()).map(|&i| &self.entries[i])
    }

    /// Whether `cache_key` belongs to this manifest
    pub fn contains_key(&self, cache_key: &str) -> bool {
        self.entries.iter().any(|e| e.cache_key == cache_key)
    }

    /// Stable fingerprint of the manifest's keys
    pub fn version(&self) -> String {
        fingerprint(self.entries.iter().map(|e| e.cache_key.as_str()))
    }
}
