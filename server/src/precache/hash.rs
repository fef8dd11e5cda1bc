//! Hashing and cache key derivation for precached assets

use sha2::{Digest, Sha256};
use url::Url;

/// Query parameter carrying the revision inside a cache key
pub const REVISION_PARAM: &str = "__precache_rev";

/// Compute SHA-256 hash (body store key) of data
pub fn sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Derive the storage key for an asset
///
/// Revisioned assets get the revision appended as a query parameter, so two
/// revisions of one path never share a key. Unrevisioned assets are keyed by
/// their URL alone.
pub fn cache_key(url: &Url, revision: Option<&str>) -> String {
    let mut key = url.clone();
    key.set_fragment(None);
    if let Some(revision) = revision {
        key.query_pairs_mut().append_pair(REVISION_PARAM, revision);
    }
    key.to_string()
}

/// Fingerprint a set of cache keys, used as a worker version
pub fn fingerprint<'a>(keys: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
