//! Server configuration read from `PRECACHE_*` environment variables

use crate::precache::PrecacheOptions;
use crate::precache::routing::NavigationRoute;
use regex::Regex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Upper bound for `PRECACHE_FETCH_RETRIES`
const MAX_FETCH_RETRIES: u32 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} is not a valid {expected}: {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{var} contains an invalid pattern {pattern:?}: {source}")]
    Pattern {
        var: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Holds `precache.db` and the `bodies/` directory
    pub storage_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Upstream site the precache fronts; also the base for manifest URLs
    pub origin: Url,
    pub manifest_path: PathBuf,
    pub cache_name: String,
    pub fetch_timeout: Duration,
    pub user_agent: Option<String>,
    pub precache: PrecacheOptions,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PrecacheOptions::default();

        let storage_dir = lookup("PRECACHE_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./precache-storage"));

        let bind_addr = parse_or(&lookup, "PRECACHE_BIND", "socket address", SocketAddr::from(([127, 0, 0, 1], 8724)))?;

        let origin_value = lookup("PRECACHE_ORIGIN").unwrap_or_else(|| "http://127.0.0.1:8080/".to_string());
        // Request paths are mapped onto the origin one to one, so it cannot carry a path prefix
        let origin = Url::parse(&origin_value)
            .ok()
            .filter(|url| {
                matches!(url.scheme(), "http" | "https")
                    && url.has_host()
                    && url.path() == "/"
                    && url.query().is_none()
                    && url.fragment().is_none()
            })
            .ok_or_else(|| ConfigError::Invalid {
                var: "PRECACHE_ORIGIN",
                expected: "http(s) origin without a path",
                value: origin_value.clone(),
            })?;

        let manifest_path = lookup("PRECACHE_MANIFEST")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./precache-manifest.json"));

        let cache_name = lookup("PRECACHE_CACHE_NAME")
            .unwrap_or_else(|| format!("precache-{}", origin.origin().ascii_serialization()));

        // An empty value turns navigation handling off
        let navigation_url = match lookup("PRECACHE_NAVIGATION_URL") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value),
            None => defaults.navigation_url.clone(),
        };

        let navigation_route = NavigationRoute::new(
            patterns(&lookup, "PRECACHE_NAVIGATION_ALLOWLIST")?.unwrap_or_default(),
            patterns(&lookup, "PRECACHE_NAVIGATION_DENYLIST")?.unwrap_or_default(),
        );

        let ignore_url_parameters =
            patterns(&lookup, "PRECACHE_IGNORE_PARAMS")?.unwrap_or(defaults.ignore_url_parameters);

        let directory_index = match lookup("PRECACHE_DIRECTORY_INDEX") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value),
            None => defaults.directory_index,
        };

        let precache = PrecacheOptions {
            navigation_url,
            navigation_route,
            ignore_url_parameters,
            directory_index,
            clean_urls: parse_or(&lookup, "PRECACHE_CLEAN_URLS", "boolean", defaults.clean_urls)?,
            install_concurrency: parse_or(
                &lookup,
                "PRECACHE_INSTALL_CONCURRENCY",
                "positive integer",
                defaults.install_concurrency,
            )?,
            fetch_retries: parse_or(&lookup, "PRECACHE_FETCH_RETRIES", "integer", defaults.fetch_retries)?
                .min(MAX_FETCH_RETRIES),
        };

        let timeout_secs: u64 = parse_or(&lookup, "PRECACHE_FETCH_TIMEOUT_SECS", "integer", 30)?;

        Ok(Self {
            storage_dir,
            bind_addr,
            origin,
            manifest_path,
            cache_name,
            fetch_timeout: Duration::from_secs(timeout_secs),
            user_agent: lookup("PRECACHE_USER_AGENT"),
            precache,
        })
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, expected: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, expected, value }),
        None => Ok(default),
    }
}

/// Comma-separated regular expressions; `None` when the variable is unset
fn patterns<F>(lookup: &F, var: &'static str) -> Result<Option<Vec<Regex>>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                var,
                pattern: pattern.to_string(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
