//! Network boundary for precaching and pass-through requests

use crate::precache::{PrecacheError, is_hop_by_hop};
use reqwest::header::{ACCEPT, HOST, HeaderMap};
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// How the request was initiated, as reported by `Sec-Fetch-Mode`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Top-level document navigation
    Navigate,
    SameOrigin,
    NoCors,
    Cors,
}

impl RequestMode {
    /// Infer the mode from request headers
    ///
    /// Clients that do not send `Sec-Fetch-Mode` are treated as navigating
    /// when they issue a GET that accepts HTML.
    pub fn from_headers(method: &Method, headers: &HeaderMap) -> Self {
        let fetch_mode = headers
            .get("sec-fetch-mode")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.trim().to_ascii_lowercase());

        match fetch_mode.as_deref() {
            Some("navigate") => RequestMode::Navigate,
            Some("same-origin") => RequestMode::SameOrigin,
            Some("no-cors") => RequestMode::NoCors,
            Some("cors") => RequestMode::Cors,
            _ => {
                let accepts_html = headers
                    .get(ACCEPT)
                    .and_then(|h| h.to_str().ok())
                    .map(|accept| accept.contains("text/html"))
                    .unwrap_or(false);
                if *method == Method::GET && accepts_html {
                    RequestMode::Navigate
                } else {
                    RequestMode::NoCors
                }
            }
        }
    }
}

/// A request entering the precache, or leaving it for the network
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchRequest {
    /// A plain subresource GET
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::NoCors,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// A top-level navigation GET
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Precache,
    Network,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
    }
}

/// Network retrieval seam
///
/// The precache manager only talks to the network through this trait, so
/// tests and alternative transports can stand in for HTTP.
#[async_trait::async_trait]
pub trait Network: Send + Sync {
    /// Send `request` and return whatever the network answered
    ///
    /// Non-2xx statuses are responses, not errors; only failures to obtain a
    /// response at all are `PrecacheError::Fetch`.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, PrecacheError>;
}

/// `reqwest`-backed network
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self, PrecacheError> {
        let mut client_builder = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5));

        if let Some(ua) = user_agent {
            client_builder = client_builder.user_agent(ua);
        }

        let client = client_builder.build().map_err(|e| PrecacheError::Fetch {
            url: String::new(),
            reason: format!("failed to build HTTP client: {}", e),
        })?;

        info!("Initialized HTTP network (timeout {:?})", timeout);
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, PrecacheError> {
        debug!("🌐 {} {}", request.method, request.url);

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if *name != HOST && !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let fetch_error = |e: reqwest::Error| PrecacheError::Fetch {
            url: request.url.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(fetch_error)?;

        let status = response.status();
        let mut headers = response.headers().clone();
        headers.remove(reqwest::header::TRANSFER_ENCODING);
        headers.remove(reqwest::header::CONNECTION);

        let body = response.bytes().await.map_err(fetch_error)?.to_vec();

        debug!("Fetched {} bytes from {} ({})", body.len(), request.url, status);

        Ok(FetchResponse {
            status,
            headers,
            body,
            source: ResponseSource::Network,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_mode_from_sec_fetch_mode() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        assert_eq!(RequestMode::from_headers(&Method::GET, &headers), RequestMode::Navigate);

        headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        assert_eq!(RequestMode::from_headers(&Method::GET, &headers), RequestMode::Cors);
    }

    #[test]
    fn test_mode_falls_back_to_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        assert_eq!(RequestMode::from_headers(&Method::GET, &headers), RequestMode::Navigate);
        assert_eq!(RequestMode::from_headers(&Method::POST, &headers), RequestMode::NoCors);

        headers.insert(ACCEPT, HeaderValue::from_static("application/javascript"));
        assert_eq!(RequestMode::from_headers(&Method::GET, &headers), RequestMode::NoCors);
    }

    #[test]
    fn test_navigate_constructor() {
        let url = Url::parse("https://example.com/foo").unwrap();
        assert!(FetchRequest::navigate(url.clone()).is_navigation());
        assert!(!FetchRequest::get(url).is_navigation());
    }
}
