//! Request-to-manifest matching

use regex::Regex;
use url::Url;

/// Candidate URLs a request may be precached under, most specific first
///
/// 1. the URL without its fragment
/// 2. the same with ignored query parameters removed
/// 3. for paths ending in `/`, the directory index appended
/// 4. for other paths, the `.html` suffix appended ("clean" URLs)
pub fn url_variations(
    url: &Url,
    ignore_parameters: &[Regex],
    directory_index: Option<&str>,
    clean_urls: bool,
) -> Vec<Url> {
    let mut variations = Vec::with_capacity(4);

    let mut exact = url.clone();
    exact.set_fragment(None);
    variations.push(exact.clone());

    let stripped = strip_parameters(&exact, ignore_parameters);
    if stripped != exact {
        variations.push(stripped.clone());
    }

    if stripped.path().ends_with('/') {
        if let Some(index) = directory_index {
            if let Ok(with_index) = stripped.join(index) {
                let mut with_index = with_index;
                with_index.set_query(stripped.query());
                variations.push(with_index);
            }
        }
    } else if clean_urls {
        let mut with_html = stripped.clone();
        with_html.set_path(&format!("{}.html", stripped.path()));
        variations.push(with_html);
    }

    variations
}

/// Remove query parameters whose name matches any of `patterns`
fn strip_parameters(url: &Url, patterns: &[Regex]) -> Url {
    if url.query().is_none() || patterns.is_empty() {
        return url.clone();
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !patterns.iter().any(|p| p.is_match(name)))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    stripped
}

/// Decides which navigations are answered with the navigation document
#[derive(Debug, Clone, Default)]
pub struct NavigationRoute {
    allowlist: Vec<Regex>,
    denylist: Vec<Regex>,
}

impl NavigationRoute {
    pub fn new(allowlist: Vec<Regex>, denylist: Vec<Regex>) -> Self {
        Self { allowlist, denylist }
    }

    /// Whether a navigation to `url` should be served the navigation document
    ///
    /// Patterns are matched against the path plus query string. An empty
    /// allowlist allows everything; the denylist always wins.
    pub fn matches(&self, url: &Url) -> bool {
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let allowed = self.allowlist.is_empty() || self.allowlist.iter().any(|p| p.is_match(&target));
        allowed && !self.denylist.iter().any(|p| p.is_match(&target))
    }
}
