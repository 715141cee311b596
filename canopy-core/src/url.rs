//! URL normalization: the dedup key and the path structure the hierarchy is inferred from.
//!
//! Accepts absolute URLs (`https://shop.example/shoes/`), scheme-less hosts
//! (`shop.example/shoes`) and absolute paths (`/shoes`). Path-only inputs have
//! an empty domain and normalize to a bare path.

use std::collections::BTreeMap;

use url::Url;

use crate::error::UrlError;

/// A URL broken into the parts the builder and similarity scoring care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// `scheme://host[:port]`, empty for path-only inputs.
    pub origin: String,
    /// Lowercased host plus non-default port, empty for path-only inputs.
    pub domain: String,
    /// Non-empty path segments, in order.
    pub segments: Vec<String>,
    /// Query parameters; a repeated key keeps its last value.
    pub query: BTreeMap<String, String>,
}

impl ParsedUrl {
    /// Canonical form: lowercase, no fragment, no query, no trailing slash
    /// except on a bare domain root.
    pub fn normalized(&self) -> String {
        self.prefix(self.segments.len())
    }

    /// Normalized form of the ancestor that keeps only the first `depth` segments.
    pub fn prefix(&self, depth: usize) -> String {
        let depth = depth.min(self.segments.len());
        if depth == 0 {
            return format!("{}/", self.origin);
        }
        format!("{}/{}", self.origin, self.segments[..depth].join("/"))
    }

    /// Path component of the normalized form (`/` for a root).
    pub fn path(&self) -> String {
        if self.segments.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.segments.join("/"))
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn slug(&self) -> &str {
        self.segments.last().map_or("", String::as_str)
    }
}

/// Parse a raw catalog URL.
pub fn parse(raw: &str) -> Result<ParsedUrl, UrlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }
    let lower = trimmed.to_lowercase();

    if lower.starts_with('/') && !lower.starts_with("//") {
        return Ok(parse_path_only(&lower));
    }

    let parsed = match Url::parse(&lower) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("http://{lower}"))
            .map_err(|e| UrlError::Malformed {
                input: trimmed.to_string(),
                reason: e.to_string(),
            })?,
        Err(e) => {
            return Err(UrlError::Malformed {
                input: trimmed.to_string(),
                reason: e.to_string(),
            });
        }
    };

    let Some(host) = parsed.host_str() else {
        return Err(UrlError::NoHost(trimmed.to_string()));
    };
    let domain = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let origin = format!("{}://{domain}", parsed.scheme());

    let segments = parsed
        .path_segments()
        .map(|segs| {
            segs.filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let query = parsed.query_pairs().into_owned().collect();

    Ok(ParsedUrl {
        origin,
        domain,
        segments,
        query,
    })
}

fn parse_path_only(lower: &str) -> ParsedUrl {
    let without_fragment = lower.split('#').next().unwrap_or_default();
    let (path, query) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };

    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let query = query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    ParsedUrl {
        origin: String::new(),
        domain: String::new(),
        segments,
        query,
    }
}

/// Normalize a raw URL to its canonical dedup key.
pub fn normalize(raw: &str) -> Result<String, UrlError> {
    parse(raw).map(|p| p.normalized())
}

/// Best-effort key for an input that failed to parse: lowercased, trimmed,
/// trailing slashes removed. Never collides with a parsed domain root.
pub fn fallback_key(raw: &str) -> String {
    raw.trim().to_lowercase().trim_end_matches('/').to_string()
}
