//! Per-origin connection hints and transport auto-selection.
//!
//! Successful connections record what worked for an origin so the next
//! connection (including across restarts of the same upstream) skips the
//! probing pass. Entries expire lazily after the TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use url::Url;

use crate::core::{TransportError, TransportResult, TransportType};

/// Default hint lifetime
pub const DEFAULT_ORIGIN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// What a previous successful connection learned about an origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginHint {
    /// Transport that worked
    pub transport: TransportType,
    /// Whether the server honoured the session id header
    pub supports_session_id: bool,
    /// Protocol version the server accepted
    pub protocol_version: Option<String>,
}

#[derive(Debug)]
struct CachedHint {
    hint: OriginHint,
    recorded_at: Instant,
}

/// Per-origin hint cache with lazy TTL expiry
#[derive(Debug)]
pub struct OriginCache {
    entries: RwLock<HashMap<String, CachedHint>>,
    ttl: Duration,
}

impl OriginCache {
    /// Create a cache with the given TTL
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up the hint for an origin, expiring it if stale
    #[must_use]
    pub fn get(&self, origin: &str) -> Option<OriginHint> {
        {
            let entries = self.entries.read();
            match entries.get(origin) {
                Some(cached) if cached.recorded_at.elapsed() < self.ttl => {
                    return Some(cached.hint.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Stale entry: drop it under the write lock.
        self.entries.write().remove(origin);
        None
    }

    /// Record a hint after a successful connection
    pub fn record(&self, origin: impl Into<String>, hint: OriginHint) {
        self.entries.write().insert(
            origin.into(),
            CachedHint {
                hint,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Drop the hint for an origin
    pub fn invalidate(&self, origin: &str) {
        self.entries.write().remove(origin);
    }

    /// Number of live entries (stale entries may still be counted)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for OriginCache {
    fn default() -> Self {
        Self::new(DEFAULT_ORIGIN_TTL)
    }
}

/// Canonical origin key `scheme://host[:port]` for a URL
pub fn origin_key(url: &Url) -> TransportResult<String> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::ConfigurationError(format!("URL has no host: {url}")))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

/// Remote transport selection mode from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteTransportMode {
    /// Infer from cached hints and the URL path
    #[default]
    Auto,
    /// Plain request/response HTTP
    Http,
    /// Server-Sent Events
    Sse,
    /// Streamable HTTP
    StreamableHttp,
}

/// Pick the transport for a remote URL.
///
/// Explicit configuration wins, then a cached hint, then the URL path
/// suffix (`/sse`, `/events`, `/stream` mean SSE; `/mcp` means streamable
/// HTTP), and plain HTTP is the fallback.
#[must_use]
pub fn select_transport(
    url: &Url,
    mode: RemoteTransportMode,
    cached: Option<&OriginHint>,
) -> TransportType {
    match mode {
        RemoteTransportMode::Http | RemoteTransportMode::StreamableHttp => {
            return TransportType::Http;
        }
        RemoteTransportMode::Sse => return TransportType::Sse,
        RemoteTransportMode::Auto => {}
    }

    if let Some(hint) = cached {
        return hint.transport;
    }

    let path = url.path().trim_end_matches('/');
    if path.ends_with("/sse") || path.ends_with("/events") || path.ends_with("/stream") {
        TransportType::Sse
    } else {
        // /mcp endpoints and everything else go through streamable HTTP.
        TransportType::Http
    }
}

/// Validate a remote URL against the security policy.
///
/// Only http/https are permitted; a production profile requires https.
pub fn validate_remote_url(url: &Url, require_https: bool) -> TransportResult<()> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if !require_https => Ok(()),
        "http" => Err(TransportError::ConfigurationError(format!(
            "plain http is not allowed in this profile: {url}"
        ))),
        other => Err(TransportError::ConfigurationError(format!(
            "unsupported URL scheme '{other}': {url}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(transport: TransportType) -> OriginHint {
        OriginHint {
            transport,
            supports_session_id: true,
            protocol_version: Some("2025-06-18".to_string()),
        }
    }

    #[test]
    fn test_origin_key() {
        let url = Url::parse("https://example.com:8443/mcp").unwrap();
        assert_eq!(origin_key(&url).unwrap(), "https://example.com:8443");

        let url = Url::parse("http://example.com/sse").unwrap();
        assert_eq!(origin_key(&url).unwrap(), "http://example.com");
    }

    #[test]
    fn test_cache_roundtrip_and_invalidate() {
        let cache = OriginCache::default();
        assert!(cache.get("https://example.com").is_none());

        cache.record("https://example.com", hint(TransportType::Http));
        assert_eq!(
            cache.get("https://example.com").unwrap().transport,
            TransportType::Http
        );

        cache.invalidate("https://example.com");
        assert!(cache.get("https://example.com").is_none());
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = OriginCache::new(Duration::from_millis(0));
        cache.record("https://example.com", hint(TransportType::Sse));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("https://example.com").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_path_suffix_selection() {
        let sse = Url::parse("https://example.com/api/sse").unwrap();
        assert_eq!(
            select_transport(&sse, RemoteTransportMode::Auto, None),
            TransportType::Sse
        );

        let events = Url::parse("https://example.com/events/").unwrap();
        assert_eq!(
            select_transport(&events, RemoteTransportMode::Auto, None),
            TransportType::Sse
        );

        let mcp = Url::parse("https://example.com/mcp").unwrap();
        assert_eq!(
            select_transport(&mcp, RemoteTransportMode::Auto, None),
            TransportType::Http
        );

        let plain = Url::parse("https://example.com/rpc").unwrap();
        assert_eq!(
            select_transport(&plain, RemoteTransportMode::Auto, None),
            TransportType::Http
        );
    }

    #[test]
    fn test_explicit_mode_wins_over_hint() {
        let url = Url::parse("https://example.com/sse").unwrap();
        let cached = hint(TransportType::Http);
        assert_eq!(
            select_transport(&url, RemoteTransportMode::Sse, Some(&cached)),
            TransportType::Sse
        );
        assert_eq!(
            select_transport(&url, RemoteTransportMode::Auto, Some(&cached)),
            TransportType::Http
        );
    }

    #[test]
    fn test_url_validation() {
        let https = Url::parse("https://example.com/mcp").unwrap();
        assert!(validate_remote_url(&https, true).is_ok());

        let http = Url::parse("http://example.com/mcp").unwrap();
        assert!(validate_remote_url(&http, false).is_ok());
        assert!(validate_remote_url(&http, true).is_err());

        let ftp = Url::parse("ftp://example.com/mcp").unwrap();
        assert!(validate_remote_url(&ftp, false).is_err());
    }
}
