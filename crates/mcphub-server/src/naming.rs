//! Naming strategies for public capability names.
//!
//! Pure encode/decode between `(server_id, local_name)` and the public name
//! the hub exposes. Decoding splits on the FIRST separator occurrence for
//! prefix-style strategies and on the LAST for suffix-style ones, so local
//! names containing the separator survive the round trip. Dots are rewritten
//! to underscores in both components for client compatibility.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mcphub_core::{HubError, Result, MAX_LOCAL_NAME_LEN, MAX_SERVER_ID_LEN};

/// Default decode-cache capacity
const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Naming strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingStrategy {
    /// `serverId + sep + localName`
    Prefix,
    /// `localName + sep + serverId`
    Suffix,
    /// `localName + sep + serverId` (namespace flavour of suffix)
    #[default]
    Namespace,
    /// `serverId + sep + localName`, with an alias map applied on top
    Alias,
    /// Bare local name; decoding requires a registry lookup
    Error,
    /// Identity; collisions are fatal at registration
    None,
}

impl NamingStrategy {
    /// Whether public names produced by this strategy can be decoded without
    /// a registry lookup
    #[must_use]
    pub const fn is_decodable(self) -> bool {
        !matches!(self, Self::Error | Self::None)
    }
}

/// Naming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Strategy in effect
    pub strategy: NamingStrategy,
    /// Separator between components
    pub separator: String,
    /// Public-name aliases applied after encoding (alias strategy)
    pub aliases: HashMap<String, String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            strategy: NamingStrategy::default(),
            separator: "_".to_string(),
            aliases: HashMap::new(),
        }
    }
}

/// Replace the reserved period with an underscore
fn sanitize(component: &str) -> String {
    component.replace('.', "_")
}

fn check_lengths(server_id: &str, local_name: &str) -> Result<()> {
    if server_id.len() > MAX_SERVER_ID_LEN {
        return Err(HubError::config(format!(
            "server id too long: {} chars (max {MAX_SERVER_ID_LEN})",
            server_id.len()
        )));
    }
    if local_name.is_empty() {
        return Err(HubError::config("local name cannot be empty"));
    }
    if local_name.len() > MAX_LOCAL_NAME_LEN {
        return Err(HubError::config(format!(
            "local name too long: {} chars (max {MAX_LOCAL_NAME_LEN})",
            local_name.len()
        )));
    }
    Ok(())
}

/// Encode a public name from its components
pub fn encode(config: &NamingConfig, server_id: &str, local_name: &str) -> Result<String> {
    check_lengths(server_id, local_name)?;
    let server_id = sanitize(server_id);
    let local_name = sanitize(local_name);
    let sep = &config.separator;

    let public = match config.strategy {
        NamingStrategy::Prefix | NamingStrategy::Alias => {
            format!("{server_id}{sep}{local_name}")
        }
        NamingStrategy::Suffix | NamingStrategy::Namespace => {
            format!("{local_name}{sep}{server_id}")
        }
        NamingStrategy::Error | NamingStrategy::None => local_name,
    };

    if config.strategy == NamingStrategy::Alias {
        if let Some(alias) = config.aliases.get(&public) {
            return Ok(alias.clone());
        }
    }
    Ok(public)
}

/// Decode a public name back to `(server_id, local_name)`.
///
/// Returns `None` when the strategy cannot decode (error/none) or the name
/// does not contain the separator; callers fall back to a registry lookup.
#[must_use]
pub fn decode(config: &NamingConfig, public_name: &str) -> Option<(String, String)> {
    let mut public_name = public_name;

    // Reverse an alias before structural decoding.
    let unaliased;
    if config.strategy == NamingStrategy::Alias {
        if let Some((original, _)) = config
            .aliases
            .iter()
            .find(|(_, alias)| alias.as_str() == public_name)
        {
            unaliased = original.clone();
            public_name = &unaliased;
        }
    }

    let sep = &config.separator;
    match config.strategy {
        NamingStrategy::Prefix | NamingStrategy::Alias => {
            // First occurrence: the server id cannot contain the separator
            // when it is multi-character safe, the local name may.
            let (server_id, local_name) = public_name.split_once(sep.as_str())?;
            if server_id.is_empty() || local_name.is_empty() {
                return None;
            }
            Some((server_id.to_string(), local_name.to_string()))
        }
        NamingStrategy::Suffix | NamingStrategy::Namespace => {
            // Last occurrence: the local name may contain the separator.
            let (local_name, server_id) = public_name.rsplit_once(sep.as_str())?;
            if server_id.is_empty() || local_name.is_empty() {
                return None;
            }
            Some((server_id.to_string(), local_name.to_string()))
        }
        NamingStrategy::Error | NamingStrategy::None => None,
    }
}

/// Name codec with a bounded decode cache.
///
/// The cache is keyed by the public name and scoped to one
/// (strategy, separator) pair; changing the config means building a new
/// codec. Eviction is FIFO at the capacity bound.
#[derive(Debug)]
pub struct NameCodec {
    config: NamingConfig,
    cache: Mutex<DecodeCache>,
}

#[derive(Debug)]
struct DecodeCache {
    entries: HashMap<String, Option<(String, String)>>,
    order: std::collections::VecDeque<String>,
    capacity: usize,
}

impl DecodeCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: std::collections::VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<Option<(String, String)>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: Option<(String, String)>) {
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
    }
}

impl NameCodec {
    /// Create a codec for the given configuration
    #[must_use]
    pub fn new(config: NamingConfig) -> Self {
        Self::with_cache_capacity(config, DEFAULT_CACHE_CAPACITY)
    }

    /// Create a codec with a custom decode-cache capacity
    #[must_use]
    pub fn with_cache_capacity(config: NamingConfig, capacity: usize) -> Self {
        Self {
            config,
            cache: Mutex::new(DecodeCache::new(capacity)),
        }
    }

    /// The configuration in effect
    #[must_use]
    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    /// Encode a public name
    pub fn encode(&self, server_id: &str, local_name: &str) -> Result<String> {
        encode(&self.config, server_id, local_name)
    }

    /// Decode a public name, consulting the bounded cache
    #[must_use]
    pub fn decode(&self, public_name: &str) -> Option<(String, String)> {
        if let Some(cached) = self.cache.lock().get(public_name) {
            return cached;
        }
        let decoded = decode(&self.config, public_name);
        self.cache
            .lock()
            .insert(public_name.to_string(), decoded.clone());
        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: NamingStrategy) -> NamingConfig {
        NamingConfig {
            strategy,
            ..Default::default()
        }
    }

    #[test]
    fn test_namespace_roundtrip() {
        let cfg = config(NamingStrategy::Namespace);
        let public = encode(&cfg, "srv_a", "echo").unwrap();
        assert_eq!(public, "echo_srv_a");
        assert_eq!(
            decode(&cfg, &public),
            Some(("srv_a".to_string(), "echo".to_string()))
        );
    }

    #[test]
    fn test_prefix_roundtrip() {
        let cfg = config(NamingStrategy::Prefix);
        let public = encode(&cfg, "srv", "do_thing").unwrap();
        assert_eq!(public, "srv_do_thing");
        // First separator splits: server id is "srv".
        assert_eq!(
            decode(&cfg, &public),
            Some(("srv".to_string(), "do_thing".to_string()))
        );
    }

    #[test]
    fn test_suffix_split_uses_last_separator() {
        let cfg = config(NamingStrategy::Suffix);
        let public = encode(&cfg, "a", "read_file").unwrap();
        assert_eq!(public, "read_file_a");
        assert_eq!(
            decode(&cfg, &public),
            Some(("a".to_string(), "read_file".to_string()))
        );
    }

    #[test]
    fn test_roundtrip_property_across_strategies() {
        // Server ids must not contain the separator for the split rules to
        // identify the boundary; these mirror valid real-world configs.
        let cases = [
            (NamingStrategy::Prefix, "srv", "tool"),
            (NamingStrategy::Suffix, "a-b", "multi_part_name"),
            (NamingStrategy::Namespace, "srv1", "echo"),
        ];
        for (strategy, server, local) in cases {
            let cfg = config(strategy);
            let public = encode(&cfg, server, local).unwrap();
            let (decoded_server, decoded_local) = decode(&cfg, &public)
                .unwrap_or_else(|| panic!("{strategy:?} failed to decode {public}"));
            assert_eq!(decoded_local, local, "{strategy:?}");
            assert_eq!(decoded_server, server, "{strategy:?}");
        }
    }

    #[test]
    fn test_alias_applied_and_reversed() {
        let mut cfg = config(NamingStrategy::Alias);
        cfg.aliases
            .insert("srv_search".to_string(), "find".to_string());

        let public = encode(&cfg, "srv", "search").unwrap();
        assert_eq!(public, "find");
        assert_eq!(
            decode(&cfg, "find"),
            Some(("srv".to_string(), "search".to_string()))
        );
    }

    #[test]
    fn test_error_strategy_encodes_bare_and_never_decodes() {
        let cfg = config(NamingStrategy::Error);
        assert_eq!(encode(&cfg, "srv", "search").unwrap(), "search");
        assert_eq!(decode(&cfg, "search"), None);
    }

    #[test]
    fn test_none_strategy_is_identity() {
        let cfg = config(NamingStrategy::None);
        assert_eq!(encode(&cfg, "srv", "tool").unwrap(), "tool");
        assert_eq!(decode(&cfg, "tool"), None);
    }

    #[test]
    fn test_dots_rewritten() {
        let cfg = config(NamingStrategy::Namespace);
        let public = encode(&cfg, "srv", "fs.read").unwrap();
        assert_eq!(public, "fs_read_srv");
        assert!(!public.contains('.'));
    }

    #[test]
    fn test_length_caps() {
        let cfg = config(NamingStrategy::Namespace);
        assert!(encode(&cfg, &"s".repeat(101), "tool").is_err());
        assert!(encode(&cfg, "srv", &"t".repeat(201)).is_err());
        assert!(encode(&cfg, "srv", "").is_err());
        assert!(encode(&cfg, &"s".repeat(100), &"t".repeat(200)).is_ok());
    }

    #[test]
    fn test_codec_cache_consistency() {
        let codec = NameCodec::new(config(NamingStrategy::Namespace));
        let public = codec.encode("srv_a", "echo").unwrap();

        // Twice: second hit comes from the cache.
        for _ in 0..2 {
            assert_eq!(
                codec.decode(&public),
                Some(("srv_a".to_string(), "echo".to_string()))
            );
        }
        assert_eq!(codec.decode("nonsense"), None);
    }

    #[test]
    fn test_codec_cache_bounded() {
        let codec =
            NameCodec::with_cache_capacity(config(NamingStrategy::Namespace), 4);
        for i in 0..32 {
            let _ = codec.decode(&format!("tool{i}_srv"));
        }
        assert!(codec.cache.lock().entries.len() <= 4);
    }
}
