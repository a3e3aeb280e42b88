//! Validated hub configuration.
//!
//! The on-disk shape (after the external JSONC layer has stripped comments)
//! deserialises into [`HubConfig`]. String values support environment
//! references in the forms `${VAR}`, `${VAR:-default}`, `${VAR:?message}`
//! and `${env:VAR}`; expansion happens before validation.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::naming::NamingConfig;
use mcphub_core::{HubError, Result, ServerId};
use mcphub_transport::{validate_remote_url, AuthConfig, RemoteTransportMode};

/// Supported config schema version
pub const CONFIG_VERSION: u32 = 1;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Schema version; must be [`CONFIG_VERSION`]
    pub version: u32,

    /// Log level filter (trace/debug/info/warn/error)
    #[serde(default)]
    pub log_level: Option<String>,

    /// Downstream HTTP endpoint settings (consumed by the wire layer)
    #[serde(default)]
    pub http: Option<HttpEndpointConfig>,

    /// Upstream server definitions
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Tool naming configuration
    #[serde(default)]
    pub tool_naming: NamingConfig,

    /// Session settings
    #[serde(default)]
    pub session: SessionSettings,

    /// Operation timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Concurrency limits
    #[serde(default)]
    pub concurrency: ConcurrencySettings,

    /// Security settings
    #[serde(default)]
    pub security: SecuritySettings,

    /// Generation management settings
    #[serde(default)]
    pub generation: GenerationSettings,

    /// Rollover controller settings
    #[serde(default)]
    pub rollover: RolloverSettings,
}

/// Downstream HTTP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEndpointConfig {
    /// Listen port
    pub port: u16,
    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// One upstream server definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerConfig {
    /// Local child process
    #[serde(rename_all = "camelCase")]
    Local {
        /// Server identifier
        id: String,
        /// Executable to run
        command: String,
        /// Arguments
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory
        #[serde(default)]
        cwd: Option<String>,
        /// Restart automatically after a crash
        #[serde(default = "default_true")]
        auto_restart: bool,
        /// Maximum restart attempts
        #[serde(default = "default_max_restarts")]
        max_restarts: u32,
        /// Delay before a restart
        #[serde(default = "default_restart_delay_ms")]
        restart_delay_ms: u64,
    },
    /// On-demand packaged server run through npx
    #[serde(rename_all = "camelCase")]
    Npx {
        /// Server identifier
        id: String,
        /// Package name
        package: String,
        /// Pinned version
        #[serde(default)]
        version: Option<String>,
        /// Arguments after the package spec
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory
        #[serde(default)]
        work_dir: Option<String>,
        /// First-run init deadline in milliseconds
        #[serde(default = "default_npx_init_timeout_ms")]
        init_timeout_ms: u64,
    },
    /// Remote server over HTTP or SSE
    #[serde(rename_all = "camelCase")]
    Remote {
        /// Server identifier
        id: String,
        /// Endpoint URL
        url: String,
        /// Transport selection
        #[serde(default)]
        transport: RemoteTransportMode,
        /// Custom headers
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Authentication
        #[serde(default)]
        auth: Option<AuthConfig>,
        /// Health probe interval in milliseconds (0 disables)
        #[serde(default = "default_health_interval_ms")]
        health_check_interval_ms: u64,
        /// Per-request timeout in milliseconds
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
}

impl ServerConfig {
    /// The configured identifier
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Local { id, .. } | Self::Npx { id, .. } | Self::Remote { id, .. } => id,
        }
    }

    /// Parse and validate the identifier
    pub fn server_id(&self) -> Result<ServerId> {
        ServerId::new(self.id())
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Idle TTL in seconds
    pub ttl_seconds: u64,
    /// Sweep cadence in seconds
    pub sweep_interval_seconds: u64,
    /// Whether session state is persisted (consumed by the store layer)
    pub persist: bool,
    /// Store identifier (consumed by the store layer)
    pub store: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            sweep_interval_seconds: 60,
            persist: false,
            store: None,
        }
    }
}

/// Timeout settings, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    /// Process spawn / connect deadline
    pub spawn_ms: u64,
    /// Initialize handshake deadline
    pub init_handshake_ms: u64,
    /// Health probe deadline
    pub health_check_ms: u64,
    /// Tool call deadline
    pub tool_call_ms: u64,
    /// Total budget across retries (0 disables)
    pub max_total_ms: u64,
    /// Whether progress resets the tool-call deadline
    pub reset_timeout_on_progress: bool,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            spawn_ms: 10_000,
            init_handshake_ms: 30_000,
            health_check_ms: 5_000,
            tool_call_ms: 60_000,
            max_total_ms: 0,
            reset_timeout_on_progress: false,
        }
    }
}

impl TimeoutSettings {
    /// Convert into the transport-level timeout set
    #[must_use]
    pub fn to_transport(&self) -> mcphub_transport::TransportTimeouts {
        mcphub_transport::TransportTimeouts {
            connect: Duration::from_millis(self.spawn_ms),
            init_handshake: Duration::from_millis(self.init_handshake_ms),
            health_check: Duration::from_millis(self.health_check_ms),
            tool_call: Duration::from_millis(self.tool_call_ms),
            max_total: (self.max_total_ms > 0).then(|| Duration::from_millis(self.max_total_ms)),
            reset_timeout_on_progress: self.reset_timeout_on_progress,
        }
    }
}

/// Concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencySettings {
    /// Global in-flight request cap
    pub global: usize,
    /// Concurrent server initializations during startup
    pub server_init: usize,
    /// Concurrent warmup probes
    pub warmup: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            global: 256,
            server_init: 4,
            warmup: 2,
        }
    }
}

/// Security settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecuritySettings {
    /// Field names redacted in logs and error bodies
    pub redact_keys: Vec<String>,
    /// Allowed remote hosts (empty means all)
    pub allow_net: Vec<String>,
    /// Require https for remote upstreams (production profile)
    pub require_https: bool,
}

/// Generation management settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    /// Maximum concurrent generations
    pub max_generations: usize,
    /// Drain grace period in milliseconds
    pub grace_period_ms: u64,
    /// Reload configuration automatically on change
    pub auto_reload: bool,
    /// Paths watched for config changes
    pub watch_paths: Vec<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_generations: 3,
            grace_period_ms: 10_000,
            auto_reload: false,
            watch_paths: Vec::new(),
        }
    }
}

/// Rollover controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RolloverSettings {
    /// Worker health probe interval in milliseconds
    pub health_check_interval_ms: u64,
    /// Drain deadline in milliseconds
    pub drain_timeout_ms: u64,
    /// Error-rate threshold triggering rollback (0.0 - 1.0)
    pub error_rate_threshold: f64,
    /// Minimum requests before the error rate is meaningful
    pub min_requests_for_rate: u64,
    /// Warmup window in milliseconds
    pub warmup_time_ms: u64,
}

impl Default for RolloverSettings {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 5_000,
            drain_timeout_ms: 30_000,
            error_rate_threshold: 0.1,
            min_requests_for_rate: 10,
            warmup_time_ms: 3_000,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

fn default_npx_init_timeout_ms() -> u64 {
    120_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Expand environment references within a string.
///
/// Supported forms: `${VAR}`, `${env:VAR}`, `${VAR:-default}`,
/// `${VAR:?message}`. An unset variable without a default resolves to the
/// empty string unless the `:?` form makes it required.
pub fn expand_env_str(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(HubError::config(format!(
                "unterminated environment reference in '{input}'"
            )));
        };
        let body = &after[..end];
        let body = body.strip_prefix("env:").unwrap_or(body);

        let value = if let Some((name, default)) = body.split_once(":-") {
            lookup(name).unwrap_or_else(|| default.to_string())
        } else if let Some((name, message)) = body.split_once(":?") {
            match lookup(name) {
                Some(value) => value,
                None => {
                    let message = if message.is_empty() {
                        format!("required environment variable '{name}' is not set")
                    } else {
                        format!("required environment variable '{name}' is not set: {message}")
                    };
                    return Err(HubError::config(message));
                }
            }
        } else {
            lookup(body).unwrap_or_default()
        };

        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Expand environment references in every string of a JSON document
pub fn expand_env_value(
    value: &mut serde_json::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    match value {
        serde_json::Value::String(s) => {
            *s = expand_env_str(s, lookup)?;
        }
        serde_json::Value::Array(items) => {
            for item in items {
                expand_env_value(item, lookup)?;
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                expand_env_value(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

impl HubConfig {
    /// Parse a config document: expand environment references, deserialise
    /// and validate
    pub fn from_json(raw: &str) -> Result<Self> {
        Self::from_json_with_lookup(raw, &|name| std::env::var(name).ok())
    }

    /// Parse with a custom environment lookup (tests)
    pub fn from_json_with_lookup(
        raw: &str,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| HubError::config(format!("config is not valid JSON: {e}")))?;
        expand_env_value(&mut value, lookup)?;
        let config: Self = serde_json::from_value(value)
            .map_err(|e| HubError::config(format!("config does not match schema: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(HubError::config(format!(
                "unsupported config version {} (expected {CONFIG_VERSION})",
                self.version
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            let id = server.server_id()?;
            if !seen.insert(id.clone()) {
                return Err(HubError::config(format!(
                    "duplicate server id '{id}' in config"
                )));
            }

            if let ServerConfig::Remote { url, .. } = server {
                let parsed = Url::parse(url)
                    .map_err(|e| HubError::config(format!("server '{id}': invalid URL: {e}")))?;
                validate_remote_url(&parsed, self.security.require_https)
                    .map_err(|e| HubError::config(format!("server '{id}': {e}")))?;

                if !self.security.allow_net.is_empty() {
                    let host = parsed.host_str().unwrap_or_default();
                    if !self.security.allow_net.iter().any(|allowed| allowed == host) {
                        return Err(HubError::security_policy(format!(
                            "server '{id}': host '{host}' is not in allowNet"
                        )));
                    }
                }
            }
        }

        if !(0.0..=1.0).contains(&self.rollover.error_rate_threshold) {
            return Err(HubError::config(format!(
                "errorRateThreshold {} outside [0, 1]",
                self.rollover.error_rate_threshold
            )));
        }
        if self.generation.max_generations == 0 {
            return Err(HubError::config("maxGenerations must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_expand_plain_var() {
        let lookup = |name: &str| (name == "TOKEN").then(|| "abc".to_string());
        assert_eq!(
            expand_env_str("Bearer ${TOKEN}", &lookup).unwrap(),
            "Bearer abc"
        );
        assert_eq!(
            expand_env_str("Bearer ${env:TOKEN}", &lookup).unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn test_expand_default_and_required() {
        assert_eq!(
            expand_env_str("${MISSING:-fallback}", &no_env).unwrap(),
            "fallback"
        );
        assert_eq!(expand_env_str("${MISSING}", &no_env).unwrap(), "");

        let err = expand_env_str("${MISSING:?set me}", &no_env).unwrap_err();
        assert!(err.message.contains("set me"));
    }

    #[test]
    fn test_expand_multiple_and_unterminated() {
        let lookup = |name: &str| Some(name.to_lowercase());
        assert_eq!(
            expand_env_str("${A}-${B}", &lookup).unwrap(),
            "a-b"
        );
        assert!(expand_env_str("${A", &no_env).is_err());
    }

    #[test]
    fn test_minimal_config_parses() {
        let config = HubConfig::from_json_with_lookup(r#"{"version": 1}"#, &no_env).unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.session.ttl_seconds, 3600);
        assert_eq!(config.rollover.error_rate_threshold, 0.1);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let err = HubConfig::from_json_with_lookup(r#"{"version": 2}"#, &no_env).unwrap_err();
        assert!(err.message.contains("version"));
    }

    #[test]
    fn test_server_variants_parse() {
        let raw = r#"{
            "version": 1,
            "servers": [
                {"type": "local", "id": "fs", "command": "mcp-fs", "args": ["--root", "/tmp"]},
                {"type": "npx", "id": "pkg", "package": "@example/server", "version": "1.0.0"},
                {"type": "remote", "id": "api", "url": "https://example.com/mcp",
                 "auth": {"type": "bearer", "token": "${API_TOKEN:-dev}"}}
            ]
        }"#;
        let config = HubConfig::from_json_with_lookup(raw, &no_env).unwrap();
        assert_eq!(config.servers.len(), 3);

        match &config.servers[2] {
            ServerConfig::Remote { auth, .. } => match auth {
                Some(AuthConfig::Bearer { token }) => assert_eq!(token, "dev"),
                other => panic!("unexpected auth: {other:?}"),
            },
            other => panic!("unexpected server: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let raw = r#"{
            "version": 1,
            "servers": [
                {"type": "local", "id": "a", "command": "x"},
                {"type": "local", "id": "a", "command": "y"}
            ]
        }"#;
        let err = HubConfig::from_json_with_lookup(raw, &no_env).unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_https_required_in_production_profile() {
        let raw = r#"{
            "version": 1,
            "security": {"requireHttps": true},
            "servers": [{"type": "remote", "id": "api", "url": "http://example.com/mcp"}]
        }"#;
        assert!(HubConfig::from_json_with_lookup(raw, &no_env).is_err());
    }

    #[test]
    fn test_allow_net_enforced() {
        let raw = r#"{
            "version": 1,
            "security": {"allowNet": ["allowed.example.com"]},
            "servers": [{"type": "remote", "id": "api", "url": "https://other.example.com/mcp"}]
        }"#;
        let err = HubConfig::from_json_with_lookup(raw, &no_env).unwrap_err();
        assert_eq!(err.kind, mcphub_core::ErrorKind::SecurityPolicy);
    }

    #[test]
    fn test_invalid_server_id_rejected() {
        let raw = r#"{
            "version": 1,
            "servers": [{"type": "local", "id": "bad id!", "command": "x"}]
        }"#;
        assert!(HubConfig::from_json_with_lookup(raw, &no_env).is_err());
    }

    #[test]
    fn test_error_rate_threshold_bounds() {
        let raw = r#"{"version": 1, "rollover": {"errorRateThreshold": 1.5}}"#;
        assert!(HubConfig::from_json_with_lookup(raw, &no_env).is_err());
    }
}
