//! Protocol version handling and feature detection.
//!
//! MCP versions are calendar dates. The hub tries the versions in
//! [`SUPPORTED_PROTOCOLS`] order when negotiating with an upstream and
//! derives a feature map from the accepted version plus the server's
//! capability advertisement.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::types::ServerCapabilities;

/// Protocol versions the hub speaks, highest preference first
pub const SUPPORTED_PROTOCOLS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// The most recent protocol version the hub speaks
pub const LATEST_PROTOCOL: &str = SUPPORTED_PROTOCOLS[0];

/// Date-based protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    /// Year component
    pub year: u16,
    /// Month component
    pub month: u8,
    /// Day component
    pub day: u8,
}

/// Version parsing errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VersionError {
    /// Input is not `YYYY-MM-DD`
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),
    /// Month outside 1..=12
    #[error("Invalid month: {0} (must be 1-12)")]
    InvalidMonth(u8),
    /// Day outside 1..=31
    #[error("Invalid day: {0} (must be 1-31)")]
    InvalidDay(u8),
}

impl ProtocolVersion {
    /// Create a new version
    pub fn new(year: u16, month: u8, day: u8) -> Result<Self, VersionError> {
        if !(1..=12).contains(&month) {
            return Err(VersionError::InvalidMonth(month));
        }
        if !(1..=31).contains(&day) {
            return Err(VersionError::InvalidDay(day));
        }
        Ok(Self { year, month, day })
    }

    /// The hub's preferred (latest) version
    #[must_use]
    pub fn latest() -> Self {
        LATEST_PROTOCOL.parse().expect("latest protocol constant")
    }

    /// All versions the hub supports, highest preference first
    #[must_use]
    pub fn supported() -> Vec<Self> {
        SUPPORTED_PROTOCOLS
            .iter()
            .map(|s| s.parse().expect("supported protocol constant"))
            .collect()
    }

    /// Whether `raw` names a version the hub supports
    #[must_use]
    pub fn is_supported(raw: &str) -> bool {
        SUPPORTED_PROTOCOLS.contains(&raw)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 3 {
            return Err(VersionError::InvalidFormat(s.to_string()));
        }

        let year = parts[0]
            .parse::<u16>()
            .map_err(|_| VersionError::InvalidFormat(s.to_string()))?;
        let month = parts[1]
            .parse::<u8>()
            .map_err(|_| VersionError::InvalidFormat(s.to_string()))?;
        let day = parts[2]
            .parse::<u8>()
            .map_err(|_| VersionError::InvalidFormat(s.to_string()))?;

        Self::new(year, month, day)
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.to_string()
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.month, self.day).cmp(&(other.year, other.month, other.day))
    }
}

/// Features available on a negotiated upstream connection.
///
/// Derived from the accepted version and the server's capability
/// advertisement; consumers branch on these booleans instead of re-reading
/// raw capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMap {
    /// Server emits list-changed notifications
    pub notifications: bool,
    /// Server exposes resources
    pub resources: bool,
    /// Server exposes prompts
    pub prompts: bool,
    /// Server exposes tools
    pub tools: bool,
    /// Progress notifications are usable on this connection
    pub progress: bool,
    /// Server exposes resource templates
    pub resource_templates: bool,
}

impl FeatureMap {
    /// Derive the feature map from negotiated state
    #[must_use]
    pub fn detect(version: ProtocolVersion, capabilities: &ServerCapabilities) -> Self {
        let tools = capabilities.tools.is_some();
        let resources = capabilities.resources.is_some();
        let prompts = capabilities.prompts.is_some();
        let notifications = capabilities
            .tools
            .as_ref()
            .and_then(|c| c.list_changed)
            .unwrap_or(false)
            || capabilities
                .resources
                .as_ref()
                .and_then(|c| c.list_changed)
                .unwrap_or(false)
            || capabilities
                .prompts
                .as_ref()
                .and_then(|c| c.list_changed)
                .unwrap_or(false);

        // Progress and templates entered the protocol with 2024-11-05; every
        // supported version carries them, so only capabilities gate them.
        let progress = version >= ProtocolVersion::new(2024, 11, 5).expect("static version");

        Self {
            notifications,
            resources,
            prompts,
            tools,
            progress,
            resource_templates: resources,
        }
    }
}
