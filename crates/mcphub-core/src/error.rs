//! Hub error taxonomy with context preservation and safe redaction hooks.
//!
//! Every failure inside the hub is classified into a closed set of kinds at
//! the site of occurrence. Errors carry a severity, a recoverability flag and
//! an open context map so that routing, retry and logging layers can act on
//! them without string matching.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Closed error classification for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Configuration is missing, malformed or invalid
    Config,

    /// Network or transport failure
    Transport,

    /// Protocol violation or failed negotiation
    Protocol,

    /// An upstream tool invocation failed
    ToolInvocation,

    /// Requested resource does not exist
    ResourceNotFound,

    /// The target upstream server is not connected
    ServerNotConnected,

    /// Operation exceeded its deadline
    Timeout,

    /// Session missing, expired or rejected
    Session,

    /// The negotiated protocol does not support the requested feature
    UnsupportedFeature,

    /// A security policy denied the operation
    SecurityPolicy,

    /// Stored data failed an integrity check
    Integrity,

    /// Internal invariant violation
    Internal,

    /// Unclassifiable failure
    Unknown,
}

/// Error severity for alerting and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected operational noise
    Low,
    /// Degraded but self-healing
    Medium,
    /// Requires attention
    High,
    /// Service-threatening
    Critical,
}

/// Hub error with classification and contextual metadata
#[derive(Debug)]
pub struct HubError {
    /// Unique identifier for this error instance
    pub id: Uuid,

    /// Error classification
    pub kind: ErrorKind,

    /// Human-readable error message
    pub message: String,

    /// Whether retrying the operation may succeed
    pub recoverable: bool,

    /// Error severity
    pub severity: Severity,

    /// Additional contextual information
    pub context: HashMap<String, serde_json::Value>,

    /// Optional source error that caused this error
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HubError {
    /// Create a new error with the specified kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            recoverable: kind.default_recoverable(),
            severity: kind.default_severity(),
            context: HashMap::new(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Create a tool invocation error
    pub fn tool_invocation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolInvocation, message)
    }

    /// Create a resource-not-found error
    pub fn resource_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceNotFound, message)
    }

    /// Create a server-not-connected error
    pub fn server_not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerNotConnected, message)
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Session, message)
    }

    /// Create an unsupported-feature error
    pub fn unsupported_feature(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFeature, message)
    }

    /// Create a security policy error
    pub fn security_policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SecurityPolicy, message)
    }

    /// Create an integrity error
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Create an unknown error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Add a context entry
    #[must_use]
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Override the severity
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Override the recoverability flag
    #[must_use]
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Chain a source error
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Classify a foreign error by inspecting its message.
    ///
    /// Falls through to `Internal` for anything that is a `std::error::Error`
    /// but matches no keyword; use [`HubError::unknown`] for non-error causes.
    pub fn classify(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let message = source.to_string();
        let lowered = message.to_lowercase();
        let kind = if lowered.contains("timeout") || lowered.contains("timed out") {
            ErrorKind::Timeout
        } else if lowered.contains("connection")
            || lowered.contains("transport")
            || lowered.contains("network")
            || lowered.contains("broken pipe")
        {
            ErrorKind::Transport
        } else if lowered.contains("config") {
            ErrorKind::Config
        } else {
            ErrorKind::Internal
        };
        Self::new(kind, message).with_source(source)
    }

    /// Check if this error is retryable based on its kind
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::ServerNotConnected
        ) && self.recoverable
    }

    /// Convert to a JSON-RPC error code
    pub const fn jsonrpc_error_code(&self) -> i32 {
        match self.kind {
            ErrorKind::Protocol => -32600,           // Invalid Request
            ErrorKind::ResourceNotFound => -32002,   // Custom: Not found
            ErrorKind::ServerNotConnected => -32003, // Custom: Upstream unavailable
            ErrorKind::Timeout => -32004,            // Custom: Timeout
            ErrorKind::Session => -32005,            // Custom: Session
            ErrorKind::UnsupportedFeature => -32601, // Method not found
            ErrorKind::SecurityPolicy => -32006,     // Custom: Denied
            ErrorKind::Config => -32007,             // Custom: Configuration
            ErrorKind::Integrity => -32008,          // Custom: Integrity
            ErrorKind::ToolInvocation => -32009,     // Custom: Tool failure
            ErrorKind::Transport => -32010,          // Custom: Transport
            ErrorKind::Internal | ErrorKind::Unknown => -32603, // Internal error
        }
    }

    /// Message safe to surface to untrusted downstream clients.
    ///
    /// Internal and unknown errors never leak their cause.
    pub fn public_message(&self) -> &str {
        match self.kind {
            ErrorKind::Internal | ErrorKind::Unknown => "internal error",
            _ => &self.message,
        }
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(component) = self.context.get("component").and_then(|v| v.as_str()) {
            write!(f, " (component: {component})")?;
        }
        Ok(())
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl ErrorKind {
    /// Stable identifier used in logs and wire error bodies
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::ToolInvocation => "tool-invocation",
            Self::ResourceNotFound => "resource-not-found",
            Self::ServerNotConnected => "server-not-connected",
            Self::Timeout => "timeout",
            Self::Session => "session",
            Self::UnsupportedFeature => "unsupported-feature",
            Self::SecurityPolicy => "security-policy",
            Self::Integrity => "integrity",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }

    const fn default_recoverable(self) -> bool {
        matches!(
            self,
            Self::Transport | Self::Timeout | Self::ServerNotConnected
        )
    }

    const fn default_severity(self) -> Severity {
        match self {
            Self::Timeout | Self::ResourceNotFound | Self::Session => Severity::Low,
            Self::Transport | Self::ServerNotConnected | Self::ToolInvocation => Severity::Medium,
            Self::Config | Self::Protocol | Self::UnsupportedFeature | Self::Unknown => {
                Severity::High
            }
            Self::SecurityPolicy | Self::Integrity | Self::Internal => Severity::Critical,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(format!("JSON error: {err}"))
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(format!("IO error: {err}"))
    }
}

/// Extension trait for attaching hub classification to foreign results
pub trait ErrorExt<T> {
    /// Convert any error to a hub error with the specified kind
    fn hub_err(self, kind: ErrorKind, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn hub_err(self, kind: ErrorKind, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| HubError::new(kind, format!("{}: {e}", message.into())).with_source(e))
    }
}
