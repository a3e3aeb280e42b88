//! Core transport traits and types.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use mcphub_core::MessageId;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Retry/reconnect budget exhausted
    #[error("Reconnect budget exhausted: {0}")]
    ReconnectExhausted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether a fresh attempt against the same endpoint may succeed.
    ///
    /// Authentication failures, configuration errors and exhausted budgets
    /// are terminal.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionLost(_)
                | Self::SendFailed(_)
                | Self::ReceiveFailed(_)
                | Self::Timeout
                | Self::Io(_)
        )
    }
}

/// Transport types the hub connects upstream with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    /// Child process over stdio
    ChildProcess,
    /// Streamable HTTP
    Http,
    /// Server-Sent Events
    Sse,
}

/// Transport state information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Transport is disconnected
    Disconnected,
    /// Transport is connecting
    Connecting,
    /// Transport is connected and ready
    Connected,
    /// Transport is disconnecting
    Disconnecting,
    /// Transport has failed
    Failed {
        /// Failure reason description
        reason: String,
    },
}

/// Transport capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Maximum message size supported
    pub max_message_size: Option<usize>,
    /// Whether streamed responses are supported
    pub supports_streaming: bool,
    /// Whether server-initiated messages can arrive
    pub supports_notifications: bool,
    /// Whether a session id header is honoured
    pub supports_session_id: bool,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            max_message_size: Some(mcphub_core::MAX_MESSAGE_SIZE),
            supports_streaming: false,
            supports_notifications: true,
            supports_session_id: false,
        }
    }
}

/// Transport message wrapper
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// Message ID
    pub id: MessageId,
    /// Message payload (one JSON-RPC document)
    pub payload: Bytes,
}

impl TransportMessage {
    /// Create a new transport message
    pub fn new(id: MessageId, payload: Bytes) -> Self {
        Self { id, payload }
    }

    /// Get message size
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Transport metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportMetrics {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
    /// Failed connection attempts
    pub failed_connections: u64,
    /// Reconnect attempts performed
    pub reconnects: u64,
}

/// Transport events
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established
    Connected {
        /// Transport type that connected
        transport_type: TransportType,
        /// Connection endpoint
        endpoint: String,
    },
    /// Connection ended
    Disconnected {
        /// Transport type that disconnected
        transport_type: TransportType,
        /// Connection endpoint
        endpoint: String,
        /// Optional disconnect reason
        reason: Option<String>,
    },
    /// The peer process or stream terminated unexpectedly
    Crashed {
        /// Transport type that crashed
        transport_type: TransportType,
        /// Connection endpoint
        endpoint: String,
        /// Crash description
        reason: String,
    },
    /// Error occurred
    Error {
        /// Transport error that occurred
        error: TransportError,
        /// Additional error context
        context: Option<String>,
    },
}

/// Transport event emitter
#[derive(Debug, Clone)]
pub struct TransportEventEmitter {
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventEmitter {
    /// Create a new event emitter together with its receiver
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Emit an event
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for TransportEventEmitter {
    fn default() -> Self {
        Self::new().0
    }
}

/// Core transport trait.
///
/// `receive` awaits the next inbound message and resolves to `Ok(None)` when
/// the peer has closed cleanly.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Get transport type
    fn transport_type(&self) -> TransportType;

    /// Get transport capabilities
    fn capabilities(&self) -> &TransportCapabilities;

    /// Get current state
    async fn state(&self) -> TransportState;

    /// Connect to the transport endpoint
    async fn connect(&mut self) -> TransportResult<()>;

    /// Disconnect from the transport
    async fn disconnect(&mut self) -> TransportResult<()>;

    /// Send a message
    async fn send(&mut self, message: TransportMessage) -> TransportResult<()>;

    /// Await the next inbound message
    async fn receive(&mut self) -> TransportResult<Option<TransportMessage>>;

    /// Get transport metrics
    async fn metrics(&self) -> TransportMetrics;

    /// Check if transport is connected
    async fn is_connected(&self) -> bool {
        matches!(self.state().await, TransportState::Connected)
    }

    /// Get endpoint information
    fn endpoint(&self) -> Option<String> {
        None
    }
}

/// Timeout set applied around transport operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportTimeouts {
    /// Process spawn / TCP connect deadline
    pub connect: Duration,
    /// Initialize handshake deadline
    pub init_handshake: Duration,
    /// Per-probe health check deadline
    pub health_check: Duration,
    /// Single tool call deadline
    pub tool_call: Duration,
    /// Total budget across retries
    pub max_total: Option<Duration>,
    /// Whether progress notifications reset the tool-call deadline
    pub reset_timeout_on_progress: bool,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            init_handshake: Duration::from_secs(30),
            health_check: Duration::from_secs(5),
            tool_call: Duration::from_secs(60),
            max_total: None,
            reset_timeout_on_progress: false,
        }
    }
}

/// Authentication configuration for remote transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Bearer token in the `Authorization` header
    Bearer {
        /// The token value
        token: String,
    },
    /// Basic authentication
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },
}

impl AuthConfig {
    /// Render the `Authorization` header value
    #[must_use]
    pub fn header_value(&self) -> String {
        match self {
            Self::Bearer { token } => format!("Bearer {token}"),
            Self::Basic { username, password } => {
                use base64::Engine as _;
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                format!("Basic {encoded}")
            }
        }
    }
}

/// Shared HTTP header names
pub mod headers {
    /// Session correlation header
    pub const MCP_SESSION_ID: &str = "Mcp-Session-Id";
    /// Protocol version header
    pub const MCP_PROTOCOL_VERSION: &str = "MCP-Protocol-Version";
    /// SSE resumability header
    pub const LAST_EVENT_ID: &str = "Last-Event-ID";
}

/// Custom header map carried in remote specs
pub type HeaderMap = HashMap<String, String>;

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChildProcess => write!(f, "child_process"),
            Self::Http => write!(f, "http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
