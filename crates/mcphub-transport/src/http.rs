//! Streamable HTTP client transport.
//!
//! Every request is a POST of one JSON-RPC document. The server answers
//! either with a JSON body or with a short-lived `text/event-stream` whose
//! frames are surfaced as individual inbound messages. A session id issued
//! via the `Mcp-Session-Id` header on any response is echoed on subsequent
//! requests until cleared.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::core::{
    headers, AuthConfig, HeaderMap, Transport, TransportCapabilities, TransportError,
    TransportEvent, TransportEventEmitter, TransportMessage, TransportMetrics, TransportResult,
    TransportState, TransportType,
};
use crate::sse::SseParser;
use mcphub_core::MessageId;

/// Streamable HTTP transport configuration
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Endpoint URL
    pub url: String,
    /// Custom headers
    pub headers: HeaderMap,
    /// Authentication
    pub auth: Option<AuthConfig>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Protocol version advertised in the version header
    pub protocol_version: Option<String>,
    /// Whether to echo a server-issued session id on subsequent requests.
    /// The two-pass connect strategy retries with this disabled when the
    /// server rejects the header.
    pub use_session_id: bool,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HeaderMap::new(),
            auth: None,
            timeout: Duration::from_secs(30),
            protocol_version: None,
            use_session_id: true,
        }
    }
}

/// Streamable HTTP client transport
#[derive(Debug)]
pub struct StreamableHttpTransport {
    config: HttpTransportConfig,
    http: reqwest::Client,
    state: Arc<Mutex<TransportState>>,
    capabilities: TransportCapabilities,
    metrics: Arc<Mutex<TransportMetrics>>,
    event_emitter: TransportEventEmitter,

    /// Session id issued by the server
    session_id: Arc<Mutex<Option<String>>>,

    incoming_tx: mpsc::Sender<TransportMessage>,
    incoming_rx: mpsc::Receiver<TransportMessage>,
}

impl StreamableHttpTransport {
    /// Create a new streamable HTTP transport
    #[must_use]
    pub fn new(config: HttpTransportConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        Self {
            config,
            http,
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            capabilities: TransportCapabilities {
                supports_streaming: true,
                supports_notifications: true,
                supports_session_id: true,
                ..Default::default()
            },
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            event_emitter: TransportEventEmitter::default(),
            session_id: Arc::new(Mutex::new(None)),
            incoming_tx,
            incoming_rx,
        }
    }

    /// Attach an event emitter so lifecycle events reach the supervisor
    #[must_use]
    pub fn with_event_emitter(mut self, emitter: TransportEventEmitter) -> Self {
        self.event_emitter = emitter;
        self
    }

    /// The session id issued by the server, if any
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Forget the current session id
    pub fn clear_session_id(&self) {
        *self.session_id.lock() = None;
    }

    fn build_request(&self, payload: &Bytes) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(self.config.url.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(payload.clone());

        if let Some(ref version) = self.config.protocol_version {
            request = request.header(headers::MCP_PROTOCOL_VERSION, version.clone());
        }
        if self.config.use_session_id {
            if let Some(session) = self.session_id.lock().clone() {
                request = request.header(headers::MCP_SESSION_ID, session);
            }
        }
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(ref auth) = self.config.auth {
            request = request.header("Authorization", auth.header_value());
        }
        request
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(value) = response.headers().get(headers::MCP_SESSION_ID) {
            if let Ok(session) = value.to_str() {
                let mut guard = self.session_id.lock();
                if guard.as_deref() != Some(session) {
                    debug!(session, "captured session id from response header");
                    *guard = Some(session.to_string());
                }
            }
        }
    }

    fn push_payload(&self, data: String) {
        if data.trim().is_empty() {
            return;
        }
        let message = TransportMessage::new(
            MessageId::from(Uuid::new_v4().to_string()),
            Bytes::from(data),
        );
        self.metrics.lock().messages_received += 1;
        // try_send: a slow consumer must not wedge the response task.
        if let Err(e) = self.incoming_tx.try_send(message) {
            warn!(error = %e, "dropping inbound message, receive queue full");
        }
    }
}

/// Extract the HTTP status from an error message formatted by this module.
///
/// The `HTTP <status>` marker may sit anywhere in a wrapped message chain.
#[must_use]
pub fn parse_http_status(message: &str) -> Option<u16> {
    let start = message.find("HTTP ")?;
    let rest = &message[start + "HTTP ".len()..];
    rest.split([':', ' ']).next()?.parse().ok()
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Http
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    async fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&mut self) -> TransportResult<()> {
        Url::parse(&self.config.url)
            .map_err(|e| TransportError::ConfigurationError(format!("invalid URL: {e}")))?;

        // The connection itself is lazy; the first POST establishes it.
        *self.state.lock() = TransportState::Connected;
        self.event_emitter.emit(TransportEvent::Connected {
            transport_type: TransportType::Http,
            endpoint: self.config.url.clone(),
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        *self.state.lock() = TransportState::Disconnected;
        self.event_emitter.emit(TransportEvent::Disconnected {
            transport_type: TransportType::Http,
            endpoint: self.config.url.clone(),
            reason: Some("disconnect requested".to_string()),
        });
        Ok(())
    }

    async fn send(&mut self, message: TransportMessage) -> TransportResult<()> {
        let state = self.state.lock().clone();
        if state != TransportState::Connected {
            return Err(TransportError::SendFailed(format!(
                "Cannot send in state: {state}"
            )));
        }

        let response = self
            .build_request(&message.payload)
            .send()
            .await
            .map_err(|e| {
                self.metrics.lock().failed_connections += 1;
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed(format!("request failed: {e}"))
                }
            })?;

        {
            let mut metrics = self.metrics.lock();
            metrics.messages_sent += 1;
            metrics.bytes_sent += message.payload.len() as u64;
        }

        self.capture_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let description = format!("HTTP {}: {body}", status.as_u16());
            return Err(match status.as_u16() {
                401 | 403 => TransportError::AuthenticationFailed(description),
                _ => TransportError::ConnectionFailed(description),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // Streamed response: frames arrive as individual messages until
            // the server closes the stream.
            use futures::StreamExt as _;
            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk.map_err(|e| {
                    TransportError::ReceiveFailed(format!("response stream error: {e}"))
                })?;
                self.metrics.lock().bytes_received += bytes.len() as u64;
                for frame in parser.feed(&bytes) {
                    self.push_payload(frame.data);
                }
            }
            trace!("response stream completed");
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::ReceiveFailed(format!("body read failed: {e}")))?;
            self.metrics.lock().bytes_received += body.len() as u64;
            self.push_payload(body);
        }

        Ok(())
    }

    async fn receive(&mut self) -> TransportResult<Option<TransportMessage>> {
        match self.incoming_rx.recv().await {
            Some(message) => Ok(Some(message)),
            None => Ok(None),
        }
    }

    async fn metrics(&self) -> TransportMetrics {
        self.metrics.lock().clone()
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.config.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_extraction() {
        assert_eq!(parse_http_status("HTTP 404: not found"), Some(404));
        assert_eq!(parse_http_status("HTTP 500"), Some(500));
        assert_eq!(
            parse_http_status("Connection failed: HTTP 400: unknown field sessionId"),
            Some(400)
        );
        assert_eq!(parse_http_status("connection refused"), None);
    }

    #[tokio::test]
    async fn test_connect_validates_url() {
        let mut transport = StreamableHttpTransport::new(HttpTransportConfig {
            url: "::invalid::".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut transport = StreamableHttpTransport::new(HttpTransportConfig {
            url: "https://example.com/mcp".to_string(),
            ..Default::default()
        });
        let message = TransportMessage::new(MessageId::from("m1"), Bytes::from("{}"));
        assert!(matches!(
            transport.send(message).await,
            Err(TransportError::SendFailed(_))
        ));
    }

    #[test]
    fn test_session_id_lifecycle() {
        let transport = StreamableHttpTransport::new(HttpTransportConfig::default());
        assert!(transport.session_id().is_none());
        *transport.session_id.lock() = Some("sess-1".to_string());
        assert_eq!(transport.session_id().as_deref(), Some("sess-1"));
        transport.clear_session_id();
        assert!(transport.session_id().is_none());
    }

    #[test]
    fn test_capabilities_advertise_streaming() {
        let transport = StreamableHttpTransport::new(HttpTransportConfig::default());
        assert!(transport.capabilities().supports_streaming);
        assert!(transport.capabilities().supports_session_id);
    }
}
