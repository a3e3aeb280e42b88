//! Server-Sent Events transport.
//!
//! Opens a long-lived GET with `Accept: text/event-stream` and posts
//! requests on a companion endpoint announced by the server's `endpoint`
//! event. The reader reconnects with exponential backoff and resumes from
//! the last seen event id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::backoff::ReconnectPolicy;
use crate::core::{
    headers, AuthConfig, HeaderMap, Transport, TransportCapabilities, TransportError,
    TransportEvent, TransportEventEmitter, TransportMessage, TransportMetrics, TransportResult,
    TransportState, TransportType,
};
use mcphub_core::MessageId;

/// One parsed SSE frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name (`message` when absent)
    pub event: Option<String>,
    /// Concatenated data lines
    pub data: String,
    /// Event id for resumability
    pub id: Option<String>,
}

/// Incremental SSE wire parser.
///
/// Fed raw byte chunks; yields complete frames at each blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning all frames completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.finish_frame() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // comment / keep-alive
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data_lines.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                // "retry" and unknown fields are ignored
                _ => {}
            }
        }

        frames
    }

    fn finish_frame(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() && self.event.is_none() {
            self.id = None;
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
            id: self.id.take(),
        };
        self.data_lines.clear();
        Some(frame)
    }
}

/// SSE transport configuration
#[derive(Debug, Clone)]
pub struct SseTransportConfig {
    /// Event-stream URL
    pub url: String,
    /// Custom headers
    pub headers: HeaderMap,
    /// Authentication
    pub auth: Option<AuthConfig>,
    /// Request timeout for companion POSTs
    pub timeout: Duration,
    /// Reconnect policy for the event stream
    pub reconnect: ReconnectPolicy,
}

impl Default for SseTransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HeaderMap::new(),
            auth: None,
            timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// SSE client transport
#[derive(Debug)]
pub struct SseTransport {
    config: SseTransportConfig,
    http: reqwest::Client,
    state: Arc<Mutex<TransportState>>,
    capabilities: TransportCapabilities,
    metrics: Arc<Mutex<TransportMetrics>>,
    event_emitter: TransportEventEmitter,

    /// Companion POST endpoint announced by the server
    post_url: Arc<Mutex<Option<Url>>>,
    post_url_ready: Arc<Notify>,

    incoming_rx: Option<mpsc::Receiver<TransportMessage>>,
    cancel: CancellationToken,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl SseTransport {
    /// Create a new SSE transport
    #[must_use]
    pub fn new(config: SseTransportConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();

        Self {
            config,
            http,
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            capabilities: TransportCapabilities {
                supports_streaming: true,
                supports_notifications: true,
                ..Default::default()
            },
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            event_emitter: TransportEventEmitter::default(),
            post_url: Arc::new(Mutex::new(None)),
            post_url_ready: Arc::new(Notify::new()),
            incoming_rx: None,
            cancel: CancellationToken::new(),
            reader_task: None,
        }
    }

    /// Attach an event emitter so lifecycle events reach the supervisor
    #[must_use]
    pub fn with_event_emitter(mut self, emitter: TransportEventEmitter) -> Self {
        self.event_emitter = emitter;
        self
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(ref auth) = self.config.auth {
            request = request.header("Authorization", auth.header_value());
        }
        request
    }

    async fn resolve_post_url(&self) -> TransportResult<Url> {
        if let Some(url) = self.post_url.lock().clone() {
            return Ok(url);
        }
        // Wait briefly for the endpoint event from a fresh stream. The URL
        // may land between the check above and the wait, so re-check after
        // a timeout before failing.
        let waited = tokio::time::timeout(self.config.timeout, self.post_url_ready.notified());
        let timed_out = waited.await.is_err();
        match self.post_url.lock().clone() {
            Some(url) => Ok(url),
            None if timed_out => Err(TransportError::ConnectionFailed(
                "no endpoint event received from SSE server".to_string(),
            )),
            None => Err(TransportError::ConnectionFailed(
                "endpoint event carried no URL".to_string(),
            )),
        }
    }
}

struct ReaderContext {
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    auth: Option<AuthConfig>,
    reconnect: ReconnectPolicy,
    state: Arc<Mutex<TransportState>>,
    metrics: Arc<Mutex<TransportMetrics>>,
    event_emitter: TransportEventEmitter,
    post_url: Arc<Mutex<Option<Url>>>,
    post_url_ready: Arc<Notify>,
    incoming_tx: mpsc::Sender<TransportMessage>,
    cancel: CancellationToken,
}

impl ReaderContext {
    async fn run(self) {
        use futures::StreamExt as _;

        let started_at = Instant::now();
        let mut attempt: u32 = 0;
        let mut last_event_id: Option<String> = None;
        let mut connected_once = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if attempt > 0 {
                let Some(delay) = self.reconnect.delay_with_jitter(attempt) else {
                    self.fail("reconnect attempts exhausted").await;
                    return;
                };
                if self.reconnect.duration_exhausted(started_at) {
                    self.fail("reconnect duration exhausted").await;
                    return;
                }
                self.metrics.lock().reconnects += 1;
                debug!(attempt, ?delay, "sse reconnect backoff");
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;

            let mut request = self
                .http
                .get(self.url.clone())
                .header("Accept", "text/event-stream");
            for (key, value) in &self.headers {
                request = request.header(key, value);
            }
            if let Some(ref auth) = self.auth {
                request = request.header("Authorization", auth.header_value());
            }
            if let Some(ref id) = last_event_id {
                request = request.header(headers::LAST_EVENT_ID, id.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "sse stream connect failed");
                    continue;
                }
            };

            let status = response.status();
            if matches!(status.as_u16(), 401 | 403 | 404) {
                self.fail(&format!("HTTP {status}: not retryable")).await;
                return;
            }
            if !status.is_success() {
                warn!(%status, "sse stream rejected");
                continue;
            }

            info!(url = %self.url, "sse stream established");
            *self.state.lock() = TransportState::Connected;
            if !connected_once {
                connected_once = true;
                self.event_emitter.emit(TransportEvent::Connected {
                    transport_type: TransportType::Sse,
                    endpoint: self.url.to_string(),
                });
            }
            attempt = 0;

            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        self.metrics.lock().bytes_received += bytes.len() as u64;
                        for frame in parser.feed(&bytes) {
                            if let Some(id) = frame.id.clone() {
                                last_event_id = Some(id);
                            }
                            self.dispatch(frame).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "sse stream error");
                        break;
                    }
                    None => {
                        debug!("sse stream ended");
                        break;
                    }
                }
            }
            *self.state.lock() = TransportState::Connecting;
        }
    }

    async fn dispatch(&self, frame: SseFrame) {
        match frame.event.as_deref() {
            Some("endpoint") => {
                match self.url.join(frame.data.trim()) {
                    Ok(url) => {
                        debug!(endpoint = %url, "sse companion endpoint announced");
                        *self.post_url.lock() = Some(url);
                        self.post_url_ready.notify_waiters();
                    }
                    Err(e) => warn!(error = %e, "invalid endpoint event payload"),
                }
            }
            None | Some("message") => {
                if frame.data.is_empty() {
                    return;
                }
                self.metrics.lock().messages_received += 1;
                let message = TransportMessage::new(
                    MessageId::from(Uuid::new_v4().to_string()),
                    Bytes::from(frame.data),
                );
                if self.incoming_tx.send(message).await.is_err() {
                    debug!("sse receiver dropped");
                }
            }
            Some(other) => debug!(event = other, "ignoring sse event"),
        }
    }

    async fn fail(&self, reason: &str) {
        warn!(reason, "sse transport failed");
        *self.state.lock() = TransportState::Failed {
            reason: reason.to_string(),
        };
        self.event_emitter.emit(TransportEvent::Crashed {
            transport_type: TransportType::Sse,
            endpoint: self.url.to_string(),
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Sse
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    async fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&mut self) -> TransportResult<()> {
        if matches!(*self.state.lock(), TransportState::Connected) {
            return Ok(());
        }

        let url = Url::parse(&self.config.url)
            .map_err(|e| TransportError::ConfigurationError(format!("invalid URL: {e}")))?;

        *self.state.lock() = TransportState::Connecting;
        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        self.incoming_rx = Some(incoming_rx);
        self.cancel = CancellationToken::new();

        let reader = ReaderContext {
            http: self.http.clone(),
            url,
            headers: self.config.headers.clone(),
            auth: self.config.auth.clone(),
            reconnect: self.config.reconnect.clone(),
            state: Arc::clone(&self.state),
            metrics: Arc::clone(&self.metrics),
            event_emitter: self.event_emitter.clone(),
            post_url: Arc::clone(&self.post_url),
            post_url_ready: Arc::clone(&self.post_url_ready),
            incoming_tx,
            cancel: self.cancel.clone(),
        };
        self.reader_task = Some(tokio::spawn(reader.run()));
        Ok(())
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        *self.state.lock() = TransportState::Disconnecting;
        self.cancel.cancel();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.incoming_rx = None;
        *self.state.lock() = TransportState::Disconnected;
        self.event_emitter.emit(TransportEvent::Disconnected {
            transport_type: TransportType::Sse,
            endpoint: self.config.url.clone(),
            reason: Some("disconnect requested".to_string()),
        });
        Ok(())
    }

    async fn send(&mut self, message: TransportMessage) -> TransportResult<()> {
        let post_url = self.resolve_post_url().await?;

        let request = self
            .http
            .post(post_url)
            .header("Content-Type", "application/json")
            .body(message.payload.clone());
        let request = self.apply_headers(request);

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(format!("POST failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::SendFailed(format!(
                "HTTP {status}: {body}"
            )));
        }

        let mut metrics = self.metrics.lock();
        metrics.messages_sent += 1;
        metrics.bytes_sent += message.payload.len() as u64;
        Ok(())
    }

    async fn receive(&mut self) -> TransportResult<Option<TransportMessage>> {
        let message = match self.incoming_rx.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => return Ok(None),
        };
        match message {
            Some(message) => Ok(Some(message)),
            None => {
                let state = self.state.lock().clone();
                match state {
                    TransportState::Failed { reason } => {
                        Err(TransportError::ConnectionLost(reason))
                    }
                    _ => Ok(None),
                }
            }
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
    fn test_parser_single_frame() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: {\"x\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"x\":1}");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn test_parser_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: hel").is_empty());
        assert!(parser.feed(b"lo\n").is_empty());
        let frames = parser.feed(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn test_parser_event_and_id() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"event: endpoint\nid: 7\ndata: /messages\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("endpoint"));
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(frames[0].data, "/messages");
    }

    #[test]
    fn test_parser_multiline_data_and_comments() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b": keep-alive\ndata: line1\ndata: line2\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn test_parser_crlf() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: x\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn test_parser_blank_line_without_data() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"\n\n\n").is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let mut transport = SseTransport::new(SseTransportConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::ConfigurationError(_))
        ));
    }
}
