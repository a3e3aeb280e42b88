//! In-memory scripted transport for tests.
//!
//! Behaves like a connected upstream: requests sent through it are answered
//! by per-method scripts, optionally after a delay and preceded by
//! notifications. Used by the client and hub test suites; not part of the
//! production surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::{
    Transport, TransportCapabilities, TransportError, TransportMessage, TransportMetrics,
    TransportResult, TransportState, TransportType,
};
use mcphub_core::MessageId;

/// A JSON-RPC request as seen by the scripted transport
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SeenRequest {
    /// Method name
    pub method: String,
    /// Raw params
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    /// Request id (absent for notifications)
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

/// Reply produced by a method script
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    /// Result payload for a success response
    pub result: Option<serde_json::Value>,
    /// Error triple for an error response
    pub error: Option<(i32, String)>,
    /// Notifications emitted before the response
    pub notifications: Vec<(String, serde_json::Value)>,
    /// Delay before the response is delivered
    pub delay: Option<Duration>,
}

impl ScriptedReply {
    /// A success reply with the given result
    #[must_use]
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    /// An error reply
    #[must_use]
    pub fn err(code: i32, message: impl Into<String>) -> Self {
        Self {
            error: Some((code, message.into())),
            ..Default::default()
        }
    }

    /// Add a delay before the response
    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Script = Arc<dyn Fn(&SeenRequest) -> ScriptedReply + Send + Sync>;

#[derive(Default)]
struct ScriptTable {
    by_method: HashMap<String, Script>,
}

/// Scripted in-memory transport
pub struct ScriptedTransport {
    scripts: Arc<Mutex<ScriptTable>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    capabilities: TransportCapabilities,
    state: Arc<Mutex<TransportState>>,
    incoming_tx: mpsc::UnboundedSender<TransportMessage>,
    incoming_rx: mpsc::UnboundedReceiver<TransportMessage>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("seen", &self.seen.lock().len())
            .finish()
    }
}

impl ScriptedTransport {
    /// Create a transport with no scripts; unknown methods get
    /// `method not found`
    #[must_use]
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            scripts: Arc::new(Mutex::new(ScriptTable::default())),
            seen: Arc::new(Mutex::new(Vec::new())),
            capabilities: TransportCapabilities {
                supports_notifications: true,
                ..Default::default()
            },
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            incoming_tx,
            incoming_rx,
        }
    }

    /// Script a method with a closure
    pub fn script(
        &self,
        method: impl Into<String>,
        reply: impl Fn(&SeenRequest) -> ScriptedReply + Send + Sync + 'static,
    ) {
        self.scripts
            .lock()
            .by_method
            .insert(method.into(), Arc::new(reply));
    }

    /// Script a method with a fixed success result
    pub fn respond_ok(&self, method: impl Into<String>, result: serde_json::Value) {
        self.script(method, move |_| ScriptedReply::ok(result.clone()));
    }

    /// Script a method with a fixed error
    pub fn respond_err(&self, method: impl Into<String>, code: i32, message: impl Into<String>) {
        let message = message.into();
        self.script(method, move |_| ScriptedReply::err(code, message.clone()));
    }

    /// Script a standard `initialize` exchange that accepts `version`
    pub fn accept_initialize(&self, version: &str, server_name: &str) {
        let version = version.to_string();
        let server_name = server_name.to_string();
        self.script("initialize", move |request| {
            let requested = request
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if requested == version {
                ScriptedReply::ok(serde_json::json!({
                    "protocolVersion": version,
                    "capabilities": {
                        "tools": {"listChanged": true},
                        "resources": {"listChanged": true},
                        "prompts": {"listChanged": true}
                    },
                    "serverInfo": {"name": server_name, "version": "1.0.0"}
                }))
            } else {
                ScriptedReply::err(-32602, format!("unknown version {requested}"))
            }
        });
    }

    /// Requests the transport has seen, in order
    #[must_use]
    pub fn seen_requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }

    /// Shared handle onto the request log, usable after the transport is
    /// moved into a client
    #[must_use]
    pub fn request_log(&self) -> Arc<Mutex<Vec<SeenRequest>>> {
        Arc::clone(&self.seen)
    }

    /// Inject a server-initiated notification
    pub fn push_notification(&self, method: &str, params: serde_json::Value) {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let _ = self.incoming_tx.send(TransportMessage::new(
            MessageId::from(Uuid::new_v4().to_string()),
            Bytes::from(body.to_string()),
        ));
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::ChildProcess
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    async fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&mut self) -> TransportResult<()> {
        *self.state.lock() = TransportState::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        *self.state.lock() = TransportState::Disconnected;
        Ok(())
    }

    async fn send(&mut self, message: TransportMessage) -> TransportResult<()> {
        let request: SeenRequest = serde_json::from_slice(&message.payload)
            .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
        self.seen.lock().push(request.clone());

        // Notifications receive no response.
        let Some(id) = request.id.clone() else {
            return Ok(());
        };

        let script = self.scripts.lock().by_method.get(&request.method).cloned();
        let reply = match script {
            Some(script) => script(&request),
            None => ScriptedReply::err(-32601, "Method not found"),
        };

        let tx = self.incoming_tx.clone();
        tokio::spawn(async move {
            for (method, params) in &reply.notifications {
                let body = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": method,
                    "params": params,
                });
                let _ = tx.send(TransportMessage::new(
                    MessageId::from(Uuid::new_v4().to_string()),
                    Bytes::from(body.to_string()),
                ));
            }

            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }

            let body = if let Some((code, message)) = reply.error {
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "error": {"code": code, "message": message},
                    "id": id,
                })
            } else {
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "result": reply.result.unwrap_or(serde_json::json!({})),
                    "id": id,
                })
            };
            let _ = tx.send(TransportMessage::new(
                MessageId::from(Uuid::new_v4().to_string()),
                Bytes::from(body.to_string()),
            ));
        });

        Ok(())
    }

    async fn receive(&mut self) -> TransportResult<Option<TransportMessage>> {
        Ok(self.incoming_rx.recv().await)
    }

    async fn metrics(&self) -> TransportMetrics {
        TransportMetrics::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_roundtrip() {
        let mut transport = ScriptedTransport::new();
        transport.connect().await.unwrap();
        transport.respond_ok("ping", serde_json::json!({}));

        let request = serde_json::json!({
            "jsonrpc": "2.0", "method": "ping", "id": 1
        });
        transport
            .send(TransportMessage::new(
                MessageId::from("m1"),
                Bytes::from(request.to_string()),
            ))
            .await
            .unwrap();

        let response = transport.receive().await.unwrap().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(body["result"], serde_json::json!({}));
        assert_eq!(body["id"], 1);
        assert_eq!(transport.seen_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_found() {
        let mut transport = ScriptedTransport::new();
        transport.connect().await.unwrap();

        let request = serde_json::json!({
            "jsonrpc": "2.0", "method": "nope", "id": 2
        });
        transport
            .send(TransportMessage::new(
                MessageId::from("m1"),
                Bytes::from(request.to_string()),
            ))
            .await
            .unwrap();

        let response = transport.receive().await.unwrap().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(body["error"]["code"], -32601);
    }
}
