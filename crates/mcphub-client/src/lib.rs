//! # mcphub-client
//!
//! MCP client used by the hub to talk to its upstream servers.
//!
//! A pump task owns the transport: outbound documents travel through a
//! command channel, inbound documents are correlated back to their waiting
//! request by id, and server-initiated notifications are surfaced on a
//! separate channel. The `initialize` handshake walks the supported protocol
//! versions in preference order; all later traffic is adapted between the
//! hub's version and the accepted one.
//!
//! ## Architecture
//!
//! ```text
//! UpstreamClient ── request()/notify() ──▶ pump task ──▶ Transport
//!        ▲                                    │
//!        └── pending map (oneshot per id) ◀───┤
//!        └── notification channel ◀───────────┘
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use mcphub_core::{ErrorKind, HubError, MessageId, Result};
use mcphub_protocol::adapt::{adapt_request, adapt_response};
use mcphub_protocol::jsonrpc::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use mcphub_protocol::types::{self, methods};
use mcphub_protocol::versioning::{FeatureMap, ProtocolVersion};
use mcphub_protocol::{
    CallToolResult, GetPromptResult, Implementation, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt, ProgressToken,
    ReadResourceResult, Resource, ResourceTemplate, ServerCapabilities, Tool,
};
use mcphub_transport::{Transport, TransportMessage, TransportTimeouts};

/// Context key carrying the JSON-RPC error code on RPC failures
pub const RPC_CODE_KEY: &str = "rpc_code";

/// Client configuration
#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    /// Client name sent during initialization
    pub client_name: String,
    /// Client version sent during initialization
    pub client_version: String,
    /// Timeout set applied to operations
    pub timeouts: TransportTimeouts,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            client_name: "mcphub".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            timeouts: TransportTimeouts::default(),
        }
    }
}

/// Negotiated upstream session state
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    /// Accepted protocol version
    pub protocol_version: ProtocolVersion,
    /// Server capability advertisement
    pub capabilities: ServerCapabilities,
    /// Derived feature map
    pub features: FeatureMap,
    /// Server implementation info
    pub server_info: Implementation,
}

/// Outcome of a ping probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    /// Server answered the ping
    Healthy,
    /// Server does not implement ping; treated as healthy
    MethodNotSupported,
}

/// Capabilities discovered from an upstream after initialization
#[derive(Debug, Clone, Default)]
pub struct DiscoveredCapabilities {
    /// Advertised tools
    pub tools: Vec<Tool>,
    /// Advertised resources
    pub resources: Vec<Resource>,
    /// Advertised resource templates
    pub resource_templates: Vec<ResourceTemplate>,
    /// Advertised prompts
    pub prompts: Vec<Prompt>,
}

enum Command {
    Send {
        payload: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send { payload, .. } => f
                .debug_struct("Send")
                .field("bytes", &payload.len())
                .finish(),
            Self::Disconnect => write!(f, "Disconnect"),
        }
    }
}

/// MCP client over one upstream transport
#[derive(Debug)]
pub struct UpstreamClient {
    config: UpstreamClientConfig,
    commands: mpsc::Sender<Command>,
    pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    notifications: Mutex<Option<mpsc::Receiver<JsonRpcNotification>>>,
    negotiated: RwLock<Option<NegotiatedSession>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    closed: CancellationToken,
}

impl UpstreamClient {
    /// Create a client over a connected transport and start its pump task
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, config: UpstreamClientConfig) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (notify_tx, notify_rx) = mpsc::channel(256);
        let pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>> =
            Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();

        let client = Arc::new(Self {
            config,
            commands: command_tx,
            pending: Arc::clone(&pending),
            notifications: Mutex::new(Some(notify_rx)),
            negotiated: RwLock::new(None),
            next_id: AtomicU64::new(1),
            cancel: cancel.clone(),
            closed: closed.clone(),
        });

        tokio::spawn(pump(
            transport, command_rx, pending, notify_tx, cancel, closed,
        ));
        client
    }

    /// Whether the connection pump has terminated
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A token triggered once the connection pump terminates
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// The negotiated session, once `initialize` succeeded
    #[must_use]
    pub fn negotiated(&self) -> Option<NegotiatedSession> {
        self.negotiated.read().clone()
    }

    /// Take the notification receiver (single consumer)
    #[must_use]
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        self.notifications.lock().take()
    }

    /// Perform the multi-version `initialize` handshake.
    ///
    /// Versions are attempted in preference order; a version is accepted only
    /// when the server echoes it back. Exhausting the list surfaces a
    /// protocol error naming every attempted version.
    pub async fn initialize(&self) -> Result<NegotiatedSession> {
        let mut attempted = Vec::new();

        for version in ProtocolVersion::supported() {
            attempted.push(version.to_string());

            let request = types::InitializeRequest {
                protocol_version: version.to_string(),
                capabilities: types::ClientCapabilities::default(),
                client_info: Implementation {
                    name: self.config.client_name.clone(),
                    version: self.config.client_version.clone(),
                    title: None,
                },
            };
            let params = adapt_request(
                methods::INITIALIZE,
                ProtocolVersion::latest(),
                version,
                serde_json::to_value(&request)?,
            );

            let outcome = self
                .request_raw(
                    methods::INITIALIZE,
                    Some(params),
                    self.config.timeouts.init_handshake,
                )
                .await;

            match outcome {
                Ok(result) => {
                    let parsed: InitializeResult = serde_json::from_value(result)?;
                    if parsed.protocol_version == version.to_string() {
                        let features = FeatureMap::detect(version, &parsed.capabilities);
                        let session = NegotiatedSession {
                            protocol_version: version,
                            capabilities: parsed.capabilities,
                            features,
                            server_info: parsed.server_info,
                        };
                        *self.negotiated.write() = Some(session.clone());

                        self.notify(methods::NOTIF_INITIALIZED, None).await?;
                        debug!(version = %version, server = %session.server_info.name, "upstream initialized");
                        return Ok(session);
                    }
                    debug!(
                        offered = %version,
                        echoed = %parsed.protocol_version,
                        "server echoed a different version, trying next"
                    );
                }
                // Only protocol-level rejections justify trying the next
                // version; transport failures surface as-is so callers can
                // classify them.
                Err(e)
                    if matches!(
                        e.kind,
                        ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::ServerNotConnected
                    ) =>
                {
                    return Err(e);
                }
                Err(e) => {
                    debug!(version = %version, error = %e, "initialize attempt rejected");
                }
            }
        }

        Err(HubError::protocol(format!(
            "protocol-negotiation-failed: no supported version accepted (attempted: {})",
            attempted.join(", ")
        )))
    }

    /// Send a request in the hub's protocol version, adapting both ways
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let accepted = self
            .negotiated
            .read()
            .as_ref()
            .map(|s| s.protocol_version)
            .ok_or_else(|| HubError::protocol("client not initialized"))?;

        let latest = ProtocolVersion::latest();
        let params = params.map(|p| adapt_request(method, latest, accepted, p));
        let result = self.request_raw(method, params, timeout).await?;
        Ok(adapt_response(method, accepted, latest, result))
    }

    /// Send a request without version adaptation
    async fn request_raw(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = MessageId::from(format!("{id}"));
        let key = id.as_key();

        let request = JsonRpcRequest::new(method, params, id);
        let payload = Bytes::from(serde_json::to_vec(&request)?);

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.insert(key.clone(), response_tx);

        if let Err(e) = self.send_payload(payload).await {
            self.pending.remove(&key);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                self.pending.remove(&key);
                return Err(HubError::transport(format!(
                    "connection closed while awaiting response to {method}"
                )));
            }
            Err(_) => {
                self.pending.remove(&key);
                return Err(HubError::timeout(format!(
                    "request {method} timed out after {timeout:?}"
                )));
            }
        };

        if let Some(error) = response.error {
            return Err(HubError::protocol(format!(
                "RPC error {}: {}",
                error.code, error.message
            ))
            .with_context(RPC_CODE_KEY, error.code));
        }

        response
            .result
            .ok_or_else(|| HubError::protocol(format!("response to {method} missing result")))
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let payload = Bytes::from(serde_json::to_vec(&notification)?);
        self.send_payload(payload).await
    }

    async fn send_payload(&self, payload: Bytes) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                payload,
                done: done_tx,
            })
            .await
            .map_err(|_| HubError::server_not_connected("upstream connection is closed"))?;
        done_rx
            .await
            .map_err(|_| HubError::server_not_connected("upstream connection is closed"))?
    }

    /// List tools, canonicalising their input schemas
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result = self
            .request(methods::TOOLS_LIST, None, self.config.timeouts.tool_call)
            .await?;
        let mut parsed: ListToolsResult = serde_json::from_value(result)?;
        for tool in &mut parsed.tools {
            tool.input_schema =
                types::canonicalize_input_schema(Some(tool.input_schema.clone()));
        }
        Ok(parsed.tools)
    }

    /// List resources
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        let result = self
            .request(methods::RESOURCES_LIST, None, self.config.timeouts.tool_call)
            .await?;
        let parsed: ListResourcesResult = serde_json::from_value(result)?;
        Ok(parsed.resources)
    }

    /// List resource templates
    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        let result = self
            .request(
                methods::RESOURCES_TEMPLATES_LIST,
                None,
                self.config.timeouts.tool_call,
            )
            .await?;
        let parsed: ListResourceTemplatesResult = serde_json::from_value(result)?;
        Ok(parsed.resource_templates)
    }

    /// List prompts
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let result = self
            .request(methods::PROMPTS_LIST, None, self.config.timeouts.tool_call)
            .await?;
        let parsed: ListPromptsResult = serde_json::from_value(result)?;
        Ok(parsed.prompts)
    }

    /// Discover all capability families the negotiated features allow.
    ///
    /// A family whose listing fails with `method not found` is treated as
    /// empty rather than an error.
    pub async fn discover(&self) -> Result<DiscoveredCapabilities> {
        let features = self
            .negotiated
            .read()
            .as_ref()
            .map(|s| s.features)
            .ok_or_else(|| HubError::protocol("client not initialized"))?;

        let mut discovered = DiscoveredCapabilities::default();
        if features.tools {
            discovered.tools = tolerate_missing(self.list_tools().await)?;
        }
        if features.resources {
            discovered.resources = tolerate_missing(self.list_resources().await)?;
        }
        if features.resource_templates {
            discovered.resource_templates =
                tolerate_missing(self.list_resource_templates().await)?;
        }
        if features.prompts {
            discovered.prompts = tolerate_missing(self.list_prompts().await)?;
        }
        Ok(discovered)
    }

    /// Call a tool by its upstream-local name
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        progress_token: Option<ProgressToken>,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        let request = types::CallToolRequest {
            name: name.to_string(),
            arguments,
            meta: progress_token.map(|token| types::RequestMeta {
                progress_token: Some(token),
            }),
        };
        let result = self
            .request(
                methods::TOOLS_CALL,
                Some(serde_json::to_value(&request)?),
                timeout,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Read a resource by its upstream-local URI
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let request = types::ReadResourceRequest {
            uri: uri.to_string(),
        };
        let result = self
            .request(
                methods::RESOURCES_READ,
                Some(serde_json::to_value(&request)?),
                self.config.timeouts.tool_call,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Get a prompt by its upstream-local name
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<GetPromptResult> {
        let request = types::GetPromptRequest {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .request(
                methods::PROMPTS_GET,
                Some(serde_json::to_value(&request)?),
                self.config.timeouts.tool_call,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Probe liveness.
    ///
    /// A server answering `method not found` is healthy (graceful
    /// degradation); timeouts and transport failures are not.
    pub async fn ping(&self) -> Result<PingOutcome> {
        match self
            .request_raw(methods::PING, None, self.config.timeouts.health_check)
            .await
        {
            Ok(_) => Ok(PingOutcome::Healthy),
            Err(e) if rpc_code(&e) == Some(-32601) => Ok(PingOutcome::MethodNotSupported),
            Err(e) => Err(e),
        }
    }

    /// Best-effort cancellation of an in-flight upstream request
    pub async fn cancel(&self, request_id: serde_json::Value, reason: Option<String>) {
        let params = serde_json::to_value(types::CancelledParams { request_id, reason }).ok();
        if let Err(e) = self.notify(methods::NOTIF_CANCELLED, params).await {
            trace!(error = %e, "cancel notification not delivered");
        }
    }

    /// Shut the connection down
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Disconnect).await;
        self.cancel.cancel();
    }
}

/// The JSON-RPC error code attached to a request failure, if any
#[must_use]
pub fn rpc_code(error: &HubError) -> Option<i64> {
    error.context.get(RPC_CODE_KEY).and_then(|v| v.as_i64())
}

fn tolerate_missing<T: Default>(outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => Ok(value),
        Err(e) if rpc_code(&e) == Some(-32601) => Ok(T::default()),
        Err(e) => Err(e),
    }
}

async fn pump(
    mut transport: Box<dyn Transport>,
    mut commands: mpsc::Receiver<Command>,
    pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    notifications: mpsc::Sender<JsonRpcNotification>,
    cancel: CancellationToken,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = transport.disconnect().await;
                break;
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Send { payload, done }) => {
                        let id = MessageId::from("out");
                        let outcome = transport
                            .send(TransportMessage::new(id, payload))
                            .await
                            .map_err(|e| HubError::transport(e.to_string()));
                        let _ = done.send(outcome);
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = transport.disconnect().await;
                        break;
                    }
                }
            }
            inbound = transport.receive() => {
                match inbound {
                    Ok(Some(message)) => {
                        dispatch(&message.payload, &pending, &notifications).await;
                    }
                    Ok(None) => {
                        debug!("upstream transport closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "upstream transport failed");
                        break;
                    }
                }
            }
        }
    }

    // Fail every in-flight request so callers observe the closure.
    pending.clear();
    closed.cancel();
}

async fn dispatch(
    payload: &[u8],
    pending: &DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    notifications: &mpsc::Sender<JsonRpcNotification>,
) {
    let text = String::from_utf8_lossy(payload);
    let message = match JsonRpcMessage::parse(&text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "discarding malformed upstream message");
            return;
        }
    };

    match message {
        JsonRpcMessage::Response(response) => {
            let Some(id) = response.id.clone() else {
                warn!("discarding response without id");
                return;
            };
            match pending.remove(&id.as_key()) {
                Some((_, waiter)) => {
                    let _ = waiter.send(response);
                }
                None => trace!(id = %id, "response for unknown or abandoned request"),
            }
        }
        JsonRpcMessage::Notification(notification) => {
            if notifications.send(notification).await.is_err() {
                trace!("notification receiver dropped");
            }
        }
        JsonRpcMessage::Request(request) => {
            // Server-initiated requests (sampling etc.) are outside the
            // hub's multiplexing surface.
            debug!(method = %request.method, "ignoring server-initiated request");
        }
    }
}
