//! Downstream request handlers.
//!
//! The wire transport (HTTP streaming or stdio) owns framing and the
//! session header; this module owns everything behind it: session issuance
//! and validation, method dispatch through the hub, error mapping with
//! redaction, and outbound notification forwarding.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hub::Hub;
use crate::router::RequestCtx;
use mcphub_core::{ErrorKind, HubError, Redactor, Result};
use mcphub_protocol::jsonrpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use mcphub_protocol::types::methods;
use mcphub_protocol::{
    CallToolRequest, GetPromptRequest, Implementation, ProgressParams, ReadResourceRequest,
};

/// Outbound notification sink implemented by the downstream transport.
///
/// Implementations keep per-client bounded queues; dropping a progress
/// notification under backpressure is acceptable, dropping responses is not
/// (responses do not travel through this trait).
pub trait NotificationSink: Send + Sync {
    /// Deliver a notification to the connected client
    fn send(&self, notification: JsonRpcNotification);
}

/// A handled request with its session outcome
#[derive(Debug)]
pub struct Handled {
    /// The response to frame back
    pub response: JsonRpcResponse,
    /// The session the request ran under
    pub session_id: String,
    /// Whether the session was created by this request (the transport must
    /// issue the session header)
    pub new_session: bool,
}

/// Downstream request handler over one hub
pub struct RequestHandler {
    hub: Arc<Hub>,
    redactor: Redactor,
    log_ring: Option<Arc<mcphub_core::LogRing>>,
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler").finish()
    }
}

impl RequestHandler {
    /// Create a handler over a hub
    #[must_use]
    pub fn new(hub: Arc<Hub>, redactor: Redactor) -> Self {
        Self {
            hub,
            redactor,
            log_ring: None,
        }
    }

    /// Attach a log ring snapshotted into crash dumps on internal errors
    #[must_use]
    pub fn with_log_ring(mut self, ring: Arc<mcphub_core::LogRing>) -> Self {
        self.log_ring = Some(ring);
        self
    }

    /// The hub behind this handler
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Map a hub error to the HTTP status the wire layer should answer with
    #[must_use]
    pub fn http_status_for(error: &HubError) -> u16 {
        match error.kind {
            ErrorKind::Session => 404,
            ErrorKind::ResourceNotFound => 404,
            ErrorKind::SecurityPolicy => 403,
            ErrorKind::Config | ErrorKind::Protocol => 400,
            ErrorKind::Timeout => 408,
            ErrorKind::ServerNotConnected => 503,
            _ => 500,
        }
    }

    /// Resolve the session for a request.
    ///
    /// No header means a new session; an unknown value is a session error
    /// (404 at the wire) and never auto-recreates.
    fn resolve_session(&self, header: Option<&str>) -> Result<(String, bool)> {
        match header {
            Some(session_id) => {
                self.hub
                    .sessions()
                    .touch(session_id)
                    .map_err(|_| HubError::session(format!("session not found: {session_id}")))?;
                Ok((session_id.to_string(), false))
            }
            None => {
                let session = self.hub.sessions().create(None);
                // Re-derive the gauge so sweeper evictions are reflected.
                self.hub
                    .metrics()
                    .active_sessions
                    .set(self.hub.sessions().count() as i64);
                Ok((session.id, true))
            }
        }
    }

    /// Delete a session (DELETE on the MCP endpoint)
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        if self.hub.sessions().remove(session_id) {
            self.hub
                .metrics()
                .active_sessions
                .set(self.hub.sessions().count() as i64);
            Ok(())
        } else {
            Err(HubError::session(format!(
                "session not found: {session_id}"
            )))
        }
    }

    /// Handle one downstream request.
    ///
    /// `cancel` aborts in-flight upstream work when the client goes away.
    pub async fn handle(
        &self,
        request: JsonRpcRequest,
        session_header: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Handled> {
        let started = Instant::now();
        self.hub.metrics().requests.incr();

        let (session_id, new_session) = self.resolve_session(session_header)?;
        let ctx = RequestCtx {
            session_id: Some(session_id.clone()),
            client_id: None,
        };

        let params = request.params.clone().unwrap_or(serde_json::Value::Null);
        self.hub
            .interceptors()
            .before(&request.method, &params, &ctx)
            .await?;

        let outcome = self.dispatch(&request.method, params, &ctx, cancel).await;

        let success = outcome.is_ok();
        self.hub
            .interceptors()
            .after(&request.method, success, &ctx)
            .await;
        self.hub
            .sessions()
            .record(&session_id, &request.method, success);
        self.hub.metrics().request_latency.record(started.elapsed());

        let response = match outcome {
            Ok(result) => JsonRpcResponse::success(result, request.id),
            Err(error) => {
                self.hub.metrics().errors.incr();
                warn!(method = %request.method, error = %error, "request failed");
                if matches!(error.kind, ErrorKind::Internal | ErrorKind::Unknown) {
                    self.dump_recent_logs();
                }
                JsonRpcResponse::error(self.to_wire_error(&error), Some(request.id))
            }
        };

        Ok(Handled {
            response,
            session_id,
            new_session,
        })
    }

    async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
        ctx: &RequestCtx,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        match method {
            methods::INITIALIZE => {
                let client_info: Option<Implementation> = params
                    .get("clientInfo")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok());
                let result = self.hub.initialize(client_info);
                Ok(serde_json::to_value(result)?)
            }
            methods::PING => Ok(serde_json::json!({})),
            methods::TOOLS_LIST => {
                Ok(serde_json::json!({ "tools": self.hub.list_tools() }))
            }
            methods::TOOLS_CALL => {
                let call: CallToolRequest = serde_json::from_value(params)
                    .map_err(|e| HubError::protocol(format!("invalid tools/call params: {e}")))?;
                let progress_token = call.meta.and_then(|m| m.progress_token);
                let result = self
                    .hub
                    .call_tool(&call.name, call.arguments, progress_token, ctx, cancel)
                    .await?;
                Ok(serde_json::to_value(result)?)
            }
            methods::RESOURCES_LIST => {
                Ok(serde_json::json!({ "resources": self.hub.list_resources() }))
            }
            methods::RESOURCES_READ => {
                let read: ReadResourceRequest = serde_json::from_value(params).map_err(|e| {
                    HubError::protocol(format!("invalid resources/read params: {e}"))
                })?;
                let result = self.hub.read_resource(&read.uri, ctx).await?;
                Ok(serde_json::to_value(result)?)
            }
            methods::RESOURCES_TEMPLATES_LIST => Ok(serde_json::json!({
                "resourceTemplates": self.hub.list_resource_templates()
            })),
            methods::PROMPTS_LIST => {
                Ok(serde_json::json!({ "prompts": self.hub.list_prompts() }))
            }
            methods::PROMPTS_GET => {
                let get: GetPromptRequest = serde_json::from_value(params)
                    .map_err(|e| HubError::protocol(format!("invalid prompts/get params: {e}")))?;
                let result = self.hub.get_prompt(&get.name, get.arguments, ctx).await?;
                Ok(serde_json::to_value(result)?)
            }
            other => Err(HubError::unsupported_feature(format!(
                "method not supported: {other}"
            ))),
        }
    }

    /// Crash-dump: log the recent-log ring so the surrounding context of an
    /// internal failure survives the generic wire message.
    fn dump_recent_logs(&self) {
        let Some(ring) = &self.log_ring else {
            return;
        };
        let lines = ring.snapshot();
        warn!(lines = lines.len(), "crash dump of recent log ring follows");
        for line in lines {
            warn!(at = %line.timestamp, level = %line.level, "| {}", line.message);
        }
    }

    fn to_wire_error(&self, error: &HubError) -> JsonRpcError {
        JsonRpcError {
            code: error.jsonrpc_error_code(),
            message: self.redactor.redact_str(error.public_message()),
            data: Some(serde_json::json!({ "kind": error.kind.as_str() })),
        }
    }

    /// Forward progress and list-changed events to a notification sink.
    ///
    /// Runs until the hub's event topics close or `cancel` fires.
    /// List-changed notifications are only emitted after the downstream
    /// `initialize` completed.
    pub fn spawn_notification_forwarder(
        &self,
        sink: Arc<dyn NotificationSink>,
        cancel: CancellationToken,
    ) {
        let mut progress = self.hub.events().subscribe_progress();
        let mut capabilities = self.hub.events().subscribe_capabilities();
        let hub = Arc::clone(&self.hub);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = progress.recv() => {
                        match event {
                            Ok(event) => {
                                let params = ProgressParams {
                                    progress_token:
                                        mcphub_protocol::ProgressToken::String(event.token),
                                    progress: event.progress,
                                    total: event.total,
                                };
                                let Ok(params) = serde_json::to_value(&params) else {
                                    continue;
                                };
                                sink.send(JsonRpcNotification::new(
                                    methods::NOTIF_PROGRESS,
                                    Some(params),
                                ));
                            }
                            // Dropped progress under lag is acceptable.
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                debug!(skipped = n, "progress notifications dropped under lag");
                            }
                            Err(_) => break,
                        }
                    }
                    event = capabilities.recv() => {
                        let Ok(event) = event else { continue };
                        if !hub.is_initialized() {
                            continue;
                        }
                        let method = match event.kind {
                            mcphub_core::CapabilityKind::Tools => methods::NOTIF_TOOLS_CHANGED,
                            mcphub_core::CapabilityKind::Resources
                            | mcphub_core::CapabilityKind::ResourceTemplates => {
                                methods::NOTIF_RESOURCES_CHANGED
                            }
                            mcphub_core::CapabilityKind::Prompts => methods::NOTIF_PROMPTS_CHANGED,
                        };
                        sink.send(JsonRpcNotification::new(method, None));
                    }
                }
            }
        });
    }
}
