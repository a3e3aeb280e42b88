//! Per-upstream supervisor.
//!
//! One supervisor owns the connection lifecycle of one upstream server:
//! `stopped → starting → running → stopping → stopped`, with `crashed`
//! reachable from `starting` and `running`. State transitions are validated
//! so a supervisor can never jump from `stopped` to `running` without
//! passing through `starting`, and a crashed upstream only recovers through
//! an explicit `start()`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ServerConfig;
use mcphub_client::{
    DiscoveredCapabilities, NegotiatedSession, PingOutcome, UpstreamClient, UpstreamClientConfig,
};
use mcphub_core::{EventBus, HubError, Result, ServerEvent, ServerId};
use mcphub_transport::{
    classify_connect_error, origin_key, parse_http_status, select_transport, validate_remote_url,
    ChildProcessConfig, ChildProcessTransport, ConnectErrorClass, HttpTransportConfig,
    OriginCache, OriginHint, SseTransport, SseTransportConfig, Transport, TransportTimeouts,
    TransportType,
};

/// Upstream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamState {
    /// Not running
    Stopped,
    /// Connecting and handshaking
    Starting,
    /// Initialized and serving
    Running,
    /// Shutdown in progress
    Stopping,
    /// Terminated unexpectedly
    Crashed,
}

impl UpstreamState {
    fn can_transition_to(self, next: Self) -> bool {
        use UpstreamState::{Crashed, Running, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Stopped | Crashed, Starting)
                | (Starting, Running | Crashed | Stopped)
                | (Running, Stopping | Crashed)
                | (Stopping, Stopped)
        )
    }
}

/// Lifecycle counters for one upstream
#[derive(Debug, Default)]
pub struct SupervisorCounters {
    /// Child restarts performed
    pub restart_count: AtomicU32,
    /// Remote reconnects performed
    pub reconnect_count: AtomicU32,
    /// First reconnect timestamp
    pub first_reconnect_at: RwLock<Option<DateTime<Utc>>>,
    /// Most recent successful start
    pub last_start_at: RwLock<Option<DateTime<Utc>>>,
}

/// Factory override for tests: produces a connected transport
pub type TransportFactory =
    Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Supervisor tuning knobs
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Timeout set applied to transports and the handshake
    pub timeouts: TransportTimeouts,
    /// Require https for remote endpoints (production profile)
    pub require_https: bool,
    /// Uptime after which the restart budget resets
    pub warmup_window: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            timeouts: TransportTimeouts::default(),
            require_https: false,
            warmup_window: Duration::from_secs(3),
        }
    }
}

/// Supervisor for one upstream server
pub struct Supervisor {
    server_id: ServerId,
    spec: ServerConfig,
    timeouts: TransportTimeouts,
    require_https: bool,
    warmup_window: Duration,

    state: RwLock<UpstreamState>,
    client: RwLock<Option<Arc<UpstreamClient>>>,
    counters: SupervisorCounters,
    events: Arc<EventBus>,
    origin_cache: Arc<OriginCache>,
    transport_factory: Option<TransportFactory>,
    /// Regenerated on every start; cancelling it stops the monitor, probe
    /// and restart tasks of that run
    cancel: RwLock<CancellationToken>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("server_id", &self.server_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Supervisor {
    /// Create a supervisor for a server spec
    #[must_use]
    pub fn new(
        spec: ServerConfig,
        server_id: ServerId,
        options: SupervisorOptions,
        events: Arc<EventBus>,
        origin_cache: Arc<OriginCache>,
    ) -> Arc<Self> {
        Self::build(spec, server_id, options, events, origin_cache, None)
    }

    /// Create a supervisor with a transport factory override (tests)
    #[must_use]
    pub fn with_transport_factory(
        spec: ServerConfig,
        server_id: ServerId,
        options: SupervisorOptions,
        events: Arc<EventBus>,
        origin_cache: Arc<OriginCache>,
        factory: TransportFactory,
    ) -> Arc<Self> {
        Self::build(spec, server_id, options, events, origin_cache, Some(factory))
    }

    fn build(
        spec: ServerConfig,
        server_id: ServerId,
        options: SupervisorOptions,
        events: Arc<EventBus>,
        origin_cache: Arc<OriginCache>,
        transport_factory: Option<TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id,
            spec,
            timeouts: options.timeouts,
            require_https: options.require_https,
            warmup_window: options.warmup_window,
            state: RwLock::new(UpstreamState::Stopped),
            client: RwLock::new(None),
            counters: SupervisorCounters::default(),
            events,
            origin_cache,
            transport_factory,
            cancel: RwLock::new(CancellationToken::new()),
        })
    }

    fn run_token(&self) -> CancellationToken {
        self.cancel.read().clone()
    }

    /// The supervised server's identifier
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> UpstreamState {
        *self.state.read()
    }

    /// Lifecycle counters
    #[must_use]
    pub fn counters(&self) -> &SupervisorCounters {
        &self.counters
    }

    /// The connected client, failing when the upstream is not running
    pub fn client(&self) -> Result<Arc<UpstreamClient>> {
        if self.state() != UpstreamState::Running {
            return Err(HubError::server_not_connected(format!(
                "server '{}' is {:?}",
                self.server_id,
                self.state()
            )));
        }
        self.client
            .read()
            .clone()
            .ok_or_else(|| {
                HubError::internal(format!(
                    "server '{}' is running without a client",
                    self.server_id
                ))
            })
    }

    fn set_state(&self, next: UpstreamState) -> Result<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(HubError::internal(format!(
                "invalid state transition {:?} -> {next:?} for server '{}'",
                *state, self.server_id
            )));
        }
        debug!(server = %self.server_id, from = ?*state, to = ?next, "upstream state transition");
        *state = next;
        Ok(())
    }

    /// Start the upstream: connect, negotiate, and begin monitoring.
    ///
    /// Valid from `Stopped` and `Crashed` only.
    pub async fn start(self: &Arc<Self>) -> Result<NegotiatedSession> {
        self.set_state(UpstreamState::Starting)?;

        let outcome = self.connect_and_initialize().await;
        match outcome {
            Ok((client, session)) => {
                *self.client.write() = Some(Arc::clone(&client));
                *self.cancel.write() = CancellationToken::new();
                self.set_state(UpstreamState::Running)?;
                *self.counters.last_start_at.write() = Some(Utc::now());
                self.events.emit_server(ServerEvent::Started {
                    server_id: self.server_id.clone(),
                });
                info!(server = %self.server_id, version = %session.protocol_version, "upstream running");

                self.spawn_monitor(client);
                if let ServerConfig::Remote {
                    health_check_interval_ms,
                    ..
                } = &self.spec
                {
                    if *health_check_interval_ms > 0 {
                        self.spawn_health_probe(Duration::from_millis(*health_check_interval_ms));
                    }
                }
                Ok(session)
            }
            Err(e) => {
                // A failed start leaves the supervisor crashed so that a
                // retry must go through start() again.
                let _ = self.set_state(UpstreamState::Crashed);
                self.events.emit_server(ServerEvent::Crashed {
                    server_id: self.server_id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stop the upstream cleanly
    pub async fn stop(&self) -> Result<()> {
        if self.state() != UpstreamState::Running {
            // Stopping a non-running upstream is a no-op.
            return Ok(());
        }
        self.set_state(UpstreamState::Stopping)?;
        self.cancel.read().cancel();

        let client = self.client.write().take();
        if let Some(client) = client {
            client.shutdown().await;
        }
        self.set_state(UpstreamState::Stopped)?;
        self.events.emit_server(ServerEvent::Stopped {
            server_id: self.server_id.clone(),
        });
        Ok(())
    }

    /// Discover the upstream's capabilities
    pub async fn discover(&self) -> Result<DiscoveredCapabilities> {
        self.client()?.discover().await
    }

    /// Probe upstream liveness
    pub async fn ping(&self) -> Result<PingOutcome> {
        self.client()?.ping().await
    }

    async fn connect_and_initialize(
        self: &Arc<Self>,
    ) -> Result<(Arc<UpstreamClient>, NegotiatedSession)> {
        if let Some(factory) = &self.transport_factory {
            let mut transport = factory();
            transport
                .connect()
                .await
                .map_err(|e| HubError::transport(e.to_string()))?;
            return self.initialize_on(transport).await;
        }

        match self.spec.clone() {
            ServerConfig::Local {
                command,
                args,
                env,
                cwd,
                ..
            } => {
                let config = ChildProcessConfig {
                    command,
                    args,
                    environment: env,
                    working_directory: cwd,
                    startup_timeout: self.timeouts.connect,
                    ..Default::default()
                };
                let mut transport = ChildProcessTransport::new(config);
                transport
                    .connect()
                    .await
                    .map_err(|e| HubError::transport(e.to_string()))?;
                self.initialize_on(Box::new(transport)).await
            }
            ServerConfig::Npx {
                package,
                version,
                args,
                env,
                work_dir,
                init_timeout_ms,
                ..
            } => {
                let mut config = ChildProcessConfig::npx(package, version, args);
                config.environment = env;
                config.working_directory = work_dir;
                config.first_run_timeout = Duration::from_millis(init_timeout_ms);
                config.startup_timeout = self.timeouts.connect;
                let mut transport = ChildProcessTransport::new(config);
                transport
                    .connect()
                    .await
                    .map_err(|e| HubError::transport(e.to_string()))?;
                self.initialize_on(Box::new(transport)).await
            }
            ServerConfig::Remote {
                url,
                transport,
                headers,
                auth,
                request_timeout_ms,
                ..
            } => {
                self.connect_remote(
                    &url,
                    transport,
                    headers,
                    auth,
                    Duration::from_millis(request_timeout_ms),
                )
                .await
            }
        }
    }

    /// Two-pass remote connection.
    ///
    /// Pass one uses the cached or default parameters. A `no-session`
    /// rejection retries without the session id header; a transport error
    /// on the HTTP transport retries over SSE; anything else surfaces the
    /// original error.
    async fn connect_remote(
        self: &Arc<Self>,
        url: &str,
        mode: mcphub_transport::RemoteTransportMode,
        headers: mcphub_transport::HeaderMap,
        auth: Option<mcphub_transport::AuthConfig>,
        request_timeout: Duration,
    ) -> Result<(Arc<UpstreamClient>, NegotiatedSession)> {
        let parsed = Url::parse(url)
            .map_err(|e| HubError::config(format!("invalid upstream URL: {e}")))?;
        validate_remote_url(&parsed, self.require_https)
            .map_err(|e| HubError::security_policy(e.to_string()))?;

        let origin = origin_key(&parsed).map_err(|e| HubError::config(e.to_string()))?;
        let hint = self.origin_cache.get(&origin);
        let mut kind = select_transport(&parsed, mode, hint.as_ref());
        let mut use_session_id = hint.as_ref().map_or(true, |h| h.supports_session_id);

        let mut last_error: Option<HubError> = None;
        for pass in 0..2 {
            let outcome = self
                .try_remote_pass(url, kind, use_session_id, &headers, auth.clone(), request_timeout)
                .await;

            match outcome {
                Ok((client, session)) => {
                    self.origin_cache.record(
                        origin.clone(),
                        OriginHint {
                            transport: kind,
                            supports_session_id: use_session_id,
                            protocol_version: Some(session.protocol_version.to_string()),
                        },
                    );
                    return Ok((client, session));
                }
                Err(e) if pass == 0 => {
                    let status = parse_http_status(&e.message);
                    match classify_connect_error(status, &e.message) {
                        ConnectErrorClass::NoSession => {
                            debug!(server = %self.server_id, "session id rejected, retrying without");
                            use_session_id = false;
                            last_error = Some(e);
                        }
                        ConnectErrorClass::TransportError if kind == TransportType::Http => {
                            debug!(server = %self.server_id, "http transport failed, retrying over sse");
                            kind = TransportType::Sse;
                            last_error = Some(e);
                        }
                        _ => return Err(e),
                    }
                }
                Err(e) => return Err(last_error.unwrap_or(e)),
            }
        }
        Err(last_error.unwrap_or_else(|| HubError::internal("remote connect exhausted")))
    }

    async fn try_remote_pass(
        self: &Arc<Self>,
        url: &str,
        kind: TransportType,
        use_session_id: bool,
        headers: &mcphub_transport::HeaderMap,
        auth: Option<mcphub_transport::AuthConfig>,
        request_timeout: Duration,
    ) -> Result<(Arc<UpstreamClient>, NegotiatedSession)> {
        let transport: Box<dyn Transport> = match kind {
            TransportType::Sse => {
                let mut transport = SseTransport::new(SseTransportConfig {
                    url: url.to_string(),
                    headers: headers.clone(),
                    auth,
                    timeout: request_timeout,
                    ..Default::default()
                });
                transport
                    .connect()
                    .await
                    .map_err(|e| HubError::transport(e.to_string()))?;
                Box::new(transport)
            }
            _ => {
                let mut transport = StreamableHttp::build(
                    url,
                    headers.clone(),
                    auth,
                    request_timeout,
                    use_session_id,
                );
                transport
                    .connect()
                    .await
                    .map_err(|e| HubError::transport(e.to_string()))?;
                Box::new(transport)
            }
        };

        self.initialize_on(transport).await
    }

    async fn initialize_on(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
    ) -> Result<(Arc<UpstreamClient>, NegotiatedSession)> {
        let client = UpstreamClient::new(
            transport,
            UpstreamClientConfig {
                timeouts: self.timeouts.clone(),
                ..Default::default()
            },
        );
        match client.initialize().await {
            Ok(session) => Ok((client, session)),
            Err(e) => {
                client.shutdown().await;
                Err(e)
            }
        }
    }

    /// Periodic liveness probe for remote upstreams.
    ///
    /// A `method not found` reply counts as healthy; only transport-level
    /// failures are reported.
    fn spawn_health_probe(self: &Arc<Self>, interval: Duration) {
        let supervisor = Arc::clone(self);
        let run = self.run_token();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = run.cancelled() => break,
                    _ = timer.tick() => {}
                }
                if supervisor.state() != UpstreamState::Running {
                    break;
                }
                match supervisor.ping().await {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(server = %supervisor.server_id, error = %e, "health probe failed");
                    }
                }
            }
        });
    }

    /// Watch the client's connection and handle crashes/restarts
    fn spawn_monitor(self: &Arc<Self>, client: Arc<UpstreamClient>) {
        let supervisor = Arc::clone(self);
        let run = self.run_token();
        let closed = client.closed_token();
        let started_at = std::time::Instant::now();

        tokio::spawn(async move {
            tokio::select! {
                _ = run.cancelled() => return,
                _ = closed.cancelled() => {}
            }

            // A deliberate stop transitions through Stopping; anything else
            // observed here is a crash.
            if supervisor.state() != UpstreamState::Running {
                return;
            }
            warn!(server = %supervisor.server_id, "upstream connection lost");
            let _ = supervisor.set_state(UpstreamState::Crashed);
            *supervisor.client.write() = None;
            supervisor.events.emit_server(ServerEvent::Crashed {
                server_id: supervisor.server_id.clone(),
                reason: "connection closed unexpectedly".to_string(),
            });

            supervisor.maybe_restart(started_at.elapsed()).await;
        });
    }

    async fn maybe_restart(self: &Arc<Self>, uptime: Duration) {
        let ServerConfig::Local {
            auto_restart,
            max_restarts,
            restart_delay_ms,
            ..
        } = &self.spec
        else {
            return;
        };
        if !*auto_restart {
            return;
        }

        // A run that survived the warmup window resets the budget.
        if uptime >= self.warmup_window {
            self.counters.restart_count.store(0, Ordering::SeqCst);
        }

        let restarts = self.counters.restart_count.fetch_add(1, Ordering::SeqCst);
        if restarts >= *max_restarts {
            warn!(
                server = %self.server_id,
                restarts,
                "restart budget exhausted, leaving upstream crashed"
            );
            return;
        }

        let delay = Duration::from_millis(*restart_delay_ms);
        info!(server = %self.server_id, attempt = restarts + 1, ?delay, "scheduling restart");
        tokio::time::sleep(delay).await;
        if self.run_token().is_cancelled() {
            return;
        }
        if let Err(e) = self.start().await {
            warn!(server = %self.server_id, error = %e, "restart attempt failed");
        }
    }
}

/// Narrow constructor shim so the remote pass reads declaratively
struct StreamableHttp;

impl StreamableHttp {
    fn build(
        url: &str,
        headers: mcphub_transport::HeaderMap,
        auth: Option<mcphub_transport::AuthConfig>,
        timeout: Duration,
        use_session_id: bool,
    ) -> mcphub_transport::StreamableHttpTransport {
        mcphub_transport::StreamableHttpTransport::new(HttpTransportConfig {
            url: url.to_string(),
            headers,
            auth,
            timeout,
            protocol_version: Some(mcphub_protocol::LATEST_PROTOCOL.to_string()),
            use_session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcphub_transport::testing::ScriptedTransport;

    fn local_spec(id: &str) -> ServerConfig {
        ServerConfig::Local {
            id: id.to_string(),
            command: "mcp-server".to_string(),
            args: vec![],
            env: Default::default(),
            cwd: None,
            auto_restart: false,
            max_restarts: 5,
            restart_delay_ms: 10,
        }
    }

    fn scripted_supervisor(id: &str) -> Arc<Supervisor> {
        let events = Arc::new(EventBus::new());
        let cache = Arc::new(OriginCache::default());
        Supervisor::with_transport_factory(
            local_spec(id),
            ServerId::new(id).unwrap(),
            SupervisorOptions::default(),
            events,
            cache,
            Arc::new(|| {
                let transport = ScriptedTransport::new();
                transport.accept_initialize("2025-06-18", "fake-upstream");
                transport.respond_ok(
                    "tools/list",
                    serde_json::json!({"tools": [{"name": "echo"}]}),
                );
                Box::new(transport)
            }),
        )
    }

    #[tokio::test]
    async fn test_start_reaches_running() {
        let supervisor = scripted_supervisor("srv_a");
        assert_eq!(supervisor.state(), UpstreamState::Stopped);

        let session = supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), UpstreamState::Running);
        assert_eq!(session.server_info.name, "fake-upstream");
        assert!(supervisor.counters().last_start_at.read().is_some());
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let supervisor = scripted_supervisor("srv_a");
        supervisor.start().await.unwrap();

        let err = supervisor.start().await.unwrap_err();
        assert!(err.message.contains("invalid state transition"));
        // The failed transition must not disturb the running upstream.
        assert_eq!(supervisor.state(), UpstreamState::Running);
    }

    #[tokio::test]
    async fn test_stop_transitions_through_stopping() {
        let supervisor = scripted_supervisor("srv_a");
        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), UpstreamState::Stopped);
        assert!(supervisor.client().is_err());
    }

    #[tokio::test]
    async fn test_failed_start_leaves_crashed() {
        let events = Arc::new(EventBus::new());
        let cache = Arc::new(OriginCache::default());
        let supervisor = Supervisor::with_transport_factory(
            local_spec("srv_a"),
            ServerId::new("srv_a").unwrap(),
            SupervisorOptions::default(),
            events,
            cache,
            Arc::new(|| {
                // Rejects every initialize attempt.
                let transport = ScriptedTransport::new();
                transport.respond_err("initialize", -32602, "unknown version");
                Box::new(transport)
            }),
        );

        let err = supervisor.start().await.unwrap_err();
        assert!(err.message.contains("protocol-negotiation-failed"));
        assert_eq!(supervisor.state(), UpstreamState::Crashed);

        // Crashed -> Starting is a valid recovery path.
        assert!(supervisor.start().await.is_err());
        assert_eq!(supervisor.state(), UpstreamState::Crashed);
    }

    #[tokio::test]
    async fn test_client_unavailable_when_not_running() {
        let supervisor = scripted_supervisor("srv_a");
        let err = supervisor.client().unwrap_err();
        assert_eq!(err.kind, mcphub_core::ErrorKind::ServerNotConnected);
    }

    #[tokio::test]
    async fn test_discovery_after_start() {
        let supervisor = scripted_supervisor("srv_a");
        supervisor.start().await.unwrap();
        let discovered = supervisor.discover().await.unwrap();
        assert_eq!(discovered.tools.len(), 1);
        assert_eq!(discovered.tools[0].name, "echo");
    }

    #[test]
    fn test_transition_table() {
        use UpstreamState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Crashed.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Crashed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
    }
}
