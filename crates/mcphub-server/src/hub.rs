//! The hub: composition of registries, supervisors and the router.
//!
//! A hub owns everything needed to serve one configuration: the four
//! capability registries, one supervisor per upstream, the router with its
//! progress broker, the session table and the event bus. Mounting and
//! unmounting are serialised by a per-hub mutex so concurrent readers always
//! observe a consistent registry snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{HubConfig, ServerConfig};
use crate::metrics::HubMetrics;
use crate::middleware::InterceptorChain;
use crate::naming::NameCodec;
use crate::registry::{CapabilityRegistry, CollisionPolicy, RegistrationItem};
use crate::router::{AllowAllGate, ProgressBroker, RequestCtx, RouteGate, Router};
use crate::supervisor::{Supervisor, SupervisorOptions, TransportFactory};
use mcphub_client::DiscoveredCapabilities;
use mcphub_core::{
    CapabilityEvent, CapabilityKind, EventBus, HubError, Result, ServerEvent, ServerId,
    SessionConfig, SessionManager,
};
use mcphub_protocol::types::methods;
use mcphub_protocol::{
    CallToolResult, GetPromptResult, Implementation, InitializeResult, ListChangedCapability,
    ProgressToken, Prompt, ReadResourceResult, Resource, ResourcesCapability, ResourceTemplate,
    ServerCapabilities, Tool,
};
use mcphub_secrets::SecretsStore;
use mcphub_transport::OriginCache;

/// Reference to a secret in the store, usable in auth token fields
const SECRET_REF_PREFIX: &str = "secret:";

/// How to react to mounting a duplicate server id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Reject the mount
    #[default]
    Error,
    /// Keep the existing mount, log a warning
    Warn,
    /// Keep the existing mount silently
    Silent,
}

/// Whether a server was wired in at startup or attached at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// Configured at startup; not hot-detachable
    Static,
    /// Mounted at runtime
    Runtime,
}

/// Hub construction options
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Naming configuration for tools and prompts
    pub naming: crate::naming::NamingConfig,
    /// Supervisor options (timeouts, https requirement, warmup)
    pub supervisor: SupervisorOptions,
    /// Session table configuration
    pub session: SessionConfig,
    /// Maximum mounted servers
    pub max_servers: usize,
    /// Duplicate-id policy
    pub duplicate_policy: DuplicatePolicy,
    /// Hub identity advertised downstream
    pub server_info: Implementation,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            naming: crate::naming::NamingConfig::default(),
            supervisor: SupervisorOptions::default(),
            session: SessionConfig::default(),
            max_servers: 64,
            duplicate_policy: DuplicatePolicy::default(),
            server_info: Implementation {
                name: "mcphub".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
        }
    }
}

impl HubOptions {
    /// Derive options from a validated configuration
    #[must_use]
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            naming: config.tool_naming.clone(),
            supervisor: SupervisorOptions {
                timeouts: config.timeouts.to_transport(),
                require_https: config.security.require_https,
                warmup_window: std::time::Duration::from_millis(config.rollover.warmup_time_ms),
            },
            session: SessionConfig {
                idle_ttl: std::time::Duration::from_secs(config.session.ttl_seconds),
                sweep_interval: std::time::Duration::from_secs(
                    config.session.sweep_interval_seconds,
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// The hub
pub struct Hub {
    options: HubOptions,

    tools: Arc<CapabilityRegistry<Tool>>,
    resources: Arc<CapabilityRegistry<Resource>>,
    templates: Arc<CapabilityRegistry<ResourceTemplate>>,
    prompts: Arc<CapabilityRegistry<Prompt>>,

    supervisors: Arc<DashMap<ServerId, Arc<Supervisor>>>,
    mount_modes: DashMap<ServerId, MountMode>,

    router: Router,
    codec: Arc<NameCodec>,
    events: Arc<EventBus>,
    metrics: Arc<HubMetrics>,
    sessions: Arc<SessionManager>,
    origin_cache: Arc<OriginCache>,
    interceptors: InterceptorChain,
    secrets: Option<Arc<SecretsStore>>,

    /// Serialises mount/unmount/registration batches
    registration_lock: Mutex<()>,

    /// Set once the downstream client finished `initialize`
    initialized: AtomicBool,

    /// Transport factory override for tests
    transport_factory: Option<HubTransportFactory>,
}

/// Per-hub transport factory override: builds a transport for a spec
pub type HubTransportFactory =
    Arc<dyn Fn(&ServerConfig) -> Box<dyn mcphub_transport::Transport> + Send + Sync>;

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("servers", &self.supervisors.len())
            .field("tools", &self.tools.count())
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

impl Hub {
    /// Create a hub with the given options
    #[must_use]
    pub fn new(options: HubOptions) -> Arc<Self> {
        Self::build(options, InterceptorChain::new(), Arc::new(AllowAllGate), None, None)
    }

    /// Create a hub with interceptors, a routing gate and optional secrets
    #[must_use]
    pub fn with_parts(
        options: HubOptions,
        interceptors: InterceptorChain,
        gate: Arc<dyn RouteGate>,
        secrets: Option<Arc<SecretsStore>>,
    ) -> Arc<Self> {
        Self::build(options, interceptors, gate, secrets, None)
    }

    /// Create a hub whose supervisors use a scripted transport factory
    /// (tests)
    #[must_use]
    pub fn with_transport_factory(
        options: HubOptions,
        factory: HubTransportFactory,
    ) -> Arc<Self> {
        Self::build(
            options,
            InterceptorChain::new(),
            Arc::new(AllowAllGate),
            None,
            Some(factory),
        )
    }

    fn build(
        options: HubOptions,
        interceptors: InterceptorChain,
        gate: Arc<dyn RouteGate>,
        secrets: Option<Arc<SecretsStore>>,
        transport_factory: Option<HubTransportFactory>,
    ) -> Arc<Self> {
        // Tools and prompts inherit the naming strategy's collision policy;
        // resources pass their URIs through with first-writer ownership.
        let tool_policy = match options.naming.strategy {
            crate::naming::NamingStrategy::Error | crate::naming::NamingStrategy::None => {
                CollisionPolicy::Error
            }
            _ => CollisionPolicy::LastWriterWins,
        };

        let tools = Arc::new(CapabilityRegistry::new(tool_policy));
        let resources = Arc::new(CapabilityRegistry::new(CollisionPolicy::FirstWriterWins));
        let templates = Arc::new(CapabilityRegistry::new(CollisionPolicy::FirstWriterWins));
        let prompts = Arc::new(CapabilityRegistry::new(tool_policy));

        let supervisors: Arc<DashMap<ServerId, Arc<Supervisor>>> = Arc::new(DashMap::new());
        let codec = Arc::new(NameCodec::new(options.naming.clone()));
        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(HubMetrics::new());
        let progress = ProgressBroker::new(Arc::clone(&events), Arc::clone(&metrics));
        let sessions = Arc::new(SessionManager::new(options.session.clone()));
        let origin_cache = Arc::new(OriginCache::default());

        let router = Router::new(
            Arc::clone(&tools),
            Arc::clone(&resources),
            Arc::clone(&templates),
            Arc::clone(&prompts),
            Arc::clone(&supervisors),
            Arc::clone(&codec),
            gate,
            Arc::clone(&metrics),
            progress,
            options.supervisor.timeouts.clone(),
        );

        Arc::new(Self {
            options,
            tools,
            resources,
            templates,
            prompts,
            supervisors,
            mount_modes: DashMap::new(),
            router,
            codec,
            events,
            metrics,
            sessions,
            origin_cache,
            interceptors,
            secrets,
            registration_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            transport_factory,
        })
    }

    /// The hub's event bus
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The hub's metric set
    #[must_use]
    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    /// The hub's session table
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The hub's interceptor chain
    #[must_use]
    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// The hub's router
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Whether the downstream client completed `initialize`
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Mounted server ids in mount order
    #[must_use]
    pub fn server_ids(&self) -> Vec<ServerId> {
        self.supervisors.iter().map(|e| e.key().clone()).collect()
    }

    /// Mount an upstream at runtime
    pub async fn mount(self: &Arc<Self>, spec: ServerConfig) -> Result<()> {
        self.mount_inner(spec, MountMode::Runtime).await
    }

    /// Import an upstream from static configuration
    pub async fn import(self: &Arc<Self>, spec: ServerConfig) -> Result<()> {
        self.mount_inner(spec, MountMode::Static).await
    }

    async fn mount_inner(self: &Arc<Self>, spec: ServerConfig, mode: MountMode) -> Result<()> {
        let server_id = spec.server_id()?;
        let _guard = self.registration_lock.lock().await;

        if self.supervisors.contains_key(&server_id) {
            return match self.options.duplicate_policy {
                DuplicatePolicy::Error => Err(HubError::config(format!(
                    "server '{server_id}' is already mounted"
                ))),
                DuplicatePolicy::Warn => {
                    warn!(server = %server_id, "duplicate mount ignored");
                    Ok(())
                }
                DuplicatePolicy::Silent => Ok(()),
            };
        }
        if self.supervisors.len() >= self.options.max_servers {
            return Err(HubError::config(format!(
                "server limit reached ({} of {})",
                self.supervisors.len(),
                self.options.max_servers
            )));
        }

        let spec = self.resolve_secret_refs(spec)?;

        let supervisor = match &self.transport_factory {
            Some(factory) => {
                let factory = Arc::clone(factory);
                let spec_for_factory = spec.clone();
                let per_server: TransportFactory =
                    Arc::new(move || factory(&spec_for_factory));
                Supervisor::with_transport_factory(
                    spec.clone(),
                    server_id.clone(),
                    self.options.supervisor.clone(),
                    Arc::clone(&self.events),
                    Arc::clone(&self.origin_cache),
                    per_server,
                )
            }
            None => Supervisor::new(
                spec.clone(),
                server_id.clone(),
                self.options.supervisor.clone(),
                Arc::clone(&self.events),
                Arc::clone(&self.origin_cache),
            ),
        };

        supervisor.start().await?;
        let discovered = match supervisor.discover().await {
            Ok(discovered) => discovered,
            Err(e) => {
                let _ = supervisor.stop().await;
                return Err(e);
            }
        };
        if let Err(e) = self.register_capabilities(&server_id, &discovered) {
            let _ = supervisor.stop().await;
            return Err(e);
        }

        self.spawn_notification_pump(&server_id, &supervisor);

        self.supervisors.insert(server_id.clone(), supervisor);
        self.mount_modes.insert(server_id.clone(), mode);
        self.metrics.connected_upstreams.incr();

        info!(
            server = %server_id,
            tools = discovered.tools.len(),
            resources = discovered.resources.len(),
            prompts = discovered.prompts.len(),
            "server mounted"
        );
        self.events.emit_server(ServerEvent::Mounted {
            server_id: server_id.clone(),
        });
        Ok(())
    }

    /// Unmount an upstream, clearing every capability it registered
    pub async fn unmount(&self, server_id: &ServerId) -> Result<()> {
        let _guard = self.registration_lock.lock().await;

        let Some((_, supervisor)) = self.supervisors.remove(server_id) else {
            return Err(HubError::config(format!(
                "server '{server_id}' is not mounted"
            )));
        };
        self.mount_modes.remove(server_id);

        supervisor.stop().await?;
        self.tools.clear_server(server_id);
        self.resources.clear_server(server_id);
        self.templates.clear_server(server_id);
        self.prompts.clear_server(server_id);
        self.metrics.connected_upstreams.decr();

        for kind in [
            CapabilityKind::Tools,
            CapabilityKind::Resources,
            CapabilityKind::ResourceTemplates,
            CapabilityKind::Prompts,
        ] {
            self.emit_capability_change(kind, server_id);
        }

        info!(server = %server_id, "server unmounted");
        self.events.emit_server(ServerEvent::Unmounted {
            server_id: server_id.clone(),
        });
        Ok(())
    }

    /// Replace an unmounted server's auth secret references with values from
    /// the store
    fn resolve_secret_refs(&self, spec: ServerConfig) -> Result<ServerConfig> {
        let ServerConfig::Remote {
            id,
            url,
            transport,
            headers,
            auth,
            health_check_interval_ms,
            request_timeout_ms,
        } = spec
        else {
            return Ok(spec);
        };

        let auth = match auth {
            Some(mcphub_transport::AuthConfig::Bearer { token })
                if token.starts_with(SECRET_REF_PREFIX) =>
            {
                let key = &token[SECRET_REF_PREFIX.len()..];
                let store = self.secrets.as_ref().ok_or_else(|| {
                    HubError::config(format!(
                        "server '{id}' references secret '{key}' but no store is configured"
                    ))
                })?;
                let value = store.get(key)?;
                Some(mcphub_transport::AuthConfig::Bearer { token: value })
            }
            other => other,
        };

        Ok(ServerConfig::Remote {
            id,
            url,
            transport,
            headers,
            auth,
            health_check_interval_ms,
            request_timeout_ms,
        })
    }

    fn register_capabilities(
        &self,
        server_id: &ServerId,
        discovered: &DiscoveredCapabilities,
    ) -> Result<()> {
        let tool_items = discovered
            .tools
            .iter()
            .map(|tool| {
                let public = self.codec.encode(server_id.as_str(), &tool.name)?;
                Ok(RegistrationItem {
                    original_key: tool.name.clone(),
                    public_key: public.clone(),
                    item: Tool {
                        name: public,
                        ..tool.clone()
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.tools.register_server(server_id, tool_items)?;

        // Resources pass their URIs through untouched.
        let resource_items = discovered
            .resources
            .iter()
            .map(|resource| RegistrationItem {
                original_key: resource.uri.clone(),
                public_key: resource.uri.clone(),
                item: resource.clone(),
            })
            .collect();
        self.resources.register_server(server_id, resource_items)?;

        let template_items = discovered
            .resource_templates
            .iter()
            .map(|template| RegistrationItem {
                original_key: template.uri_template.clone(),
                public_key: template.uri_template.clone(),
                item: template.clone(),
            })
            .collect();
        self.templates.register_server(server_id, template_items)?;

        let prompt_items = discovered
            .prompts
            .iter()
            .map(|prompt| {
                let public = self.codec.encode(server_id.as_str(), &prompt.name)?;
                Ok(RegistrationItem {
                    original_key: prompt.name.clone(),
                    public_key: public.clone(),
                    item: Prompt {
                        name: public,
                        ..prompt.clone()
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.prompts.register_server(server_id, prompt_items)?;

        Ok(())
    }

    fn emit_capability_change(&self, kind: CapabilityKind, server_id: &ServerId) {
        // List-changed notifications are suppressed until the downstream
        // initialize completed; the post-initialize listing reflects the
        // coalesced state anyway.
        if !self.is_initialized() {
            return;
        }
        self.events.emit_capability(CapabilityEvent {
            kind,
            server_id: server_id.clone(),
        });
    }

    fn spawn_notification_pump(self: &Arc<Self>, server_id: &ServerId, supervisor: &Arc<Supervisor>) {
        let Ok(client) = supervisor.client() else {
            return;
        };
        let Some(mut notifications) = client.take_notifications() else {
            return;
        };
        let hub = Arc::clone(self);
        let server_id = server_id.clone();

        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                match notification.method.as_str() {
                    methods::NOTIF_PROGRESS => {
                        let Some(params) = notification.params else {
                            continue;
                        };
                        let token = params
                            .get("progressToken")
                            .map(|t| match t {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_default();
                        let progress =
                            params.get("progress").and_then(|p| p.as_u64()).unwrap_or(0);
                        let total = params.get("total").and_then(|t| t.as_u64());
                        hub.router.progress().observe_upstream(&token, progress, total);
                    }
                    methods::NOTIF_TOOLS_CHANGED => {
                        hub.refresh_family(&server_id, CapabilityKind::Tools).await;
                    }
                    methods::NOTIF_RESOURCES_CHANGED => {
                        hub.refresh_family(&server_id, CapabilityKind::Resources).await;
                    }
                    methods::NOTIF_PROMPTS_CHANGED => {
                        hub.refresh_family(&server_id, CapabilityKind::Prompts).await;
                    }
                    other => {
                        debug!(server = %server_id, method = other, "ignoring upstream notification");
                    }
                }
            }
            debug!(server = %server_id, "notification pump ended");
        });
    }

    /// Re-discover one capability family after an upstream change
    /// notification
    async fn refresh_family(self: &Arc<Self>, server_id: &ServerId, kind: CapabilityKind) {
        let Some(supervisor) = self
            .supervisors
            .get(server_id)
            .map(|e| Arc::clone(e.value()))
        else {
            return;
        };

        let discovered = match supervisor.discover().await {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!(server = %server_id, error = %e, "re-discovery failed");
                return;
            }
        };

        let _guard = self.registration_lock.lock().await;
        if let Err(e) = self.register_capabilities(server_id, &discovered) {
            warn!(server = %server_id, error = %e, "re-registration failed");
            return;
        }
        self.emit_capability_change(kind, server_id);
    }

    // --- Downstream dispatch -------------------------------------------

    /// Serve `initialize` locally, advertising the hub's merged surface
    pub fn initialize(&self, _client_info: Option<Implementation>) -> InitializeResult {
        self.initialized.store(true, Ordering::Relaxed);
        InitializeResult {
            protocol_version: mcphub_protocol::LATEST_PROTOCOL.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ListChangedCapability {
                    list_changed: Some(true),
                }),
                resources: Some(ResourcesCapability {
                    subscribe: None,
                    list_changed: Some(true),
                }),
                prompts: Some(ListChangedCapability {
                    list_changed: Some(true),
                }),
                experimental: None,
            },
            server_info: self.options.server_info.clone(),
        }
    }

    /// List every tool under its public name
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        self.tools.list().into_iter().map(|i| i.item).collect()
    }

    /// List every resource
    #[must_use]
    pub fn list_resources(&self) -> Vec<Resource> {
        self.resources.list().into_iter().map(|i| i.item).collect()
    }

    /// List every resource template
    #[must_use]
    pub fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        self.templates.list().into_iter().map(|i| i.item).collect()
    }

    /// List every prompt under its public name
    #[must_use]
    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.prompts.list().into_iter().map(|i| i.item).collect()
    }

    /// Call a tool by its public name
    pub async fn call_tool(
        &self,
        public_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        progress_token: Option<ProgressToken>,
        ctx: &RequestCtx,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<CallToolResult> {
        let decision = self.router.route_tool(public_name, ctx)?;
        self.router
            .forward_tool(&decision, arguments, progress_token, cancel)
            .await
    }

    /// Read a resource by its public URI
    pub async fn read_resource(&self, uri: &str, ctx: &RequestCtx) -> Result<ReadResourceResult> {
        let decision = self.router.route_resource(uri, ctx)?;
        self.router.forward_read_resource(&decision).await
    }

    /// Get a prompt by its public name
    pub async fn get_prompt(
        &self,
        public_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        ctx: &RequestCtx,
    ) -> Result<GetPromptResult> {
        let decision = self.router.route_prompt(public_name, ctx)?;
        self.router.forward_get_prompt(&decision, arguments).await
    }

    /// Tool-name collisions currently visible
    #[must_use]
    pub fn tool_collisions(&self) -> std::collections::HashMap<String, Vec<ServerId>> {
        self.tools.collisions()
    }

    /// Probe every mounted upstream; the first failure surfaces.
    ///
    /// Used by worker health gating during warmup and by the readiness
    /// monitor.
    pub async fn probe_upstreams(&self) -> Result<()> {
        let supervisors: Vec<(ServerId, Arc<Supervisor>)> = self
            .supervisors
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        for (id, supervisor) in supervisors {
            supervisor
                .ping()
                .await
                .map_err(|e| e.with_context("server", id.to_string()))?;
        }
        Ok(())
    }

    /// Shut the hub down: stop sweepers, tear down progress timers, stop
    /// every supervisor
    pub async fn shutdown(&self) {
        self.sessions.stop_sweeper();
        self.router.progress().shutdown();

        let ids: Vec<ServerId> = self.server_ids();
        for id in ids {
            if let Some(supervisor) = self.supervisors.get(&id).map(|e| Arc::clone(e.value())) {
                if let Err(e) = supervisor.stop().await {
                    warn!(server = %id, error = %e, "supervisor stop failed during shutdown");
                }
            }
        }
        self.supervisors.clear();
        self.metrics.connected_upstreams.set(0);
        info!("hub shut down");
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

    fn scripted_hub(options: HubOptions) -> Arc<Hub> {
        Hub::with_transport_factory(
            options,
            Arc::new(|spec: &ServerConfig| {
                let transport = ScriptedTransport::new();
                transport.accept_initialize("2025-06-18", spec.id());
                transport.respond_ok(
                    "tools/list",
                    serde_json::json!({"tools": [{"name": "echo"}]}),
                );
                transport.respond_ok(
                    "resources/list",
                    serde_json::json!({"resources": [
                        {"uri": format!("file:///{}.txt", spec.id())}
                    ]}),
                );
                transport.respond_ok(
                    "resources/templates/list",
                    serde_json::json!({"resourceTemplates": []}),
                );
                transport.respond_ok("prompts/list", serde_json::json!({"prompts": []}));
                Box::new(transport)
            }),
        )
    }

    #[tokio::test]
    async fn test_mount_registers_namespaced_tools() {
        let hub = scripted_hub(HubOptions::default());
        hub.mount(local_spec("srv_a")).await.unwrap();

        let tools = hub.list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo_srv_a");

        let resources = hub.list_resources();
        assert_eq!(resources[0].uri, "file:///srv_a.txt");
    }

    #[tokio::test]
    async fn test_duplicate_mount_policies() {
        let hub = scripted_hub(HubOptions::default());
        hub.mount(local_spec("srv_a")).await.unwrap();
        let err = hub.mount(local_spec("srv_a")).await.unwrap_err();
        assert!(err.message.contains("already mounted"));

        let hub = scripted_hub(HubOptions {
            duplicate_policy: DuplicatePolicy::Warn,
            ..Default::default()
        });
        hub.mount(local_spec("srv_a")).await.unwrap();
        hub.mount(local_spec("srv_a")).await.unwrap();
        assert_eq!(hub.server_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_max_servers_enforced() {
        let hub = scripted_hub(HubOptions {
            max_servers: 1,
            ..Default::default()
        });
        hub.mount(local_spec("srv_a")).await.unwrap();
        let err = hub.mount(local_spec("srv_b")).await.unwrap_err();
        assert!(err.message.contains("server limit"));
    }

    #[tokio::test]
    async fn test_unmount_clears_registries() {
        let hub = scripted_hub(HubOptions::default());
        hub.mount(local_spec("srv_a")).await.unwrap();
        assert_eq!(hub.list_tools().len(), 1);

        let id = ServerId::new("srv_a").unwrap();
        hub.unmount(&id).await.unwrap();
        assert!(hub.list_tools().is_empty());
        assert!(hub.list_resources().is_empty());
        assert!(hub.server_ids().is_empty());

        let err = hub.unmount(&id).await.unwrap_err();
        assert!(err.message.contains("not mounted"));
    }

    #[tokio::test]
    async fn test_call_tool_end_to_end() {
        let hub = Hub::with_transport_factory(
            HubOptions::default(),
            Arc::new(|spec: &ServerConfig| {
                let transport = ScriptedTransport::new();
                transport.accept_initialize("2025-06-18", spec.id());
                transport.respond_ok(
                    "tools/list",
                    serde_json::json!({"tools": [{"name": "echo"}]}),
                );
                transport.script("tools/call", |request| {
                    let params = request.params.as_ref().unwrap();
                    assert_eq!(params["name"], "echo");
                    let text = params["arguments"]["text"].as_str().unwrap().to_string();
                    mcphub_transport::testing::ScriptedReply::ok(serde_json::json!({
                        "content": [{"type": "text", "text": text}]
                    }))
                });
                Box::new(transport)
            }),
        );
        hub.mount(local_spec("srv_a")).await.unwrap();

        let mut args = serde_json::Map::new();
        args.insert("text".to_string(), serde_json::json!("hi"));
        let result = hub
            .call_tool(
                "echo_srv_a",
                Some(args),
                None,
                &RequestCtx::default(),
                tokio_util::sync::CancellationToken::new(),
            )
            .await
            .unwrap();

        match &result.content[0] {
            mcphub_protocol::Content::Text { text } => assert_eq!(text, "hi"),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_advertises_list_changed() {
        let hub = scripted_hub(HubOptions::default());
        assert!(!hub.is_initialized());

        let result = hub.initialize(None);
        assert!(hub.is_initialized());
        assert_eq!(
            result.capabilities.tools.unwrap().list_changed,
            Some(true)
        );
        assert_eq!(
            result.capabilities.resources.unwrap().list_changed,
            Some(true)
        );
        assert_eq!(result.server_info.name, "mcphub");
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let hub = scripted_hub(HubOptions::default());
        hub.mount(local_spec("srv_a")).await.unwrap();
        hub.shutdown().await;
        assert!(hub.server_ids().is_empty());
        assert_eq!(hub.router().progress().active_count(), 0);
        assert_eq!(hub.metrics().connected_upstreams.get(), 0);
    }

    #[tokio::test]
    async fn test_mount_failure_surfaces() {
        let hub = Hub::with_transport_factory(
            HubOptions::default(),
            Arc::new(|_spec: &ServerConfig| {
                let transport = ScriptedTransport::new();
                transport.respond_err("initialize", -32602, "unknown version");
                Box::new(transport)
            }),
        );
        let err = hub.mount(local_spec("srv_a")).await.unwrap_err();
        assert!(err.message.contains("protocol-negotiation-failed"));
        assert!(hub.server_ids().is_empty());
    }
}
