//! Request routing and forwarding.
//!
//! The router resolves public identifiers to `(server, original name)`
//! targets, consults the policy gate, and forwards calls through the owning
//! supervisor's client. Long-running tool calls with a progress token get a
//! cadence timer that streams increment-only progress to the downstream
//! side until the call resolves, aborts or times out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics::HubMetrics;
use crate::naming::NameCodec;
use crate::registry::CapabilityRegistry;
use crate::supervisor::Supervisor;
use mcphub_core::{EventBus, HubError, ProgressEvent, Result, ServerId};
use mcphub_protocol::{
    CallToolResult, GetPromptResult, ProgressToken, Prompt, ReadResourceResult, Resource,
    ResourceTemplate, Tool,
};
use mcphub_transport::TransportTimeouts;

/// Progress cadence while a call is in flight
pub const PROGRESS_CADENCE: Duration = Duration::from_secs(1);

/// Routing context passed by the downstream surface
#[derive(Debug, Clone, Default)]
pub struct RequestCtx {
    /// Session issuing the request
    pub session_id: Option<String>,
    /// Client identifier, when known
    pub client_id: Option<String>,
}

/// A resolved routing target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Owning server
    pub server_id: ServerId,
    /// Name or URI the upstream knows
    pub original_key: String,
}

/// Routing decision with selection metadata
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Selected target
    pub target: RouteTarget,
    /// Every candidate server, in registration order
    pub candidates: Vec<ServerId>,
    /// Candidates removed by the policy gate
    pub filtered: usize,
}

/// Policy hook consulted before server selection.
///
/// The default gate passes every candidate through; deployments plug an
/// external policy engine in here.
pub trait RouteGate: Send + Sync {
    /// Filter the candidate list for a request
    fn filter(&self, candidates: Vec<RouteTarget>, ctx: &RequestCtx) -> Vec<RouteTarget>;
}

/// Pass-through gate
#[derive(Debug, Default)]
pub struct AllowAllGate;

impl RouteGate for AllowAllGate {
    fn filter(&self, candidates: Vec<RouteTarget>, _ctx: &RequestCtx) -> Vec<RouteTarget> {
        candidates
    }
}

/// Cadence timers for in-flight progress tokens
#[derive(Debug)]
pub struct ProgressBroker {
    events: Arc<EventBus>,
    metrics: Arc<HubMetrics>,
    active: DashMap<String, ProgressHandle>,
}

#[derive(Debug)]
struct ProgressHandle {
    task: tokio::task::JoinHandle<()>,
    reset: Arc<Notify>,
}

/// Guard keeping one token's cadence timer alive; dropping it stops and
/// removes the timer
#[derive(Debug)]
pub struct ProgressGuard {
    broker: Arc<ProgressBroker>,
    token: String,
    /// Notified when the upstream reports real progress for this token
    pub reset: Arc<Notify>,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.broker.stop(&self.token);
    }
}

impl ProgressBroker {
    /// Create a broker publishing onto the given event bus
    #[must_use]
    pub fn new(events: Arc<EventBus>, metrics: Arc<HubMetrics>) -> Arc<Self> {
        Arc::new(Self {
            events,
            metrics,
            active: DashMap::new(),
        })
    }

    /// Start the cadence timer for a token.
    ///
    /// Emits progress 0 immediately and increments once per cadence tick
    /// until stopped. Starting an already-tracked token replaces its timer.
    pub fn start(self: &Arc<Self>, token: &ProgressToken) -> ProgressGuard {
        let key = token.to_string();
        let reset = Arc::new(Notify::new());
        let events = Arc::clone(&self.events);
        let emit_key = key.clone();

        let task = tokio::spawn(async move {
            let mut progress: u64 = 0;
            let mut timer = tokio::time::interval(PROGRESS_CADENCE);
            loop {
                timer.tick().await;
                events.emit_progress(ProgressEvent {
                    token: emit_key.clone(),
                    progress,
                    total: None,
                });
                progress += 1;
            }
        });

        if let Some(previous) = self.active.insert(
            key.clone(),
            ProgressHandle {
                task,
                reset: Arc::clone(&reset),
            },
        ) {
            previous.task.abort();
        } else {
            self.metrics.active_streams.incr();
        }

        ProgressGuard {
            broker: Arc::clone(self),
            token: key,
            reset,
        }
    }

    /// Relay a progress notification observed from an upstream.
    ///
    /// Re-emits it downstream and signals deadline-reset to the forwarding
    /// call when the token is in flight.
    pub fn observe_upstream(&self, token: &str, progress: u64, total: Option<u64>) {
        self.events.emit_progress(ProgressEvent {
            token: token.to_string(),
            progress,
            total,
        });
        if let Some(handle) = self.active.get(token) {
            handle.reset.notify_waiters();
        }
    }

    /// Stop and remove one token's timer
    pub fn stop(&self, token: &str) {
        if let Some((_, handle)) = self.active.remove(token) {
            handle.task.abort();
            self.metrics.active_streams.decr();
        }
    }

    /// Number of in-flight progress timers
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Abort every timer (server shutdown)
    pub fn shutdown(&self) {
        let keys: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.stop(&key);
        }
    }
}

/// The hub's request router
pub struct Router {
    tools: Arc<CapabilityRegistry<Tool>>,
    resources: Arc<CapabilityRegistry<Resource>>,
    templates: Arc<CapabilityRegistry<ResourceTemplate>>,
    prompts: Arc<CapabilityRegistry<Prompt>>,
    supervisors: Arc<DashMap<ServerId, Arc<Supervisor>>>,
    codec: Arc<NameCodec>,
    gate: Arc<dyn RouteGate>,
    metrics: Arc<HubMetrics>,
    progress: Arc<ProgressBroker>,
    timeouts: TransportTimeouts,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("tools", &self.tools.count())
            .field("supervisors", &self.supervisors.len())
            .finish()
    }
}

impl Router {
    /// Create a router over the hub's registries and supervisor directory
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        tools: Arc<CapabilityRegistry<Tool>>,
        resources: Arc<CapabilityRegistry<Resource>>,
        templates: Arc<CapabilityRegistry<ResourceTemplate>>,
        prompts: Arc<CapabilityRegistry<Prompt>>,
        supervisors: Arc<DashMap<ServerId, Arc<Supervisor>>>,
        codec: Arc<NameCodec>,
        gate: Arc<dyn RouteGate>,
        metrics: Arc<HubMetrics>,
        progress: Arc<ProgressBroker>,
        timeouts: TransportTimeouts,
    ) -> Self {
        Self {
            tools,
            resources,
            templates,
            prompts,
            supervisors,
            codec,
            gate,
            metrics,
            progress,
            timeouts,
        }
    }

    /// The progress broker in use
    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressBroker> {
        &self.progress
    }

    fn route_in<T: Clone>(
        &self,
        registry: &CapabilityRegistry<T>,
        public_key: &str,
        ctx: &RequestCtx,
        kind: &str,
    ) -> Result<RouteDecision> {
        // Strategy parse first; ambiguous or unparseable names fall back to
        // the registry lookup.
        let resolved = self
            .codec
            .decode(public_key)
            .and_then(|(server, original)| {
                let server = ServerId::new(server).ok()?;
                registry
                    .list_by_server(&server)
                    .into_iter()
                    .find(|item| item.original_key == original)
                    .map(|item| (server, item.original_key))
            })
            .or_else(|| registry.resolve(public_key));

        let Some((owner, original_key)) = resolved else {
            return Err(HubError::resource_not_found(format!(
                "unknown {kind}: {public_key}"
            )));
        };

        let sources = registry.sources_of(public_key);
        let candidates: Vec<RouteTarget> = if sources.is_empty() {
            vec![RouteTarget {
                server_id: owner.clone(),
                original_key: original_key.clone(),
            }]
        } else {
            sources
                .iter()
                .map(|server_id| RouteTarget {
                    server_id: server_id.clone(),
                    original_key: original_key.clone(),
                })
                .collect()
        };
        let candidate_ids: Vec<ServerId> =
            candidates.iter().map(|c| c.server_id.clone()).collect();

        let surviving = self.gate.filter(candidates, ctx);
        let filtered = candidate_ids.len().saturating_sub(surviving.len());

        // Selection prefers the registry owner when it survived the gate;
        // otherwise the first surviving candidate.
        let target = surviving
            .iter()
            .find(|t| t.server_id == owner)
            .or_else(|| surviving.first())
            .cloned()
            .ok_or_else(|| {
                HubError::security_policy(format!(
                    "every candidate for {kind} '{public_key}' was denied by policy"
                ))
            })?;

        trace!(
            key = public_key,
            server = %target.server_id,
            candidates = candidate_ids.len(),
            filtered,
            "routed {kind}"
        );
        Ok(RouteDecision {
            target,
            candidates: candidate_ids,
            filtered,
        })
    }

    /// Resolve a public tool name
    pub fn route_tool(&self, public_name: &str, ctx: &RequestCtx) -> Result<RouteDecision> {
        self.route_in(&self.tools, public_name, ctx, "tool")
    }

    /// Resolve a public resource URI
    pub fn route_resource(&self, uri: &str, ctx: &RequestCtx) -> Result<RouteDecision> {
        self.route_in(&self.resources, uri, ctx, "resource")
    }

    /// Resolve a public prompt name
    pub fn route_prompt(&self, name: &str, ctx: &RequestCtx) -> Result<RouteDecision> {
        self.route_in(&self.prompts, name, ctx, "prompt")
    }

    /// Resource templates advertised across upstreams
    #[must_use]
    pub fn list_templates(&self) -> Vec<ResourceTemplate> {
        self.templates.list().into_iter().map(|i| i.item).collect()
    }

    fn supervisor_for(&self, server_id: &ServerId) -> Result<Arc<Supervisor>> {
        self.supervisors
            .get(server_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                HubError::server_not_connected(format!("no supervisor for server '{server_id}'"))
            })
    }

    /// Forward a tool call to its upstream.
    ///
    /// With a progress token present, a cadence timer streams progress until
    /// the call resolves; the tool-call deadline is an inactivity deadline
    /// when `reset_timeout_on_progress` is set, bounded by `max_total`.
    pub async fn forward_tool(
        &self,
        decision: &RouteDecision,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        progress_token: Option<ProgressToken>,
        cancel: CancellationToken,
    ) -> Result<CallToolResult> {
        let supervisor = self.supervisor_for(&decision.target.server_id)?;
        let client = supervisor.client()?;

        let guard = progress_token.as_ref().map(|token| self.progress.start(token));
        let started = Instant::now();

        // The client-side timeout is the hard budget; the router enforces
        // the (resettable) inactivity deadline underneath it.
        let hard_budget = self
            .timeouts
            .max_total
            .unwrap_or(Duration::from_secs(3600));
        let call = client.call_tool(
            &decision.target.original_key,
            arguments,
            progress_token.clone(),
            hard_budget,
        );
        tokio::pin!(call);

        let mut deadline = Instant::now() + self.timeouts.tool_call;
        let hard_deadline = Instant::now() + hard_budget;

        let outcome = loop {
            let reset_notified = async {
                match &guard {
                    Some(guard) => guard.reset.notified().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                result = &mut call => break result,
                _ = cancel.cancelled() => {
                    debug!(server = %decision.target.server_id, "tool call aborted by caller");
                    client
                        .cancel(serde_json::Value::Null, Some("client aborted".to_string()))
                        .await;
                    break Err(HubError::timeout("tool call cancelled by caller")
                        .with_context("cancelled", true));
                }
                _ = tokio::time::sleep_until(deadline.min(hard_deadline).into()) => {
                    let which = if Instant::now() >= hard_deadline { "total budget" } else { "tool call" };
                    break Err(HubError::timeout(format!(
                        "{which} deadline exceeded for '{}'",
                        decision.target.original_key
                    )));
                }
                _ = reset_notified => {
                    if self.timeouts.reset_timeout_on_progress {
                        deadline = Instant::now() + self.timeouts.tool_call;
                        trace!("tool call deadline reset on progress");
                    }
                }
            }
        };

        drop(guard);
        let elapsed = started.elapsed();
        self.metrics.tool_calls.incr();
        self.metrics.call_latency.record(elapsed);

        match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                self.metrics.errors.incr();
                warn!(server = %decision.target.server_id, error = %e, "tool call failed");
                Err(e)
            }
        }
    }

    /// Forward a resource read
    pub async fn forward_read_resource(
        &self,
        decision: &RouteDecision,
    ) -> Result<ReadResourceResult> {
        let supervisor = self.supervisor_for(&decision.target.server_id)?;
        let client = supervisor.client()?;

        let started = Instant::now();
        let outcome = client.read_resource(&decision.target.original_key).await;
        self.metrics.call_latency.record(started.elapsed());
        if outcome.is_err() {
            self.metrics.errors.incr();
        }
        outcome
    }

    /// Forward a prompt fetch
    pub async fn forward_get_prompt(
        &self,
        decision: &RouteDecision,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<GetPromptResult> {
        let supervisor = self.supervisor_for(&decision.target.server_id)?;
        let client = supervisor.client()?;

        let started = Instant::now();
        let outcome = client
            .get_prompt(&decision.target.original_key, arguments)
            .await;
        self.metrics.call_latency.record(started.elapsed());
        if outcome.is_err() {
            self.metrics.errors.incr();
        }
        outcome
    }
}
