//! Config generations and the rollover controller.
//!
//! Every accepted configuration becomes a generation with its own worker (a
//! fresh hub). A new generation warms up, passes health gating, and is
//! promoted while the previous one drains: sessions finish or are migrated,
//! then the old worker stops. An error-rate guard over the active worker
//! triggers rollback to the previous generation while it is still
//! available. Promotion, drain and rollback are coordinated through one
//! single-slot control lock so their state flips never interleave.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{GenerationSettings, HubConfig, RolloverSettings};
use crate::hub::Hub;
use crate::worker::{Worker, WorkerState};
use mcphub_core::{EventBus, GenerationEvent, HubError, Result};

/// Drain poll cadence
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Generation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    /// Created, worker not yet built
    Pending,
    /// Worker inside the warmup window
    Warming,
    /// Serving new sessions
    Active,
    /// Finishing existing sessions
    Draining,
    /// Stopped; kept only for bookkeeping
    Retired,
}

/// One configuration generation
#[derive(Debug)]
pub struct ConfigGeneration {
    /// Monotonically increasing identifier
    pub id: u64,
    /// The validated configuration snapshot
    pub config: Arc<HubConfig>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    state: RwLock<GenerationState>,
}

impl ConfigGeneration {
    fn new(id: u64, config: Arc<HubConfig>) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            created_at: Utc::now(),
            state: RwLock::new(GenerationState::Pending),
        })
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> GenerationState {
        *self.state.read()
    }

    fn set_state(&self, state: GenerationState) {
        debug!(generation = self.id, ?state, "generation state change");
        *self.state.write() = state;
    }
}

/// Builds a worker hub from a configuration snapshot
pub type WorkerFactory =
    Arc<dyn Fn(Arc<HubConfig>) -> BoxFuture<'static, Result<Arc<Hub>>> + Send + Sync>;

/// Snapshot persisted when draining sessions have no migration target
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationSnapshot {
    /// Generation the sessions were pinned to
    pub generation_id: u64,
    /// Session ids left behind
    pub sessions: Vec<String>,
    /// Snapshot time
    pub created_at: DateTime<Utc>,
}

/// Durable store for migration snapshots
pub trait MigrationStore: Send + Sync {
    /// Persist a snapshot
    fn persist(&self, snapshot: &MigrationSnapshot) -> Result<()>;
}

/// File-backed migration store writing one JSON file per snapshot
#[derive(Debug)]
pub struct FileMigrationStore {
    dir: PathBuf,
}

impl FileMigrationStore {
    /// Create a store under `dir` (created on demand)
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl MigrationStore for FileMigrationStore {
    fn persist(&self, snapshot: &MigrationSnapshot) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!(
            "migration-gen{}-{}.json",
            snapshot.generation_id,
            snapshot.created_at.timestamp_millis()
        ));
        let body = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&path, body)?;
        info!(path = %path.display(), sessions = snapshot.sessions.len(), "migration snapshot persisted");
        Ok(())
    }
}

/// Discards snapshots (tests, ephemeral deployments)
#[derive(Debug, Default)]
pub struct NullMigrationStore;

impl MigrationStore for NullMigrationStore {
    fn persist(&self, _snapshot: &MigrationSnapshot) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ControllerInner {
    next_id: u64,
    generations: BTreeMap<u64, Arc<ConfigGeneration>>,
    workers_by_generation: BTreeMap<u64, Vec<String>>,
}

/// The generation/rollover controller
pub struct RolloverController {
    rollover: RolloverSettings,
    generation_cfg: GenerationSettings,
    factory: WorkerFactory,
    events: Arc<EventBus>,
    migration_store: Arc<dyn MigrationStore>,

    inner: RwLock<ControllerInner>,
    workers: DashMap<String, Arc<Worker>>,
    /// Session id to worker id
    pins: DashMap<String, String>,
    /// Single-slot coordination of promote/drain/rollback
    control: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RolloverController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloverController")
            .field("generations", &self.inner.read().generations.len())
            .field("workers", &self.workers.len())
            .field("pins", &self.pins.len())
            .finish()
    }
}

impl RolloverController {
    /// Create a controller
    #[must_use]
    pub fn new(
        rollover: RolloverSettings,
        generation_cfg: GenerationSettings,
        factory: WorkerFactory,
        events: Arc<EventBus>,
        migration_store: Arc<dyn MigrationStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rollover,
            generation_cfg,
            factory,
            events,
            migration_store,
            inner: RwLock::new(ControllerInner::default()),
            workers: DashMap::new(),
            pins: DashMap::new(),
            control: tokio::sync::Mutex::new(()),
        })
    }

    /// The currently active generation, if any
    #[must_use]
    pub fn active_generation(&self) -> Option<u64> {
        self.inner
            .read()
            .generations
            .values()
            .find(|g| g.state() == GenerationState::Active)
            .map(|g| g.id)
    }

    /// A generation by id
    #[must_use]
    pub fn generation(&self, id: u64) -> Option<Arc<ConfigGeneration>> {
        self.inner.read().generations.get(&id).cloned()
    }

    /// A worker by id
    #[must_use]
    pub fn worker(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Workers bound to a generation
    #[must_use]
    pub fn workers_of(&self, generation_id: u64) -> Vec<Arc<Worker>> {
        let ids = self
            .inner
            .read()
            .workers_by_generation
            .get(&generation_id)
            .cloned()
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.worker(id)).collect()
    }

    /// Apply a new validated configuration: build a generation, warm its
    /// worker, gate on health and promote it.
    pub async fn apply_config(self: &Arc<Self>, config: Arc<HubConfig>) -> Result<u64> {
        let _slot = self.control.lock().await;

        // Bound live generations before creating a new one.
        let live = self
            .inner
            .read()
            .generations
            .values()
            .filter(|g| g.state() != GenerationState::Retired)
            .count();
        if live >= self.generation_cfg.max_generations {
            return Err(HubError::config(format!(
                "generation limit reached ({live} live of {} allowed)",
                self.generation_cfg.max_generations
            )));
        }

        let generation = {
            let mut inner = self.inner.write();
            inner.next_id += 1;
            let generation = ConfigGeneration::new(inner.next_id, Arc::clone(&config));
            inner.generations.insert(generation.id, Arc::clone(&generation));
            generation
        };
        info!(generation = generation.id, "building worker for new generation");

        let hub = match (self.factory)(config).await {
            Ok(hub) => hub,
            Err(e) => {
                generation.set_state(GenerationState::Retired);
                return Err(e.with_context("generation", generation.id));
            }
        };

        let worker = Worker::new(generation.id, 0, hub);
        worker.set_state(WorkerState::WarmingUp);
        generation.set_state(GenerationState::Warming);
        self.workers.insert(worker.id().to_string(), Arc::clone(&worker));
        self.inner
            .write()
            .workers_by_generation
            .entry(generation.id)
            .or_default()
            .push(worker.id().to_string());

        tokio::time::sleep(Duration::from_millis(self.rollover.warmup_time_ms)).await;

        if let Err(e) = worker.probe().await {
            warn!(generation = generation.id, error = %e, "worker failed health gating");
            worker.stop().await;
            generation.set_state(GenerationState::Retired);
            return Err(
                HubError::unknown(format!("worker failed warmup health check: {e}"))
                    .with_context("generation", generation.id),
            );
        }

        worker.set_state(WorkerState::Healthy);
        let previous_active = self.active_generation();
        generation.set_state(GenerationState::Active);
        self.events.emit_generation(GenerationEvent::Activated {
            generation_id: generation.id,
        });
        info!(generation = generation.id, "generation activated");

        if let Some(previous) = previous_active {
            self.begin_drain(previous);
        }
        Ok(generation.id)
    }

    /// Transition a generation to draining and spawn its drain task
    fn begin_drain(self: &Arc<Self>, generation_id: u64) {
        let Some(generation) = self.generation(generation_id) else {
            return;
        };
        generation.set_state(GenerationState::Draining);
        for worker in self.workers_of(generation_id) {
            worker.set_state(WorkerState::Draining);
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.drain(generation_id).await;
        });
    }

    /// Drain a generation: poll its sessions, warn inside the grace window,
    /// migrate leftovers at the deadline, then stop and retire.
    async fn drain(self: &Arc<Self>, generation_id: u64) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.rollover.drain_timeout_ms);
        let grace = Duration::from_millis(self.generation_cfg.grace_period_ms);
        let mut warned = false;

        loop {
            // A rollback may have re-promoted this generation; its drain is
            // then void.
            match self.generation(generation_id) {
                Some(generation) if generation.state() == GenerationState::Draining => {}
                _ => {
                    info!(generation = generation_id, "drain aborted, generation re-promoted");
                    for worker in self.workers_of(generation_id) {
                        if worker.state() == WorkerState::Draining {
                            worker.set_state(WorkerState::Healthy);
                        }
                    }
                    return;
                }
            }

            let active: usize = self
                .workers_of(generation_id)
                .iter()
                .map(|w| w.active_sessions())
                .sum();
            if active == 0 {
                break;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                info!(
                    generation = generation_id,
                    sessions = active,
                    "drain deadline reached, migrating remaining sessions"
                );
                self.migrate_sessions(generation_id).await;
                break;
            }
            if !warned && deadline.saturating_duration_since(now) <= grace {
                warn!(
                    generation = generation_id,
                    sessions = active,
                    "drain entering grace period with sessions still active"
                );
                warned = true;
            }

            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - now)).await;
        }

        let _slot = self.control.lock().await;
        match self.generation(generation_id) {
            Some(generation) if generation.state() == GenerationState::Draining => {}
            _ => return,
        }
        for worker in self.workers_of(generation_id) {
            worker.stop().await;
        }
        if let Some(generation) = self.generation(generation_id) {
            generation.set_state(GenerationState::Retired);
        }
        self.events
            .emit_generation(GenerationEvent::Retired { generation_id });
        info!(generation = generation_id, "generation retired");
    }

    /// Re-pin every session of a draining generation to a healthy worker,
    /// preferring the active generation. Sessions without a target are
    /// persisted to the migration store and released.
    async fn migrate_sessions(self: &Arc<Self>, from_generation: u64) {
        let source_workers: std::collections::HashSet<String> = self
            .workers_of(from_generation)
            .iter()
            .map(|w| w.id().to_string())
            .collect();

        let stranded: Vec<(String, String)> = self
            .pins
            .iter()
            .filter(|entry| source_workers.contains(entry.value()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if stranded.is_empty() {
            return;
        }

        let mut orphaned = Vec::new();
        for (session_id, old_worker_id) in stranded {
            let target = self.select_migration_target(from_generation);
            match target {
                Some(target) => {
                    if let Some(old) = self.worker(&old_worker_id) {
                        old.session_ended();
                    }
                    target.session_started();
                    self.pins.insert(session_id.clone(), target.id().to_string());
                    debug!(
                        session = %session_id,
                        from = %old_worker_id,
                        to = %target.id(),
                        "session migrated"
                    );
                }
                None => {
                    if let Some(old) = self.worker(&old_worker_id) {
                        old.session_ended();
                    }
                    self.pins.remove(&session_id);
                    orphaned.push(session_id);
                }
            }
        }

        if !orphaned.is_empty() {
            let snapshot = MigrationSnapshot {
                generation_id: from_generation,
                sessions: orphaned,
                created_at: Utc::now(),
            };
            if let Err(e) = self.migration_store.persist(&snapshot) {
                warn!(error = %e, "failed to persist migration snapshot");
            }
        }
    }

    /// Least-loaded healthy worker outside `excluded_generation`, preferring
    /// the active generation
    fn select_migration_target(&self, excluded_generation: u64) -> Option<Arc<Worker>> {
        let active = self.active_generation();

        let mut candidates: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .map(|e| Arc::clone(e.value()))
            .filter(|w| w.generation_id() != excluded_generation && w.is_healthy())
            .collect();
        candidates.sort_by_key(|w| {
            let active_bonus = if Some(w.generation_id()) == active { 0 } else { 1 };
            (active_bonus, w.active_sessions())
        });
        candidates.into_iter().next()
    }

    /// Evaluate the active worker's error rate; a breach emits
    /// `rollback:needed` and rolls back to the previous generation when it
    /// is still available.
    pub async fn check_error_rates(self: &Arc<Self>) {
        let Some(active_id) = self.active_generation() else {
            return;
        };

        for worker in self.workers_of(active_id) {
            let Some(rate) = worker.error_rate(self.rollover.min_requests_for_rate) else {
                continue;
            };
            if rate <= self.rollover.error_rate_threshold {
                continue;
            }

            warn!(
                generation = active_id,
                rate,
                threshold = self.rollover.error_rate_threshold,
                "error rate breached"
            );
            self.events.emit_generation(GenerationEvent::RollbackNeeded {
                generation_id: active_id,
                error_rate: rate,
            });
            self.rollback(active_id).await;
            return;
        }
    }

    /// Roll back from a breaching generation to its closest available
    /// predecessor.
    async fn rollback(self: &Arc<Self>, from_generation: u64) {
        let _slot = self.control.lock().await;

        // The closest earlier generation whose worker is not stopped.
        let target = {
            let inner = self.inner.read();
            inner
                .generations
                .range(..from_generation)
                .rev()
                .find(|(_, g)| g.state() != GenerationState::Retired)
                .map(|(id, _)| *id)
        };
        let Some(target_id) = target else {
            warn!(
                generation = from_generation,
                "rollback needed but no previous generation is available"
            );
            return;
        };

        if let Some(generation) = self.generation(target_id) {
            generation.set_state(GenerationState::Active);
        }
        for worker in self.workers_of(target_id) {
            worker.set_state(WorkerState::Healthy);
        }
        info!(from = from_generation, to = target_id, "rolled back");

        drop(_slot);
        self.begin_drain(from_generation);
    }

    /// Run the error-rate guard on a cadence until cancelled
    pub fn spawn_guard(self: &Arc<Self>, cancel: CancellationToken) {
        let controller = Arc::clone(self);
        let interval = Duration::from_millis(self.rollover.health_check_interval_ms);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => controller.check_error_rates().await,
                }
            }
        });
    }

    /// Pin a session to a worker.
    ///
    /// An existing pin is honoured while its worker stays healthy; otherwise
    /// the least-loaded healthy worker of the target generation is chosen.
    /// `None` means the caller must fail the request as service-unavailable.
    #[must_use]
    pub fn assign_worker(&self, session_id: &str, generation_id: Option<u64>) -> Option<Arc<Worker>> {
        if let Some(existing) = self.pins.get(session_id) {
            if let Some(worker) = self.worker(existing.value()) {
                if worker.is_healthy() || worker.state() == WorkerState::Draining {
                    return Some(worker);
                }
            }
        }

        let target_generation = generation_id.or_else(|| self.active_generation())?;
        let candidate = self
            .workers_of(target_generation)
            .into_iter()
            .filter(|w| w.is_healthy())
            .min_by_key(|w| w.active_sessions())?;

        // Replacing a dead pin releases the old worker's count.
        if let Some((_, old_worker_id)) = self.pins.remove(session_id) {
            if let Some(old) = self.worker(&old_worker_id) {
                old.session_ended();
            }
        }

        candidate.session_started();
        self.pins
            .insert(session_id.to_string(), candidate.id().to_string());
        Some(candidate)
    }

    /// Release a session's pin
    pub fn release_session(&self, session_id: &str) {
        if let Some((_, worker_id)) = self.pins.remove(session_id) {
            if let Some(worker) = self.worker(&worker_id) {
                worker.session_ended();
            }
        }
    }

    /// Record a request outcome against the session's pinned worker
    pub fn record_result(&self, session_id: &str, success: bool) {
        if let Some(pin) = self.pins.get(session_id) {
            if let Some(worker) = self.worker(pin.value()) {
                worker.record_result(success);
            }
        }
    }

    /// Total sessions pinned across all workers
    #[must_use]
    pub fn pinned_sessions(&self) -> usize {
        self.pins.len()
    }

    /// Shut everything down: release every pin, stop every worker, retire
    /// every generation.
    pub async fn shutdown(self: &Arc<Self>) {
        let _slot = self.control.lock().await;

        let sessions: Vec<String> = self.pins.iter().map(|e| e.key().clone()).collect();
        for session in sessions {
            self.release_session(&session);
        }

        let workers: Vec<Arc<Worker>> =
            self.workers.iter().map(|e| Arc::clone(e.value())).collect();
        for worker in workers {
            worker.stop().await;
        }

        let generations: Vec<Arc<ConfigGeneration>> =
            self.inner.read().generations.values().cloned().collect();
        for generation in generations {
            generation.set_state(GenerationState::Retired);
        }
        info!("rollover controller shut down");
    }
}
