//! Workers: one running hub instance bound to a config generation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::hub::Hub;
use mcphub_core::Result;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Hub construction in progress
    Initializing,
    /// Built; inside the warmup window
    WarmingUp,
    /// Passed health gating; accepting sessions
    Healthy,
    /// Failed health gating or error-rate guard
    Unhealthy,
    /// Finishing existing sessions, accepting no new ones
    Draining,
    /// Stopped
    Stopped,
}

/// One running hub bound to a generation
pub struct Worker {
    id: String,
    generation_id: u64,
    hub: Arc<Hub>,
    state: RwLock<WorkerState>,
    active_sessions: AtomicUsize,
    error_count: AtomicU64,
    request_count: AtomicU64,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &*self.state.read())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

impl Worker {
    /// Create a worker for a generation; `index` disambiguates pool members
    #[must_use]
    pub fn new(generation_id: u64, index: usize, hub: Arc<Hub>) -> Arc<Self> {
        let id = if index == 0 {
            format!("worker-{generation_id}")
        } else {
            format!("worker-{generation_id}-{index}")
        };
        Arc::new(Self {
            id,
            generation_id,
            hub,
            state: RwLock::new(WorkerState::Initializing),
            active_sessions: AtomicUsize::new(0),
            error_count: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
        })
    }

    /// Worker identifier (`worker-<generation>[-<n>]`)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Generation this worker belongs to
    #[must_use]
    pub fn generation_id(&self) -> u64 {
        self.generation_id
    }

    /// The worker's hub
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Update the state
    pub fn set_state(&self, state: WorkerState) {
        debug!(worker = %self.id, ?state, "worker state change");
        *self.state.write() = state;
    }

    /// Whether the worker accepts new sessions
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state() == WorkerState::Healthy
    }

    /// Sessions currently pinned to this worker
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Account a session pin
    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
    }

    /// Account a session release
    pub fn session_ended(&self) {
        let previous = self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "session counter underflow on {}", self.id);
    }

    /// Record a request outcome for the error-rate guard
    pub fn record_result(&self, success: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Requests observed so far
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Errors observed so far
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Error rate, once at least `min_requests` were observed
    #[must_use]
    pub fn error_rate(&self, min_requests: u64) -> Option<f64> {
        let requests = self.request_count();
        if requests < min_requests.max(1) {
            return None;
        }
        Some(self.error_count() as f64 / requests as f64)
    }

    /// Probe the worker's upstreams
    pub async fn probe(&self) -> Result<()> {
        self.hub.probe_upstreams().await
    }

    /// Stop the worker and its hub
    pub async fn stop(&self) {
        self.set_state(WorkerState::Stopped);
        self.hub.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubOptions;

    fn empty_worker(generation: u64, index: usize) -> Arc<Worker> {
        Worker::new(generation, index, Hub::new(HubOptions::default()))
    }

    #[test]
    fn test_worker_id_format() {
        assert_eq!(empty_worker(3, 0).id(), "worker-3");
        assert_eq!(empty_worker(3, 2).id(), "worker-3-2");
    }

    #[test]
    fn test_session_accounting() {
        let worker = empty_worker(1, 0);
        worker.session_started();
        worker.session_started();
        assert_eq!(worker.active_sessions(), 2);
        worker.session_ended();
        assert_eq!(worker.active_sessions(), 1);
    }

    #[test]
    fn test_error_rate_needs_minimum_requests() {
        let worker = empty_worker(1, 0);
        worker.record_result(false);
        assert_eq!(worker.error_rate(10), None);

        for _ in 0..9 {
            worker.record_result(true);
        }
        let rate = worker.error_rate(10).unwrap();
        assert!((rate - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_probe_with_no_upstreams_is_healthy() {
        let worker = empty_worker(1, 0);
        assert!(worker.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_marks_stopped() {
        let worker = empty_worker(1, 0);
        worker.set_state(WorkerState::Healthy);
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.is_healthy());
    }
}
