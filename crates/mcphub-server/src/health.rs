//! Liveness/readiness aggregation.
//!
//! Probes are registered per `(component, name)`. A critical probe failing
//! `failure_threshold` consecutive times degrades the overall state to
//! `Failing` and then `Failed`; non-critical failures yield `NotReady`;
//! all-green yields `Ready` and records `ready_at` once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mcphub_core::Result;

/// Overall hub health
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverallHealth {
    /// Startup in progress
    Starting,
    /// Everything green
    Ready,
    /// Non-critical degradation
    NotReady,
    /// Critical probes failing
    Failing,
    /// Critical probes failed beyond recovery
    Failed,
}

type ProbeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type ProbeFn = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

/// A registered health probe
#[derive(Clone)]
pub struct Probe {
    /// Component the probe belongs to
    pub component: String,
    /// Probe name, unique within the component
    pub name: String,
    /// Whether failure degrades overall health to failing
    pub critical: bool,
    /// Per-run deadline
    pub timeout: Duration,
    check: ProbeFn,
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe")
            .field("component", &self.component)
            .field("name", &self.name)
            .field("critical", &self.critical)
            .finish()
    }
}

impl Probe {
    /// Create a probe from an async check
    pub fn new<F, Fut>(
        component: impl Into<String>,
        name: impl Into<String>,
        critical: bool,
        timeout: Duration,
        check: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            component: component.into(),
            name: name.into(),
            critical,
            timeout,
            check: Arc::new(move || Box::pin(check())),
        }
    }
}

#[derive(Debug)]
struct ProbeEntry {
    probe: Probe,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Result of one probe evaluation round
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeReport {
    /// Component name
    pub component: String,
    /// Probe name
    pub name: String,
    /// Whether the probe passed
    pub healthy: bool,
    /// Consecutive failures so far
    pub consecutive_failures: u32,
    /// Last failure message
    pub last_error: Option<String>,
}

/// Health monitor aggregating registered probes
pub struct HealthMonitor {
    probes: RwLock<Vec<ProbeEntry>>,
    state: RwLock<OverallHealth>,
    ready_at: RwLock<Option<DateTime<Utc>>>,
    failure_threshold: u32,
    /// Consecutive failing rounds before Failing becomes Failed
    failed_after_rounds: u32,
    failing_rounds: RwLock<u32>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("state", &*self.state.read())
            .field("probes", &self.probes.read().len())
            .finish()
    }
}

impl HealthMonitor {
    /// Create a monitor; `failure_threshold` consecutive failures of a
    /// critical probe mark the hub failing
    #[must_use]
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            probes: RwLock::new(Vec::new()),
            state: RwLock::new(OverallHealth::Starting),
            ready_at: RwLock::new(None),
            failure_threshold: failure_threshold.max(1),
            failed_after_rounds: 3,
            failing_rounds: RwLock::new(0),
        }
    }

    /// Register a probe
    pub fn register(&self, probe: Probe) {
        self.probes.write().push(ProbeEntry {
            probe,
            consecutive_failures: 0,
            last_error: None,
        });
    }

    /// Remove every probe of a component
    pub fn unregister_component(&self, component: &str) {
        self.probes
            .write()
            .retain(|entry| entry.probe.component != component);
    }

    /// Current overall state
    #[must_use]
    pub fn state(&self) -> OverallHealth {
        *self.state.read()
    }

    /// When the hub first became ready
    #[must_use]
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        *self.ready_at.read()
    }

    /// Evaluate every probe once and update the overall state
    pub async fn run_once(&self) -> Vec<ProbeReport> {
        let probes: Vec<Probe> = self
            .probes
            .read()
            .iter()
            .map(|entry| entry.probe.clone())
            .collect();

        let mut outcomes = Vec::with_capacity(probes.len());
        for probe in probes {
            let outcome = match tokio::time::timeout(probe.timeout, (probe.check)()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("probe timed out after {:?}", probe.timeout)),
            };
            outcomes.push((probe.component, probe.name, outcome));
        }

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut any_noncritical_failure = false;
        let mut any_critical_breach = false;

        {
            let mut entries = self.probes.write();
            for (component, name, outcome) in outcomes {
                let Some(entry) = entries
                    .iter_mut()
                    .find(|e| e.probe.component == component && e.probe.name == name)
                else {
                    continue;
                };

                match outcome {
                    Ok(()) => {
                        entry.consecutive_failures = 0;
                        entry.last_error = None;
                    }
                    Err(message) => {
                        entry.consecutive_failures += 1;
                        entry.last_error = Some(message.clone());
                        if entry.probe.critical {
                            if entry.consecutive_failures >= self.failure_threshold {
                                any_critical_breach = true;
                            } else {
                                any_noncritical_failure = true;
                            }
                        } else {
                            any_noncritical_failure = true;
                        }
                        warn!(
                            component = %entry.probe.component,
                            probe = %entry.probe.name,
                            failures = entry.consecutive_failures,
                            "health probe failed: {message}"
                        );
                    }
                }

                reports.push(ProbeReport {
                    component: entry.probe.component.clone(),
                    name: entry.probe.name.clone(),
                    healthy: entry.consecutive_failures == 0,
                    consecutive_failures: entry.consecutive_failures,
                    last_error: entry.last_error.clone(),
                });
            }
        }

        self.transition(any_critical_breach, any_noncritical_failure);
        reports
    }

    fn transition(&self, critical_breach: bool, noncritical_failure: bool) {
        let mut state = self.state.write();
        let mut failing_rounds = self.failing_rounds.write();

        *state = if critical_breach {
            *failing_rounds += 1;
            if *failing_rounds >= self.failed_after_rounds || *state == OverallHealth::Failed {
                OverallHealth::Failed
            } else {
                OverallHealth::Failing
            }
        } else if noncritical_failure {
            *failing_rounds = 0;
            OverallHealth::NotReady
        } else {
            *failing_rounds = 0;
            let mut ready_at = self.ready_at.write();
            if ready_at.is_none() {
                *ready_at = Some(Utc::now());
                debug!("hub became ready");
            }
            OverallHealth::Ready
        };
    }

    /// Run probe rounds on a cadence until cancelled
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let _ = monitor.run_once().await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcphub_core::HubError;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ok_probe(component: &str, name: &str, critical: bool) -> Probe {
        Probe::new(component, name, critical, Duration::from_secs(1), || async {
            Ok(())
        })
    }

    fn failing_probe(component: &str, name: &str, critical: bool) -> Probe {
        Probe::new(component, name, critical, Duration::from_secs(1), || async {
            Err(HubError::transport("down"))
        })
    }

    #[tokio::test]
    async fn test_all_green_becomes_ready_once() {
        let monitor = HealthMonitor::new(3);
        monitor.register(ok_probe("upstream", "srv_a", true));

        assert_eq!(monitor.state(), OverallHealth::Starting);
        monitor.run_once().await;
        assert_eq!(monitor.state(), OverallHealth::Ready);

        let first_ready = monitor.ready_at().unwrap();
        monitor.run_once().await;
        assert_eq!(monitor.ready_at().unwrap(), first_ready);
    }

    #[tokio::test]
    async fn test_noncritical_failure_is_not_ready() {
        let monitor = HealthMonitor::new(3);
        monitor.register(ok_probe("upstream", "srv_a", true));
        monitor.register(failing_probe("upstream", "srv_b", false));

        monitor.run_once().await;
        assert_eq!(monitor.state(), OverallHealth::NotReady);
    }

    #[tokio::test]
    async fn test_critical_breach_escalates_to_failed() {
        let monitor = HealthMonitor::new(2);
        monitor.register(failing_probe("upstream", "srv_a", true));

        // First round: below threshold, treated as degradation.
        monitor.run_once().await;
        assert_eq!(monitor.state(), OverallHealth::NotReady);

        // Threshold reached: failing.
        monitor.run_once().await;
        assert_eq!(monitor.state(), OverallHealth::Failing);

        monitor.run_once().await;
        monitor.run_once().await;
        assert_eq!(monitor.state(), OverallHealth::Failed);
    }

    #[tokio::test]
    async fn test_recovery_resets_failure_count() {
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&healthy);
        let monitor = HealthMonitor::new(2);
        monitor.register(Probe::new(
            "upstream",
            "srv_a",
            true,
            Duration::from_secs(1),
            move || {
                let flag = Arc::clone(&flag);
                async move {
                    if flag.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(HubError::transport("down"))
                    }
                }
            },
        ));

        monitor.run_once().await;
        healthy.store(true, Ordering::SeqCst);
        monitor.run_once().await;
        assert_eq!(monitor.state(), OverallHealth::Ready);
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        let monitor = HealthMonitor::new(1);
        monitor.register(Probe::new(
            "upstream",
            "slow",
            true,
            Duration::from_millis(10),
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        ));

        let reports = monitor.run_once().await;
        assert!(!reports[0].healthy);
        assert!(reports[0].last_error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unregister_component() {
        let monitor = HealthMonitor::new(3);
        monitor.register(failing_probe("upstream", "srv_a", false));
        monitor.unregister_component("upstream");

        monitor.run_once().await;
        assert_eq!(monitor.state(), OverallHealth::Ready);
    }
}
