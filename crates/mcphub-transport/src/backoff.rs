//! Reconnect policy and connection-error classification.
//!
//! Delays grow exponentially and are capped at 30 seconds; the overall
//! budget is bounded both by attempt count and by total elapsed duration.
//! Error-handling recursion is bounded by an explicit depth and step guard
//! so that a reconnect failure can never feed back into itself unbounded.

use std::time::{Duration, Instant};

use crate::core::{TransportError, TransportResult};

/// Hard cap on a single reconnect delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Default bound on error-handling recursion depth
pub const DEFAULT_MAX_DEPTH: u32 = 32;

/// Default bound on total error-handling steps
pub const DEFAULT_MAX_STEPS: u64 = 10_000;

/// Exponential reconnect policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Base delay for the first reconnect
    pub base_delay: Duration,
    /// Maximum number of reconnect attempts (None for unlimited)
    pub max_attempts: Option<u32>,
    /// Maximum total duration spent reconnecting
    pub max_total_duration: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_attempts: Some(10),
            max_total_duration: Some(Duration::from_secs(300)),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the k-th reconnect (1-based): `min(base * 2^(k-1), 30s)`.
    ///
    /// Returns `None` once the attempt budget is exhausted.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let exponent = attempt.saturating_sub(1).min(31);
        let raw_ms = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exponent);
        let capped = raw_ms.min(MAX_RECONNECT_DELAY.as_millis() as u64);
        Some(Duration::from_millis(capped))
    }

    /// Delay with deterministic jitter derived from the attempt number.
    ///
    /// Jitter is within ±25% of the capped delay and avoids a shared random
    /// source so concurrent reconnects stay spread out but reproducible.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32) -> Option<Duration> {
        let capped = self.delay(attempt)?.as_millis() as u64;
        if capped == 0 {
            return Some(Duration::ZERO);
        }
        let jitter_range = capped / 4;
        let jitter_offset = if jitter_range > 0 {
            let hash = (attempt as u64)
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            hash % (jitter_range * 2)
        } else {
            0
        };
        let final_delay = capped
            .saturating_sub(jitter_range)
            .saturating_add(jitter_offset);
        Some(Duration::from_millis(final_delay))
    }

    /// Whether the total duration budget is exhausted
    #[must_use]
    pub fn duration_exhausted(&self, started_at: Instant) -> bool {
        self.max_total_duration
            .is_some_and(|max| started_at.elapsed() >= max)
    }
}

/// Guard bounding pathological error-handling loops.
///
/// Each nested error-handling entry descends a level; each handled error
/// counts a step. Exceeding either bound short-circuits to a terminal error
/// so the caller marks the upstream crashed instead of retrying further.
#[derive(Debug)]
pub struct ReconnectGuard {
    depth: u32,
    steps: u64,
    max_depth: u32,
    max_steps: u64,
}

impl ReconnectGuard {
    /// Create a guard with the given bounds
    #[must_use]
    pub fn new(max_depth: u32, max_steps: u64) -> Self {
        Self {
            depth: 0,
            steps: 0,
            max_depth,
            max_steps,
        }
    }

    /// Enter one level of error handling
    pub fn descend(&mut self) -> TransportResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(TransportError::ReconnectExhausted(format!(
                "error-handling depth exceeded {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    /// Leave one level of error handling
    pub fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Count one handled error
    pub fn step(&mut self) -> TransportResult<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(TransportError::ReconnectExhausted(format!(
                "error-handling steps exceeded {}",
                self.max_steps
            )));
        }
        Ok(())
    }

    /// Current depth
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Total steps taken
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Default for ReconnectGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH, DEFAULT_MAX_STEPS)
    }
}

/// Classification of a failed connection attempt, driving the two-pass
/// connect strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorClass {
    /// Server rejected the session id; retry without it
    NoSession,
    /// Server speaks an older protocol; renegotiate downward
    LegacyProtocol,
    /// Server does not know the method; treat per caller policy
    MethodNotFound,
    /// Network-level failure; retry with the alternate transport
    TransportError,
    /// Terminal failure (auth, not-found); do not retry
    Fatal,
}

/// Classify a connection error from its HTTP status and message text
#[must_use]
pub fn classify_connect_error(status: Option<u16>, message: &str) -> ConnectErrorClass {
    if let Some(status) = status {
        if matches!(status, 401 | 403 | 404) {
            return ConnectErrorClass::Fatal;
        }
    }

    let lowered = message.to_lowercase();
    if lowered.contains("session") && (lowered.contains("unknown") || lowered.contains("invalid")) {
        ConnectErrorClass::NoSession
    } else if lowered.contains("protocol") && lowered.contains("version") {
        ConnectErrorClass::LegacyProtocol
    } else if lowered.contains("method not found") || lowered.contains("-32601") {
        ConnectErrorClass::MethodNotFound
    } else {
        ConnectErrorClass::TransportError
    }
}

/// Whether an HTTP status is worth retrying
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}
