//! Typed event topics for the hub.
//!
//! One broadcast topic per event family replaces ad-hoc emitters. Lifecycle
//! and generation topics are sized generously and treated as lossless;
//! the progress topic is explicitly lossy for slow subscribers (progress
//! notifications may be dropped, final results never travel on this bus).

use tokio::sync::broadcast;

use crate::types::ServerId;

/// Capacity of the lossless lifecycle/capability/generation topics
const LIFECYCLE_TOPIC_CAPACITY: usize = 256;

/// Capacity of the lossy progress topic
const PROGRESS_TOPIC_CAPACITY: usize = 64;

/// Upstream server lifecycle events
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A server was mounted into the hub
    Mounted {
        /// Server identifier
        server_id: ServerId,
    },
    /// A server was unmounted from the hub
    Unmounted {
        /// Server identifier
        server_id: ServerId,
    },
    /// A supervisor reached the running state
    Started {
        /// Server identifier
        server_id: ServerId,
    },
    /// A supervisor observed a crash
    Crashed {
        /// Server identifier
        server_id: ServerId,
        /// Crash reason
        reason: String,
    },
    /// A supervisor stopped cleanly
    Stopped {
        /// Server identifier
        server_id: ServerId,
    },
}

/// Which capability family changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    /// Tools registry changed
    Tools,
    /// Resources registry changed
    Resources,
    /// Resource templates registry changed
    ResourceTemplates,
    /// Prompts registry changed
    Prompts,
}

/// Capability registry change events
#[derive(Debug, Clone)]
pub struct CapabilityEvent {
    /// Which registry changed
    pub kind: CapabilityKind,
    /// Server whose registration caused the change
    pub server_id: ServerId,
}

/// Generation/rollover events
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A generation became active
    Activated {
        /// Generation identifier
        generation_id: u64,
    },
    /// The active worker breached the error-rate threshold
    RollbackNeeded {
        /// Generation identifier
        generation_id: u64,
        /// Observed error rate
        error_rate: f64,
    },
    /// A generation was retired
    Retired {
        /// Generation identifier
        generation_id: u64,
    },
}

/// Progress notification events, correlated by token
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Progress token supplied by the downstream caller
    pub token: String,
    /// Increment-only progress counter
    pub progress: u64,
    /// Total, when known
    pub total: Option<u64>,
}

/// The hub's event topics
#[derive(Debug)]
pub struct EventBus {
    servers: broadcast::Sender<ServerEvent>,
    capabilities: broadcast::Sender<CapabilityEvent>,
    generations: broadcast::Sender<GenerationEvent>,
    progress: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    /// Create a new event bus
    #[must_use]
    pub fn new() -> Self {
        let (servers, _) = broadcast::channel(LIFECYCLE_TOPIC_CAPACITY);
        let (capabilities, _) = broadcast::channel(LIFECYCLE_TOPIC_CAPACITY);
        let (generations, _) = broadcast::channel(LIFECYCLE_TOPIC_CAPACITY);
        let (progress, _) = broadcast::channel(PROGRESS_TOPIC_CAPACITY);
        Self {
            servers,
            capabilities,
            generations,
            progress,
        }
    }

    /// Publish a server lifecycle event
    pub fn emit_server(&self, event: ServerEvent) {
        let _ = self.servers.send(event);
    }

    /// Publish a capability change event
    pub fn emit_capability(&self, event: CapabilityEvent) {
        let _ = self.capabilities.send(event);
    }

    /// Publish a generation event
    pub fn emit_generation(&self, event: GenerationEvent) {
        let _ = self.generations.send(event);
    }

    /// Publish a progress event
    pub fn emit_progress(&self, event: ProgressEvent) {
        let _ = self.progress.send(event);
    }

    /// Subscribe to server lifecycle events
    #[must_use]
    pub fn subscribe_servers(&self) -> broadcast::Receiver<ServerEvent> {
        self.servers.subscribe()
    }

    /// Subscribe to capability change events
    #[must_use]
    pub fn subscribe_capabilities(&self) -> broadcast::Receiver<CapabilityEvent> {
        self.capabilities.subscribe()
    }

    /// Subscribe to generation events
    #[must_use]
    pub fn subscribe_generations(&self) -> broadcast::Receiver<GenerationEvent> {
        self.generations.subscribe()
    }

    /// Subscribe to progress events
    #[must_use]
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
