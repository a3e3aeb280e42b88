//! # mcphub-server
//!
//! The mcphub engine: everything between the downstream wire transport and
//! the upstream connectors.
//!
//! ## Architecture
//!
//! ```text
//! handlers ──▶ hub ──▶ router ──▶ supervisor ──▶ upstream client
//!                │        │
//!                │        └── progress broker (cadence timers)
//!                ├── registries (tools/resources/templates/prompts)
//!                ├── naming codec
//!                └── session table / event bus / metrics
//!
//! generation ──▶ worker ──▶ hub        (one hub per config generation)
//! ```
//!
//! The [`generation::RolloverController`] runs overlapping generations of
//! workers for zero-downtime reconfiguration; [`health::HealthMonitor`]
//! aggregates probe results into the readiness surface.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod config;
pub mod generation;
pub mod handlers;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod middleware;
pub mod naming;
pub mod registry;
pub mod router;
pub mod snapshot;
pub mod supervisor;
pub mod worker;

pub use config::{HubConfig, ServerConfig};
pub use generation::{
    ConfigGeneration, FileMigrationStore, GenerationState, MigrationSnapshot, MigrationStore,
    NullMigrationStore, RolloverController, WorkerFactory,
};
pub use handlers::{Handled, NotificationSink, RequestHandler};
pub use health::{HealthMonitor, OverallHealth, Probe};
pub use hub::{DuplicatePolicy, Hub, HubOptions, MountMode};
pub use metrics::{HubMetrics, MetricsSnapshot};
pub use middleware::{InterceptorChain, LoggingInterceptor, RequestInterceptor};
pub use naming::{NameCodec, NamingConfig, NamingStrategy};
pub use registry::{CapabilityRegistry, CollisionPolicy, RegisteredItem, RegistrationItem};
pub use router::{AllowAllGate, ProgressBroker, RequestCtx, RouteDecision, RouteGate, Router};
pub use snapshot::RegistrySnapshot;
pub use supervisor::{Supervisor, SupervisorOptions, UpstreamState};
pub use worker::{Worker, WorkerState};
