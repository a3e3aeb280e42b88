//! # mcphub-core
//!
//! Foundation crate for the mcphub MCP hub: the error taxonomy, core
//! identifier types, session management, redaction and the typed event bus
//! shared by the other workspace crates.
//!
//! ## Architecture
//!
//! ```text
//! mcphub-core/
//! ├── error/          # Closed error taxonomy with severity and context
//! ├── types/          # ServerId, MessageId, shared constants
//! ├── session/        # Idle-TTL session table with sweeper and share tokens
//! ├── redact/         # Key- and pattern-based secret redaction
//! ├── logring/        # Bounded recent-log ring for crash dumps
//! └── events/         # Typed broadcast topics per event family
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod error;
pub mod events;
pub mod logring;
pub mod redact;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use error::{ErrorExt, ErrorKind, HubError, Result, Severity};
pub use events::{
    CapabilityEvent, CapabilityKind, EventBus, GenerationEvent, ProgressEvent, ServerEvent,
};
pub use logring::{LogLine, LogRing};
pub use redact::{Redactor, REDACTED};
pub use session::{Session, SessionConfig, SessionManager};
pub use types::{MessageId, ServerId, MAX_LOCAL_NAME_LEN, MAX_SERVER_ID_LEN};

/// Maximum message size in bytes (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default timeout for operations in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
