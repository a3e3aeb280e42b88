//! # mcphub-transport
//!
//! Upstream transports for the mcphub MCP hub.
//!
//! Three concrete transports share the [`Transport`] trait:
//!
//! - [`child_process::ChildProcessTransport`] spawns an upstream server as a
//!   child process and frames newline-delimited JSON-RPC over its stdio.
//! - [`http::StreamableHttpTransport`] POSTs JSON-RPC documents and handles
//!   both plain JSON and streamed (`text/event-stream`) responses, with
//!   session-id header capture and echo.
//! - [`sse::SseTransport`] holds a long-lived event stream open and posts
//!   requests on the companion endpoint the server announces.
//!
//! The [`backoff`] module bounds every reconnect path; [`origin_cache`]
//! remembers per-origin connection hints across attempts and restarts.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod backoff;
pub mod child_process;
pub mod core;
pub mod http;
pub mod origin_cache;
pub mod sse;
pub mod testing;

pub use backoff::{
    classify_connect_error, is_retryable_status, ConnectErrorClass, ReconnectGuard,
    ReconnectPolicy, MAX_RECONNECT_DELAY,
};
pub use child_process::{ChildProcessConfig, ChildProcessTransport, SpawnKind};
pub use core::{
    AuthConfig, HeaderMap, Transport, TransportCapabilities, TransportError, TransportEvent,
    TransportEventEmitter, TransportMessage, TransportMetrics, TransportResult, TransportState,
    TransportTimeouts, TransportType,
};
pub use http::{parse_http_status, HttpTransportConfig, StreamableHttpTransport};
pub use origin_cache::{
    origin_key, select_transport, validate_remote_url, OriginCache, OriginHint,
    RemoteTransportMode, DEFAULT_ORIGIN_TTL,
};
pub use sse::{SseFrame, SseParser, SseTransport, SseTransportConfig};
