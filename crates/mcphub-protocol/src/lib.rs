//! # mcphub-protocol
//!
//! Model Context Protocol types for the mcphub hub: JSON-RPC 2.0 framing,
//! the MCP message subset the hub multiplexes, date-based protocol
//! versioning, and pure cross-version payload adaptation.
//!
//! The hub speaks the latest supported version internally; the
//! [`adapt`] module rewrites payloads for upstreams that negotiated an
//! older version.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod adapt;
pub mod jsonrpc;
pub mod types;
pub mod versioning;

pub use jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion, JSONRPC_VERSION,
};
pub use types::{
    CallToolRequest, CallToolResult, ClientCapabilities, Content, GetPromptRequest,
    GetPromptResult, Implementation, InitializeRequest, InitializeResult, ListChangedCapability,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    ProgressParams, ProgressToken, Prompt, PromptArgument, PromptMessage, ReadResourceRequest,
    ReadResourceResult, RequestMeta, Resource, ResourceContents, ResourceTemplate,
    ResourcesCapability, ServerCapabilities, Tool,
};
pub use versioning::{FeatureMap, ProtocolVersion, LATEST_PROTOCOL, SUPPORTED_PROTOCOLS};
