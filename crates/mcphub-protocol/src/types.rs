//! MCP message types the hub multiplexes.
//!
//! The hub is transparent to most payloads; only the subset needed for
//! aggregation, routing and version adaptation is modelled. Descriptor
//! metadata the hub does not interpret stays as raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Method name constants for the downstream and upstream surfaces
pub mod methods {
    /// Initialization handshake
    pub const INITIALIZE: &str = "initialize";
    /// Liveness probe
    pub const PING: &str = "ping";
    /// List tools
    pub const TOOLS_LIST: &str = "tools/list";
    /// Call a tool
    pub const TOOLS_CALL: &str = "tools/call";
    /// List resources
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Read a resource
    pub const RESOURCES_READ: &str = "resources/read";
    /// List resource templates
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    /// List prompts
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Get a prompt
    pub const PROMPTS_GET: &str = "prompts/get";
    /// Client finished initialization
    pub const NOTIF_INITIALIZED: &str = "notifications/initialized";
    /// Tool list changed
    pub const NOTIF_TOOLS_CHANGED: &str = "notifications/tools/list_changed";
    /// Resource list changed
    pub const NOTIF_RESOURCES_CHANGED: &str = "notifications/resources/list_changed";
    /// Prompt list changed
    pub const NOTIF_PROMPTS_CHANGED: &str = "notifications/prompts/list_changed";
    /// Progress update for a long-running request
    pub const NOTIF_PROGRESS: &str = "notifications/progress";
    /// Best-effort cancellation of an in-flight request
    pub const NOTIF_CANCELLED: &str = "notifications/cancelled";
}

/// Implementation info exchanged during initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name
    pub name: String,
    /// Implementation version
    pub version: String,
    /// Optional human-readable title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Tool name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema describing the tool arguments
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Canonicalise a tool input schema.
///
/// A missing schema becomes `{"type":"object","properties":{}}`; a schema
/// without a `type` field gets `"object"` filled in.
#[must_use]
pub fn canonicalize_input_schema(schema: Option<Value>) -> Value {
    match schema {
        None | Some(Value::Null) => default_input_schema(),
        Some(Value::Object(mut map)) => {
            if !map.contains_key("type") {
                map.insert("type".to_string(), Value::String("object".to_string()));
            }
            Value::Object(map)
        }
        // Non-object schemas are upstream bugs; pass them through untouched.
        Some(other) => other,
    }
}

/// Resource definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource URI
    pub uri: String,
    /// Resource name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Resource template definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    /// URI template (RFC 6570)
    pub uri_template: String,
    /// Template name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of matching resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Prompt argument definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument is required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// Prompt definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    /// Prompt name
    pub name: String,
    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Accepted arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// Content block in a tool result or prompt message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Content {
    /// Plain text content
    #[serde(rename_all = "camelCase")]
    Text {
        /// The text body
        text: String,
    },
    /// Base64-encoded image content
    #[serde(rename_all = "camelCase")]
    Image {
        /// Base64 payload
        data: String,
        /// MIME type
        mime_type: String,
    },
    /// Embedded resource content
    #[serde(rename_all = "camelCase")]
    Resource {
        /// The embedded resource body
        resource: Value,
    },
}

impl Content {
    /// Convenience constructor for text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Request metadata carried under `_meta`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Progress token for streaming progress back to the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
}

/// Progress token supplied by a downstream caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// String token
    String(String),
    /// Numeric token
    Number(i64),
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// `tools/call` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequest {
    /// Tool name
    pub name: String,
    /// Tool arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    /// Request metadata
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

/// `tools/call` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// Result content blocks
    pub content: Vec<Content>,
    /// Whether the tool reported a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// `resources/read` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceRequest {
    /// Resource URI
    pub uri: String,
}

/// One element of a `resources/read` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    /// Resource URI
    pub uri: String,
    /// MIME type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text body, when textual
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 body, when binary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// `resources/read` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// Contents of the resource
    pub contents: Vec<ResourceContents>,
}

/// `prompts/get` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptRequest {
    /// Prompt name
    pub name: String,
    /// Prompt arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
}

/// Message within a prompt result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Speaker role
    pub role: String,
    /// Message content
    pub content: Content,
}

/// `prompts/get` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptResult {
    /// Prompt description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rendered messages
    pub messages: Vec<PromptMessage>,
}

/// `tools/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// Tool definitions
    pub tools: Vec<Tool>,
}

/// `resources/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    /// Resource definitions
    pub resources: Vec<Resource>,
}

/// `resources/templates/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceTemplatesResult {
    /// Resource template definitions
    pub resource_templates: Vec<ResourceTemplate>,
}

/// `prompts/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPromptsResult {
    /// Prompt definitions
    pub prompts: Vec<Prompt>,
}

/// Capability flag carrying `listChanged`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChangedCapability {
    /// Whether list-changed notifications are emitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Resources capability flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    /// Whether resource subscriptions are supported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    /// Whether list-changed notifications are emitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Server capability advertisement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tools capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
    /// Resources capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    /// Prompts capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
    /// Experimental capabilities, passed through opaquely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// Client capability advertisement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// `initialize` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    /// Requested protocol version
    pub protocol_version: String,
    /// Client capabilities
    pub capabilities: ClientCapabilities,
    /// Client implementation info
    pub client_info: Implementation,
}

/// `initialize` result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Accepted protocol version
    pub protocol_version: String,
    /// Server capabilities
    pub capabilities: ServerCapabilities,
    /// Server implementation info
    pub server_info: Implementation,
}

/// `notifications/progress` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    /// Correlating token
    pub progress_token: ProgressToken,
    /// Increment-only counter
    pub progress: u64,
    /// Total, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// `notifications/cancelled` parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    /// Identifier of the request to cancel
    pub request_id: Value,
    /// Optional reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_canonicalisation() {
        let filled = canonicalize_input_schema(None);
        assert_eq!(filled, json!({"type": "object", "properties": {}}));

        let typed = canonicalize_input_schema(Some(json!({"properties": {"x": {}}})));
        assert_eq!(typed["type"], "object");
        assert_eq!(typed["properties"]["x"], json!({}));

        let untouched = canonicalize_input_schema(Some(json!({"type": "array"})));
        assert_eq!(untouched["type"], "array");
    }

    #[test]
    fn test_tool_default_schema_on_deserialize() {
        let tool: Tool = serde_json::from_value(json!({"name": "echo"})).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_content_tagged_serialisation() {
        let content = Content::text("hi");
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json, json!({"type": "text", "text": "hi"}));

        let image: Content =
            serde_json::from_value(json!({"type": "image", "data": "QUJD", "mimeType": "image/png"}))
                .unwrap();
        assert!(matches!(image, Content::Image { .. }));
    }

    #[test]
    fn test_call_tool_meta_roundtrip() {
        let request: CallToolRequest = serde_json::from_value(json!({
            "name": "echo",
            "arguments": {"text": "hi"},
            "_meta": {"progressToken": "pt-1"}
        }))
        .unwrap();

        assert_eq!(
            request.meta.as_ref().unwrap().progress_token,
            Some(ProgressToken::String("pt-1".to_string()))
        );

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["_meta"]["progressToken"], "pt-1");
    }

    #[test]
    fn test_initialize_roundtrip() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {
                "tools": {"listChanged": true},
                "resources": {"listChanged": true}
            },
            "serverInfo": {"name": "upstream", "version": "1.0.0"}
        }))
        .unwrap();

        assert_eq!(result.protocol_version, "2025-06-18");
        assert_eq!(result.capabilities.tools.unwrap().list_changed, Some(true));
        assert_eq!(result.server_info.name, "upstream");
    }

    #[test]
    fn test_progress_params_wire_shape() {
        let params = ProgressParams {
            progress_token: ProgressToken::String("pt-1".to_string()),
            progress: 2,
            total: None,
        };
        let wire = serde_json::to_value(&params).unwrap();
        assert_eq!(wire, json!({"progressToken": "pt-1", "progress": 2}));
    }
}
