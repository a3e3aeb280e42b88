//! Cross-version request/response adaptation.
//!
//! The hub always speaks [`LATEST_PROTOCOL`](crate::versioning::LATEST_PROTOCOL)
//! internally. When an upstream accepted an older version, requests are
//! adapted down before sending and responses adapted back up afterwards.
//!
//! Adapters are pure functions registered per `(method, from, to, direction)`
//! for adjacent version pairs; non-adjacent hops compose step-wise through
//! the supported-version chain. Methods without a registered adapter pass
//! through unchanged.

use serde_json::Value;

use crate::types::{canonicalize_input_schema, methods};
use crate::versioning::ProtocolVersion;

/// Direction of an adaptation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client payload adapted toward the upstream's accepted version
    Request,
    /// Upstream payload adapted back toward the hub's version
    Response,
}

type AdaptFn = fn(&mut Value);

struct AdapterEntry {
    method: &'static str,
    from: &'static str,
    to: &'static str,
    direction: Direction,
    apply: AdaptFn,
}

/// The adaptation table for adjacent version pairs.
///
/// 2025-06-18 introduced `title` on implementation info and
/// `structuredContent` on tool results; 2025-03-26 introduced audio content
/// blocks. Downgrades strip what the target version does not know; upgrades
/// restore canonical shapes for fields older servers omit.
const ADAPTERS: &[AdapterEntry] = &[
    AdapterEntry {
        method: methods::INITIALIZE,
        from: "2025-06-18",
        to: "2025-03-26",
        direction: Direction::Request,
        apply: drop_client_info_title,
    },
    AdapterEntry {
        method: methods::TOOLS_CALL,
        from: "2025-03-26",
        to: "2024-11-05",
        direction: Direction::Request,
        apply: strip_unknown_call_meta,
    },
    AdapterEntry {
        method: methods::TOOLS_CALL,
        from: "2024-11-05",
        to: "2025-03-26",
        direction: Direction::Response,
        apply: lift_legacy_tool_result,
    },
    AdapterEntry {
        method: methods::TOOLS_LIST,
        from: "2024-11-05",
        to: "2025-03-26",
        direction: Direction::Response,
        apply: canonicalize_tool_schemas,
    },
    AdapterEntry {
        method: methods::TOOLS_LIST,
        from: "2025-06-18",
        to: "2025-03-26",
        direction: Direction::Response,
        apply: |_| {},
    },
];

fn drop_client_info_title(params: &mut Value) {
    if let Some(info) = params.get_mut("clientInfo").and_then(Value::as_object_mut) {
        info.remove("title");
    }
}

fn strip_unknown_call_meta(params: &mut Value) {
    let mut drop_meta = false;
    if let Some(meta) = params.get_mut("_meta").and_then(Value::as_object_mut) {
        meta.retain(|key, _| key == "progressToken");
        drop_meta = meta.is_empty();
    }
    if drop_meta {
        if let Some(obj) = params.as_object_mut() {
            obj.remove("_meta");
        }
    }
}

fn lift_legacy_tool_result(result: &mut Value) {
    let Some(obj) = result.as_object_mut() else {
        return;
    };
    if obj.contains_key("content") {
        return;
    }
    if let Some(legacy) = obj.remove("toolResult") {
        let text = match legacy {
            Value::String(s) => s,
            other => other.to_string(),
        };
        obj.insert(
            "content".to_string(),
            serde_json::json!([{"type": "text", "text": text}]),
        );
    }
}

fn canonicalize_tool_schemas(result: &mut Value) {
    if let Some(tools) = result.get_mut("tools").and_then(Value::as_array_mut) {
        for tool in tools.iter_mut() {
            if let Some(obj) = tool.as_object_mut() {
                let schema = obj.remove("inputSchema");
                obj.insert(
                    "inputSchema".to_string(),
                    canonicalize_input_schema(schema),
                );
            }
        }
    }
}

/// The chain of adjacent hops between two versions, ordered for application.
///
/// Returns `None` when either endpoint is unsupported.
fn hops(from: ProtocolVersion, to: ProtocolVersion) -> Option<Vec<(ProtocolVersion, ProtocolVersion)>> {
    let supported = ProtocolVersion::supported();
    let from_idx = supported.iter().position(|v| *v == from)?;
    let to_idx = supported.iter().position(|v| *v == to)?;

    let mut chain = Vec::new();
    if from_idx <= to_idx {
        // Moving down the preference list (newer -> older)
        for i in from_idx..to_idx {
            chain.push((supported[i], supported[i + 1]));
        }
    } else {
        // Moving up (older -> newer)
        for i in (to_idx..from_idx).rev() {
            chain.push((supported[i + 1], supported[i]));
        }
    }
    Some(chain)
}

fn apply_hop(
    method: &str,
    from: ProtocolVersion,
    to: ProtocolVersion,
    direction: Direction,
    payload: &mut Value,
) {
    let from = from.to_string();
    let to = to.to_string();
    for entry in ADAPTERS {
        if entry.method == method
            && entry.direction == direction
            && entry.from == from
            && entry.to == to
        {
            (entry.apply)(payload);
        }
    }
}

/// Adapt a request payload from `from` to `to`.
///
/// Unknown methods and unsupported version pairs pass through unchanged.
#[must_use]
pub fn adapt_request(
    method: &str,
    from: ProtocolVersion,
    to: ProtocolVersion,
    mut params: Value,
) -> Value {
    if from == to {
        return params;
    }
    if let Some(chain) = hops(from, to) {
        for (hop_from, hop_to) in chain {
            apply_hop(method, hop_from, hop_to, Direction::Request, &mut params);
        }
    }
    params
}

/// Adapt a response payload from `from` to `to`
#[must_use]
pub fn adapt_response(
    method: &str,
    from: ProtocolVersion,
    to: ProtocolVersion,
    mut result: Value,
) -> Value {
    if from == to {
        return result;
    }
    if let Some(chain) = hops(from, to) {
        for (hop_from, hop_to) in chain {
            apply_hop(method, hop_from, hop_to, Direction::Response, &mut result);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(s: &str) -> ProtocolVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_identity_when_versions_match() {
        let params = json!({"name": "echo", "arguments": {"x": 1}});
        let adapted = adapt_request(
            methods::TOOLS_CALL,
            v("2025-06-18"),
            v("2025-06-18"),
            params.clone(),
        );
        assert_eq!(adapted, params);
    }

    #[test]
    fn test_call_meta_stripped_for_oldest() {
        let params = json!({
            "name": "echo",
            "arguments": {"text": "hi"},
            "_meta": {"progressToken": "pt-1", "trace": "abc"}
        });
        let adapted = adapt_request(methods::TOOLS_CALL, v("2025-06-18"), v("2024-11-05"), params);
        assert_eq!(adapted["_meta"], json!({"progressToken": "pt-1"}));
        assert_eq!(adapted["arguments"]["text"], "hi");
    }

    #[test]
    fn test_empty_meta_removed_entirely() {
        let params = json!({"name": "echo", "_meta": {"trace": "abc"}});
        let adapted = adapt_request(methods::TOOLS_CALL, v("2025-06-18"), v("2024-11-05"), params);
        assert!(adapted.get("_meta").is_none());
    }

    #[test]
    fn test_initialize_title_dropped_below_latest() {
        let params = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "mcphub", "version": "0.1.0", "title": "Hub"}
        });
        let adapted = adapt_request(methods::INITIALIZE, v("2025-06-18"), v("2025-03-26"), params);
        assert!(adapted["clientInfo"].get("title").is_none());
        assert_eq!(adapted["clientInfo"]["name"], "mcphub");
    }

    #[test]
    fn test_legacy_tool_result_lifted() {
        let result = json!({"toolResult": "it worked"});
        let adapted = adapt_response(methods::TOOLS_CALL, v("2024-11-05"), v("2025-06-18"), result);
        assert_eq!(
            adapted["content"],
            json!([{"type": "text", "text": "it worked"}])
        );
        assert!(adapted.get("toolResult").is_none());
    }

    #[test]
    fn test_modern_tool_result_untouched() {
        let result = json!({"content": [{"type": "text", "text": "hi"}], "isError": false});
        let adapted = adapt_response(
            methods::TOOLS_CALL,
            v("2024-11-05"),
            v("2025-06-18"),
            result.clone(),
        );
        assert_eq!(adapted, result);
    }

    #[test]
    fn test_tool_list_schemas_canonicalised() {
        let result = json!({"tools": [{"name": "echo"}, {"name": "sum", "inputSchema": {"properties": {}}}]});
        let adapted = adapt_response(methods::TOOLS_LIST, v("2024-11-05"), v("2025-06-18"), result);
        assert_eq!(adapted["tools"][0]["inputSchema"]["type"], "object");
        assert_eq!(adapted["tools"][1]["inputSchema"]["type"], "object");
    }

    #[test]
    fn test_unsupported_version_passes_through() {
        let params = json!({"name": "echo"});
        let from = ProtocolVersion::new(2023, 1, 1).unwrap();
        let adapted = adapt_request(methods::TOOLS_CALL, from, v("2024-11-05"), params.clone());
        assert_eq!(adapted, params);
    }
}
