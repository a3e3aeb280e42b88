//! End-to-end scenarios over scripted upstreams.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mcphub_core::{EventBus, MessageId, Redactor, ServerId};
use mcphub_protocol::jsonrpc::JsonRpcRequest;
use mcphub_protocol::types::methods;
use mcphub_server::generation::NullMigrationStore;
use mcphub_server::{
    Hub, HubConfig, HubOptions, NamingConfig, NamingStrategy, RequestHandler, RolloverController,
    ServerConfig,
};
use mcphub_transport::testing::{ScriptedReply, ScriptedTransport};

fn local_spec(id: &str) -> ServerConfig {
    ServerConfig::Local {
        id: id.to_string(),
        command: "mcp-server".to_string(),
        args: vec![],
        env: Default::default(),
        cwd: None,
        auto_restart: false,
        max_restarts: 5,
        restart_delay_ms: 10,
    }
}

fn request(method: &str, params: serde_json::Value) -> JsonRpcRequest {
    JsonRpcRequest::new(method, Some(params), MessageId::from(1i64))
}

fn echo_upstream(accept_version: &'static str) -> impl Fn(&ServerConfig) -> Box<dyn mcphub_transport::Transport> {
    move |spec: &ServerConfig| {
        let transport = ScriptedTransport::new();
        transport.accept_initialize(accept_version, spec.id());
        transport.respond_ok(
            "tools/list",
            serde_json::json!({"tools": [{"name": "echo"}]}),
        );
        transport.script("tools/call", |seen| {
            let params = seen.params.as_ref().unwrap();
            assert_eq!(params["name"], "echo");
            let text = params["arguments"]["text"].as_str().unwrap().to_string();
            ScriptedReply::ok(serde_json::json!({
                "content": [{"type": "text", "text": text}]
            }))
        });
        Box::new(transport) as Box<dyn mcphub_transport::Transport>
    }
}

/// S1 - namespace namespacing: `echo` on `srv_a` is exposed as
/// `echo_srv_a`; calling it reaches the upstream under its original name
/// and the content round-trips unchanged.
#[tokio::test]
async fn scenario_namespace_round_trip() {
    let hub = Hub::with_transport_factory(
        HubOptions::default(),
        Arc::new(echo_upstream("2025-06-18")),
    );
    hub.mount(local_spec("srv_a")).await.unwrap();
    let handler = RequestHandler::new(hub, Redactor::default());

    let listed = handler
        .handle(
            request(methods::TOOLS_LIST, serde_json::json!({})),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let tools = listed.response.result.unwrap();
    assert_eq!(tools["tools"][0]["name"], "echo_srv_a");

    let called = handler
        .handle(
            request(
                methods::TOOLS_CALL,
                serde_json::json!({"name": "echo_srv_a", "arguments": {"text": "hi"}}),
            ),
            Some(&listed.session_id),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let result = called.response.result.unwrap();
    assert_eq!(
        result["content"],
        serde_json::json!([{"type": "text", "text": "hi"}])
    );
}

/// S2 - progress streaming: a call carrying a progress token and taking a
/// few seconds upstream produces cadence progress 0,1,2 while in flight,
/// exactly one final response, and no surviving timer afterwards.
#[tokio::test]
async fn scenario_progress_streaming() {
    let hub = Hub::with_transport_factory(
        HubOptions::default(),
        Arc::new(|spec: &ServerConfig| {
            let transport = ScriptedTransport::new();
            transport.accept_initialize("2025-06-18", spec.id());
            transport.respond_ok(
                "tools/list",
                serde_json::json!({"tools": [{"name": "slow"}]}),
            );
            transport.script("tools/call", |_| {
                ScriptedReply::ok(serde_json::json!({
                    "content": [{"type": "text", "text": "done"}]
                }))
                .after(Duration::from_millis(2300))
            });
            Box::new(transport) as Box<dyn mcphub_transport::Transport>
        }),
    );
    hub.mount(local_spec("srv_a")).await.unwrap();

    let mut progress = hub.events().subscribe_progress();
    let handler = RequestHandler::new(Arc::clone(&hub), Redactor::default());

    let handled = handler
        .handle(
            request(
                methods::TOOLS_CALL,
                serde_json::json!({
                    "name": "slow_srv_a",
                    "arguments": {},
                    "_meta": {"progressToken": "pt-1"}
                }),
            ),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(handled.response.is_success());
    assert_eq!(
        handled.response.result.unwrap()["content"][0]["text"],
        "done"
    );

    // Cadence events 0,1,2 were emitted during the ~2.3s call.
    let mut seen = Vec::new();
    while let Ok(event) = progress.try_recv() {
        assert_eq!(event.token, "pt-1");
        seen.push(event.progress);
    }
    assert!(seen.len() >= 3, "expected at least 3 ticks, got {seen:?}");
    assert_eq!(&seen[..3], &[0, 1, 2]);

    // The timer was torn down with the call.
    assert_eq!(hub.router().progress().active_count(), 0);
}

/// S3 - protocol fallback: the upstream rejects newer versions and accepts
/// 2024-11-05; negotiation lands there and tools/call request bodies are
/// adapted down (foreign `_meta` fields are stripped for the old version).
#[tokio::test]
async fn scenario_protocol_fallback() {
    let logs: Arc<parking_lot::Mutex<Vec<Arc<parking_lot::Mutex<Vec<mcphub_transport::testing::SeenRequest>>>>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let logs_for_factory = Arc::clone(&logs);

    let hub = Hub::with_transport_factory(
        HubOptions::default(),
        Arc::new(move |spec: &ServerConfig| {
            let transport = ScriptedTransport::new();
            transport.accept_initialize("2024-11-05", spec.id());
            transport.respond_ok(
                "tools/list",
                serde_json::json!({"tools": [{"name": "echo"}]}),
            );
            transport.script("tools/call", |seen| {
                let text = seen.params.as_ref().unwrap()["arguments"]["text"]
                    .as_str()
                    .unwrap()
                    .to_string();
                ScriptedReply::ok(serde_json::json!({
                    "content": [{"type": "text", "text": text}]
                }))
            });
            logs_for_factory.lock().push(transport.request_log());
            Box::new(transport) as Box<dyn mcphub_transport::Transport>
        }),
    );
    hub.mount(local_spec("srv_a")).await.unwrap();

    let handler = RequestHandler::new(hub, Redactor::default());
    let handled = handler
        .handle(
            request(
                methods::TOOLS_CALL,
                serde_json::json!({
                    "name": "echo_srv_a",
                    "arguments": {"text": "hi"},
                    "_meta": {"progressToken": "pt-1"}
                }),
            ),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(handled.response.is_success());

    let logs = logs.lock();
    let seen = logs[0].lock();

    // Negotiation walked the versions until the server's one.
    let offered: Vec<String> = seen
        .iter()
        .filter(|r| r.method == methods::INITIALIZE)
        .map(|r| {
            r.params.as_ref().unwrap()["protocolVersion"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(offered, vec!["2025-06-18", "2025-03-26", "2024-11-05"]);

    // The forwarded call was adapted for 2024-11-05: progressToken kept,
    // nothing else in _meta.
    let call = seen
        .iter()
        .find(|r| r.method == methods::TOOLS_CALL)
        .unwrap();
    let meta = &call.params.as_ref().unwrap()["_meta"];
    assert_eq!(meta, &serde_json::json!({"progressToken": "pt-1"}));
}

/// S5 - hot reload with error-rate rollback: config B takes over from A;
/// B's error rate breaches 10%, `rollback:needed` fires, A is re-promoted
/// and B's sessions are migrated back.
#[tokio::test]
async fn scenario_rollover_rollback() {
    let config = Arc::new(HubConfig::from_json_with_lookup(
        r#"{"version": 1,
            "rollover": {"warmupTimeMs": 10, "drainTimeoutMs": 1500,
                          "errorRateThreshold": 0.1, "minRequestsForRate": 10,
                          "healthCheckIntervalMs": 50},
            "generation": {"gracePeriodMs": 30}}"#,
        &|_| None,
    )
    .unwrap());

    let events = Arc::new(EventBus::new());
    let mut generation_events = events.subscribe_generations();
    let controller = RolloverController::new(
        config.rollover.clone(),
        config.generation.clone(),
        Arc::new(|_config| Box::pin(async { Ok(Hub::new(HubOptions::default())) })),
        events,
        Arc::new(NullMigrationStore),
    );

    // Config A serves and holds a session (keeping generation 1 draining
    // rather than retired once B takes over).
    controller.apply_config(Arc::clone(&config)).await.unwrap();
    controller.assign_worker("sess-a", None).unwrap();

    // Config B warms, passes health gating and takes over; a new session
    // lands on B.
    controller.apply_config(Arc::clone(&config)).await.unwrap();
    assert_eq!(controller.active_generation(), Some(2));
    let on_b = controller.assign_worker("sess-b", None).unwrap();
    assert_eq!(on_b.generation_id(), 2);

    // Drive B over the threshold: 3 errors in 21 requests (~14%).
    let workers = controller.workers_of(2);
    for _ in 0..18 {
        workers[0].record_result(true);
    }
    for _ in 0..3 {
        workers[0].record_result(false);
    }
    controller.check_error_rates().await;

    // rollback:needed was emitted for generation 2.
    let mut saw_rollback = false;
    while let Ok(event) = generation_events.try_recv() {
        if let mcphub_core::GenerationEvent::RollbackNeeded {
            generation_id,
            error_rate,
        } = event
        {
            assert_eq!(generation_id, 2);
            assert!(error_rate > 0.1);
            saw_rollback = true;
        }
    }
    assert!(saw_rollback);

    // A is re-promoted; B drains.
    assert_eq!(controller.active_generation(), Some(1));
    assert_eq!(
        controller.generation(2).unwrap().state(),
        mcphub_server::GenerationState::Draining
    );

    // B's drain deadline passes and its session migrates back to A.
    tokio::time::sleep(Duration::from_millis(2000)).await;
    let pinned = controller.assign_worker("sess-b", None).unwrap();
    assert_eq!(pinned.generation_id(), 1);
    assert_eq!(
        controller.generation(2).unwrap().state(),
        mcphub_server::GenerationState::Retired
    );
    // A's own earlier drain was voided by the rollback.
    assert_eq!(controller.active_generation(), Some(1));
    let on_a = controller.assign_worker("sess-a", None).unwrap();
    assert_eq!(on_a.generation_id(), 1);
}

/// S6 - collision under the `error` strategy: the second server offering
/// `search` fails registration atomically and the listing keeps exactly one
/// `search` owned by server1.
#[tokio::test]
async fn scenario_collision_under_error_strategy() {
    let hub = Hub::with_transport_factory(
        HubOptions {
            naming: NamingConfig {
                strategy: NamingStrategy::Error,
                ..Default::default()
            },
            ..Default::default()
        },
        Arc::new(|spec: &ServerConfig| {
            let transport = ScriptedTransport::new();
            transport.accept_initialize("2025-06-18", spec.id());
            transport.respond_ok(
                "tools/list",
                serde_json::json!({"tools": [{"name": "search"}]}),
            );
            Box::new(transport) as Box<dyn mcphub_transport::Transport>
        }),
    );

    hub.mount(local_spec("server1")).await.unwrap();
    let err = hub.mount(local_spec("server2")).await.unwrap_err();
    assert!(err.message.contains("search"));

    let tools = hub.list_tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "search");
    assert_eq!(
        hub.router()
            .route_tool("search", &mcphub_server::RequestCtx::default())
            .unwrap()
            .target
            .server_id,
        ServerId::new("server1").unwrap()
    );
    assert!(hub.tool_collisions().is_empty());
}

/// Boundary: zero upstreams configured still serves empty listings.
#[tokio::test]
async fn scenario_zero_upstreams() {
    let hub = Hub::new(HubOptions::default());
    let handler = RequestHandler::new(hub, Redactor::default());

    let handled = handler
        .handle(
            request(methods::TOOLS_LIST, serde_json::json!({})),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        handled.response.result.unwrap()["tools"],
        serde_json::json!([])
    );
}

/// Boundary: a capability without an input schema is canonicalised.
#[tokio::test]
async fn scenario_schema_canonicalisation() {
    let hub = Hub::with_transport_factory(
        HubOptions::default(),
        Arc::new(|spec: &ServerConfig| {
            let transport = ScriptedTransport::new();
            transport.accept_initialize("2025-06-18", spec.id());
            transport.respond_ok(
                "tools/list",
                serde_json::json!({"tools": [
                    {"name": "bare"},
                    {"name": "untyped", "inputSchema": {"properties": {"x": {}}}}
                ]}),
            );
            Box::new(transport) as Box<dyn mcphub_transport::Transport>
        }),
    );
    hub.mount(local_spec("srv_a")).await.unwrap();

    for tool in hub.list_tools() {
        assert_eq!(tool.input_schema["type"], "object");
    }
}

/// Boundary: a server replying `method not found` to ping stays healthy.
#[tokio::test]
async fn scenario_ping_method_not_found_is_healthy() {
    let hub = Hub::with_transport_factory(
        HubOptions::default(),
        Arc::new(|spec: &ServerConfig| {
            let transport = ScriptedTransport::new();
            transport.accept_initialize("2025-06-18", spec.id());
            transport.respond_ok("tools/list", serde_json::json!({"tools": []}));
            // No ping script: the upstream answers -32601.
            Box::new(transport) as Box<dyn mcphub_transport::Transport>
        }),
    );
    hub.mount(local_spec("srv_a")).await.unwrap();
    hub.probe_upstreams().await.unwrap();
}
