//! Two-pass remote connection against a canned HTTP upstream (scenario: a
//! server that rejects the session-id form on the first attempt).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use mcphub_core::{EventBus, ServerId};
use mcphub_server::{ServerConfig, Supervisor, SupervisorOptions, UpstreamState};
use mcphub_transport::{origin_key, OriginCache};

/// Serve canned JSON-RPC-over-HTTP: the very first request is rejected with
/// an "unknown field sessionId" error; everything afterwards succeeds.
async fn spawn_canned_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                loop {
                    let Some(body) = read_http_request(&mut socket).await else {
                        break;
                    };
                    let n = hits.fetch_add(1, Ordering::SeqCst);

                    let response_body = if n == 0 {
                        // First contact: reject the session-id request form.
                        write_response(
                            &mut socket,
                            400,
                            r#"{"error": "unknown field sessionId"}"#,
                        )
                        .await;
                        continue;
                    } else if body.get("method").and_then(|m| m.as_str())
                        == Some("initialize")
                    {
                        let version = body["params"]["protocolVersion"]
                            .as_str()
                            .unwrap_or("2025-06-18");
                        serde_json::json!({
                            "jsonrpc": "2.0",
                            "result": {
                                "protocolVersion": version,
                                "capabilities": {"tools": {"listChanged": true}},
                                "serverInfo": {"name": "canned-remote", "version": "1.0"}
                            },
                            "id": body["id"]
                        })
                        .to_string()
                    } else if body.get("id").is_none() {
                        // Notification: acknowledge without a body.
                        write_response(&mut socket, 202, "").await;
                        continue;
                    } else {
                        serde_json::json!({
                            "jsonrpc": "2.0",
                            "result": {},
                            "id": body["id"]
                        })
                        .to_string()
                    };

                    write_response(&mut socket, 200, &response_body).await;
                }
            });
        }
    });

    addr
}

async fn read_http_request(socket: &mut tokio::net::TcpStream) -> Option<serde_json::Value> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    // Read until the header terminator.
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buffer.len() > 64 * 1024 {
            return None;
        }
    };

    let headers = String::from_utf8_lossy(&buffer[..header_end]).to_lowercase();
    let content_length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    while buffer.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    if content_length == 0 {
        return Some(serde_json::Value::Null);
    }
    serde_json::from_slice(&buffer[header_end..header_end + content_length]).ok()
}

async fn write_response(socket: &mut tokio::net::TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        _ => "Unknown",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{body}",
        body.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
}

/// S4 - HTTP no-session: the first pass fails with "unknown field
/// sessionId", the second pass without the session-id form succeeds, and
/// the per-origin cache records `supports_session_id = false` so the next
/// startup skips the probing pass.
#[tokio::test]
async fn scenario_http_no_session_two_pass() {
    let addr = spawn_canned_upstream().await;
    let url = format!("http://{addr}/mcp");

    let spec = ServerConfig::Remote {
        id: "remote_a".to_string(),
        url: url.clone(),
        transport: Default::default(),
        headers: Default::default(),
        auth: None,
        health_check_interval_ms: 0,
        request_timeout_ms: 5_000,
    };

    let events = Arc::new(EventBus::new());
    let cache = Arc::new(OriginCache::default());
    let supervisor = Supervisor::new(
        spec.clone(),
        ServerId::new("remote_a").unwrap(),
        SupervisorOptions::default(),
        Arc::clone(&events),
        Arc::clone(&cache),
    );

    let session = supervisor.start().await.unwrap();
    assert_eq!(supervisor.state(), UpstreamState::Running);
    assert_eq!(session.server_info.name, "canned-remote");
    assert_eq!(session.protocol_version.to_string(), "2025-06-18");

    // The cache learned that this origin rejects the session-id form.
    let origin = origin_key(&url::Url::parse(&url).unwrap()).unwrap();
    let hint = cache.get(&origin).expect("origin hint recorded");
    assert!(!hint.supports_session_id);
    assert_eq!(hint.protocol_version.as_deref(), Some("2025-06-18"));

    supervisor.stop().await.unwrap();

    // A fresh supervisor against the same origin starts on the cached
    // parameters; the canned server only ever rejects the first request,
    // so a second probing pass would not be needed either way - what
    // matters is that the hint short-circuits pass one.
    let supervisor = Supervisor::new(
        spec,
        ServerId::new("remote_a").unwrap(),
        SupervisorOptions::default(),
        events,
        cache,
    );
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.state(), UpstreamState::Running);
    supervisor.stop().await.unwrap();
}
