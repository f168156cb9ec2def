//! End-to-end test of the unified SSE bridge against a live database.
//!
//! Run with a PostgreSQL instance (migrations applied) and:
//!   DATABASE_URL=postgres://... cargo test -p gateway-api -- --ignored

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use gateway_api::bridge::routes;
use gateway_api::mcp::transport::sse::SseEventParser;
use gateway_api::{AppState, Config};
use gateway_shared::ProjectId;

fn test_config(database_url: String) -> Config {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        database_url,
        database_max_connections: 3,
        encryption_key: BASE64.encode([0x42u8; 32]),
        auth_secret: None,
        initial_admin_email: None,
        session_idle_timeout: Duration::from_secs(1800),
        session_cleanup_interval: Duration::from_secs(300),
        request_timeout: Duration::from_secs(30),
        max_frame_bytes: 4 * 1024 * 1024,
    }
}

/// Stub MCP server: answers initialize (id 1), swallows the initialized
/// notification, then answers the next request (id 2) with a tools list.
const STUB_SCRIPT: &str = r#"
    read line
    printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"echo-mcp","version":"0"}}}'
    read initialized
    read call
    printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}'
    sleep 5
"#;

#[tokio::test]
#[ignore] // Requires database
async fn test_cold_call_to_stdio_backend() {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let config = test_config(database_url);

    let pool = gateway_shared::create_pool(&config.database_url, 3)
        .await
        .expect("pool");
    gateway_shared::run_migrations(&pool).await.expect("migrations");

    let state = AppState::assemble(config, pool.clone()).expect("state");

    // Seed project P1 with stdio server `fs`; args land encrypted at rest
    let project = ProjectId::new();
    let args = vec!["-c".to_string(), STUB_SCRIPT.to_string()];
    let args_token = state.crypto.encrypt_json(&args).expect("encrypt args");
    assert!(!args_token.contains("jsonrpc"));
    sqlx::query(
        r#"INSERT INTO mcp_servers (project_id, name, transport, command, args_encrypted)
           VALUES ($1, 'fs', 'stdio', 'sh', $2)"#,
    )
    .bind(project.0)
    .bind(&args_token)
    .execute(&pool)
    .await
    .expect("seed server");

    // Serve the bridge on an ephemeral port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sessions = Arc::clone(&state.sessions);
    tokio::spawn(async move {
        axum::serve(listener, routes::router(state)).await.unwrap();
    });

    // Open the SSE stream; the first event names the channel's POST URL
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/projects/{}/unified/sse", addr, project))
        .send()
        .await
        .expect("open stream");
    assert!(response.status().is_success());

    let mut stream = response.bytes_stream();
    let mut parser = SseEventParser::new();
    let mut endpoint = None;
    let mut message = None;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while message.is_none() && tokio::time::Instant::now() < deadline {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended")
            .expect("stream error");
        for event in parser.feed(&String::from_utf8_lossy(&chunk)) {
            match event.event.as_str() {
                "endpoint" => {
                    assert!(event.data.contains("channel_id="));
                    let url = format!("http://{}{}", addr, event.data);
                    endpoint = Some(url.clone());

                    // POST the cold call; 202 means accepted for delivery
                    let post = client
                        .post(&url)
                        .header("content-type", "application/json")
                        .body(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"_server":"fs","name":"echo","arguments":{}}}"#)
                        .send()
                        .await
                        .expect("post message");
                    assert_eq!(post.status(), reqwest::StatusCode::ACCEPTED);
                }
                "message" => {
                    message = Some(
                        serde_json::from_str::<serde_json::Value>(&event.data).expect("payload"),
                    );
                }
                _ => {}
            }
        }
    }

    assert!(endpoint.is_some(), "no endpoint event received");
    let message = message.expect("no message event received");
    assert_eq!(message["id"], 1);
    assert!(message["result"]["tools"].is_array());

    // Exactly one live session was constructed for the cold call
    assert_eq!(sessions.session_count().await, 1);
    sessions.shutdown().await;

    sqlx::query("DELETE FROM mcp_servers WHERE project_id = $1")
        .bind(project.0)
        .execute(&pool)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unknown_channel_is_404() {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let config = test_config(database_url);
    let pool = gateway_shared::create_pool(&config.database_url, 3)
        .await
        .expect("pool");
    let state = AppState::assemble(config, pool).expect("state");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, routes::router(state)).await.unwrap();
    });

    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/projects/{}/unified/messages/?channel_id={}",
            addr,
            uuid::Uuid::new_v4(),
            uuid::Uuid::new_v4()
        ))
        .header("content-type", "application/json")
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
