//! `/ws` channel: prompt streaming, buffered replay, permissions and
//! control frames, driven by a raw websocket client.

use std::sync::Arc;
use std::time::Duration;

use companion_bridge::models::frame::{ClientFrame, ServerFrame};
use companion_bridge::models::permission::PermissionOutcome;
use companion_bridge::models::response::ResponseFormat;
use companion_bridge::models::session::SessionStatus;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::test_helpers::{
    http_client, spawn_server, test_config, ScriptedBackend, Step, TestServer, TEST_TOKEN,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open(server: &TestServer) -> Ws {
    let url = format!("ws://{}/ws?token={TEST_TOKEN}", server.addr);
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("channel upgrade");
    ws
}

async fn send(ws: &mut Ws, frame: &ClientFrame) {
    let text = serde_json::to_string(frame).expect("encode frame");
    ws.send(Message::Text(text.into())).await.expect("send frame");
}

async fn next_frame(ws: &mut Ws) -> ServerFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("channel open")
            .expect("channel read");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("decode frame");
        }
    }
}

fn prompt(request_id: &str, text: &str, session_id: Option<&str>) -> ClientFrame {
    ClientFrame::Prompt {
        request_id: request_id.to_owned(),
        prompt: text.to_owned(),
        session_id: session_id.map(str::to_owned),
        working_directory: None,
        format: ResponseFormat::Markdown,
    }
}

#[tokio::test]
async fn prompt_streams_partials_in_order() {
    let backend = ScriptedBackend::new(vec![
        Step::Partial("a"),
        Step::Partial("b"),
        Step::Partial("c"),
    ]);
    let server = spawn_server(test_config(), backend).await;
    let mut ws = open(&server).await;

    send(&mut ws, &prompt("r1", "hi", None)).await;

    let ServerFrame::SessionStarted {
        request_id,
        session_id,
    } = next_frame(&mut ws).await
    else {
        panic!("expected session_started first");
    };
    assert_eq!(request_id, "r1");
    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::TurnStarted {
            session_id: session_id.clone(),
            request_id: "r1".into(),
            first_seq: 1,
        }
    );

    for (expected_seq, expected_text) in [(1, "a"), (2, "b"), (3, "c")] {
        match next_frame(&mut ws).await {
            ServerFrame::Partial {
                session_id: sid,
                seq,
                text,
            } => {
                assert_eq!(sid, session_id);
                assert_eq!(seq, expected_seq);
                assert_eq!(text, expected_text);
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    match next_frame(&mut ws).await {
        ServerFrame::Response {
            request_id,
            response,
            ..
        } => {
            assert_eq!(request_id.as_deref(), Some("r1"));
            assert_eq!(response.content, "done: hi");
            assert_eq!(response.format, ResponseFormat::Markdown);
            assert_eq!(response.partial_count, 3);
        }
        other => panic!("expected response, got {other:?}"),
    }

    // Sequence numbers continue across turns of the same session.
    send(&mut ws, &prompt("r2", "again", Some(&session_id))).await;
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::TurnStarted { first_seq: 4, ref request_id, .. } if request_id == "r2"
    ));
    match next_frame(&mut ws).await {
        ServerFrame::Partial { seq, .. } => assert_eq!(seq, 4),
        other => panic!("expected partial, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn subscribe_replays_buffer_after_gap() {
    let mut config = test_config();
    config.stream.buffer_capacity = 4;
    let backend = ScriptedBackend::new(vec![
        Step::Partial("1"),
        Step::Partial("2"),
        Step::Partial("3"),
        Step::Partial("4"),
        Step::Partial("5"),
        Step::Partial("6"),
    ]);
    let server = spawn_server(config, backend).await;

    let started: serde_json::Value = http_client()
        .post(server.url("/stream/start"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "count" }))
        .send()
        .await
        .expect("start request")
        .json()
        .await
        .expect("start json");
    let session_id = started["sessionId"].as_str().expect("session id").to_owned();

    let mut ws = open(&server).await;
    send(
        &mut ws,
        &ClientFrame::Subscribe {
            session_id: session_id.clone(),
        },
    )
    .await;

    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::Gap {
            session_id: session_id.clone(),
            dropped: 3,
            resume_seq: 4,
        }
    );
    for expected in 4..=6 {
        match next_frame(&mut ws).await {
            ServerFrame::Partial { seq, text, .. } => {
                assert_eq!(seq, expected);
                assert_eq!(text, expected.to_string());
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::Response { request_id: None, .. }
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn permission_round_trip_over_channel() {
    let mut config = test_config();
    config.timeouts.permission_seconds = 30;
    let backend = ScriptedBackend::new(vec![Step::Permission("Edit Cargo.toml?")]);
    let server = spawn_server(config, backend).await;
    let mut ws = open(&server).await;

    send(&mut ws, &prompt("r1", "bump deps", None)).await;
    let ServerFrame::SessionStarted { session_id, .. } = next_frame(&mut ws).await else {
        panic!("expected session_started");
    };
    assert!(matches!(next_frame(&mut ws).await, ServerFrame::TurnStarted { .. }));

    let request_id = match next_frame(&mut ws).await {
        ServerFrame::PermissionRequest { request, .. } => {
            assert_eq!(request.prompt, "Edit Cargo.toml?");
            assert!(!request.resolved);
            request.id
        }
        other => panic!("expected permission_request, got {other:?}"),
    };

    send(
        &mut ws,
        &ClientFrame::Permission {
            session_id: session_id.clone(),
            response: "yes".into(),
        },
    )
    .await;

    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::PermissionResolved {
            session_id: session_id.clone(),
            request_id,
            outcome: PermissionOutcome::Answered,
            decision: "allow".into(),
        }
    );
    assert!(matches!(
        next_frame(&mut ws).await,
        ServerFrame::Response { .. }
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn control_frames_and_errors() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;
    let mut ws = open(&server).await;

    send(&mut ws, &ClientFrame::Ping).await;
    assert_eq!(next_frame(&mut ws).await, ServerFrame::Pong);

    ws.send(Message::Text(r#"{"type":"shout"}"#.into()))
        .await
        .expect("send raw");
    match next_frame(&mut ws).await {
        ServerFrame::Error { kind, .. } => assert_eq!(kind, "bad_request"),
        other => panic!("expected error, got {other:?}"),
    }

    send(&mut ws, &prompt("r9", "  ", None)).await;
    match next_frame(&mut ws).await {
        ServerFrame::Error {
            kind, request_id, ..
        } => {
            assert_eq!(kind, "bad_request");
            assert_eq!(request_id.as_deref(), Some("r9"));
        }
        other => panic!("expected error, got {other:?}"),
    }

    send(
        &mut ws,
        &ClientFrame::Subscribe {
            session_id: "ghost".into(),
        },
    )
    .await;
    match next_frame(&mut ws).await {
        ServerFrame::Error {
            kind, session_id, ..
        } => {
            assert_eq!(kind, "session_not_found");
            assert_eq!(session_id.as_deref(), Some("ghost"));
        }
        other => panic!("expected error, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn close_notifies_subscriber() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;
    let mut ws = open(&server).await;

    send(&mut ws, &prompt("r1", "hi", None)).await;
    let ServerFrame::SessionStarted { session_id, .. } = next_frame(&mut ws).await else {
        panic!("expected session_started");
    };
    assert!(matches!(next_frame(&mut ws).await, ServerFrame::TurnStarted { .. }));
    assert!(matches!(next_frame(&mut ws).await, ServerFrame::Response { .. }));

    let resp = http_client()
        .delete(server.url(&format!("/stream/{session_id}")))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("close request");
    assert!(resp.status().is_success());

    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::SessionClosed {
            session_id,
            reason: "closed by client".into(),
        }
    );

    server.shutdown().await;
}

#[tokio::test]
async fn channel_that_stops_reading_does_not_block_other_requests() {
    let chunk: &'static str = Box::leak("x".repeat(64 * 1024).into_boxed_str());
    let backend = ScriptedBackend::new(vec![Step::Partial(chunk); 400]);
    let server = spawn_server(test_config(), backend).await;
    let mut ws = open(&server).await;

    send(&mut ws, &prompt("r1", "flood", None)).await;
    let ServerFrame::SessionStarted { session_id, .. } = next_frame(&mut ws).await else {
        panic!("expected session_started");
    };
    // From here on the client never reads again.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let listed = tokio::time::timeout(
        Duration::from_secs(3),
        http_client()
            .get(server.url("/sessions"))
            .bearer_auth(TEST_TOKEN)
            .send(),
    )
    .await
    .expect("list answers while the channel is stalled")
    .expect("list request");
    assert!(listed.status().is_success());
    let body: serde_json::Value = listed.json().await.expect("list json");
    assert_eq!(body["sessions"][0]["id"], json!(session_id));

    let closed = tokio::time::timeout(
        Duration::from_secs(3),
        http_client()
            .delete(server.url(&format!("/stream/{session_id}")))
            .bearer_auth(TEST_TOKEN)
            .send(),
    )
    .await
    .expect("close answers while the channel is stalled")
    .expect("close request");
    assert!(closed.status().is_success());

    drop(ws);
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_live_sessions_and_notifies_subscribers() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;
    let mut ws = open(&server).await;

    send(&mut ws, &prompt("r1", "hi", None)).await;
    let ServerFrame::SessionStarted { session_id, .. } = next_frame(&mut ws).await else {
        panic!("expected session_started");
    };
    assert!(matches!(next_frame(&mut ws).await, ServerFrame::TurnStarted { .. }));
    assert!(matches!(next_frame(&mut ws).await, ServerFrame::Response { .. }));

    let state = Arc::clone(&server.state);
    let stopping = tokio::spawn(server.shutdown());
    assert_eq!(
        next_frame(&mut ws).await,
        ServerFrame::SessionClosed {
            session_id: session_id.clone(),
            reason: "server shutdown".into(),
        }
    );
    stopping.await.expect("shutdown task");

    assert!(state.manager.list().await.is_empty());
    let session = state.manager.get(&session_id).await.expect("retired session");
    assert_eq!(session.status, SessionStatus::Closed);
}

#[tokio::test]
async fn upgrade_without_token_is_rejected() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }

    server.shutdown().await;
}
