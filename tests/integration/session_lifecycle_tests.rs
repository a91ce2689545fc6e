//! Session creation, continuation and close over the HTTP surface.

use reqwest::StatusCode;
use serde_json::json;

use super::test_helpers::{
    http_client, spawn_server, test_config, ScriptedBackend, Step, TEST_TOKEN,
};

#[tokio::test]
async fn start_continue_and_close() {
    let backend = ScriptedBackend::new(vec![Step::Partial("thinking")]);
    let server = spawn_server(test_config(), backend.clone()).await;
    let client = http_client();

    let started: serde_json::Value = client
        .post(server.url("/stream/start"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "first" }))
        .send()
        .await
        .expect("start request")
        .json()
        .await
        .expect("start json");
    let session_id = started["sessionId"].as_str().expect("session id").to_owned();
    assert_eq!(started["response"]["content"], "done: first");
    assert_eq!(started["response"]["partialCount"], 1);

    let second = client
        .post(server.url(&format!("/stream/{session_id}")))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "second", "format": "text" }))
        .send()
        .await
        .expect("continue request");
    assert_eq!(second.status(), StatusCode::OK);
    let second: serde_json::Value = second.json().await.expect("continue json");
    assert_eq!(second["sessionId"], session_id.as_str());
    assert_eq!(second["format"], "text");

    let session: serde_json::Value = client
        .get(server.url(&format!("/sessions/{session_id}")))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("get session")
        .json()
        .await
        .expect("session json");
    assert_eq!(session["promptCount"], 2);
    assert_eq!(session["backendSessionId"], "backend-1");
    assert_eq!(backend.prompts(), vec!["first".to_owned(), "second".to_owned()]);

    let close: serde_json::Value = client
        .delete(server.url(&format!("/stream/{session_id}")))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("close request")
        .json()
        .await
        .expect("close json");
    assert_eq!(close["status"], "closed");
    assert_eq!(close["alreadyClosed"], false);

    let after = client
        .post(server.url(&format!("/stream/{session_id}")))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "third" }))
        .send()
        .await
        .expect("post after close");
    assert_eq!(after.status(), StatusCode::CONFLICT);
    let err: serde_json::Value = after.json().await.expect("error json");
    assert_eq!(err["error"]["kind"], "invalid_session_state");

    server.shutdown().await;
}

#[tokio::test]
async fn list_shows_only_live_sessions() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;
    let client = http_client();

    let mut ids = Vec::new();
    for prompt in ["a", "b"] {
        let started: serde_json::Value = client
            .post(server.url("/stream/start"))
            .bearer_auth(TEST_TOKEN)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await
            .expect("start request")
            .json()
            .await
            .expect("start json");
        ids.push(started["sessionId"].as_str().expect("session id").to_owned());
    }
    assert_ne!(ids[0], ids[1]);

    let resp = client
        .delete(server.url(&format!("/stream/{}", ids[0])))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("close request");
    assert_eq!(resp.status(), StatusCode::OK);

    let list: serde_json::Value = client
        .get(server.url("/sessions"))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("list request")
        .json()
        .await
        .expect("list json");
    let sessions = list["sessions"].as_array().expect("sessions array");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], ids[1].as_str());

    server.shutdown().await;
}

#[tokio::test]
async fn close_is_idempotent_for_known_sessions() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;
    let client = http_client();

    let started: serde_json::Value = client
        .post(server.url("/ask"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "hello" }))
        .send()
        .await
        .expect("ask request")
        .json()
        .await
        .expect("ask json");
    let session_id = started["sessionId"].as_str().expect("session id").to_owned();

    for expected_already in [false, true] {
        let close: serde_json::Value = client
            .delete(server.url(&format!("/stream/{session_id}")))
            .bearer_auth(TEST_TOKEN)
            .send()
            .await
            .expect("close request")
            .json()
            .await
            .expect("close json");
        assert_eq!(close["alreadyClosed"], expected_already);
    }

    let unknown = client
        .delete(server.url("/stream/no-such-session"))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("close unknown");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = unknown.json().await.expect("error json");
    assert_eq!(body["error"]["kind"], "session_not_found");

    server.shutdown().await;
}

#[tokio::test]
async fn missing_prompt_is_bad_request() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;
    let client = http_client();

    for body in [json!({}), json!({ "prompt": "   " })] {
        let resp = client
            .post(server.url("/ask"))
            .bearer_auth(TEST_TOKEN)
            .json(&body)
            .send()
            .await
            .expect("ask request");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err: serde_json::Value = resp.json().await.expect("error json");
        assert_eq!(err["error"]["kind"], "bad_request");
    }

    let list: serde_json::Value = client
        .get(server.url("/sessions"))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("list request")
        .json()
        .await
        .expect("list json");
    assert!(list["sessions"].as_array().expect("array").is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_session_prompt_is_not_found() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;

    let resp = http_client()
        .post(server.url("/stream/does-not-exist"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "hi" }))
        .send()
        .await
        .expect("prompt request");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn backend_failure_maps_to_bad_gateway() {
    let backend = ScriptedBackend::new(vec![Step::Fail("model overloaded")]);
    let server = spawn_server(test_config(), backend).await;

    let resp = http_client()
        .post(server.url("/ask"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "hi" }))
        .send()
        .await
        .expect("ask request");
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let err: serde_json::Value = resp.json().await.expect("error json");
    assert_eq!(err["error"]["kind"], "backend");
    assert_eq!(err["error"]["message"], "model overloaded");

    server.shutdown().await;
}

#[tokio::test]
async fn invalid_working_directory_is_bad_request() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;
    let temp = tempfile::tempdir().expect("tempdir");
    let file = temp.path().join("plain.txt");
    std::fs::write(&file, "x").expect("write file");

    let resp = http_client()
        .post(server.url("/stream/start"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "hi", "workingDirectory": file }))
        .send()
        .await
        .expect("start request");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let ok = http_client()
        .post(server.url("/stream/start"))
        .bearer_auth(TEST_TOKEN)
        .json(&json!({ "prompt": "hi", "workingDirectory": temp.path() }))
        .send()
        .await
        .expect("start request");
    assert_eq!(ok.status(), StatusCode::OK);

    server.shutdown().await;
}
