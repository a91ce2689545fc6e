//! `/health`, `/info` and bearer authentication behaviour.

use reqwest::StatusCode;

use super::test_helpers::{http_client, spawn_server, test_config, ScriptedBackend, TEST_TOKEN};

#[tokio::test]
async fn health_reports_available_backend() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;

    let resp = http_client()
        .get(server.url("/health"))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("health request");
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await.expect("health json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backendAvailable"], true);
    assert_eq!(body["backendVersion"], "scripted 1.0");

    server.shutdown().await;
}

#[tokio::test]
async fn health_is_unavailable_without_backend() {
    let server = spawn_server(test_config(), ScriptedBackend::unavailable()).await;

    let resp = http_client()
        .get(server.url("/health"))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("health request");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: serde_json::Value = resp.json().await.expect("health json");
    assert_eq!(body["backendAvailable"], false);

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;
    let client = http_client();

    let resp = client
        .get(server.url("/health"))
        .bearer_auth("nope")
        .send()
        .await
        .expect("health request");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json().await.expect("error json");
    assert_eq!(body["error"]["kind"], "authentication_failed");

    let missing = client
        .get(server.url("/sessions"))
        .send()
        .await
        .expect("sessions request");
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    server.shutdown().await;
}

#[tokio::test]
async fn token_query_parameter_is_accepted() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;

    let resp = http_client()
        .get(server.url(&format!("/health?token={TEST_TOKEN}")))
        .send()
        .await
        .expect("health request");
    assert_eq!(resp.status(), StatusCode::OK);

    server.shutdown().await;
}

#[tokio::test]
async fn open_server_needs_no_token() {
    let mut config = test_config();
    config.auth.token = None;
    let server = spawn_server(config, ScriptedBackend::new(Vec::new())).await;

    let resp = http_client()
        .get(server.url("/health"))
        .send()
        .await
        .expect("health request");
    assert_eq!(resp.status(), StatusCode::OK);

    server.shutdown().await;
}

#[tokio::test]
async fn info_lists_endpoints_and_channel() {
    let server = spawn_server(test_config(), ScriptedBackend::new(Vec::new())).await;

    let body: serde_json::Value = http_client()
        .get(server.url("/info"))
        .bearer_auth(TEST_TOKEN)
        .send()
        .await
        .expect("info request")
        .json()
        .await
        .expect("info json");

    assert_eq!(body["name"], "companion-bridge");
    assert_eq!(body["streamingPath"], "/ws");
    assert_eq!(body["backendAvailable"], true);
    let endpoints = body["endpoints"].as_array().expect("endpoints array");
    assert!(endpoints.iter().any(|e| e == "POST /permission/{sessionId}"));

    server.shutdown().await;
}
