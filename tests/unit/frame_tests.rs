//! Wire shapes of channel frames, error bodies and endpoints.

use companion_bridge::models::api::{required, ErrorBody};
use companion_bridge::models::endpoint::Endpoint;
use companion_bridge::models::frame::{ClientFrame, ServerFrame};
use companion_bridge::models::permission::{PermissionDecision, PermissionOutcome};
use companion_bridge::models::response::ResponseFormat;
use companion_bridge::AppError;
use serde_json::json;

#[test]
fn error_frame_uses_kind_and_bare_message() {
    let err = AppError::SessionNotFound("s9".into());
    let frame = ServerFrame::error(Some("s9".into()), Some("r1".into()), &err);
    let value = serde_json::to_value(&frame).expect("serialize");
    assert_eq!(
        value,
        json!({
            "type": "error",
            "sessionId": "s9",
            "requestId": "r1",
            "kind": "session_not_found",
            "message": "s9",
        })
    );
}

#[test]
fn error_frame_omits_absent_ids() {
    let frame = ServerFrame::error(None, None, &AppError::BadRequest("missing prompt".into()));
    let value = serde_json::to_value(&frame).expect("serialize");
    assert!(value.get("sessionId").is_none());
    assert!(value.get("requestId").is_none());
}

#[test]
fn permission_resolved_frame_wire_shape() {
    let frame = ServerFrame::PermissionResolved {
        session_id: "s1".into(),
        request_id: "p1".into(),
        outcome: PermissionOutcome::TimedOut,
        decision: "deny".into(),
    };
    assert_eq!(
        serde_json::to_value(&frame).expect("serialize"),
        json!({
            "type": "permission_resolved",
            "sessionId": "s1",
            "requestId": "p1",
            "outcome": "timed_out",
            "decision": "deny",
        })
    );
}

#[test]
fn session_id_is_exposed_for_tagged_frames() {
    let closed = ServerFrame::SessionClosed {
        session_id: "s1".into(),
        reason: "idle timeout".into(),
    };
    assert_eq!(closed.session_id(), Some("s1"));
    assert_eq!(ServerFrame::Pong.session_id(), None);
    assert!(!closed.is_partial());
}

#[test]
fn client_frames_parse_from_wire() {
    let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).expect("ping");
    assert_eq!(ping, ClientFrame::Ping);

    let answer: ClientFrame =
        serde_json::from_str(r#"{"type":"permission","sessionId":"s1","response":"y"}"#)
            .expect("permission");
    assert_eq!(
        answer,
        ClientFrame::Permission {
            session_id: "s1".into(),
            response: "y".into(),
        }
    );

    let prompt: ClientFrame = serde_json::from_str(
        r#"{"type":"prompt","requestId":"r","prompt":"p","sessionId":"s2","format":"markdown"}"#,
    )
    .expect("prompt");
    assert!(matches!(
        prompt,
        ClientFrame::Prompt { session_id: Some(ref id), format: ResponseFormat::Markdown, .. } if id == "s2"
    ));
}

#[test]
fn unknown_client_frame_type_is_rejected() {
    assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"shout"}"#).is_err());
}

#[test]
fn error_body_round_trips_to_app_error() {
    let err = AppError::PermissionAlreadyResolved("request p1 already resolved".into());
    let body = ErrorBody::from(&err);
    let wire = serde_json::to_string(&body).expect("serialize");
    let parsed: ErrorBody = serde_json::from_str(&wire).expect("parse");
    assert_eq!(parsed.into_error(), err);
}

#[test]
fn required_rejects_missing_and_blank() {
    assert!(matches!(required(None, "prompt"), Err(AppError::BadRequest(ref m)) if m == "missing prompt"));
    assert!(matches!(required(Some("  ".into()), "prompt"), Err(AppError::BadRequest(_))));
    assert_eq!(required(Some("hi".into()), "prompt").expect("present"), "hi");
}

#[test]
fn decisions_parse_case_insensitively() {
    assert_eq!(PermissionDecision::parse(" YES "), PermissionDecision::Allow);
    assert_eq!(PermissionDecision::parse("No"), PermissionDecision::Deny);
    assert_eq!(PermissionDecision::parse("abort"), PermissionDecision::Abort);
    assert_eq!(
        PermissionDecision::parse(" only the tests dir "),
        PermissionDecision::Custom("only the tests dir".into())
    );
}

#[test]
fn endpoint_urls_follow_security_flag() {
    let plain = Endpoint::new("http://10.0.0.2/", 3000, None, false);
    assert_eq!(plain.address(), "10.0.0.2");
    assert_eq!(plain.base_url().expect("url").as_str(), "http://10.0.0.2:3000/");
    assert_eq!(plain.channel_url().expect("url").as_str(), "ws://10.0.0.2:3000/ws");

    let tls = Endpoint::infer("bridge.local", 443, Some("t".into()));
    assert!(tls.is_secure());
    assert_eq!(tls.channel_url().expect("url").scheme(), "wss");
}

#[test]
fn endpoint_rejects_invalid_address_and_port() {
    assert!(matches!(
        Endpoint::new("bad host", 3000, None, false).base_url(),
        Err(AppError::ConnectionFailed(_))
    ));
    assert!(matches!(
        Endpoint::new("localhost", 0, None, false).base_url(),
        Err(AppError::ConnectionFailed(_))
    ));
}

#[test]
fn endpoint_drops_empty_token() {
    let endpoint = Endpoint::new("localhost", 3000, Some(String::new()), false);
    assert_eq!(endpoint.auth_token(), None);
}
