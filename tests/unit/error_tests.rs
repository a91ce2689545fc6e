//! `AppError` display format, wire kinds and conversions.

use companion_bridge::AppError;

#[test]
fn display_is_kind_prefixed() {
    assert_eq!(
        AppError::ConnectionFailed("refused".into()).to_string(),
        "connection failed: refused"
    );
    assert_eq!(
        AppError::SessionNotFound("abc".into()).to_string(),
        "session not found: abc"
    );
    assert_eq!(AppError::AuthenticationFailed.to_string(), "authentication failed");
}

#[test]
fn messages_have_no_trailing_period() {
    let err = AppError::Timeout("prompt exceeded 5s".into());
    assert!(!err.to_string().ends_with('.'));
}

#[test]
fn kinds_are_stable_snake_case() {
    let cases = [
        (AppError::BadRequest(String::new()), "bad_request"),
        (AppError::AuthenticationFailed, "authentication_failed"),
        (AppError::Network(String::new()), "network"),
        (AppError::InvalidResponse(String::new()), "invalid_response"),
        (AppError::SessionNotFound(String::new()), "session_not_found"),
        (AppError::InvalidSessionState(String::new()), "invalid_session_state"),
        (
            AppError::PermissionAlreadyResolved(String::new()),
            "permission_already_resolved",
        ),
        (AppError::Timeout(String::new()), "timeout"),
    ];
    for (err, kind) in cases {
        assert_eq!(err.kind(), kind);
    }
}

#[test]
fn wire_kind_round_trips() {
    let original = AppError::InvalidSessionState("session s1 is awaiting permission".into());
    let rebuilt = AppError::from_wire(original.kind(), original.detail().to_owned());
    assert_eq!(rebuilt, original);
}

#[test]
fn unknown_wire_kind_is_invalid_response() {
    let err = AppError::from_wire("quota_exceeded", "slow down".into());
    assert!(matches!(err, AppError::InvalidResponse(ref msg) if msg.contains("quota_exceeded")));
}

#[test]
fn json_errors_are_invalid_responses() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{not json")
        .expect_err("invalid json")
        .into();
    assert!(matches!(err, AppError::InvalidResponse(_)));
}

#[test]
fn toml_errors_are_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("= nope")
        .expect_err("invalid toml")
        .into();
    assert!(err.to_string().starts_with("config:"));
}
