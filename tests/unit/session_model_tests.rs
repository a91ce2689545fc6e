//! Session lifecycle rules and list-view summaries.

use companion_bridge::models::permission::PermissionRequest;
use companion_bridge::models::session::{Session, SessionStatus};

#[test]
fn new_session_is_active_and_unique() {
    let first = Session::new(None);
    let second = Session::new(None);

    assert_eq!(first.status, SessionStatus::Active);
    assert_ne!(first.id, second.id);
    assert_eq!(first.created_at, first.updated_at);
    assert_eq!(first.prompt_count, 0);
}

#[test]
fn touch_never_moves_backwards() {
    let mut session = Session::new(None);
    let before = session.updated_at;
    session.touch();
    assert!(session.updated_at >= before);

    session.updated_at += chrono::Duration::hours(1);
    let future = session.updated_at;
    session.touch();
    assert_eq!(session.updated_at, future);
}

#[test]
fn allowed_transitions() {
    let mut session = Session::new(None);
    assert!(session.can_transition_to(SessionStatus::AwaitingPermission));
    assert!(session.can_transition_to(SessionStatus::Closed));
    assert!(!session.can_transition_to(SessionStatus::Active));

    session.status = SessionStatus::AwaitingPermission;
    assert!(session.can_transition_to(SessionStatus::Active));
    assert!(session.can_transition_to(SessionStatus::Closed));
}

#[test]
fn closed_is_terminal() {
    let mut session = Session::new(None);
    session.status = SessionStatus::Closed;
    for next in [
        SessionStatus::Active,
        SessionStatus::AwaitingPermission,
        SessionStatus::Closed,
    ] {
        assert!(!session.can_transition_to(next));
    }
}

#[test]
fn summary_reflects_pending_permission() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut session = Session::new(Some(temp.path().to_path_buf()));
    session.status = SessionStatus::AwaitingPermission;
    session.pending_permission = Some(PermissionRequest::new(session.id.clone(), "ok?".into()));
    session.prompt_count = 2;

    let summary = session.summary();
    assert_eq!(summary.id, session.id);
    assert!(summary.awaiting_permission);
    assert_eq!(summary.prompt_count, 2);
    assert_eq!(summary.working_directory.as_deref(), Some(temp.path()));

    let value = serde_json::to_value(&summary).expect("serialize");
    assert_eq!(value["status"], "awaiting_permission");
    assert_eq!(value["awaitingPermission"], true);
}
