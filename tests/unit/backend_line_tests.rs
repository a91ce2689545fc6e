//! Backend stdout framing and line classification.

use bytes::BytesMut;
use companion_bridge::backend::codec::{BackendCodec, MAX_LINE_BYTES};
use companion_bridge::backend::reader::{parse_line, BackendLine};
use companion_bridge::AppError;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn partial_line_carries_text_verbatim() {
    let line = r#"{"type":"partial","text":"  indented\n"}"#;
    assert_eq!(
        parse_line(line).expect("parses"),
        Some(BackendLine::Partial("  indented\n".into()))
    );
}

#[test]
fn result_prefers_backend_session_id() {
    let line = r#"{"type":"result","result":"ok","backend_session_id":"b1","session_id":"s1"}"#;
    assert_eq!(
        parse_line(line).expect("parses"),
        Some(BackendLine::Result {
            result: "ok".into(),
            backend_session_id: Some("b1".into()),
        })
    );
}

#[test]
fn result_without_session_id_is_accepted() {
    let line = r#"{"type":"result","result":"ok"}"#;
    assert_eq!(
        parse_line(line).expect("parses"),
        Some(BackendLine::Result {
            result: "ok".into(),
            backend_session_id: None,
        })
    );
}

#[test]
fn result_without_text_is_an_error() {
    let err = parse_line(r#"{"type":"result"}"#).expect_err("missing result");
    assert!(matches!(err, AppError::Backend(ref msg) if msg.contains("result.result")));
}

#[test]
fn error_line_uses_default_message() {
    assert_eq!(
        parse_line(r#"{"type":"error"}"#).expect("parses"),
        Some(BackendLine::Error("backend reported an error".into()))
    );
    assert_eq!(
        parse_line(r#"{"type":"error","message":"rate limited"}"#).expect("parses"),
        Some(BackendLine::Error("rate limited".into()))
    );
}

#[test]
fn brace_prefixed_non_json_is_plain_output() {
    assert_eq!(
        parse_line("{ not json").expect("parses"),
        Some(BackendLine::Partial("{ not json\n".into()))
    );
}

#[test]
fn assistant_message_without_text_is_skipped() {
    let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use"}]}}"#;
    assert_eq!(parse_line(line).expect("parses"), None);
}

#[test]
fn codec_splits_lines_and_keeps_remainder() {
    let mut codec = BackendCodec::new();
    let mut buf = BytesMut::from("first\nsecond\npart");

    assert_eq!(codec.decode(&mut buf).expect("decode"), Some("first".into()));
    assert_eq!(codec.decode(&mut buf).expect("decode"), Some("second".into()));
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    assert_eq!(codec.decode_eof(&mut buf).expect("eof"), Some("part".into()));
}

#[test]
fn codec_rejects_oversized_line() {
    let mut codec = BackendCodec::new();
    let mut buf = BytesMut::from("x".repeat(MAX_LINE_BYTES + 1).as_str());
    buf.extend_from_slice(b"\n");

    let err = codec.decode(&mut buf).expect_err("too long");
    assert!(err.to_string().contains("line too long"));
}

#[test]
fn codec_appends_newline_on_encode() {
    let mut codec = BackendCodec::new();
    let mut dst = BytesMut::new();
    codec.encode("y".to_owned(), &mut dst).expect("encode");
    assert_eq!(&dst[..], b"y\n");
}
