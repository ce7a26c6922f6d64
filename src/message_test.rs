use super::*;
use serde_json::json;

fn classify(value: Value) -> Message {
    Message::from_value(value).expect("object should classify")
}

#[test]
fn client_type_wins_over_type() {
    let msg = classify(json!({"client_type": "unity", "type": "heartbeat"}));
    let Message::Handshake { client_type, .. } = msg else {
        panic!("expected handshake, got {msg:?}");
    };
    assert_eq!(client_type, "unity");
}

#[test]
fn non_string_client_type_is_stringified() {
    let msg = classify(json!({"client_type": 7}));
    assert!(matches!(msg, Message::Handshake { ref client_type, .. } if client_type == "7"));
}

#[test]
fn reserved_types_classify() {
    assert!(classify(json!({"type": "heartbeat", "server_time": 1.5})).is_heartbeat());
    assert!(matches!(
        classify(json!({"type": "welcome", "client_id": "abc"})),
        Message::Welcome { client_id: Some(ref id), .. } if id == "abc"
    ));
    assert!(matches!(
        classify(json!({"type": "connection_established"})),
        Message::ConnectionEstablished { client_id: None, .. }
    ));
}

#[test]
fn error_prefers_message_then_error_field() {
    let msg = classify(json!({"type": "error", "error": "boom"}));
    assert!(matches!(msg, Message::Error { ref error, .. } if error == "boom"));

    let msg = classify(json!({"type": "error", "message": "first", "error": "second"}));
    assert!(matches!(msg, Message::Error { ref error, .. } if error == "first"));

    let msg = classify(json!({"type": "error"}));
    assert!(matches!(msg, Message::Error { ref error, .. } if error == "unknown error"));
}

#[test]
fn unknown_type_is_custom_and_missing_type_is_untyped() {
    let msg = classify(json!({"type": "product_generated", "day": 3}));
    assert_eq!(msg.kind(), Some("product_generated"));
    assert!(matches!(msg, Message::Custom { ref kind, .. } if kind == "product_generated"));

    let msg = classify(json!({"day": 3}));
    assert!(matches!(msg, Message::Untyped { .. }));
    assert_eq!(msg.kind(), None);

    // A non-string type is as good as absent.
    assert!(matches!(classify(json!({"type": 42})), Message::Untyped { .. }));
}

#[test]
fn non_object_is_protocol_error() {
    let err = Message::from_value(json!([1, 2])).unwrap_err();
    assert!(matches!(err, RelayError::Protocol(ref m) if m.contains("array")));
}

#[test]
fn try_from_value_classifies_objects_and_rejects_the_rest() {
    let msg = Message::try_from(json!({"type": "welcome", "client_id": "c1"})).expect("object converts");
    assert!(matches!(msg, Message::Welcome { client_id: Some(ref id), .. } if id == "c1"));

    let err = Message::try_from(json!("text")).unwrap_err();
    assert_eq!(err.error_code(), "E_PROTOCOL");
}

#[test]
fn parse_reports_framing_for_bad_json() {
    let err = Message::parse(b"{\"type\": ").unwrap_err();
    assert_eq!(err.error_code(), "E_FRAMING");
    let err = Message::parse(b"\"just a string\"").unwrap_err();
    assert_eq!(err.error_code(), "E_PROTOCOL");
}

#[test]
fn unknown_fields_survive_reserialization() {
    let raw = r#"{"type":"sim_day","day":4,"tasks":[{"name":"a"}]}"#;
    let msg = Message::parse(raw.as_bytes()).unwrap();
    let back: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
    assert_eq!(back, serde_json::from_str::<Value>(raw).unwrap());
}

#[test]
fn connection_established_shape() {
    let msg = Message::connection_established("abc", "unity");
    assert_eq!(msg.kind(), Some("connection_established"));
    assert_eq!(msg.get("client_id").and_then(Value::as_str), Some("abc"));
    assert!(msg.get("server_time").and_then(Value::as_f64).unwrap() > 0.0);
    assert!(msg.get("message").and_then(Value::as_str).unwrap().contains("unity"));
}

#[test]
fn error_from_carries_code_and_both_text_keys() {
    let msg = Message::error_from(&RelayError::Protocol("message missing type field".into()));
    assert_eq!(msg.get("code").and_then(Value::as_str), Some("E_PROTOCOL"));
    assert_eq!(msg.get("error"), msg.get("message"));
    assert!(matches!(msg, Message::Error { ref error, .. } if error.contains("missing type")));
}

#[test]
fn handshake_announces_type_and_version() {
    let msg = Message::handshake("dashboard");
    assert!(matches!(msg, Message::Handshake { ref client_type, .. } if client_type == "dashboard"));
    assert_eq!(msg.get("version").and_then(Value::as_str), Some(PROTOCOL_VERSION));
    assert!(msg.get("system_info").is_some_and(Value::is_object));
}

#[test]
fn with_data_reclassifies() {
    let msg = Message::new("echo").with_data("client_type", "unity");
    assert!(matches!(msg, Message::Handshake { .. }));
}

#[test]
fn client_heartbeat_carries_optional_id() {
    let msg = Message::client_heartbeat(None);
    assert_eq!(msg.get("client_id"), Some(&Value::Null));
    let msg = Message::client_heartbeat(Some("abc"));
    assert_eq!(msg.get("client_id").and_then(Value::as_str), Some("abc"));
    assert!(msg.get("timestamp").is_some());
}

#[test]
fn serde_round_trip_via_derive_impls() {
    let msg = Message::new("echo").with_data("text", "hi");
    let json = serde_json::to_string(&msg).unwrap();
    let restored: Message = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, msg);
}
