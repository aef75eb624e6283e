use serde_json::json;

use super::*;

// ==================== ClientFrame wire shape ====================

#[test]
fn test_publish_frame_serializes_with_camel_case_request_id() {
    let frame = ClientFrame::Publish {
        topic: "chat/general".to_string(),
        data: json!({"text": "hi"}),
        request_id: "r1".to_string(),
    };

    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "publish",
            "topic": "chat/general",
            "data": {"text": "hi"},
            "requestId": "r1"
        })
    );
}

#[test]
fn test_global_unsubscribe_omits_topic() {
    let frame = ClientFrame::Unsubscribe {
        topic: None,
        request_id: "r9".to_string(),
    };

    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value, json!({"type": "unsubscribe", "requestId": "r9"}));
}

#[test]
fn test_scoped_unsubscribe_keeps_topic() {
    let frame = ClientFrame::Unsubscribe {
        topic: Some("t".to_string()),
        request_id: "r9".to_string(),
    };

    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["topic"], "t");
}

// ==================== ServerFrame decoding ====================

#[test]
fn test_ready_frame_decodes_client_id() {
    let frame: ServerFrame =
        serde_json::from_str(r#"{"type":"ready","clientId":"abc"}"#).unwrap();
    assert!(matches!(frame, ServerFrame::Ready { client_id } if client_id == "abc"));
}

#[test]
fn test_message_frame_preserves_arbitrary_data() {
    let frame: ServerFrame = serde_json::from_str(
        r#"{"type":"message","id":"m1","topic":"orders/*","created":"2024-01-01T00:00:00Z","data":{"action":"create","n":[1,2,null]}}"#,
    )
    .unwrap();

    match frame {
        ServerFrame::Message { id, topic, data, .. } => {
            assert_eq!(id, "m1");
            assert_eq!(topic, "orders/*");
            assert_eq!(data["action"], "create");
            assert_eq!(data["n"], json!([1, 2, null]));
        }
        other => panic!("expected message frame, got {:?}", other),
    }
}

#[test]
fn test_published_frame_tolerates_extra_fields() {
    let frame: ServerFrame = serde_json::from_str(
        r#"{"type":"published","requestId":"r1","id":"msg1","topic":"t","created":"2024-01-01T00:00:01Z","serverOnly":true}"#,
    )
    .unwrap();
    assert_eq!(frame.request_id(), Some("r1"));
}

#[test]
fn test_error_frame_without_request_id_is_connection_level() {
    let frame: ServerFrame =
        serde_json::from_str(r#"{"type":"error","message":"boom"}"#).unwrap();
    assert_eq!(frame.request_id(), None);
    assert!(matches!(frame, ServerFrame::Error { message, .. } if message == "boom"));
}

#[test]
fn test_unknown_frame_type_fails_to_decode() {
    let result = serde_json::from_str::<ServerFrame>(r#"{"type":"telemetry"}"#);
    assert!(result.is_err(), "unknown frame types are rejected, then skipped by the reader");
}

// ==================== Realtime payloads ====================

#[test]
fn test_record_event_decodes_known_actions() {
    let event: RecordEvent =
        serde_json::from_str(r#"{"action":"create","record":{"id":"rec1"}}"#).unwrap();
    assert_eq!(event.action, RecordAction::Create);
    assert_eq!(event.record["id"], "rec1");
}

#[test]
fn test_record_event_maps_unrecognized_action_to_unknown() {
    let event: RecordEvent = serde_json::from_str(r#"{"action":"archive","record":{}}"#).unwrap();
    assert_eq!(event.action, RecordAction::Unknown);
}

#[test]
fn test_topic_submission_wire_shape() {
    let submission = TopicSubmission {
        client_id: "abc".to_string(),
        subscriptions: vec!["t1".to_string(), "t2".to_string()],
    };
    let value = serde_json::to_value(&submission).unwrap();
    assert_eq!(
        value,
        json!({"clientId": "abc", "subscriptions": ["t1", "t2"]})
    );
}
