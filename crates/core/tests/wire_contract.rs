//! Wire-contract tests for the inbound event envelope and the decision
//! request/response JSON shapes.

use chrono::{TimeZone, Utc};
use sendflow_core::types::*;

#[test]
fn test_decision_request_accepts_snake_case_wire_format() {
    let json = r#"{
        "identifiers": {
            "email": "alice@example.com",
            "klaviyo_id": "k_alice"
        },
        "send_after": "2024-01-08T08:00:00Z",
        "send_before": "2024-01-08T10:00:00Z",
        "latency_estimate_seconds": 300
    }"#;

    let request: DecisionRequest = serde_json::from_str(json).unwrap();
    assert_eq!(request.identifiers.email.as_deref(), Some("alice@example.com"));
    assert_eq!(request.identifiers.klaviyo_id.as_deref(), Some("k_alice"));
    assert!(request.identifiers.phone.is_none());
    assert_eq!(
        request.send_after,
        Some(Utc.with_ymd_and_hms(2024, 1, 8, 8, 0, 0).unwrap())
    );
    assert_eq!(request.latency_estimate_seconds, Some(300.0));
}

#[test]
fn test_decision_request_window_is_optional() {
    let request: DecisionRequest =
        serde_json::from_str(r#"{"identifiers": {"email": "a@b.com"}}"#).unwrap();
    assert!(request.send_after.is_none());
    assert!(request.send_before.is_none());
    assert!(request.latency_estimate_seconds.is_none());
}

#[test]
fn test_inbound_event_tolerates_partial_payloads() {
    // Deserialization never fails on missing fields; validation does.
    let inbound: InboundEvent = serde_json::from_str(r#"{"event_type": "opened"}"#).unwrap();
    assert!(inbound.event_id.is_none());
    assert_eq!(inbound.event_type.as_deref(), Some("opened"));
    assert!(inbound.metadata.is_null());
}

#[test]
fn test_inbound_event_full_envelope() {
    let json = r#"{
        "event_id": "ev-123",
        "event_type": "clicked",
        "timestamp": "2024-01-03T12:00:00Z",
        "esp": "klaviyo",
        "recipient_email": "alice@example.com",
        "campaign_id": "camp-9",
        "metadata": {"klaviyo_id": "k_alice", "latency_seconds": 42.0}
    }"#;
    let inbound: InboundEvent = serde_json::from_str(json).unwrap();
    assert_eq!(inbound.event_id.as_deref(), Some("ev-123"));
    assert_eq!(inbound.campaign_id.as_deref(), Some("camp-9"));
    assert_eq!(inbound.metadata["klaviyo_id"], "k_alice");
}

#[test]
fn test_timing_decision_serializes_snake_case() {
    let decision = TimingDecision {
        decision_id: uuid::Uuid::new_v4(),
        universal_id: UniversalId::from_string("sf_0011223344556677"),
        target_minute: 540,
        trigger_timestamp_utc: Utc.with_ymd_and_hms(2024, 1, 8, 8, 55, 0).unwrap(),
        latency_estimate_seconds: 300.0,
        confidence_score: 0.42,
        model_version: "heuristic-v1".to_string(),
        base_curve_peak_minute: 540,
        applied_weights: vec![AppliedWeight {
            signal: EventType::SiteVisit,
            magnitude: 1.43,
            minutes_ago: 5,
        }],
        suppressed: false,
        suppression_reason: None,
        suppression_until: None,
        explanation_ref: "exp_1".to_string(),
        created_at: Utc::now(),
    };

    let value = serde_json::to_value(&decision).unwrap();
    assert_eq!(value["target_minute"], 540);
    assert_eq!(value["universal_id"], "sf_0011223344556677");
    assert_eq!(value["applied_weights"][0]["signal"], "site_visit");
    assert_eq!(value["suppressed"], false);

    // Round-trip.
    let back: TimingDecision = serde_json::from_value(value).unwrap();
    assert_eq!(back.target_minute, decision.target_minute);
    assert_eq!(back.universal_id, decision.universal_id);
}

#[test]
fn test_dead_letter_payload_shape() {
    let letter = DeadLetter {
        error: "invalid_input: missing event_id".to_string(),
        original_key: None,
        original_value: "{\"event_type\":\"opened\"}".to_string(),
        partition: 3,
        offset: 117,
        ingested_at: Utc::now(),
    };
    let value = serde_json::to_value(&letter).unwrap();
    assert_eq!(value["partition"], 3);
    assert_eq!(value["offset"], 117);
    assert!(value["error"].as_str().unwrap().starts_with("invalid_input"));
}

#[test]
fn test_event_type_wire_names() {
    assert_eq!(
        serde_json::to_value(EventType::UnsubscribeRequest).unwrap(),
        "unsubscribe_request"
    );
    assert_eq!(
        serde_json::from_value::<EventType>(serde_json::json!("sms_click")).unwrap(),
        EventType::SmsClick
    );
}
