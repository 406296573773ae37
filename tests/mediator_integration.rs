mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{Value, json};

use a1_mediator::busloop::{drain_outbound, process_inbound};
use a1_mediator::codec;
use common::{adm_instance_body, adm_type_body, make_mediator_with_ttl, request};

// ══════════════════════════════════════════════════════════════════
// Mediator end-to-end scenarios (in-memory store + loopback bus)
//
// Walks the full instance lifecycle: create → fan-out → ack →
// delete → grace window → purge, plus the no-ack timeout path.
// ══════════════════════════════════════════════════════════════════

const TID: i64 = 6660666;
const TYPE_URI: &str = "/a1-p/policytypes/6660666";
const INSTANCE_URI: &str = "/a1-p/policytypes/6660666/policies/admission_control_policy";
const STATUS_URI: &str = "/a1-p/policytypes/6660666/policies/admission_control_policy/status";

fn ack_body(status: &str) -> Value {
    json!({
        "policy_type_id": TID,
        "policy_instance_id": "admission_control_policy",
        "handler_id": "xapp-1",
        "status": status
    })
}

#[tokio::test]
async fn test_happy_path_lifecycle() {
    let h = make_mediator_with_ttl(Duration::from_millis(400), Duration::from_millis(400));

    // 1. Create the type
    let (status, _) = request(&h.router, "PUT", TYPE_URI, Some(adm_type_body(TID))).await;
    assert_eq!(status, StatusCode::CREATED);

    // 2. Create the instance
    let (status, _) = request(&h.router, "PUT", INSTANCE_URI, Some(adm_instance_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // The CREATE fan-out leaves on the next drain
    drain_outbound(&h.mediator).await;
    let sent = h.bus.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].mtype, codec::POLICY_REQUEST);
    assert_eq!(sent[0].subid, TID as i32);
    let envelope: Value = serde_json::from_slice(&sent[0].payload).unwrap();
    assert_eq!(envelope["operation"], "CREATE");

    // 3. No acks yet
    let (status, body) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance_status"], "NOT IN EFFECT");
    assert_eq!(body["has_been_deleted"], false);

    // 4. A handler acks OK
    h.bus
        .inject(codec::POLICY_RESPONSE, 0, ack_body("OK").to_string().into_bytes())
        .await;
    process_inbound(&h.mediator).await;

    let (_, body) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(body["instance_status"], "IN EFFECT");

    // 5. Delete: tombstoned but still visible during the grace window
    let (status, _) = request(&h.router, "DELETE", INSTANCE_URI, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance_status"], "IN EFFECT");
    assert_eq!(body["has_been_deleted"], true);

    drain_outbound(&h.mediator).await;
    let sent = h.bus.sent().await;
    let delete_envelope: Value = serde_json::from_slice(&sent[1].payload).unwrap();
    assert_eq!(delete_envelope["operation"], "DELETE");
    assert_eq!(delete_envelope["payload"], "");

    // 6. The handler confirms the removal
    h.bus
        .inject(
            codec::POLICY_RESPONSE,
            0,
            ack_body("DELETED").to_string().into_bytes(),
        )
        .await;
    process_inbound(&h.mediator).await;

    let (_, body) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(body["instance_status"], "NOT IN EFFECT");
    assert_eq!(body["has_been_deleted"], true);

    // 7. After the grace window everything is purged
    tokio::time::sleep(Duration::from_millis(800)).await;
    let (status, _) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = request(&h.router, "GET", INSTANCE_URI, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // 8. The type can now be removed
    let (status, _) = request(&h.router, "DELETE", TYPE_URI, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_timeout_path_purges_without_acks() {
    let h = make_mediator_with_ttl(Duration::from_millis(100), Duration::from_secs(60));

    request(&h.router, "PUT", TYPE_URI, Some(adm_type_body(TID))).await;
    let (status, _) = request(&h.router, "PUT", INSTANCE_URI, Some(adm_instance_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // No handler ever answers; the delete uses the no-response window.
    let (status, _) = request(&h.router, "DELETE", INSTANCE_URI, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let (status, _) = request(&h.router, "GET", INSTANCE_URI, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = request(
        &h.router,
        "GET",
        "/a1-p/policytypes/6660666/policies",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_acked_delete_uses_larger_window() {
    // With a status present, the grace window is max(resp, no_resp).
    let h = make_mediator_with_ttl(Duration::from_millis(50), Duration::from_millis(600));

    request(&h.router, "PUT", TYPE_URI, Some(adm_type_body(TID))).await;
    request(&h.router, "PUT", INSTANCE_URI, Some(adm_instance_body())).await;

    h.bus
        .inject(codec::POLICY_RESPONSE, 0, ack_body("OK").to_string().into_bytes())
        .await;
    process_inbound(&h.mediator).await;

    request(&h.router, "DELETE", INSTANCE_URI, None).await;

    // Well past no_resp but inside resp: still tombstoned, not purged
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (status, body) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_been_deleted"], true);

    tokio::time::sleep(Duration::from_millis(700)).await;
    let (status, _) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_replace_resets_handler_statuses() {
    let h = make_mediator_with_ttl(Duration::from_secs(60), Duration::from_secs(60));

    request(&h.router, "PUT", TYPE_URI, Some(adm_type_body(TID))).await;
    request(&h.router, "PUT", INSTANCE_URI, Some(adm_instance_body())).await;

    h.bus
        .inject(codec::POLICY_RESPONSE, 0, ack_body("OK").to_string().into_bytes())
        .await;
    process_inbound(&h.mediator).await;
    let (_, body) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(body["instance_status"], "IN EFFECT");

    // Replacing the instance starts a new generation: old acks are gone.
    let (status, _) = request(&h.router, "PUT", INSTANCE_URI, Some(adm_instance_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (_, body) = request(&h.router, "GET", STATUS_URI, None).await;
    assert_eq!(body["instance_status"], "NOT IN EFFECT");
}

#[tokio::test]
async fn test_every_inbound_message_is_freed() {
    let h = make_mediator_with_ttl(Duration::from_secs(60), Duration::from_secs(60));
    request(&h.router, "PUT", TYPE_URI, Some(adm_type_body(TID))).await;

    // One valid ack for a missing instance, one malformed blob, one query.
    h.bus
        .inject(codec::POLICY_RESPONSE, 0, ack_body("OK").to_string().into_bytes())
        .await;
    h.bus
        .inject(codec::POLICY_RESPONSE, 0, b"garbage".to_vec())
        .await;
    h.bus
        .inject(
            codec::POLICY_QUERY,
            0,
            json!({"policy_type_id": TID}).to_string().into_bytes(),
        )
        .await;

    process_inbound(&h.mediator).await;
    assert_eq!(h.bus.freed_count().await, 3);
}
