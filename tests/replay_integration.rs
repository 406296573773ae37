mod common;

use std::collections::HashSet;

use axum::http::StatusCode;
use serde_json::{Value, json};

use a1_mediator::busloop::process_inbound;
use a1_mediator::codec;
use common::{adm_instance_body, adm_type_body, make_mediator, request};

// ══════════════════════════════════════════════════════════════════
// Replay scenarios: a restarting handler sends PolicyQuery and the
// loop answers with one CREATE per live instance over the reverse
// path.
// ══════════════════════════════════════════════════════════════════

const TID: i64 = 6660666;

async fn seed_instances(h: &common::TestMediator, iids: &[&str]) {
    let (status, _) = request(
        &h.router,
        "PUT",
        "/a1-p/policytypes/6660666",
        Some(adm_type_body(TID)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    for iid in iids {
        let uri = format!("/a1-p/policytypes/6660666/policies/{iid}");
        let (status, _) = request(&h.router, "PUT", &uri, Some(adm_instance_body())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
}

#[tokio::test]
async fn test_query_replays_every_live_instance() {
    let h = make_mediator();
    seed_instances(&h, &["pi_1", "pi_2"]).await;

    h.bus
        .inject(
            codec::POLICY_QUERY,
            TID as i32,
            json!({"policy_type_id": TID}).to_string().into_bytes(),
        )
        .await;
    process_inbound(&h.mediator).await;

    let returned = h.bus.returned().await;
    assert_eq!(returned.len(), 2);

    let mut seen = HashSet::new();
    for msg in &returned {
        assert_eq!(msg.mtype, codec::POLICY_REQUEST);
        assert_eq!(msg.subid, TID as i32);
        let envelope: Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(envelope["operation"], "CREATE");
        assert_eq!(envelope["policy_type_id"], TID);
        assert_eq!(envelope["payload"], adm_instance_body());
        seen.insert(envelope["policy_instance_id"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, HashSet::from(["pi_1".to_string(), "pi_2".to_string()]));
}

#[tokio::test]
async fn test_query_for_type_without_instances_replays_nothing() {
    let h = make_mediator();
    seed_instances(&h, &[]).await;

    h.bus
        .inject(
            codec::POLICY_QUERY,
            TID as i32,
            json!({"policy_type_id": TID}).to_string().into_bytes(),
        )
        .await;
    process_inbound(&h.mediator).await;

    assert!(h.bus.returned().await.is_empty());
    assert_eq!(h.bus.freed_count().await, 1);
}

#[tokio::test]
async fn test_query_for_unknown_type_is_dropped() {
    let h = make_mediator();

    h.bus
        .inject(
            codec::POLICY_QUERY,
            0,
            json!({"policy_type_id": 424242}).to_string().into_bytes(),
        )
        .await;
    process_inbound(&h.mediator).await;

    assert!(h.bus.returned().await.is_empty());
    assert_eq!(h.bus.freed_count().await, 1);
}

#[tokio::test]
async fn test_malformed_query_is_dropped() {
    let h = make_mediator();

    h.bus
        .inject(codec::POLICY_QUERY, 0, b"{}".to_vec())
        .await;
    process_inbound(&h.mediator).await;

    assert!(h.bus.returned().await.is_empty());
    assert_eq!(h.bus.freed_count().await, 1);
}
