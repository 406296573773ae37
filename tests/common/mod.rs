use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use a1_mediator::bus::LoopbackBus;
use a1_mediator::busloop::Mediator;
use a1_mediator::config::Config;
use a1_mediator::ei::EiBridge;
use a1_mediator::http::build_router;
use a1_mediator::registry::PolicyRegistry;
use a1_mediator::store::MemStore;

/// A fully wired mediator over the in-memory store and the loopback bus.
#[allow(dead_code)]
pub struct TestMediator {
    pub mediator: Arc<Mediator>,
    pub router: Router,
    pub bus: Arc<LoopbackBus>,
    pub store: Arc<MemStore>,
}

#[allow(dead_code)]
pub fn make_mediator() -> TestMediator {
    make_mediator_with_ttl(Duration::ZERO, Duration::ZERO)
}

pub fn make_mediator_with_ttl(no_resp_ttl: Duration, resp_ttl: Duration) -> TestMediator {
    let config = Config {
        instance_delete_no_resp_ttl: no_resp_ttl,
        instance_delete_resp_ttl: resp_ttl,
        ..Config::default()
    };
    let store = Arc::new(MemStore::new());
    let registry = PolicyRegistry::new(store.clone(), &config);
    let bus = Arc::new(LoopbackBus::new());
    // Port 1 never answers; EI coordinator calls fail fast when exercised.
    let ei = EiBridge::new("http://127.0.0.1:1");
    let mediator = Mediator::new(registry, bus.clone(), ei, &config);
    let router = build_router(mediator.clone());
    TestMediator {
        mediator,
        router,
        bus,
        store,
    }
}

/// Drive one request through the router, returning status and JSON body.
pub async fn request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, bytes) = request_raw(router, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

pub async fn request_raw(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .expect("request should build"),
        None => builder.body(Body::empty()).expect("request should build"),
    };
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should answer");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes()
        .to_vec();
    (status, bytes)
}

/// The admission-control policy type used throughout the scenarios.
pub fn adm_type_body(tid: i64) -> Value {
    json!({
        "name": "Admission Control",
        "description": "limit admission rates",
        "policy_type_id": tid,
        "create_schema": {
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "class": {"type": "integer"},
                "enforce": {"type": "boolean"},
                "window_length": {"type": "integer"},
                "blocking_rate": {"type": "number"},
                "trigger_threshold": {"type": "integer"}
            },
            "required": ["class", "enforce", "blocking_rate", "trigger_threshold", "window_length"],
            "additionalProperties": false
        }
    })
}

pub fn adm_instance_body() -> Value {
    json!({
        "class": 12,
        "enforce": true,
        "window_length": 20,
        "blocking_rate": 20,
        "trigger_threshold": 10
    })
}
