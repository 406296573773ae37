use std::sync::LazyLock;

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/* ============================= PROMETHEUS ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static CREATE_POLICY_TYPE_REQS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("CreatePolicyTypeReqs", "Total policy type creation requests")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static DELETE_POLICY_TYPE_REQS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("DeletePolicyTypeReqs", "Total policy type deletion requests")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static CREATE_POLICY_INSTANCE_REQS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "CreatePolicyInstanceReqs",
        "Total policy instance creation requests",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static DELETE_POLICY_INSTANCE_REQS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "DeletePolicyInstanceReqs",
        "Total policy instance deletion requests",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RMR_SEND_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "A1RmrSendFailures",
        "Total bus sends dropped after the retry budget",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RMR_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("A1RmrReceived", "Total bus messages received by the loop")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/// Force-init every counter so they appear on the first scrape.
pub fn force_init() {
    LazyLock::force(&CREATE_POLICY_TYPE_REQS);
    LazyLock::force(&DELETE_POLICY_TYPE_REQS);
    LazyLock::force(&CREATE_POLICY_INSTANCE_REQS);
    LazyLock::force(&DELETE_POLICY_INSTANCE_REQS);
    LazyLock::force(&RMR_SEND_FAILURES);
    LazyLock::force(&RMR_RECEIVED);
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/* ============================= TESTS ============================= */
