use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::bus::{Bus, BusError, InboundMessage};
use crate::codec::{self, EiDelivery, Operation, PolicyQuery, PolicyRequest, PolicyResponse};
use crate::config::Config;
use crate::ei::EiBridge;
use crate::metrics::{RMR_RECEIVED, RMR_SEND_FAILURES};
use crate::registry::{PolicyRegistry, RegistryError};

/* ============================= CONFIG ============================= */

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A loop that has not ticked for this long is considered dead.
pub const STALE_TICK_LIMIT_SECONDS: u64 = 30;

/* ============================= QUEUE ENTRIES ============================= */

/// A pending policy fan-out, enqueued by the facade.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub operation: Operation,
    pub policy_type_id: i64,
    pub policy_instance_id: String,
    pub payload: Value,
}

/// A pending EI delivery, enqueued by the data-delivery surface.
#[derive(Debug, Clone)]
pub struct EiJob {
    pub job_id: String,
    pub payload: Value,
}

/* ============================= MEDIATOR ============================= */

/// Shared context tying the registry, the bus and the two outbound
/// queues together. The HTTP facade, the loop and the health probe all
/// hold the same `Arc`.
pub struct Mediator {
    pub registry: PolicyRegistry,
    pub bus: Arc<dyn Bus>,
    pub ei: EiBridge,
    send_queue: Mutex<VecDeque<SendJob>>,
    ei_queue: Mutex<VecDeque<EiJob>>,
    last_tick: AtomicU64,
    loop_alive: AtomicBool,
    keep_going: AtomicBool,
    retry_times: u32,
}

impl Mediator {
    pub fn new(
        registry: PolicyRegistry,
        bus: Arc<dyn Bus>,
        ei: EiBridge,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bus,
            ei,
            send_queue: Mutex::new(VecDeque::new()),
            ei_queue: Mutex::new(VecDeque::new()),
            last_tick: AtomicU64::new(0),
            loop_alive: AtomicBool::new(false),
            keep_going: AtomicBool::new(true),
            retry_times: config.rmr_retry_times,
        })
    }

    pub async fn enqueue_policy_request(
        &self,
        operation: Operation,
        policy_type_id: i64,
        policy_instance_id: &str,
        payload: Value,
    ) {
        self.send_queue.lock().await.push_back(SendJob {
            operation,
            policy_type_id,
            policy_instance_id: policy_instance_id.to_string(),
            payload,
        });
    }

    pub async fn enqueue_ei_delivery(&self, job_id: &str, payload: Value) {
        self.ei_queue.lock().await.push_back(EiJob {
            job_id: job_id.to_string(),
            payload,
        });
    }

    /// Liveness: the loop is alive, ticked recently, and the store answers.
    pub async fn healthy(&self) -> bool {
        if !self.loop_alive.load(Ordering::Relaxed) {
            return false;
        }
        let last = self.last_tick.load(Ordering::Relaxed);
        let now = Utc::now().timestamp() as u64;
        if now.saturating_sub(last) >= STALE_TICK_LIMIT_SECONDS {
            return false;
        }
        self.registry.store().healthy().await
    }

    pub fn record_tick(&self) {
        self.last_tick
            .store(Utc::now().timestamp() as u64, Ordering::Relaxed);
    }

    pub fn mark_loop_alive(&self, alive: bool) {
        self.loop_alive.store(alive, Ordering::Relaxed);
    }

    /// Ask the loop to stop at the next tick boundary. In-flight sends
    /// and delete finalizers are not cancelled.
    pub fn shutdown(&self) {
        self.keep_going.store(false, Ordering::Relaxed);
    }

    pub fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::Relaxed)
    }
}

/* ============================= LOOP ============================= */

/// The single background worker coupling the store to the bus.
pub async fn run(mediator: Arc<Mediator>) {
    while !mediator.bus.ready().await {
        if !mediator.keep_going() {
            return;
        }
        sleep(READY_POLL_INTERVAL).await;
    }

    mediator.mark_loop_alive(true);
    mediator.record_tick();
    info!("bus_loop_started");

    while mediator.keep_going() {
        // Detached drain: a blocking first-contact send must not stall
        // ingestion or push the tick past the liveness window.
        let drain = mediator.clone();
        tokio::spawn(async move { drain_outbound(&drain).await });

        process_inbound(&mediator).await;
        mediator.record_tick();
        sleep(TICK_INTERVAL).await;
    }

    mediator.mark_loop_alive(false);
    info!("bus_loop_stopped");
}

/// Empty both outbound queues onto the bus, oldest first.
pub async fn drain_outbound(mediator: &Mediator) {
    let jobs = {
        let mut queue = mediator.send_queue.lock().await;
        mem::take(&mut *queue)
    };
    for job in jobs {
        let subid = job.policy_type_id as i32;
        let envelope = PolicyRequest {
            operation: job.operation,
            policy_type_id: job.policy_type_id,
            policy_instance_id: job.policy_instance_id,
            payload: job.payload,
        };
        match serde_json::to_vec(&envelope) {
            Ok(payload) => {
                send_with_retry(mediator, payload, codec::POLICY_REQUEST, subid).await;
            }
            Err(e) => warn!(error = %e, "unencodable_policy_request"),
        }
    }

    let jobs = {
        let mut queue = mediator.ei_queue.lock().await;
        mem::take(&mut *queue)
    };
    for job in jobs {
        let subid = subid_for_job(&job.job_id);
        let envelope = EiDelivery {
            ei_job_id: job.job_id,
            payload: job.payload,
        };
        match serde_json::to_vec(&envelope) {
            Ok(payload) => {
                send_with_retry(mediator, payload, codec::EI_DELIVERY, subid).await;
            }
            Err(e) => warn!(error = %e, "unencodable_ei_delivery"),
        }
    }
}

/// Receive pending inbound traffic, dispatch it, and free every handle.
pub async fn process_inbound(mediator: &Mediator) {
    let batch = mediator.bus.recv_batch(&codec::INBOUND_FILTER).await;
    for msg in batch {
        RMR_RECEIVED.inc();
        dispatch(mediator, &msg).await;
        mediator.bus.free(msg).await;
    }
}

async fn dispatch(mediator: &Mediator, msg: &InboundMessage) {
    match msg.mtype {
        codec::POLICY_RESPONSE => handle_policy_response(mediator, msg).await,
        codec::POLICY_QUERY => handle_policy_query(mediator, msg).await,
        codec::EI_QUERY_ALL => {
            mediator
                .ei
                .handle_query_all(mediator.bus.as_ref(), msg)
                .await
        }
        codec::EI_CREATE_JOB => {
            mediator
                .ei
                .handle_create_job(mediator.bus.as_ref(), msg)
                .await
        }
        other => warn!(mtype = other, "unexpected_message_type"),
    }
}

/* ============================= DISPATCH HANDLERS ============================= */

async fn handle_policy_response(mediator: &Mediator, msg: &InboundMessage) {
    let resp: PolicyResponse = match serde_json::from_slice(&msg.payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed_policy_response");
            return;
        }
    };

    match mediator
        .registry
        .set_status(
            resp.policy_type_id,
            &resp.policy_instance_id,
            &resp.handler_id,
            &resp.status,
        )
        .await
    {
        Ok(()) => {}
        Err(RegistryError::TypeNotFound(_)) | Err(RegistryError::InstanceNotFound(_, _)) => {
            warn!(
                policy_type_id = resp.policy_type_id,
                policy_instance_id = %resp.policy_instance_id,
                handler_id = %resp.handler_id,
                "status_for_unknown_instance"
            );
        }
        Err(e) => warn!(error = %e, "status_write_failed"),
    }
}

/// Replay: answer a handler's query with one CREATE per live instance.
async fn handle_policy_query(mediator: &Mediator, msg: &InboundMessage) {
    let query: PolicyQuery = match serde_json::from_slice(&msg.payload) {
        Ok(q) => q,
        Err(e) => {
            warn!(error = %e, "malformed_policy_query");
            return;
        }
    };
    let tid = query.policy_type_id;

    let iids = match mediator.registry.list_instances(tid).await {
        Ok(iids) => iids,
        Err(RegistryError::TypeNotFound(_)) => {
            warn!(policy_type_id = tid, "query_for_unknown_type");
            return;
        }
        Err(e) => {
            warn!(policy_type_id = tid, error = %e, "query_listing_failed");
            return;
        }
    };

    for iid in iids {
        let body = match mediator.registry.get_instance(tid, &iid).await {
            Ok(b) => b,
            Err(e) => {
                warn!(policy_type_id = tid, policy_instance_id = %iid, error = %e, "replay_read_failed");
                continue;
            }
        };
        let request = PolicyRequest {
            operation: Operation::Create,
            policy_type_id: tid,
            policy_instance_id: iid.clone(),
            payload: body,
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unencodable_policy_request");
                continue;
            }
        };
        if let Err(e) = mediator
            .bus
            .rts(msg, payload, codec::POLICY_REQUEST)
            .await
        {
            warn!(policy_type_id = tid, policy_instance_id = %iid, error = %e, "replay_send_failed");
        }
    }
}

/* ============================= SEND RETRY ============================= */

/// One send attempt plus up to `retry_times` repeats while the transport
/// reports a retryable condition. No backoff and no cross-tick state;
/// the replay path carries long-term correctness.
async fn send_with_retry(mediator: &Mediator, payload: Vec<u8>, mtype: u32, subid: i32) {
    let attempts = mediator.retry_times.max(1);
    for attempt in 1..=attempts {
        match mediator.bus.send(payload.clone(), mtype, subid).await {
            Ok(()) => return,
            Err(BusError::Retry) if attempt < attempts => continue,
            Err(e) => {
                warn!(mtype, subid, attempt, error = %e, "send_dropped");
                RMR_SEND_FAILURES.inc();
                return;
            }
        }
    }
}

/// Stable routing id for an EI job: FNV-1a folded into the positive
/// 32-bit range so a job keeps one subscription id across restarts.
fn subid_for_job(job_id: &str) -> i32 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in job_id.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    ((h ^ (h >> 32)) & 0x7fff_ffff) as i32
}

/* ============================= TESTS ============================= */
