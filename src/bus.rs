use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum BusError {
    /// The transport asked for the send to be attempted again.
    #[error("transport requested a retry")]
    Retry,

    /// The send failed for good; the message is dropped.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/* ============================= MESSAGES ============================= */

/// A received bus message. The handle is owned by the transport and must
/// be given back through [`Bus::free`] after dispatch, on every path.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub mtype: u32,
    pub subid: i32,
    pub payload: Vec<u8>,
    pub handle: u64,
}

/// A message recorded by the loopback transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub mtype: u32,
    pub subid: i32,
    pub payload: Vec<u8>,
}

/* ============================= TRAIT ============================= */

/// Message-bus transport seam.
///
/// The mediator owns exactly one instance; the loop is its only reader.
/// Production deployments implement this over their wire transport; the
/// in-process [`LoopbackBus`] backs local runs and the test suite.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Whether the transport finished initialising.
    async fn ready(&self) -> bool;

    /// Emit a routed message.
    async fn send(&self, payload: Vec<u8>, mtype: u32, subid: i32) -> Result<(), BusError>;

    /// Return-to-sender: answer `incoming` on its reverse path.
    async fn rts(
        &self,
        incoming: &InboundMessage,
        payload: Vec<u8>,
        mtype: u32,
    ) -> Result<(), BusError>;

    /// Drain currently pending messages whose type is in `filter`.
    async fn recv_batch(&self, filter: &[u32]) -> Vec<InboundMessage>;

    /// Release a message handle.
    async fn free(&self, msg: InboundMessage);
}

/* ============================= LOOPBACK BUS ============================= */

/// In-process [`Bus`]: inbound traffic is injected, outbound traffic is
/// recorded. Sends can be made to report `Retry` a number of times to
/// exercise the retry budget.
#[derive(Default)]
pub struct LoopbackBus {
    inbound: Mutex<VecDeque<InboundMessage>>,
    sent: Mutex<Vec<SentMessage>>,
    returned: Mutex<Vec<SentMessage>>,
    freed: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
    retries_pending: AtomicU32,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an inbound message as if a handler had sent it.
    pub async fn inject(&self, mtype: u32, subid: i32, payload: Vec<u8>) {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.inbound.lock().await.push_back(InboundMessage {
            mtype,
            subid,
            payload,
            handle,
        });
    }

    /// Make the next `n` sends report `Retry`.
    pub fn fail_next_sends(&self, n: u32) {
        self.retries_pending.store(n, Ordering::Relaxed);
    }

    /// Snapshot of everything emitted through `send`.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    /// Snapshot of everything emitted through `rts`.
    pub async fn returned(&self) -> Vec<SentMessage> {
        self.returned.lock().await.clone()
    }

    /// Number of handles given back through `free`.
    pub async fn freed_count(&self) -> usize {
        self.freed.lock().await.len()
    }
}

#[async_trait]
impl Bus for LoopbackBus {
    async fn ready(&self) -> bool {
        true
    }

    async fn send(&self, payload: Vec<u8>, mtype: u32, subid: i32) -> Result<(), BusError> {
        if self
            .retries_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BusError::Retry);
        }
        self.sent.lock().await.push(SentMessage {
            mtype,
            subid,
            payload,
        });
        Ok(())
    }

    async fn rts(
        &self,
        incoming: &InboundMessage,
        payload: Vec<u8>,
        mtype: u32,
    ) -> Result<(), BusError> {
        self.returned.lock().await.push(SentMessage {
            mtype,
            subid: incoming.subid,
            payload,
        });
        Ok(())
    }

    async fn recv_batch(&self, filter: &[u32]) -> Vec<InboundMessage> {
        let mut queue = self.inbound.lock().await;
        let mut batch = Vec::new();
        let mut rest = VecDeque::new();
        while let Some(msg) = queue.pop_front() {
            if filter.contains(&msg.mtype) {
                batch.push(msg);
            } else {
                rest.push_back(msg);
            }
        }
        *queue = rest;
        batch
    }

    async fn free(&self, msg: InboundMessage) {
        self.freed.lock().await.insert(msg.handle);
    }
}

/* ============================= TESTS ============================= */
