use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

/* ============================= NAMESPACE & KEYS ============================= */

/// The single logical namespace all mediator state lives in.
pub const A1_NS: &str = "A1m_ns";

const TYPE_PREFIX: &str = "a1.policy_type.";
const INSTANCE_PREFIX: &str = "a1.policy_instance.";
const METADATA_PREFIX: &str = "a1.policy_inst_metadata.";
const HANDLER_PREFIX: &str = "a1.policy_handler.";

pub fn type_key(policy_type_id: i64) -> String {
    format!("{TYPE_PREFIX}{policy_type_id}")
}

pub fn instance_key(policy_type_id: i64, policy_instance_id: &str) -> String {
    format!("{INSTANCE_PREFIX}{policy_type_id}.{policy_instance_id}")
}

pub fn metadata_key(policy_type_id: i64, policy_instance_id: &str) -> String {
    format!("{METADATA_PREFIX}{policy_type_id}.{policy_instance_id}")
}

pub fn handler_key(policy_type_id: i64, policy_instance_id: &str, handler_id: &str) -> String {
    format!("{HANDLER_PREFIX}{policy_type_id}.{policy_instance_id}.{handler_id}")
}

/// Prefix covering every policy type key.
pub fn type_prefix() -> &'static str {
    TYPE_PREFIX
}

/// Prefix covering every instance of one type.
pub fn instance_prefix(policy_type_id: i64) -> String {
    format!("{INSTANCE_PREFIX}{policy_type_id}.")
}

/// Prefix covering every handler status of one instance.
pub fn handler_prefix(policy_type_id: i64, policy_instance_id: &str) -> String {
    format!("{HANDLER_PREFIX}{policy_type_id}.{policy_instance_id}.")
}

/// Recover the type id from a full type key.
pub fn tid_from_type_key(key: &str) -> Option<i64> {
    key.strip_prefix(TYPE_PREFIX)?.parse().ok()
}

/// Recover the instance id from a full instance key of the given type.
pub fn iid_from_instance_key(policy_type_id: i64, key: &str) -> Option<&str> {
    let rest = key.strip_prefix(INSTANCE_PREFIX)?;
    let rest = rest.strip_prefix(&format!("{policy_type_id}."))?;
    if rest.is_empty() { None } else { Some(rest) }
}

/* ============================= ERRORS ============================= */

/// Failure modes of the backing KV.
///
/// The registry treats all three as one "store unavailable" condition;
/// the split exists so the log line names what actually happened.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend refused the operation outright.
    #[error("store rejected the request: {0}")]
    Rejected(String),

    /// The connection to the backend was lost.
    #[error("store connection lost: {0}")]
    Disconnected(String),

    /// A transient backend failure; a later retry may succeed.
    #[error("transient store failure: {0}")]
    Transient(String),
}

/* ============================= TRAIT ============================= */

/// Namespaced JSON KV used for all persisted mediator state.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get the value for a key. Returns `None` if absent.
    async fn get(&self, ns: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Set a value, overwriting any previous one.
    async fn set(&self, ns: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, ns: &str, key: &str) -> Result<(), StoreError>;

    /// Scan keys starting with `prefix` and return full-key → value.
    async fn find_and_get(
        &self,
        ns: &str,
        prefix: &str,
    ) -> Result<HashMap<String, Value>, StoreError>;

    /// Whether the backend currently answers.
    async fn healthy(&self) -> bool;
}

/* ============================= IN-MEMORY STORE ============================= */

/// In-memory store used when `USE_FAKE_SDL` is set, and by the test suite.
///
/// Keys can be marked as rejecting to exercise the 503 paths.
#[derive(Default)]
pub struct MemStore {
    data: RwLock<HashMap<String, HashMap<String, Value>>>,
    rejecting: RwLock<HashSet<(String, String)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation on `(ns, key)` fail with `Rejected`.
    pub async fn reject_key(&self, ns: &str, key: &str) {
        self.rejecting
            .write()
            .await
            .insert((ns.to_string(), key.to_string()));
    }

    async fn check_rejected(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        if self
            .rejecting
            .read()
            .await
            .contains(&(ns.to_string(), key.to_string()))
        {
            return Err(StoreError::Rejected(format!("{ns}/{key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.check_rejected(ns, key).await?;
        Ok(self
            .data
            .read()
            .await
            .get(ns)
            .and_then(|m| m.get(key))
            .cloned())
    }

    async fn set(&self, ns: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.check_rejected(ns, key).await?;
        self.data
            .write()
            .await
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        self.check_rejected(ns, key).await?;
        if let Some(m) = self.data.write().await.get_mut(ns) {
            m.remove(key);
        }
        Ok(())
    }

    async fn find_and_get(
        &self,
        ns: &str,
        prefix: &str,
    ) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self
            .data
            .read()
            .await
            .get(ns)
            .map(|m| {
                m.iter()
                    .filter(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/* ============================= REDIS STORE ============================= */

/// Redis-backed store. The namespace is folded into the Redis key as
/// `{ns},{key}`, mirroring the layout the SDL sidecar uses.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Rejected(e.to_string()))?;
        Ok(Self { client })
    }

    fn full_key(ns: &str, key: &str) -> String {
        format!("{ns},{key}")
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_err)
    }
}

fn map_redis_err(e: redis::RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Transient(e.to_string())
    } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Disconnected(e.to_string())
    } else {
        StoreError::Rejected(e.to_string())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::full_key(ns, key))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        match raw {
            None => Ok(None),
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| StoreError::Rejected(format!("undecodable value: {e}"))),
        }
    }

    async fn set(&self, ns: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(Self::full_key(ns, key))
            .arg(value.to_string())
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(Self::full_key(ns, key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn find_and_get(
        &self,
        ns: &str,
        prefix: &str,
    ) -> Result<HashMap<String, Value>, StoreError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{},{}*", ns, glob_escape(prefix));
        let strip = format!("{ns},");

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(128)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut out = HashMap::new();
        for full in keys {
            let raw: Option<String> = redis::cmd("GET")
                .arg(&full)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            let Some(raw) = raw else { continue };
            let value = serde_json::from_str(&raw)
                .map_err(|e| StoreError::Rejected(format!("undecodable value: {e}")))?;
            let logical = full.strip_prefix(&strip).unwrap_or(&full).to_string();
            out.insert(logical, value);
        }
        Ok(out)
    }

    async fn healthy(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

/// Escape glob metacharacters so stored keys never widen the MATCH pattern.
fn glob_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/* ============================= TESTS ============================= */
