use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::Operation;
use crate::config::Config;
use crate::store::{self, Store, StoreError, A1_NS};

/* ============================= STATUS STRINGS ============================= */

pub const HANDLER_OK: &str = "OK";
pub const HANDLER_DELETED: &str = "DELETED";
pub const IN_EFFECT: &str = "IN EFFECT";
pub const NOT_IN_EFFECT: &str = "NOT IN EFFECT";

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("policy type {0} not found")]
    TypeNotFound(i64),

    #[error("policy instance {1} of type {0} not found")]
    InstanceNotFound(i64, String),

    #[error("body policy_type_id {body:?} does not match path id {path}")]
    IdMismatch { path: i64, body: Option<i64> },

    #[error("policy type {0} already exists")]
    TypeAlreadyExists(i64),

    #[error("policy type {0} still has instances")]
    TypeNotEmpty(i64),

    #[error("instance rejected by create_schema: {0}")]
    SchemaViolation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/* ============================= REGISTRY ============================= */

/// Business rules over the four key families.
///
/// The registry is the only writer of store state; the bus loop and the
/// HTTP facade both go through it.
#[derive(Clone)]
pub struct PolicyRegistry {
    store: Arc<dyn Store>,
    resp_ttl: Duration,
    no_resp_ttl: Duration,
}

impl PolicyRegistry {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            store,
            resp_ttl: config.instance_delete_resp_ttl,
            no_resp_ttl: config.instance_delete_no_resp_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /* ── types ── */

    pub async fn list_types(&self) -> Result<Vec<i64>, RegistryError> {
        let found = self.store.find_and_get(A1_NS, store::type_prefix()).await?;
        Ok(found
            .keys()
            .filter_map(|k| store::tid_from_type_key(k))
            .collect())
    }

    pub async fn create_type(&self, tid: i64, body: Value) -> Result<(), RegistryError> {
        let body_tid = body.get("policy_type_id").and_then(Value::as_i64);
        if body_tid != Some(tid) {
            return Err(RegistryError::IdMismatch {
                path: tid,
                body: body_tid,
            });
        }
        if body.get("create_schema").is_none() {
            return Err(RegistryError::SchemaViolation(
                "policy type body has no create_schema".to_string(),
            ));
        }
        if self.store.get(A1_NS, &store::type_key(tid)).await?.is_some() {
            return Err(RegistryError::TypeAlreadyExists(tid));
        }
        self.store.set(A1_NS, &store::type_key(tid), body).await?;
        Ok(())
    }

    pub async fn get_type(&self, tid: i64) -> Result<Value, RegistryError> {
        self.store
            .get(A1_NS, &store::type_key(tid))
            .await?
            .ok_or(RegistryError::TypeNotFound(tid))
    }

    pub async fn delete_type(&self, tid: i64) -> Result<(), RegistryError> {
        self.get_type(tid).await?;
        let instances = self
            .store
            .find_and_get(A1_NS, &store::instance_prefix(tid))
            .await?;
        if !instances.is_empty() {
            return Err(RegistryError::TypeNotEmpty(tid));
        }
        self.store.delete(A1_NS, &store::type_key(tid)).await?;
        Ok(())
    }

    /* ── instances ── */

    pub async fn list_instances(&self, tid: i64) -> Result<Vec<String>, RegistryError> {
        self.get_type(tid).await?;
        let found = self
            .store
            .find_and_get(A1_NS, &store::instance_prefix(tid))
            .await?;
        Ok(found
            .keys()
            .filter_map(|k| store::iid_from_instance_key(tid, k))
            .map(str::to_string)
            .collect())
    }

    /// Create or replace an instance, returning which of the two happened.
    ///
    /// On a replace, every prior handler status is erased first: statuses
    /// belong to the current instance generation.
    pub async fn create_or_replace_instance(
        &self,
        tid: i64,
        iid: &str,
        body: Value,
    ) -> Result<Operation, RegistryError> {
        let type_body = self.get_type(tid).await?;
        validate_against_schema(&type_body, &body)?;

        let existing = self
            .store
            .get(A1_NS, &store::instance_key(tid, iid))
            .await?;
        let operation = if existing.is_some() {
            self.purge_handler_statuses(tid, iid).await?;
            Operation::Update
        } else {
            Operation::Create
        };

        self.store
            .set(A1_NS, &store::instance_key(tid, iid), body)
            .await?;
        self.store
            .set(
                A1_NS,
                &store::metadata_key(tid, iid),
                json!({
                    "created_at": Utc::now().timestamp(),
                    "has_been_deleted": false,
                }),
            )
            .await?;
        Ok(operation)
    }

    pub async fn get_instance(&self, tid: i64, iid: &str) -> Result<Value, RegistryError> {
        self.store
            .get(A1_NS, &store::instance_key(tid, iid))
            .await?
            .ok_or_else(|| RegistryError::InstanceNotFound(tid, iid.to_string()))
    }

    /// Tombstone an instance and arm the grace-window finalizer.
    ///
    /// Idempotent: a repeat delete re-stamps `deleted_at` and re-arms the
    /// timer; nothing else observable changes.
    pub async fn delete_instance(&self, tid: i64, iid: &str) -> Result<(), RegistryError> {
        self.get_instance(tid, iid).await?;

        let created_at = self
            .store
            .get(A1_NS, &store::metadata_key(tid, iid))
            .await?
            .and_then(|m| m.get("created_at").and_then(Value::as_i64))
            .unwrap_or_else(|| Utc::now().timestamp());

        self.store
            .set(
                A1_NS,
                &store::metadata_key(tid, iid),
                json!({
                    "created_at": created_at,
                    "has_been_deleted": true,
                    "deleted_at": Utc::now().timestamp(),
                }),
            )
            .await?;

        let statuses = self
            .store
            .find_and_get(A1_NS, &store::handler_prefix(tid, iid))
            .await?;
        let ttl = if statuses.is_empty() {
            self.no_resp_ttl
        } else {
            self.resp_ttl.max(self.no_resp_ttl)
        };

        // Fire-and-forget; a lost timer is recovered by the next delete.
        let registry = self.clone();
        let iid = iid.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            registry.finalize_delete(tid, &iid).await;
        });
        Ok(())
    }

    /// Remove statuses, then the instance, then its metadata.
    async fn finalize_delete(&self, tid: i64, iid: &str) {
        let result: Result<(), RegistryError> = async {
            self.purge_handler_statuses(tid, iid).await?;
            self.store
                .delete(A1_NS, &store::instance_key(tid, iid))
                .await?;
            self.store
                .delete(A1_NS, &store::metadata_key(tid, iid))
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => debug!(policy_type_id = tid, policy_instance_id = iid, "instance_purged"),
            Err(e) => warn!(
                policy_type_id = tid,
                policy_instance_id = iid,
                error = %e,
                "instance_purge_failed"
            ),
        }
    }

    async fn purge_handler_statuses(&self, tid: i64, iid: &str) -> Result<(), RegistryError> {
        let statuses = self
            .store
            .find_and_get(A1_NS, &store::handler_prefix(tid, iid))
            .await?;
        for key in statuses.keys() {
            self.store.delete(A1_NS, key).await?;
        }
        Ok(())
    }

    /* ── handler statuses ── */

    pub async fn set_status(
        &self,
        tid: i64,
        iid: &str,
        hid: &str,
        status: &str,
    ) -> Result<(), RegistryError> {
        self.get_type(tid).await?;
        self.get_instance(tid, iid).await?;
        self.store
            .set(
                A1_NS,
                &store::handler_key(tid, iid, hid),
                Value::String(status.to_string()),
            )
            .await?;
        Ok(())
    }

    /// Metadata plus the computed `instance_status` aggregate.
    ///
    /// The aggregate is OK-vs-not: any handler reporting "OK" puts the
    /// instance IN EFFECT. An all-DELETED status set is logged but does
    /// not change the computation.
    pub async fn get_instance_status(&self, tid: i64, iid: &str) -> Result<Value, RegistryError> {
        self.get_instance(tid, iid).await?;

        let mut metadata = self
            .store
            .get(A1_NS, &store::metadata_key(tid, iid))
            .await?
            .unwrap_or_else(|| json!({}));

        let statuses: HashMap<String, Value> = self
            .store
            .find_and_get(A1_NS, &store::handler_prefix(tid, iid))
            .await?;

        let values: Vec<&str> = statuses.values().filter_map(Value::as_str).collect();
        let aggregate = if values.iter().any(|s| *s == HANDLER_OK) {
            IN_EFFECT
        } else {
            NOT_IN_EFFECT
        };
        if !values.is_empty() && values.iter().all(|s| *s == HANDLER_DELETED) {
            warn!(
                policy_type_id = tid,
                policy_instance_id = iid,
                "all_handlers_deleted"
            );
        }

        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("instance_status".to_string(), json!(aggregate));
        }
        Ok(metadata)
    }
}

/* ============================= SCHEMA VALIDATION ============================= */

/// Validate an instance body against the owning type's `create_schema`.
///
/// Validation applies to instances only; type bodies are never checked
/// beyond their two mandatory fields.
fn validate_against_schema(type_body: &Value, instance: &Value) -> Result<(), RegistryError> {
    let schema = type_body
        .get("create_schema")
        .ok_or_else(|| RegistryError::SchemaViolation("type has no create_schema".to_string()))?;
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| RegistryError::SchemaViolation(format!("unusable create_schema: {e}")))?;
    validator
        .validate(instance)
        .map_err(|e| RegistryError::SchemaViolation(e.to_string()))
}

/* ============================= TESTS ============================= */
