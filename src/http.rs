use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Json;
use serde_json::{Value, json};

use crate::busloop::Mediator;
use crate::codec::Operation;
use crate::metrics::{
    self, CREATE_POLICY_INSTANCE_REQS, CREATE_POLICY_TYPE_REQS, DELETE_POLICY_INSTANCE_REQS,
    DELETE_POLICY_TYPE_REQS,
};
use crate::registry::RegistryError;

/* ============================= ROUTER ============================= */

pub fn build_router(mediator: Arc<Mediator>) -> Router {
    // Counters must exist before the first scrape, not on first use
    metrics::force_init();

    Router::new()
        .route("/a1-p/healthcheck", get(healthcheck))
        .route("/a1-p/metrics", get(metrics_handler))
        .route("/a1-p/policytypes", get(list_types))
        .route(
            "/a1-p/policytypes/:policy_type_id",
            put(create_type).get(get_type).delete(delete_type),
        )
        .route(
            "/a1-p/policytypes/:policy_type_id/policies",
            get(list_instances),
        )
        .route(
            "/a1-p/policytypes/:policy_type_id/policies/:policy_instance_id",
            put(put_instance).get(get_instance).delete(delete_instance),
        )
        .route(
            "/a1-p/policytypes/:policy_type_id/policies/:policy_instance_id/status",
            get(instance_status),
        )
        .route("/data-delivery", post(data_delivery))
        .with_state(mediator)
}

/* ============================= ERRORS ============================= */

/// One mapping table from registry failures to HTTP statuses.
pub enum ApiError {
    BadRequest(String),
    Registry(RegistryError),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Registry(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Registry(e) => {
                let status = match &e {
                    RegistryError::IdMismatch { .. }
                    | RegistryError::TypeAlreadyExists(_)
                    | RegistryError::TypeNotEmpty(_)
                    | RegistryError::SchemaViolation(_) => StatusCode::BAD_REQUEST,
                    RegistryError::TypeNotFound(_) | RegistryError::InstanceNotFound(_, _) => {
                        StatusCode::NOT_FOUND
                    }
                    // Permanent vs transient is undecidable here; both are 503.
                    RegistryError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// PUT-side gate for the accepted type id range.
fn checked_tid(tid: i64) -> Result<i64, ApiError> {
    if (1..=i64::from(i32::MAX)).contains(&tid) {
        Ok(tid)
    } else {
        Err(ApiError::BadRequest(format!(
            "policy type id {tid} out of range [1, 2147483647]"
        )))
    }
}

/* ============================= HEALTH & METRICS ============================= */

async fn healthcheck(State(mediator): State<Arc<Mediator>>) -> Response {
    if mediator.healthy().await {
        StatusCode::OK.into_response()
    } else {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (StatusCode::OK, metrics::render())
}

/* ============================= POLICY TYPES ============================= */

async fn list_types(
    State(mediator): State<Arc<Mediator>>,
) -> Result<Json<Vec<i64>>, ApiError> {
    Ok(Json(mediator.registry.list_types().await?))
}

async fn create_type(
    State(mediator): State<Arc<Mediator>>,
    Path(tid): Path<i64>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    CREATE_POLICY_TYPE_REQS.inc();
    let tid = checked_tid(tid)?;
    mediator.registry.create_type(tid, body).await?;
    Ok(StatusCode::CREATED)
}

async fn get_type(
    State(mediator): State<Arc<Mediator>>,
    Path(tid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(mediator.registry.get_type(tid).await?))
}

async fn delete_type(
    State(mediator): State<Arc<Mediator>>,
    Path(tid): Path<i64>,
) -> Result<StatusCode, ApiError> {
    DELETE_POLICY_TYPE_REQS.inc();
    mediator.registry.delete_type(tid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/* ============================= POLICY INSTANCES ============================= */

async fn list_instances(
    State(mediator): State<Arc<Mediator>>,
    Path(tid): Path<i64>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(mediator.registry.list_instances(tid).await?))
}

async fn put_instance(
    State(mediator): State<Arc<Mediator>>,
    Path((tid, iid)): Path<(i64, String)>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    CREATE_POLICY_INSTANCE_REQS.inc();
    let tid = checked_tid(tid)?;
    let operation = mediator
        .registry
        .create_or_replace_instance(tid, &iid, body.clone())
        .await?;
    mediator
        .enqueue_policy_request(operation, tid, &iid, body)
        .await;
    Ok(StatusCode::ACCEPTED)
}

async fn get_instance(
    State(mediator): State<Arc<Mediator>>,
    Path((tid, iid)): Path<(i64, String)>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(mediator.registry.get_instance(tid, &iid).await?))
}

async fn delete_instance(
    State(mediator): State<Arc<Mediator>>,
    Path((tid, iid)): Path<(i64, String)>,
) -> Result<StatusCode, ApiError> {
    DELETE_POLICY_INSTANCE_REQS.inc();
    mediator.registry.delete_instance(tid, &iid).await?;
    mediator
        .enqueue_policy_request(Operation::Delete, tid, &iid, json!(""))
        .await;
    Ok(StatusCode::ACCEPTED)
}

async fn instance_status(
    State(mediator): State<Arc<Mediator>>,
    Path((tid, iid)): Path<(i64, String)>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(mediator.registry.get_instance_status(tid, &iid).await?))
}

/* ============================= DATA DELIVERY ============================= */

async fn data_delivery(
    State(mediator): State<Arc<Mediator>>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let job = match body.get("job") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(ApiError::BadRequest(
                "data-delivery body has no job field".to_string(),
            ));
        }
    };
    mediator.enqueue_ei_delivery(&job, body).await;
    Ok(StatusCode::OK)
}

/* ============================= TESTS ============================= */
