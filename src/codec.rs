use serde::{Deserialize, Serialize};
use serde_json::Value;

/* ============================= MESSAGE TYPES ============================= */

pub const POLICY_REQUEST: u32 = 20010;
pub const POLICY_RESPONSE: u32 = 20011;
pub const POLICY_QUERY: u32 = 20012;
pub const EI_QUERY_ALL: u32 = 20013;
pub const EI_QUERY_ALL_RESP: u32 = 20014;
pub const EI_CREATE_JOB: u32 = 20015;
pub const EI_CREATE_JOB_RESP: u32 = 20016;
pub const EI_DELIVERY: u32 = 20017;

/// Message types the loop subscribes to.
pub const INBOUND_FILTER: [u32; 4] = [POLICY_RESPONSE, POLICY_QUERY, EI_QUERY_ALL, EI_CREATE_JOB];

/* ============================= OUTBOUND ============================= */

/// Lifecycle operation carried in a [`PolicyRequest`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

/// Fan-out envelope telling handlers to apply or drop a policy instance.
///
/// `payload` is the instance body on CREATE/UPDATE and an empty string
/// on DELETE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRequest {
    pub operation: Operation,
    pub policy_type_id: i64,
    pub policy_instance_id: String,
    pub payload: Value,
}

/// EI result forwarded from the data-delivery surface to the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EiDelivery {
    pub ei_job_id: String,
    pub payload: Value,
}

/* ============================= INBOUND ============================= */

/// Per-handler acknowledgement of a [`PolicyRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyResponse {
    pub policy_type_id: i64,
    pub policy_instance_id: String,
    pub handler_id: String,
    pub status: String,
}

/// Replay request: a handler asking for every instance of one type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyQuery {
    pub policy_type_id: i64,
}

/// Split an EI job-creation body into its `job-id` and the remainder.
///
/// The id field uses a hyphen on the wire. Numeric ids are accepted and
/// stringified; anything else is a malformed message.
pub fn split_job_id(mut body: Value) -> Option<(String, Value)> {
    let obj = body.as_object_mut()?;
    let id = obj.remove("job-id")?;
    let id = match id {
        Value::String(s) if !s.is_empty() => s,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some((id, body))
}

/* ============================= TESTS ============================= */
