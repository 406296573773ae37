use serde_json::{Value, json};
use tracing::warn;

use crate::bus::{Bus, InboundMessage};
use crate::codec::{self, EI_CREATE_JOB_RESP, EI_QUERY_ALL_RESP};

/* ============================= EI BRIDGE ============================= */

/// Bridge between the bus and the EI coordinator.
///
/// Runs inside the bus-loop tick: the coordinator calls are short and
/// fit the one-second tick granularity.
#[derive(Clone)]
pub struct EiBridge {
    http: reqwest::Client,
    base: String,
}

impl EiBridge {
    pub fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn eitypes_url(&self) -> String {
        format!("{}/A1-EI/v1/eitypes", self.base)
    }

    pub fn eijob_url(&self, job_id: &str) -> String {
        format!("{}/A1-EI/v1/eijobs/{job_id}", self.base)
    }

    /// Probe the coordinator; used by the `check` command.
    pub async fn probe(&self) -> Result<u16, String> {
        self.http
            .get(self.eitypes_url())
            .send()
            .await
            .map(|r| r.status().as_u16())
            .map_err(|e| e.to_string())
    }

    /// Answer an EIQueryAll: fetch the type list and return it to sender.
    ///
    /// A non-200 from the coordinator is logged but its body is still
    /// returned; only a transport failure leaves the query unanswered.
    pub async fn handle_query_all(&self, bus: &dyn Bus, msg: &InboundMessage) {
        let body = match self.http.get(self.eitypes_url()).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    warn!(status = %resp.status(), "ei_types_query_non_200");
                }
                resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default()
            }
            Err(e) => {
                warn!(error = %e, "ei_coordinator_unreachable");
                return;
            }
        };
        if let Err(e) = bus.rts(msg, body, EI_QUERY_ALL_RESP).await {
            warn!(error = %e, "ei_query_reply_failed");
        }
    }

    /// Create an EI job at the coordinator and ack the requester.
    pub async fn handle_create_job(&self, bus: &dyn Bus, msg: &InboundMessage) {
        let body: Value = match serde_json::from_slice(&msg.payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed_ei_create_job");
                return;
            }
        };
        let Some((job_id, rest)) = codec::split_job_id(body) else {
            warn!("ei_create_job_missing_job_id");
            return;
        };

        match self.http.put(self.eijob_url(&job_id)).json(&rest).send().await {
            Ok(resp) if matches!(resp.status().as_u16(), 200 | 201) => {
                let ack = json!({ "ei_job_id": job_id });
                if let Err(e) = bus
                    .rts(msg, ack.to_string().into_bytes(), EI_CREATE_JOB_RESP)
                    .await
                {
                    warn!(error = %e, "ei_job_ack_failed");
                }
            }
            Ok(resp) => {
                warn!(job_id = %job_id, status = %resp.status(), "ei_job_create_rejected");
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "ei_coordinator_unreachable");
            }
        }
    }
}

/* ============================= TESTS ============================= */
