//! HTTP client for the inspectd agent protocol.

use std::time::Duration;

use chrono::{DateTime, Utc};
use inspect_core::{AgentRunStatus, Id, InspectionResult, PlanItem, RunStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server not reachable at {addr}\n  → check server.base_url and network connectivity")]
    ConnectionFailed { addr: String },

    #[error("unauthorized: the agent token was rejected, re-provision it on the server")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::Http {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Map a non-success status code plus the server's error body to a typed
/// error, mirroring the protocol's documented codes.
fn error_for_status(status: u16, message: String) -> ClientError {
    match status {
        401 => ClientError::Unauthorized,
        403 => ClientError::Forbidden(message),
        404 => ClientError::NotFound(message),
        400 => ClientError::InvalidState(message),
        _ => ClientError::Http { status, message },
    }
}

/// One queued task as served by GET /agent/tasks.
#[derive(Debug, Deserialize)]
pub struct AgentTask {
    pub run_id: Id,
    pub cluster_id: Id,
    #[serde(default)]
    pub operator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<PlanItem>,
}

/// Run representation returned by claim and submit.
#[derive(Debug, Deserialize)]
pub struct AgentRunView {
    pub run_id: Id,
    pub status: RunStatus,
    #[serde(default)]
    pub agent_status: Option<AgentRunStatus>,
    pub total_items: u32,
    pub processed_items: u32,
    pub percent: u32,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub results: Vec<InspectionResult>,
}

/// One result row in a submission batch.
#[derive(Debug, Serialize)]
pub struct SubmittedResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    results: &'a [SubmittedResult],
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Token-authenticated client for the four agent operations.
pub struct Client {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::from)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ClientError::InvalidResponse(e.to_string()));
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(error_for_status(status.as_u16(), message))
    }

    /// POST /agent/heartbeat - liveness signal.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/agent/heartbeat", self.base_url))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;
        Self::parse::<serde_json::Value>(response).await.map(|_| ())
    }

    /// GET /agent/tasks?limit= - queued runs bound to this agent.
    pub async fn fetch_tasks(&self, limit: u32) -> Result<Vec<AgentTask>, ClientError> {
        let response = self
            .http
            .get(format!("{}/agent/tasks", self.base_url))
            .query(&[("limit", limit)])
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;
        Self::parse(response).await
    }

    /// POST /agent/runs/{id}/claim - take ownership of one queued run.
    pub async fn claim_run(&self, run_id: &Id) -> Result<AgentRunView, ClientError> {
        let response = self
            .http
            .post(format!("{}/agent/runs/{run_id}/claim", self.base_url))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await?;
        Self::parse(response).await
    }

    /// POST /agent/runs/{id}/results - full replacement result submission.
    pub async fn submit_results(
        &self,
        run_id: &Id,
        results: &[SubmittedResult],
    ) -> Result<AgentRunView, ClientError> {
        let response = self
            .http
            .post(format!("{}/agent/runs/{run_id}/results", self.base_url))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(&SubmitRequest { results })
            .send()
            .await?;
        Self::parse(response).await
    }
}
