//! Agent lease protocol.
//!
//! The four token-authenticated operations an external agent uses to
//! execute runs on behalf of a cluster the server cannot reach: heartbeat,
//! task pull, claim, and result submission. Every call also runs the
//! stale-run sweep, which is what recovers from a crashed or partitioned
//! agent without manual intervention.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use chrono::{Duration, Utc};
use inspect_core::{
    sanitize, AgentRunStatus, CheckStatus, Id, InspectionAgent, InspectionResult, InspectionRun,
    PlanItem, RunStatus, StatusCounts,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::server::{api_error, ApiResult, AppState};
use crate::worker::classify_run;

/// An agent that stays silent longer than this has its running runs
/// reclaimed by the sweep.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 300;

/// Note appended to a swept run's summary.
pub const STALE_RESET_NOTE: &str =
    "Reset to queued after the executing agent missed its heartbeat deadline.";

/// Authenticate the bearer token and run the stale-run sweep.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<InspectionAgent> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

    let agent = state
        .storage
        .get_agent_by_token(token)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "invalid agent token"))?;

    if !agent.is_enabled {
        return Err(api_error(StatusCode::FORBIDDEN, "agent is disabled"));
    }

    let cutoff = Utc::now() - Duration::seconds(HEARTBEAT_TIMEOUT_SECS);
    match state
        .storage
        .reset_stale_agent_runs(cutoff, STALE_RESET_NOTE)
        .await
    {
        Ok(0) => {}
        Ok(count) => info!(count, "stale agent runs reset to queued"),
        Err(e) => warn!(error = %e, "stale-run sweep failed"),
    }

    Ok(agent)
}

// --- Request/response types ---

/// Run representation returned by every agent operation.
#[derive(Debug, Serialize)]
pub struct AgentRunView {
    pub run_id: Id,
    pub status: RunStatus,
    pub agent_status: Option<AgentRunStatus>,
    pub total_items: u32,
    pub processed_items: u32,
    pub percent: u32,
    pub summary: Option<String>,
    pub results: Vec<InspectionResult>,
}

impl AgentRunView {
    fn from_run(run: &InspectionRun, results: Vec<InspectionResult>) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            agent_status: run.agent_status,
            total_items: run.total_items,
            processed_items: run.processed_items,
            percent: run.progress_percent(),
            summary: run.summary.clone(),
            results,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub status: &'static str,
    pub agent_id: Id,
}

#[derive(Debug, Deserialize, Default)]
pub struct PullTasksQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

/// One queued task, serialized from the run's immutable plan snapshot —
/// never from the live catalog.
#[derive(Debug, Serialize)]
pub struct AgentTask {
    pub run_id: Id,
    pub cluster_id: Id,
    pub operator: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub items: Vec<PlanItem>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitResultsRequest {
    pub results: Vec<SubmittedResult>,
}

#[derive(Debug, Deserialize)]
pub struct SubmittedResult {
    #[serde(default)]
    pub item_id: Option<Id>,
    #[serde(default)]
    pub item_name: Option<String>,
    /// Free-form on the wire; unrecognized values normalize to `warning`.
    pub status: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

// --- Handlers ---

/// POST /agent/heartbeat - liveness signal, idempotent.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<HeartbeatResponse>> {
    let agent = authenticate(&state, &headers).await?;
    state
        .storage
        .touch_agent_seen(&agent.id, Utc::now())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(HeartbeatResponse {
        status: "ok",
        agent_id: agent.id,
    }))
}

/// GET /agent/tasks?limit= - queued runs bound to this agent, oldest first.
pub async fn pull_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PullTasksQuery>,
) -> ApiResult<Json<Vec<AgentTask>>> {
    let agent = authenticate(&state, &headers).await?;
    let limit = query.limit.unwrap_or(1).max(1);
    let runs = state
        .storage
        .list_agent_queued_runs(&agent.id, limit)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let tasks = runs
        .into_iter()
        .map(|run| AgentTask {
            run_id: run.id,
            cluster_id: run.cluster_id,
            operator: run.operator,
            created_at: run.created_at,
            items: run.plan,
        })
        .collect();
    Ok(Json(tasks))
}

/// POST /agent/runs/{id}/claim - take exclusive ownership of one queued run.
pub async fn claim_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentRunView>> {
    let agent = authenticate(&state, &headers).await?;
    let run_id = Id::from_string(&id);
    let run = get_run_or_404(&state, &run_id).await?;

    if run.agent_id.as_ref() != Some(&agent.id) {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "run is bound to a different agent",
        ));
    }

    let claimed = state
        .storage
        .claim_agent_run(&run_id, &agent.id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !claimed {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("run cannot be claimed in status '{}'", run.status.as_str()),
        ));
    }

    info!(run_id = %run_id, agent = %agent.name, "run claimed by agent");
    let run = get_run_or_404(&state, &run_id).await?;
    let results = list_results(&state, &run_id).await?;
    Ok(Json(AgentRunView::from_run(&run, results)))
}

/// POST /agent/runs/{id}/results - full replacement result submission.
pub async fn submit_results(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<SubmitResultsRequest>,
) -> ApiResult<Json<AgentRunView>> {
    let agent = authenticate(&state, &headers).await?;
    let run_id = Id::from_string(&id);
    let run = get_run_or_404(&state, &run_id).await?;

    if run.agent_id.as_ref() != Some(&agent.id) {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "run is bound to a different agent",
        ));
    }
    // Accept submissions for a claimed run and resubmissions after a
    // partial failure; a run nobody claimed cannot take results.
    if run.agent_status == Some(AgentRunStatus::Queued) || run.status == RunStatus::Queued {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "run has not been claimed",
        ));
    }

    let rows: Vec<InspectionResult> = request
        .results
        .iter()
        .map(|submitted| to_result_row(&run, submitted))
        .collect();

    state
        .storage
        .replace_results(&run_id, &rows)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let processed = (rows.len() as u32).min(run.total_items);
    state
        .storage
        .raise_progress(&run_id, processed)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let cluster_name = state
        .storage
        .get_cluster(&run.cluster_id)
        .await
        .map(|c| c.name)
        .unwrap_or_else(|_| "unknown".to_string());

    let counts = StatusCounts::tally(rows.iter().map(|r| &r.status));
    let (status, summary) = classify_run(&counts, run.total_items, processed, &cluster_name);
    let agent_status = match status {
        RunStatus::Finished => AgentRunStatus::Finished,
        _ => AgentRunStatus::Failed,
    };
    state
        .storage
        .finalize_run(&run_id, status, Some(agent_status), &summary)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!(
        run_id = %run_id,
        agent = %agent.name,
        status = status.as_str(),
        results = rows.len(),
        "agent results accepted"
    );

    let run = get_run_or_404(&state, &run_id).await?;
    let results = list_results(&state, &run_id).await?;
    Ok(Json(AgentRunView::from_run(&run, results)))
}

fn to_result_row(run: &InspectionRun, submitted: &SubmittedResult) -> InspectionResult {
    // Unknown status strings normalize to warning, never silently to passed.
    let status = CheckStatus::parse(&submitted.status).unwrap_or(CheckStatus::Warning);
    let plan_name = submitted.item_id.as_ref().and_then(|item_id| {
        run.plan
            .iter()
            .find(|p| &p.item_id == item_id)
            .map(|p| p.name.clone())
    });
    let item_name = plan_name
        .or_else(|| submitted.item_name.clone())
        .unwrap_or_else(|| "unknown item".to_string());

    InspectionResult {
        id: Id::new(),
        run_id: run.id.clone(),
        item_id: submitted.item_id.clone(),
        item_name,
        status,
        detail: submitted.detail.as_deref().and_then(sanitize::detail),
        suggestion: submitted.suggestion.as_deref().and_then(sanitize::detail),
    }
}

async fn get_run_or_404(state: &AppState, run_id: &Id) -> ApiResult<InspectionRun> {
    state
        .storage
        .get_run(run_id)
        .await
        .map_err(|_| api_error(StatusCode::NOT_FOUND, format!("run not found: {run_id}")))
}

async fn list_results(state: &AppState, run_id: &Id) -> ApiResult<Vec<InspectionResult>> {
    state
        .storage
        .list_results(run_id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
