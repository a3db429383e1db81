//! HTTP surface for the inspection daemon.
//!
//! Management API (clusters, check catalog, agents, runs, audit log) plus
//! the agent lease protocol routes from [`crate::agent_api`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use inspect_core::{
    AgentRunStatus, CheckSpec, ClusterConfig, ExecutorKind, Id, InspectionAgent, InspectionItem,
    InspectionResult, InspectionRun, PlanItem, RunStatus,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent_api;
use crate::scheduler::RunScheduler;
use crate::storage::{AuditEntry, Storage, StorageError};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub scheduler: Arc<RunScheduler>,
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    error!("internal error: {e}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::NOT_FOUND, message)
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Cluster registry
        .route("/clusters", post(create_cluster).get(list_clusters))
        .route(
            "/clusters/{id}",
            get(get_cluster).put(update_cluster).delete(delete_cluster),
        )
        // Check catalog
        .route("/inspection-items", post(create_item).get(list_items))
        .route("/inspection-items/{id}", put(update_item).delete(delete_item))
        // Agent registry
        .route("/agents", post(create_agent).get(list_agents))
        .route("/agents/{id}", axum::routing::delete(delete_agent))
        .route("/agents/{id}/enable", post(enable_agent))
        .route("/agents/{id}/disable", post(disable_agent))
        // Runs
        .route("/inspection-runs", post(create_run).get(list_runs))
        .route("/inspection-runs/{id}", get(get_run).delete(delete_run))
        .route("/inspection-runs/{id}/pause", post(pause_run))
        .route("/inspection-runs/{id}/resume", post(resume_run))
        .route("/inspection-runs/{id}/cancel", post(cancel_run))
        .route("/inspection-runs/{id}/progress", get(run_progress))
        // Agent lease protocol
        .route("/agent/heartbeat", post(agent_api::heartbeat))
        .route("/agent/tasks", get(agent_api::pull_tasks))
        .route("/agent/runs/{id}/claim", post(agent_api::claim_run))
        .route("/agent/runs/{id}/results", post(agent_api::submit_results))
        // Audit log and health
        .route("/audit-logs", get(list_audit_logs))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(
    storage: Arc<Storage>,
    scheduler: Arc<RunScheduler>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState { storage, scheduler });
    let router = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

// --- Shared helpers ---

/// Strip trailing slashes and insist on an http(s) scheme.
fn normalize_prometheus_url(value: Option<&str>) -> Result<Option<String>, ApiError> {
    let Some(value) = value else { return Ok(None) };
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(bad_request(
            "prometheus_url must start with http:// or https://",
        ));
    }
    Ok(Some(trimmed.to_string()))
}

/// Pull context names out of a kubeconfig, for display. Unreadable or
/// malformed files simply yield no contexts.
fn extract_contexts(kubeconfig_path: &str) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(kubeconfig_path) else {
        return Vec::new();
    };
    let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(&text) else {
        return Vec::new();
    };
    doc.get("contexts")
        .and_then(serde_yaml::Value::as_sequence)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("name").and_then(serde_yaml::Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

async fn audit(state: &AppState, action: &str, entity_type: &str, id: Option<&Id>, desc: String) {
    if let Err(e) = state
        .storage
        .append_audit(action, entity_type, id, &desc)
        .await
    {
        warn!(error = %e, "failed to append audit entry");
    }
}

// --- Health ---

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// --- Cluster handlers ---

#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub kubeconfig_path: String,
    #[serde(default)]
    pub prometheus_url: Option<String>,
    #[serde(default)]
    pub execution_mode: Option<ExecutorKind>,
    #[serde(default)]
    pub default_agent_id: Option<Id>,
}

async fn create_cluster(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateClusterRequest>,
) -> ApiResult<(StatusCode, Json<ClusterConfig>)> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("cluster name must not be empty"));
    }
    if state
        .storage
        .get_cluster_by_name(&name)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(bad_request(format!("cluster '{name}' already exists")));
    }
    let prometheus_url = normalize_prometheus_url(req.prometheus_url.as_deref())?;

    let now = Utc::now();
    let cluster = ClusterConfig {
        id: Id::new(),
        name,
        contexts: extract_contexts(&req.kubeconfig_path),
        kubeconfig_path: req.kubeconfig_path,
        prometheus_url,
        execution_mode: req.execution_mode.unwrap_or_default(),
        default_agent_id: req.default_agent_id,
        created_at: now,
        updated_at: now,
    };
    state.storage.insert_cluster(&cluster).await.map_err(internal)?;
    audit(
        &state,
        "create",
        "cluster",
        Some(&cluster.id),
        format!("Registered cluster '{}'.", cluster.name),
    )
    .await;

    info!(cluster = %cluster.name, "cluster registered");
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn list_clusters(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<ClusterConfig>>> {
    let clusters = state.storage.list_clusters().await.map_err(internal)?;
    Ok(Json(clusters))
}

async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ClusterConfig>> {
    let cluster = state
        .storage
        .get_cluster(&Id::from_string(&id))
        .await
        .map_err(|_| not_found(format!("cluster not found: {id}")))?;
    Ok(Json(cluster))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClusterRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kubeconfig_path: Option<String>,
    #[serde(default)]
    pub prometheus_url: Option<String>,
    #[serde(default)]
    pub execution_mode: Option<ExecutorKind>,
    #[serde(default)]
    pub default_agent_id: Option<Id>,
}

async fn update_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateClusterRequest>,
) -> ApiResult<Json<ClusterConfig>> {
    let cluster_id = Id::from_string(&id);
    let mut cluster = state
        .storage
        .get_cluster(&cluster_id)
        .await
        .map_err(|_| not_found(format!("cluster not found: {id}")))?;

    if let Some(name) = req.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(bad_request("cluster name must not be empty"));
        }
        if name != cluster.name
            && state
                .storage
                .get_cluster_by_name(&name)
                .await
                .map_err(internal)?
                .is_some()
        {
            return Err(bad_request(format!("cluster '{name}' already exists")));
        }
        cluster.name = name;
    }
    if let Some(path) = req.kubeconfig_path {
        cluster.contexts = extract_contexts(&path);
        cluster.kubeconfig_path = path;
    }
    if req.prometheus_url.is_some() {
        cluster.prometheus_url = normalize_prometheus_url(req.prometheus_url.as_deref())?;
    }
    if let Some(mode) = req.execution_mode {
        cluster.execution_mode = mode;
    }
    if let Some(agent_id) = req.default_agent_id {
        cluster.default_agent_id = Some(agent_id);
    }

    state.storage.update_cluster(&cluster).await.map_err(internal)?;
    audit(
        &state,
        "update",
        "cluster",
        Some(&cluster.id),
        format!("Updated cluster '{}'.", cluster.name),
    )
    .await;
    Ok(Json(cluster))
}

async fn delete_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let cluster_id = Id::from_string(&id);
    let cluster = state
        .storage
        .get_cluster(&cluster_id)
        .await
        .map_err(|_| not_found(format!("cluster not found: {id}")))?;
    state
        .storage
        .delete_cluster(&cluster_id)
        .await
        .map_err(internal)?;
    audit(
        &state,
        "delete",
        "cluster",
        Some(&cluster_id),
        format!("Deleted cluster '{}'.", cluster.name),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

// --- Inspection item handlers ---

#[derive(Debug, Deserialize)]
pub struct CreateItemRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub check: CheckSpec,
}

async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateItemRequest>,
) -> ApiResult<(StatusCode, Json<InspectionItem>)> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("item name must not be empty"));
    }
    req.check
        .validate()
        .map_err(|e| bad_request(format!("invalid check config: {e}")))?;
    if state
        .storage
        .get_item_by_name(&name)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(bad_request(format!(
            "inspection item '{name}' already exists"
        )));
    }

    let now = Utc::now();
    let item = InspectionItem {
        id: Id::new(),
        name,
        description: req.description,
        check: req.check,
        is_archived: false,
        created_at: now,
        updated_at: now,
    };
    state.storage.insert_item(&item).await.map_err(internal)?;
    audit(
        &state,
        "create",
        "inspection_item",
        Some(&item.id),
        format!("Created inspection item '{}'.", item.name),
    )
    .await;
    Ok((StatusCode::CREATED, Json(item)))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListItemsQuery {
    #[serde(default)]
    pub include_archived: bool,
}

async fn list_items(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListItemsQuery>,
) -> ApiResult<Json<Vec<InspectionItem>>> {
    let items = state
        .storage
        .list_items(query.include_archived)
        .await
        .map_err(internal)?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub check: CheckSpec,
    #[serde(default)]
    pub is_archived: Option<bool>,
}

async fn update_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateItemRequest>,
) -> ApiResult<Json<InspectionItem>> {
    let item_id = Id::from_string(&id);
    let mut item = state
        .storage
        .get_item(&item_id)
        .await
        .map_err(|_| not_found(format!("inspection item not found: {id}")))?;

    req.check
        .validate()
        .map_err(|e| bad_request(format!("invalid check config: {e}")))?;
    item.name = req.name.trim().to_string();
    if item.name.is_empty() {
        return Err(bad_request("item name must not be empty"));
    }
    item.description = req.description;
    item.check = req.check;
    if let Some(is_archived) = req.is_archived {
        item.is_archived = is_archived;
    }
    item.updated_at = Utc::now();

    state.storage.update_item(&item).await.map_err(internal)?;
    audit(
        &state,
        "update",
        "inspection_item",
        Some(&item.id),
        format!("Updated inspection item '{}'.", item.name),
    )
    .await;
    Ok(Json(item))
}

async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let item_id = Id::from_string(&id);
    let item = state
        .storage
        .get_item(&item_id)
        .await
        .map_err(|_| not_found(format!("inspection item not found: {id}")))?;
    state.storage.delete_item(&item_id).await.map_err(internal)?;
    audit(
        &state,
        "delete",
        "inspection_item",
        Some(&item_id),
        format!("Deleted inspection item '{}'.", item.name),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

// --- Agent registry handlers ---

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub cluster_id: Option<Id>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prometheus_url: Option<String>,
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<InspectionAgent>)> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_request("agent name must not be empty"));
    }
    let prometheus_url = normalize_prometheus_url(req.prometheus_url.as_deref())?;

    let now = Utc::now();
    let agent = InspectionAgent {
        id: Id::new(),
        name,
        // Opaque bearer token, generated server-side and unique by
        // construction.
        token: Uuid::new_v4().simple().to_string(),
        cluster_id: req.cluster_id,
        description: req.description,
        is_enabled: true,
        last_seen_at: None,
        prometheus_url,
        created_at: now,
        updated_at: now,
    };
    state.storage.insert_agent(&agent).await.map_err(internal)?;
    audit(
        &state,
        "create",
        "agent",
        Some(&agent.id),
        format!("Registered agent '{}'.", agent.name),
    )
    .await;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<InspectionAgent>>> {
    let agents = state.storage.list_agents().await.map_err(internal)?;
    Ok(Json(agents))
}

async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let agent_id = Id::from_string(&id);
    state
        .storage
        .delete_agent(&agent_id)
        .await
        .map_err(|_| not_found(format!("agent not found: {id}")))?;
    audit(
        &state,
        "delete",
        "agent",
        Some(&agent_id),
        "Deleted agent.".to_string(),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_agent_enabled(
    state: &Arc<AppState>,
    id: &str,
    enabled: bool,
) -> ApiResult<StatusCode> {
    let agent_id = Id::from_string(id);
    state
        .storage
        .set_agent_enabled(&agent_id, enabled)
        .await
        .map_err(|_| not_found(format!("agent not found: {id}")))?;
    audit(
        state,
        "update",
        "agent",
        Some(&agent_id),
        format!(
            "Agent {}.",
            if enabled { "enabled" } else { "disabled" }
        ),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    set_agent_enabled(&state, &id, true).await
}

async fn disable_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    set_agent_enabled(&state, &id, false).await
}

// --- Run handlers ---

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub cluster_id: Id,
    #[serde(default)]
    pub operator: Option<String>,
    pub item_ids: Vec<Id>,
}

/// Summary view for run listings; the full plan and results come from the
/// detail endpoint.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub id: Id,
    pub cluster_id: Id,
    pub operator: Option<String>,
    pub status: RunStatus,
    pub executor: ExecutorKind,
    pub agent_status: Option<AgentRunStatus>,
    pub total_items: u32,
    pub processed_items: u32,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&InspectionRun> for RunSummary {
    fn from(run: &InspectionRun) -> Self {
        Self {
            id: run.id.clone(),
            cluster_id: run.cluster_id.clone(),
            operator: run.operator.clone(),
            status: run.status,
            executor: run.executor,
            agent_status: run.agent_status,
            total_items: run.total_items,
            processed_items: run.processed_items,
            summary: run.summary.clone(),
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }
}

/// Detail view: the run plus its results in plan order.
#[derive(Debug, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: RunSummary,
    pub results: Vec<InspectionResult>,
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<RunDetail>)> {
    if req.item_ids.is_empty() {
        return Err(bad_request("no inspection items selected"));
    }
    let cluster = state
        .storage
        .get_cluster(&req.cluster_id)
        .await
        .map_err(|_| not_found(format!("cluster not found: {}", req.cluster_id)))?;

    let items = state
        .storage
        .get_items_by_ids(&req.item_ids)
        .await
        .map_err(internal)?;
    let distinct: std::collections::HashSet<&str> =
        req.item_ids.iter().map(Id::as_ref).collect();
    if items.len() != distinct.len() {
        return Err(bad_request("one or more inspection items do not exist"));
    }
    for item in &items {
        item.check.validate().map_err(|e| {
            bad_request(format!("item '{}' has an invalid check config: {e}", item.name))
        })?;
    }

    // The plan snapshot is the execution contract: captured here, verbatim,
    // immune to later catalog edits.
    let plan: Vec<PlanItem> = items
        .iter()
        .map(|item| PlanItem {
            item_id: item.id.clone(),
            name: item.name.clone(),
            description: item.description.clone(),
            check: item.check.clone(),
        })
        .collect();

    let (executor, agent_id, agent_status) = match cluster.execution_mode {
        ExecutorKind::Server => (ExecutorKind::Server, None, None),
        ExecutorKind::Agent => {
            let Some(agent_id) = cluster.default_agent_id.clone() else {
                return Err(bad_request(
                    "cluster is in agent mode but has no default agent bound",
                ));
            };
            (
                ExecutorKind::Agent,
                Some(agent_id),
                Some(AgentRunStatus::Queued),
            )
        }
    };

    let run = InspectionRun {
        id: Id::new(),
        cluster_id: cluster.id.clone(),
        operator: req.operator,
        status: RunStatus::Queued,
        executor,
        agent_id,
        agent_status,
        total_items: plan.len() as u32,
        processed_items: 0,
        plan,
        summary: None,
        report_path: None,
        generation: 0,
        created_at: Utc::now(),
        completed_at: None,
    };
    state.storage.insert_run(&run).await.map_err(internal)?;
    audit(
        &state,
        "create",
        "inspection_run",
        Some(&run.id),
        format!(
            "Created inspection run for cluster '{}' ({} items, {} executor).",
            cluster.name,
            run.total_items,
            run.executor.as_str()
        ),
    )
    .await;

    // Server-mode runs start immediately; agent-mode runs wait to be
    // pulled and claimed.
    if run.executor == ExecutorKind::Server {
        state.scheduler.submit(&run.id).await.map_err(internal)?;
    }

    info!(
        run_id = %run.id,
        cluster = %cluster.name,
        executor = run.executor.as_str(),
        items = run.total_items,
        "inspection run created"
    );
    Ok((
        StatusCode::CREATED,
        Json(RunDetail {
            run: RunSummary::from(&run),
            results: Vec::new(),
        }),
    ))
}

async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<RunSummary>>> {
    let runs = state.storage.list_runs().await.map_err(internal)?;
    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunDetail>> {
    let run_id = Id::from_string(&id);
    let run = state
        .storage
        .get_run(&run_id)
        .await
        .map_err(|_| not_found(format!("run not found: {id}")))?;
    let results = state.storage.list_results(&run_id).await.map_err(internal)?;
    Ok(Json(RunDetail {
        run: RunSummary::from(&run),
        results,
    }))
}

async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let run_id = Id::from_string(&id);
    state
        .storage
        .get_run(&run_id)
        .await
        .map_err(|_| not_found(format!("run not found: {id}")))?;
    state.storage.delete_run(&run_id).await.map_err(internal)?;
    audit(
        &state,
        "delete",
        "inspection_run",
        Some(&run_id),
        format!("Deleted inspection run {run_id}."),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

/// Response for the control endpoints: whether a state change occurred.
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub changed: bool,
}

async fn pause_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = Id::from_string(&id);
    state
        .storage
        .get_run(&run_id)
        .await
        .map_err(|_| not_found(format!("run not found: {id}")))?;
    let changed = state.scheduler.pause(&run_id).await.map_err(internal)?;
    Ok(Json(ControlResponse { changed }))
}

async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = Id::from_string(&id);
    state
        .storage
        .get_run(&run_id)
        .await
        .map_err(|_| not_found(format!("run not found: {id}")))?;
    let changed = state.scheduler.resume(&run_id).await.map_err(internal)?;
    Ok(Json(ControlResponse { changed }))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = Id::from_string(&id);
    state
        .storage
        .get_run(&run_id)
        .await
        .map_err(|_| not_found(format!("run not found: {id}")))?;
    let changed = state.scheduler.cancel(&run_id).await.map_err(internal)?;
    Ok(Json(ControlResponse { changed }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub total: u32,
    pub processed: u32,
    pub percent: u32,
}

async fn run_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProgressResponse>> {
    let run_id = Id::from_string(&id);
    let (total, processed, percent) = state
        .scheduler
        .progress(&run_id)
        .await
        .map_err(|e| match e {
            crate::scheduler::SchedulerError::Storage(StorageError::RunNotFound(_)) => {
                not_found(format!("run not found: {id}"))
            }
            other => internal(other),
        })?;
    Ok(Json(ProgressResponse {
        total,
        processed,
        percent,
    }))
}

// --- Audit log ---

#[derive(Debug, Deserialize, Default)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let entries = state
        .storage
        .list_audit(query.limit.unwrap_or(100))
        .await
        .map_err(internal)?;
    Ok(Json(entries))
}
