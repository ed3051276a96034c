//! REST endpoints for cron jobs and their run history.

use crate::cron::scheduler::CronScheduler;
use crate::cron::store::CronStore;
use crate::cron::types::{CronJob, JobType};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct CronState {
    pub store: Arc<CronStore>,
    pub scheduler: Arc<CronScheduler>,
}

pub fn router(state: CronState) -> Router {
    Router::new()
        .route("/cron/jobs", get(list_jobs).post(create_job))
        .route(
            "/cron/jobs/:id",
            get(get_job).patch(update_job).delete(delete_job),
        )
        .route("/cron/jobs/:id/run", post(run_job))
        .route("/cron/jobs/:id/reset", post(reset_job))
        .route("/cron/jobs/:id/runs", get(job_runs))
        .route("/cron/runs", get(all_runs))
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Job not found: {id}")})),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest {
    name: String,
    #[serde(rename = "type")]
    job_type: JobType,
    interval_seconds: u64,
    config: Value,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    permission_mode: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateJobRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    interval_seconds: Option<u64>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    permission_mode: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn list_jobs(State(state): State<CronState>) -> Json<Value> {
    Json(json!({"jobs": state.store.list_jobs().await}))
}

async fn create_job(
    State(state): State<CronState>,
    Json(req): Json<CreateJobRequest>,
) -> (StatusCode, Json<CronJob>) {
    let now = Utc::now();
    let job = CronJob {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        job_type: req.job_type,
        enabled: req.enabled,
        interval_seconds: req.interval_seconds,
        config: req.config,
        model: req.model,
        permission_mode: req.permission_mode,
        last_run_at: None,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_job(job.clone()).await;
    (StatusCode::CREATED, Json(job))
}

async fn get_job(
    State(state): State<CronState>,
    Path(id): Path<String>,
) -> Result<Json<CronJob>, ApiError> {
    state.store.get_job(&id).await.map(Json).ok_or(not_found(&id))
}

async fn update_job(
    State(state): State<CronState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateJobRequest>,
) -> Result<Json<CronJob>, ApiError> {
    state
        .store
        .update_job(&id, |job| {
            if let Some(name) = req.name {
                job.name = name;
            }
            if let Some(interval) = req.interval_seconds {
                job.interval_seconds = interval;
            }
            if let Some(config) = req.config {
                job.config = config;
            }
            if let Some(model) = req.model {
                job.model = Some(model);
            }
            if let Some(mode) = req.permission_mode {
                job.permission_mode = Some(mode);
            }
            if let Some(enabled) = req.enabled {
                job.enabled = enabled;
            }
        })
        .await
        .map(Json)
        .ok_or(not_found(&id))
}

async fn delete_job(
    State(state): State<CronState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.delete_job(&id).await {
        Ok(Json(json!({"deleted": true, "jobId": id})))
    } else {
        Err(not_found(&id))
    }
}

/// POST /cron/jobs/:id/run — one immediate invocation.
async fn run_job(
    State(state): State<CronState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.scheduler.trigger_now(&id).await {
        Some(run) => Ok(Json(json!(run))),
        None => Err(not_found(&id)),
    }
}

/// POST /cron/jobs/:id/reset — clear the seen-trigger set.
async fn reset_job(
    State(state): State<CronState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_job(&id).await.is_none() {
        return Err(not_found(&id));
    }
    state.scheduler.reset(&id).await;
    Ok(Json(json!({"reset": true, "jobId": id})))
}

async fn job_runs(
    State(state): State<CronState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_job(&id).await.is_none() {
        return Err(not_found(&id));
    }
    Ok(Json(json!({"runs": state.store.runs_for_job(&id).await})))
}

async fn all_runs(State(state): State<CronState>) -> Json<Value> {
    Json(json!({"runs": state.store.all_runs().await}))
}
