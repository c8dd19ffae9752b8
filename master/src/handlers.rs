use std::{
    fs, io,
    path::PathBuf,
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    new_job_id, CancelResponse, JobInfo, JobLogsResponse, JobRequest, JobResults, JobState,
    ResultFile, JOB_LOG_FILE, RESULTS_POST_DIR,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::{ExecutorError, StoreError};
use crate::state::AppState;
use crate::store::JobStore;

/// Margen sobre el abort forzado antes de dar por perdido el borrado.
const DELETE_GRACE: Duration = Duration::from_secs(5);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job).delete(delete_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/jobs/:id/logs", get(get_job_logs))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .with_state(state)
}

fn store_status(err: StoreError) -> StatusCode {
    match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Duplicate { .. } => StatusCode::CONFLICT,
        other => {
            error!(error = %other, "error del almacén de jobs");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Corre una operación de SQLite en el pool bloqueante de tokio.
async fn with_store<T, F>(state: &AppState, op: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce(&dyn JobStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| {
            error!(error = %e, "la tarea del almacén no terminó");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(store_status)
}

async fn load_job(state: &AppState, id: &str) -> Result<JobInfo, StatusCode> {
    let id = id.to_string();
    with_store(state, move |store| store.get_job(&id)).await
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Registra el job en el store y lo agenda en el pool
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> Result<(StatusCode, Json<JobInfo>), StatusCode> {
    if req.compute_on_cluster && req.cluster.is_none() && state.config.cluster.is_none() {
        warn!(name = %req.name, "job para el cluster sin conexión configurada");
        return Err(StatusCode::BAD_REQUEST);
    }

    let job_id = req.id.clone().unwrap_or_else(new_job_id);
    let working_directory = state.config.storage.jobs_dir.join(&job_id);
    let job = JobInfo {
        id: job_id.clone(),
        name: req.name.clone(),
        state: JobState::Queued,
        progress_percent: 0.0,
        submitted_at: Utc::now(),
        begin_time: None,
        end_time: None,
        working_directory: working_directory.to_string_lossy().to_string(),
        remote_job_id: None,
        request: req,
    };

    let row = job.clone();
    with_store(&state, move |store| store.create_job(&row)).await?;
    if let Err(ExecutorError::Duplicate(_)) = state.executor.submit(job.clone()) {
        return Err(StatusCode::CONFLICT);
    }

    info!(job_id = %job_id, name = %job.name, "job creado");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobInfo>>, StatusCode> {
    with_store(&state, |store| store.list_jobs()).await.map(Json)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    load_job(&state, &id).await.map(Json)
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, StatusCode> {
    let job = load_job(&state, &id).await?;
    let accepted = !job.state.is_terminal()
        && state.executor.cancel(&id, state.config.abort_delay());

    Ok(Json(CancelResponse {
        job_id: job.id,
        accepted,
    }))
}

// Cancela el job si sigue en el pool, después borra la fila y su directorio
async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let job = load_job(&state, &id).await?;

    if state.executor.is_in_flight(&id) {
        let abort_delay = state.config.abort_delay();
        state.executor.cancel(&id, abort_delay);
        if !state
            .executor
            .wait_until_idle(&id, abort_delay + DELETE_GRACE)
            .await
        {
            warn!(job_id = %id, "el job no salió del pool, no se borra");
            return Err(StatusCode::CONFLICT);
        }
    }

    let row = id.clone();
    with_store(&state, move |store| store.delete_job(&row)).await?;

    let working_directory = PathBuf::from(&job.working_directory);
    if !working_directory.starts_with(&state.config.storage.jobs_dir) {
        warn!(job_id = %id, dir = %working_directory.display(), "directorio fuera de jobs_dir, se deja");
    } else {
        match tokio::fs::remove_dir_all(&working_directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(job_id = %id, error = %e, "no se pudo borrar el directorio del job");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    info!(job_id = %id, "job borrado");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

// joblog.txt si el job ya terminó, si no lo capturado hasta ahora
async fn get_job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<JobLogsResponse>, StatusCode> {
    let job = load_job(&state, &id).await?;
    let log_path = PathBuf::from(&job.working_directory).join(JOB_LOG_FILE);

    let (persisted, mut lines) = match tokio::fs::read_to_string(&log_path).await {
        Ok(text) => (true, text.lines().map(str::to_string).collect::<Vec<_>>()),
        Err(_) => (false, state.logs.tail(&id, None).unwrap_or_default()),
    };
    if let Some(n) = query.lines {
        let skip = lines.len().saturating_sub(n);
        lines.drain(..skip);
    }

    Ok(Json(JobLogsResponse {
        job_id: job.id,
        persisted,
        lines,
    }))
}

fn list_result_files(output_dir: &std::path::Path) -> Vec<ResultFile> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(output_dir) {
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_file() {
                files.push(ResultFile {
                    name: entry.file_name().to_string_lossy().to_string(),
                    size_bytes: meta.len(),
                });
            }
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResults>, StatusCode> {
    let job = load_job(&state, &id).await?;
    let output_dir = PathBuf::from(&job.working_directory).join(RESULTS_POST_DIR);

    let dir = output_dir.clone();
    let files = tokio::task::spawn_blocking(move || list_result_files(&dir))
        .await
        .map_err(|e| {
            error!(error = %e, "no se pudo listar resultados");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(JobResults {
        job_id: job.id,
        state: job.state,
        output_dir: output_dir.to_string_lossy().to_string(),
        files,
    }))
}
