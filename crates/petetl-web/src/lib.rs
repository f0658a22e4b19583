//! Axum + Askama dashboard and upload API for the pet ETL.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use petetl_adapters::{preview_csv, SourceLocator};
use petetl_core::{MetricsSnapshot, StatusCount};
use petetl_storage::UploadStore;
use petetl_sync::{build_scheduler, derive_metrics, pipeline_from_config, EtlConfig, EtlPipeline, PipelineError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "petetl-web";

const PREVIEW_ROWS: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<EtlPipeline>,
    pub uploads: UploadStore,
}

impl AppState {
    pub fn new(pipeline: Arc<EtlPipeline>, uploads: UploadStore) -> Self {
        Self { pipeline, uploads }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PetsQuery {
    status: Option<String>,
}

#[derive(Debug, Clone)]
struct StatusRow {
    label: String,
    count: i64,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    generated_at: String,
    run_status: String,
    last_run_at: String,
    last_successful_run: String,
    total_records: u64,
    store_available: bool,
    status_rows: Vec<StatusRow>,
    total_pets: i64,
    recent_lines: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EtlMetricsResponse {
    metrics: MetricsSnapshot,
    log_tail: Vec<String>,
}

struct CsvUpload {
    file_name: String,
    bytes: Vec<u8>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/pets", get(pets_handler))
        .route("/api/dashboard/pet-stats", get(pet_stats_handler))
        .route("/api/dashboard/etl-metrics", get(etl_metrics_handler))
        .route("/upload-csv", post(upload_csv_handler))
        .route("/csv-preview", post(csv_preview_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = EtlConfig::from_env();
    let port = config.web_port;
    let uploads = UploadStore::new(config.upload_dir.clone());
    let pipeline = Arc::new(pipeline_from_config(config)?);

    let scheduler = build_scheduler(pipeline.clone(), pipeline.config().source_locator()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting ETL scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving pet ETL dashboard");
    axum::serve(listener, app(AppState::new(pipeline, uploads))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let recent_lines = match state.pipeline.history_tail().await {
        Ok(lines) => lines,
        Err(err) => return server_error(err),
    };
    let metrics = derive_metrics(&recent_lines);

    let stats = state.pipeline.store().pet_stats().await;
    if let Err(err) = &stats {
        warn!(error = %err, "dashboard rendered without store statistics");
    }
    let status_counts = stats.map(|s| s.status_counts).ok();

    render_html(IndexTemplate {
        generated_at: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        run_status: format!("{:?}", metrics.status),
        last_run_at: metrics.last_run_at.unwrap_or_else(|| "n/a".into()),
        last_successful_run: metrics.last_successful_run.unwrap_or_else(|| "n/a".into()),
        total_records: metrics.total_records,
        store_available: status_counts.is_some(),
        total_pets: status_counts.iter().flatten().map(|c| c.count).sum(),
        status_rows: status_counts
            .unwrap_or_default()
            .into_iter()
            .map(status_row)
            .collect(),
        recent_lines,
    })
}

fn status_row(count: StatusCount) -> StatusRow {
    StatusRow {
        label: count.status.unwrap_or_else(|| "unknown".into()),
        count: count.count,
    }
}

async fn pets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PetsQuery>,
) -> Response {
    let status = query
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "all");
    match state.pipeline.store().list_pets(status).await {
        Ok(pets) => Json(pets).into_response(),
        Err(err) => json_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

async fn pet_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().pet_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => json_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

async fn etl_metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.history_tail().await {
        Ok(log_tail) => Json(EtlMetricsResponse {
            metrics: derive_metrics(&log_tail),
            log_tail,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn upload_csv_handler(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let upload = match read_csv_upload(multipart).await {
        Ok(upload) => upload,
        Err(resp) => return resp,
    };
    if upload.bytes.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "Uploaded file is empty");
    }
    let stored = match state
        .uploads
        .store_upload(Utc::now(), &upload.file_name, &upload.bytes)
        .await
    {
        Ok(stored) => stored,
        Err(err) => return server_error(err),
    };

    let source = SourceLocator::Local(stored.absolute_path);
    match state.pipeline.run_once(&source).await {
        Ok(summary) if summary.status.is_success() => Json(json!({
            "message": "File uploaded and processed successfully",
            "filename": stored.original_name,
            "run_id": summary.run_id,
            "status": summary.status,
        }))
        .into_response(),
        Ok(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to process the file"),
        Err(PipelineError::RunInProgress) => {
            json_error(StatusCode::CONFLICT, "An ETL run is already in progress")
        }
        Err(err) => server_error(err.into()),
    }
}

async fn csv_preview_handler(multipart: Multipart) -> Response {
    let upload = match read_csv_upload(multipart).await {
        Ok(upload) => upload,
        Err(resp) => return resp,
    };
    match preview_csv(&upload.bytes, PREVIEW_ROWS) {
        Ok(preview) => Json(preview).into_response(),
        Err(err) => json_error(
            StatusCode::BAD_REQUEST,
            format!("Error parsing CSV: {err}"),
        ),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    match state.pipeline.store().ping().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "database": "connected",
            "timestamp": timestamp,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "error": err.to_string(),
                "timestamp": timestamp,
            })),
        )
            .into_response(),
    }
}

/// First `file` part of the form, which must carry a `.csv` file name.
async fn read_csv_upload(mut multipart: Multipart) -> Result<CsvUpload, Response> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().trim().to_string();
        if file_name.is_empty() {
            return Err(json_error(StatusCode::BAD_REQUEST, "No selected file"));
        }
        if !file_name.to_ascii_lowercase().ends_with(".csv") {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "Invalid file format. Please upload a CSV file",
            ));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|err| json_error(StatusCode::BAD_REQUEST, format!("reading upload: {err}")))?;
        return Ok(CsvUpload {
            file_name,
            bytes: bytes.to_vec(),
        });
    }
    Err(json_error(StatusCode::BAD_REQUEST, "No file part"))
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}
