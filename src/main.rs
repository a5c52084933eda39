// Entry point for the webtoon page translation service

use webtoon_workflow::{
    core::{types::GlossaryEntry, Config},
    jobs::{JobCoordinator, JobStore, NewJob, PipelineServices, TaskQueue},
    services::{DirectTranslator, HttpTranslator, Inpainter, TextDetector, Typesetter},
    ReadingMode, RemovalMethod,
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    store: Arc<JobStore>,
    coordinator: Arc<JobCoordinator>,
    queue: Arc<TaskQueue>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::new().expect("Failed to load configuration"));

    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::new(format!(
        "webtoon_workflow={}",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Initializing services...");
    let store = Arc::new(JobStore::open(config.database_path())?);
    let inpainter = Arc::new(Inpainter::from_config(&config.inpaint)?);
    let services = PipelineServices {
        detector: Arc::new(TextDetector::from_config(&config)?),
        translator: Arc::new(HttpTranslator::from_config(&config)?),
        inpainter: Arc::clone(&inpainter),
        typesetter: Arc::new(Typesetter::new(config.fonts_dir())?),
        direct: DirectTranslator::from_config(&config)?.map(Arc::new),
    };
    let coordinator = Arc::new(JobCoordinator::new(
        Arc::clone(&store),
        services,
        &config,
    ));
    let queue = TaskQueue::start(Arc::clone(&coordinator), &config.queue);

    let state = AppState {
        store,
        coordinator,
        queue,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/jobs", post(create_job))
        .route("/jobs/:job_id", get(job_status))
        .route("/jobs/:job_id/purge", post(purge_job))
        .route("/pages/:page_id/typeset", post(typeset_page))
        .with_state(state)
        .layer(DefaultBodyLimit::max(200 * 1024 * 1024))
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("Server starting on http://{}", addr);
    info!("Endpoints:");
    info!("  GET  /                      - Root endpoint");
    info!("  GET  /health                - Health check");
    info!("  POST /jobs                  - Create a translation job (multipart)");
    info!("  GET  /jobs/:id              - Job status with pages");
    info!("  POST /jobs/:id/purge        - Drop queued pages of a job");
    info!("  POST /pages/:id/typeset     - Re-render a page from its overrides");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    inpainter.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn root() -> &'static str {
    "Webtoon Page Translation Pipeline"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Job options carried in the multipart "options" field.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JobOptions {
    user_id: Option<String>,
    title: String,
    reading_mode: ReadingMode,
    source_language: Option<String>,
    text_removal: RemovalMethod,
    overwrite_text: Option<bool>,
    skip_translation: bool,
    glossary: Vec<GlossaryEntry>,
    detection_backend: Option<String>,
}

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Create a job from uploaded pages.
///
/// Multipart fields:
/// - "pages": one or more image files, in reading order
/// - "options" (optional): JSON JobOptions
async fn create_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut options = JobOptions::default();
    let mut pages: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "pages" => {
                let filename = field
                    .file_name()
                    .unwrap_or("page.png")
                    .replace(['/', '\\'], "_");
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
                image::load_from_memory(&data)
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid image: {}", e)))?;
                pages.push((filename, data.to_vec()));
            }
            "options" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Options error: {}", e)))?;
                options = serde_json::from_str(&raw).map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Invalid options JSON: {}", e))
                })?;
            }
            _ => {}
        }
    }

    if pages.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No pages provided".to_string()));
    }

    let new_job = NewJob {
        user_id: options.user_id.unwrap_or_else(|| "anonymous".to_string()),
        title: options.title,
        reading_mode: options.reading_mode,
        source_language: options.source_language.unwrap_or_else(|| "ko".to_string()),
        text_removal: options.text_removal,
        overwrite_text: options.overwrite_text.unwrap_or(true),
        skip_translation: options.skip_translation,
        glossary: options.glossary,
        detection_backend: options.detection_backend,
    };
    let job_id = state.store.create_job(&new_job).map_err(internal)?;

    let job_dir = state.coordinator.image_root().join("webtoons").join(&job_id);
    tokio::fs::create_dir_all(&job_dir)
        .await
        .map_err(internal)?;

    for (order, (filename, data)) in pages.iter().enumerate() {
        let rel = format!("webtoons/{}/{}", job_id, filename);
        tokio::fs::write(state.coordinator.image_root().join(&rel), data)
            .await
            .map_err(internal)?;
        state
            .store
            .add_page(&job_id, 1, order as i64, filename, &rel)
            .map_err(internal)?;
    }

    state.store.submit_job(&job_id).map_err(internal)?;
    state.queue.enqueue_job(&job_id);
    info!(%job_id, pages = pages.len(), "job created");

    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "total_pages": pages.len(),
        "status": "pending",
    })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .store
        .get_job(&job_id)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    let pages = state.store.pages_for_job(&job_id).map_err(internal)?;

    let page_views: Vec<serde_json::Value> = pages
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "chapter_number": p.chapter_number,
                "page_order": p.page_order,
                "original_filename": p.original_filename,
                "status": p.status.as_str(),
                "translated_path": p.translated_path,
                "typeset_path": p.typeset_path,
                "error_message": p.error_message,
                "processing_secs": p.processing_secs,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "job_id": job.job_id,
        "title": job.title,
        "status": job.status.as_str(),
        "total_pages": job.total_pages,
        "processed_pages": job.processed_pages,
        "failed_pages": job.failed_pages,
        "error_message": job.error_message,
        "created_at": job.created_at,
        "completed_at": job.completed_at,
        "pages": page_views,
    })))
}

async fn purge_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Verify the job exists before acknowledging the purge.
    state
        .store
        .get_job(&job_id)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    state.queue.purge_job(&job_id);
    Ok(Json(serde_json::json!({ "job_id": job_id, "purged": true })))
}

async fn typeset_page(
    State(state): State<AppState>,
    Path(page_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let path = state.coordinator.typeset_page(page_id).await.map_err(|e| {
        error!(page_id, error = %e, "typeset re-render failed");
        internal(e)
    })?;
    Ok(Json(serde_json::json!({
        "page_id": page_id,
        "typeset_path": path,
    })))
}
