//! HTTP server initialization and JSON routes.
//!
//! [`build_service`] wires the database, embedding provider, corpus and basis
//! registry into a [`ProjectionService`]; [`router`] exposes it over three
//! routes; [`serve`] binds the listener and runs until ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::db;
use crate::embedding::{self, store::EmbeddingStore};
use crate::projection::{
    BasisRegistry, DefaultCorpus, Projection, ProjectionError, ProjectionRequest,
    ProjectionService,
};

/// Open the cache database, create the embedding provider and load the default
/// corpus.
///
/// Blocking: the remote provider owns a blocking HTTP client, so call this
/// from `spawn_blocking` when inside a runtime.
pub fn build_service(config: &AppConfig) -> Result<ProjectionService> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    let provider: Arc<dyn embedding::EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    tracing::info!(model = %provider.model_id(), "embedding provider ready");

    let cache = Arc::new(db::cache::SqliteCache::new(conn, provider.model_id())?);

    let corpus_path = config.resolved_corpus_path();
    let corpus = DefaultCorpus::load(&corpus_path)
        .with_context(|| format!("failed to load default corpus from {}", corpus_path.display()))?;
    tracing::info!(words = corpus.len(), "default corpus loaded");

    let store = EmbeddingStore::new(provider, cache.clone(), config.embedding.batch_size);
    let registry = BasisRegistry::new(config.projection.max_bases)
        .with_store(cache)
        .with_default_source(corpus.digest());

    Ok(ProjectionService::new(
        Arc::new(store),
        Arc::new(registry),
        Arc::new(corpus),
        config.projection.max_word_len,
    ))
}

#[derive(Clone)]
pub struct AppState {
    service: Arc<ProjectionService>,
}

impl AppState {
    pub fn new(service: Arc<ProjectionService>) -> Self {
        Self { service }
    }
}

/// Body of `POST /api/search`.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub words: Vec<String>,
    #[serde(default)]
    pub pca_id: Option<String>,
}

/// Body of `POST /api/set_pca`.
#[derive(Debug, Deserialize)]
pub struct SetPcaRequest {
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default)]
    pub search_history: Vec<String>,
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

/// Error returned by the route handlers.
#[derive(Debug)]
pub enum ApiError {
    Projection(ProjectionError),
    Internal(String),
}

impl From<ProjectionError> for ApiError {
    fn from(e: ProjectionError) -> Self {
        ApiError::Projection(e)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("projection task failed: {e}"))
    }
}

/// HTTP status for each projection error kind.
pub fn status_for(error: &ProjectionError) -> StatusCode {
    match error {
        ProjectionError::InvalidWord { .. }
        | ProjectionError::InsufficientData { .. }
        | ProjectionError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
        ProjectionError::UnknownBasis(_) => StatusCode::NOT_FOUND,
        ProjectionError::EmbeddingUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ProjectionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Projection(e) => (
                status_for(&e),
                ErrorBody {
                    error: e.kind(),
                    detail: e.to_string(),
                },
            ),
            ApiError::Internal(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: "internal",
                    detail,
                },
            ),
        };
        if status.is_server_error() {
            tracing::error!(status = %status, detail = %body.detail, "request failed");
        } else {
            tracing::debug!(status = %status, detail = %body.detail, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

/// Build the API router over a shared service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/index", get(index))
        .route("/api/search", post(search))
        .route("/api/set_pca", post(set_pca))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Result<Json<Projection>, ApiError> {
    let service = Arc::clone(&state.service);
    let projection = tokio::task::spawn_blocking(move || service.default_projection()).await??;
    Ok(Json(Projection::clone(&projection)))
}

async fn search(
    State(state): State<AppState>,
    Json(body): Json<SearchRequest>,
) -> Result<Json<Projection>, ApiError> {
    let service = Arc::clone(&state.service);
    let request = ProjectionRequest {
        target_words: body.words,
        basis_id: body.pca_id,
        ..Default::default()
    };
    let projection = tokio::task::spawn_blocking(move || service.project(&request)).await??;
    Ok(Json(projection))
}

async fn set_pca(
    State(state): State<AppState>,
    Json(body): Json<SetPcaRequest>,
) -> Result<Json<Projection>, ApiError> {
    let service = Arc::clone(&state.service);
    let projection = tokio::task::spawn_blocking(move || {
        service.rebase(&body.words, &body.search_history, body.reset)
    })
    .await??;
    Ok(Json(projection))
}

/// Start the HTTP server and block until ctrl-c.
pub async fn serve(config: AppConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting latentdict server");

    let service = tokio::task::spawn_blocking(move || build_service(&config))
        .await
        .context("service setup task failed")??;
    let service = Arc::new(service);

    let app = router(AppState::new(Arc::clone(&service)));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "listening at http://{bind_addr}/api");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down server");
        })
        .await?;

    // Last handle; the blocking HTTP client must not be dropped on a runtime thread.
    tokio::task::spawn_blocking(move || drop(service)).await?;
    Ok(())
}
