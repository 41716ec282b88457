//! HTTP surface.

mod error;
mod handlers;

pub use error::ApiError;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::{Config, ServerConfig};
use crate::dataset::DatasetStore;
use crate::db::Database;
use crate::prediction::Predictor;
use crate::training::{Orchestrator, TrainingStatus};

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub store: DatasetStore,
    pub predictor: Arc<Predictor>,
    pub orchestrator: Arc<Orchestrator>,
    pub upload_dir: PathBuf,
    pub top_k: usize,
}

impl AppState {
    /// Wire up services from configuration, loading the current artifact.
    pub fn new(config: &Config, db: Arc<Database>) -> Self {
        let predictor = Arc::new(Predictor::load(
            &config.storage.model_path(),
            config.training.target_size,
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&db),
            config.storage.clone(),
            config.training.clone(),
            Arc::clone(&predictor),
            Arc::new(TrainingStatus::with_lock_file(
                config.storage.training_lock_path(),
            )),
        );
        log_startup_state(&db, &predictor);

        Self {
            db,
            store: DatasetStore::new(config.storage.dataset_dir.clone()),
            predictor,
            orchestrator: Arc::new(orchestrator),
            upload_dir: config.storage.upload_dir.clone(),
            top_k: config.matching.top_k,
        }
    }
}

/// Report what the metadata store holds and whether the artifact on disk is
/// the one the latest run recorded. Never fatal: the server still serves
/// whatever model it loaded.
fn log_startup_state(db: &Database, predictor: &Predictor) {
    match (
        db.count_untrained_images(),
        db.count_trained_images(),
        db.count_models(),
    ) {
        (Ok(untrained), Ok(trained), Ok(models)) => {
            tracing::info!(untrained, trained, models, "Metadata store ready")
        }
        _ => tracing::warn!("Could not count stored images and models"),
    }

    match predictor.verify_latest(db) {
        Ok(Some(model_id)) => tracing::info!(model_id, "Artifact matches latest model"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Artifact does not match latest model record"),
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub fn router(state: AppState, server: &ServerConfig) -> Router {
    let static_files = ServeDir::new(state.store.root().to_path_buf());

    Router::new()
        .route("/health", get(handlers::health))
        .route("/upload", post(handlers::upload_image))
        .route("/predict", post(handlers::predict))
        .route("/predict-with-match", post(handlers::predict_with_match))
        .route("/train", post(handlers::train))
        .route("/training-status", get(handlers::training_status))
        .route("/models", get(handlers::list_models))
        .route("/labels", get(handlers::list_labels))
        .route("/sample-images/:label", get(handlers::sample_images))
        .route("/training-data", get(handlers::training_data))
        .route("/uploaded-data", get(handlers::uploaded_data))
        .route("/training-images/:label", get(handlers::training_images))
        .nest_service("/static", static_files)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&server.allowed_origins))
        .layer(DefaultBodyLimit::max(server.max_upload_bytes))
        .layer(RequestBodyLimitLayer::new(server.max_upload_bytes))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: &Config, db: Arc<Database>) -> Result<()> {
    let state = AppState::new(config, db);
    state.store.ensure_root()?;
    let app = router(state, &config.server);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}
