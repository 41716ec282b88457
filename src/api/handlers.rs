use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::AppState;
use crate::classifier::Prediction;
use crate::db::SUMMARY_SAMPLES;
use crate::matching;
use crate::prediction;
use crate::training::StatusSnapshot;
use crate::upload::{self, UploadError};

/// Fields extracted from a multipart form.
struct FilePart {
    filename: String,
    bytes: Bytes,
    label: Option<String>,
}

async fn read_multipart(mut multipart: Multipart) -> Result<FilePart, ApiError> {
    let mut filename = None;
    let mut bytes = None;
    let mut label = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Multipart error: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                filename = field.file_name().map(|n| n.to_string());
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("Read error: {}", e)))?,
                );
            }
            Some("label") => {
                label = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("Read error: {}", e)))?,
                );
            }
            _ => {}
        }
    }

    let bytes =
        bytes.ok_or_else(|| ApiError::BadRequest("Missing file in multipart form".to_string()))?;
    if bytes.is_empty() {
        return Err(UploadError::EmptyFile.into());
    }
    let filename = filename
        .ok_or_else(|| UploadError::InvalidFilename(String::new()))?;

    Ok(FilePart {
        filename,
        bytes,
        label,
    })
}

/// Run filesystem/SQLite/CPU work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Background task failed: {}", e)))?
        .map_err(ApiError::from)
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    label: Option<String>,
}

pub async fn upload_image(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let part = read_multipart(multipart).await?;
    let label = part.label.or(query.label);

    let result = blocking(move || {
        upload::upload(
            &state.db,
            &state.store,
            &part.bytes,
            &part.filename,
            label.as_deref(),
        )
    })
    .await?;

    Ok(Json(json!({
        "status": true,
        "image_id": result.image_id,
        "filename": result.filename,
        "label": result.label,
    })))
}

/// Classify an uploaded file. Undecodable input is the caller's fault.
async fn classify(state: &AppState, bytes: Bytes) -> Result<Prediction, ApiError> {
    let predictor = state.predictor.clone();
    tokio::task::spawn_blocking(move || predictor.predict_bytes(&bytes))
        .await
        .map_err(|e| ApiError::Internal(format!("Background task failed: {}", e)))?
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

pub async fn predict(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let part = read_multipart(multipart).await?;
    let prediction = classify(&state, part.bytes.clone()).await?;

    let logged = prediction.clone();
    blocking(move || {
        prediction::record_prediction(
            &state.db,
            &state.upload_dir,
            &part.filename,
            &part.bytes,
            &logged,
        )
    })
    .await?;

    Ok(Json(json!({
        "status": true,
        "prediction": prediction.label,
        "confidence": prediction.confidence,
        "trained": prediction.trained,
    })))
}

pub async fn predict_with_match(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let part = read_multipart(multipart).await?;
    let prediction = classify(&state, part.bytes).await?;

    let label = prediction.label.clone();
    let top_k = state.top_k;
    let db = state.db.clone();
    let matches = blocking(move || matching::find_matches(&db, &label, top_k)).await?;

    Ok(Json(json!({
        "status": true,
        "prediction": prediction.label,
        "confidence": prediction.confidence,
        "trained": prediction.trained,
        "matched_training_images": matches,
    })))
}

#[derive(Debug, Deserialize)]
struct TrainRequest {
    #[serde(default)]
    labels: Option<Vec<String>>,
}

/// Empty body → full run; `{labels: [..]}` → scoped run.
fn parse_train_request(body: &[u8]) -> Result<Option<Vec<String>>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let request: TrainRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid train request: {}", e)))?;

    match request.labels {
        Some(labels) if !labels.is_empty() => {
            let labels = labels
                .iter()
                .map(|l| upload::validate_label(l))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(labels))
        }
        _ => Ok(None),
    }
}

pub async fn train(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let labels = parse_train_request(&body)?;
    let message = match &labels {
        Some(labels) => format!("Training started for labels: {}", labels.join(", ")),
        None => "Training started".to_string(),
    };

    // The handle is dropped; progress is polled via /training-status.
    state.orchestrator.start(labels)?;
    tracing::info!("{}", message);

    Ok(Json(json!({ "status": true, "message": message })))
}

pub async fn training_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.orchestrator.status().snapshot())
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let models = blocking(move || state.db.get_models()).await?;
    Ok(Json(json!({ "status": true, "models": models })))
}

pub async fn list_labels(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let labels = blocking(move || state.db.get_untrained_labels()).await?;
    Ok(Json(json!({ "status": true, "labels": labels })))
}

pub async fn sample_images(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let images = blocking(move || state.db.get_sample_images(&label, SUMMARY_SAMPLES)).await?;
    Ok(Json(json!({ "status": true, "images": images })))
}

pub async fn training_data(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let summary = blocking(move || state.db.get_training_summary()).await?;
    Ok(Json(json!({ "status": true, "training_data": summary })))
}

pub async fn uploaded_data(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let summary = blocking(move || state.db.get_uploaded_summary()).await?;
    Ok(Json(json!({ "status": true, "uploaded_data": summary })))
}

pub async fn training_images(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let images = blocking(move || state.db.get_trained_image_refs(&label)).await?;
    Ok(Json(json!({ "status": true, "images": images })))
}
