//! Inference against the current classifier artifact.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::classifier::{self, features, ClassifierModel, Prediction};
use crate::db::{Database, ImageOrigin};
use crate::upload;

/// Holds the active model and swaps it when a run completes.
#[derive(Debug)]
pub struct Predictor {
    model: RwLock<Arc<ClassifierModel>>,
}

impl Predictor {
    pub fn new(model: ClassifierModel) -> Self {
        Self {
            model: RwLock::new(Arc::new(model)),
        }
    }

    /// Load the artifact at `path`. A missing or unreadable artifact yields
    /// the untrained placeholder sized for `target_size` inputs.
    pub fn load(path: &Path, target_size: u32) -> Self {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "No trained model found, using untrained model");
            return Self::new(ClassifierModel::untrained(target_size));
        }

        match ClassifierModel::load(path) {
            Ok(model) => {
                tracing::info!(
                    path = %path.display(),
                    classes = model.num_classes(),
                    "Loaded classifier"
                );
                Self::new(model)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load model, using untrained model");
                Self::new(ClassifierModel::untrained(target_size))
            }
        }
    }

    pub fn current(&self) -> Arc<ClassifierModel> {
        let guard = self.model.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, model: ClassifierModel) {
        let classes = model.class_names.len();
        *self.model.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(model);
        tracing::info!(classes, "Swapped in new classifier");
    }

    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let img = features::decode(bytes)?;
        self.current().predict(&img)
    }

    /// Load the artifact recorded for model `model_id`, checking that the file
    /// on disk is still the one that run produced.
    pub fn load_model(&self, db: &Database, model_id: i64) -> Result<ClassifierModel> {
        let record = db
            .get_model(model_id)?
            .with_context(|| format!("Model {} not found", model_id))?;
        let path = PathBuf::from(&record.filepath);

        let Some(expected) = record.artifact_sha256.as_deref() else {
            bail!("Model {} has no recorded artifact digest", model_id);
        };
        let actual = classifier::file_sha256(&path)
            .with_context(|| format!("Artifact for model {} is unreadable", model_id))?;
        if actual != expected {
            bail!(
                "Artifact at {} no longer matches model {} (superseded by a later run)",
                path.display(),
                model_id
            );
        }

        ClassifierModel::load(&path)
    }

    /// Check the artifact on disk against the newest recorded run.
    ///
    /// Returns the verified model id, `None` when no run was ever recorded,
    /// or an error when the artifact is missing or was written by something
    /// other than that run.
    pub fn verify_latest(&self, db: &Database) -> Result<Option<i64>> {
        let Some(latest) = db.get_latest_model()? else {
            return Ok(None);
        };
        let model = self.load_model(db, latest.id)?;
        if model != *self.current() {
            bail!("Model {} differs from the classifier in memory", latest.id);
        }
        Ok(Some(latest.id))
    }
}

/// Store a file submitted for prediction under `upload_dir` and log it with
/// the predicted label. These rows never feed training.
pub fn record_prediction(
    db: &Database,
    upload_dir: &Path,
    filename: &str,
    bytes: &[u8],
    prediction: &Prediction,
) -> Result<i64> {
    let filename = upload::sanitize_filename(filename)?;
    fs::create_dir_all(upload_dir).context("Failed to create upload directory")?;
    let path = upload_dir.join(&filename);
    fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;

    db.insert_labeled_image(
        &filename,
        &path.to_string_lossy(),
        &prediction.label,
        ImageOrigin::Prediction,
    )
}
