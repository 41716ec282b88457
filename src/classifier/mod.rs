//! Image classifier: feature extraction, the saved model artifact and the
//! training backend seam.

pub mod features;
mod model;
mod trainer;

pub use model::{file_sha256, sha256_hex, ClassifierModel, Prediction, Weights};
pub use trainer::{accuracy, LogisticTrainer, Trainer, TrainingSet};

/// File name of the artifact inside the model directory. Every run replaces it.
pub const ARTIFACT_FILENAME: &str = "latest_model.json";
