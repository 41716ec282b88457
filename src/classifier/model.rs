//! Serializable classifier artifact.

use anyhow::{anyhow, bail, Context, Result};
use image::DynamicImage;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use super::features;

/// Class count assumed by the placeholder model used before any training.
const UNTRAINED_CLASSES: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Weights {
    /// Nothing trained yet; every prediction is class 0 at chance confidence.
    Untrained { num_classes: usize },
    /// A single label was trained; it always wins.
    Constant { class: usize },
    /// Multinomial logistic regression: `softmax(x · weights + intercept)`.
    /// `weights` is `(features, classes)`.
    Linear {
        weights: Array2<f64>,
        intercept: Array1<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub confidence: f64,
    /// False when the placeholder model produced this result.
    pub trained: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierModel {
    /// Label folder names indexed by class. Empty means "report raw indexes".
    #[serde(default)]
    pub class_names: Vec<String>,
    /// Square input edge the model was trained on.
    pub input_size: u32,
    pub weights: Weights,
}

impl ClassifierModel {
    pub fn untrained(input_size: u32) -> Self {
        Self {
            class_names: Vec::new(),
            input_size,
            weights: Weights::Untrained {
                num_classes: UNTRAINED_CLASSES,
            },
        }
    }

    pub fn is_trained(&self) -> bool {
        !matches!(self.weights, Weights::Untrained { .. })
    }

    pub fn num_classes(&self) -> usize {
        match &self.weights {
            Weights::Untrained { num_classes } => *num_classes,
            Weights::Constant { .. } => self.class_names.len().max(1),
            Weights::Linear { intercept, .. } => intercept.len(),
        }
    }

    /// Class name for `index`, or the index itself when no names are known.
    pub fn label_for(&self, index: usize) -> String {
        self.class_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }

    /// Class probabilities for an already extracted feature vector.
    pub fn probabilities(&self, features: &[f64]) -> Result<Array1<f64>> {
        match &self.weights {
            Weights::Untrained { num_classes } => {
                let n = (*num_classes).max(1);
                Ok(Array1::from_elem(n, 1.0 / n as f64))
            }
            Weights::Constant { class } => {
                let mut probs: Array1<f64> = Array1::zeros(class + 1);
                probs[*class] = 1.0;
                Ok(probs)
            }
            Weights::Linear { weights, intercept } => {
                if features.len() != weights.nrows() {
                    bail!(
                        "Feature length {} does not match model input {}",
                        features.len(),
                        weights.nrows()
                    );
                }
                let logits = ArrayView1::from(features).dot(weights) + intercept;
                Ok(softmax(logits))
            }
        }
    }

    pub fn predict_features(&self, features: &[f64]) -> Result<Prediction> {
        let probs = self.probabilities(features)?;
        let (class_index, confidence) = probs
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, &p)| if p > best.1 { (i, p) } else { best });

        Ok(Prediction {
            class_index,
            label: self.label_for(class_index),
            confidence: confidence.clamp(0.0, 1.0),
            trained: self.is_trained(),
        })
    }

    /// Resize/normalize `img` to this model's geometry and classify it.
    pub fn predict(&self, img: &DynamicImage) -> Result<Prediction> {
        let features = features::extract(img, self.input_size);
        self.predict_features(&features)
    }

    /// Write the artifact to `path`, replacing whatever is there, and return
    /// the SHA-256 of the written bytes.
    pub fn save(&self, path: &Path) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        // Write next to the target and rename so readers never see a partial file.
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        fs::write(tmp.path(), &bytes)?;
        tmp.persist(path)
            .map_err(|e| anyhow!("Failed to replace {}: {}", path.display(), e))?;

        Ok(sha256_hex(&bytes))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read model {}", path.display()))?;
        let model: ClassifierModel = serde_json::from_slice(&bytes)
            .with_context(|| format!("Invalid model artifact {}", path.display()))?;

        if let Weights::Linear { weights, intercept } = &model.weights {
            let expected = features::feature_len(model.input_size);
            if weights.nrows() != expected || weights.ncols() != intercept.len() {
                bail!(
                    "Model {} has {}x{} weights, expected {} inputs for size {}",
                    path.display(),
                    weights.nrows(),
                    weights.ncols(),
                    expected,
                    model.input_size
                );
            }
        }
        Ok(model)
    }
}

fn softmax(logits: Array1<f64>) -> Array1<f64> {
    let max = logits.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let exp = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn linear_model() -> ClassifierModel {
        // One RGB pixel, two classes: the red channel votes "red", blue votes "blue".
        ClassifierModel {
            class_names: vec!["red".to_string(), "blue".to_string()],
            input_size: 1,
            weights: Weights::Linear {
                weights: array![[4.0, -4.0], [0.0, 0.0], [-4.0, 4.0]],
                intercept: array![0.0, 0.0],
            },
        }
    }

    #[test]
    fn test_linear_prediction_picks_highest_probability() {
        let model = linear_model();
        let prediction = model.predict_features(&[0.0, 0.0, 1.0]).unwrap();

        assert_eq!(prediction.label, "blue");
        assert_eq!(prediction.class_index, 1);
        assert!(prediction.confidence > 0.99 && prediction.confidence <= 1.0);
        assert!(prediction.trained);
    }

    #[test]
    fn test_feature_length_mismatch_is_an_error() {
        assert!(linear_model().predict_features(&[1.0, 0.0]).is_err());
    }

    #[test]
    fn test_load_rejects_weights_for_other_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest_model.json");

        let mut model = linear_model();
        model.input_size = 2;
        model.save(&path).unwrap();

        let err = ClassifierModel::load(&path).unwrap_err();
        assert!(err.to_string().contains("expected 12 inputs"));
    }

    #[test]
    fn test_untrained_model_reports_raw_index() {
        let model = ClassifierModel::untrained(8);
        let prediction = model.predict_features(&[0.3; 192]).unwrap();

        assert_eq!(prediction.label, "0");
        assert!((prediction.confidence - 0.5).abs() < 1e-9);
        assert!(!prediction.trained);
    }

    #[test]
    fn test_constant_model() {
        let model = ClassifierModel {
            class_names: vec!["cat".to_string()],
            input_size: 4,
            weights: Weights::Constant { class: 0 },
        };
        let prediction = model.predict_features(&[]).unwrap();
        assert_eq!(prediction.label, "cat");
        assert!((prediction.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_save_overwrites_and_digest_matches_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model").join("latest_model.json");

        let first = ClassifierModel::untrained(8).save(&path).unwrap();
        let second = linear_model().save(&path).unwrap();

        assert_ne!(first, second);
        assert_eq!(file_sha256(&path).unwrap(), second);
        assert_eq!(ClassifierModel::load(&path).unwrap(), linear_model());

        let files: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }
}
