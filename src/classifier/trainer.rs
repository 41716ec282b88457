//! Training backends.

use anyhow::{anyhow, bail, Result};
use linfa::prelude::*;
use linfa_logistic::MultiLogisticRegression;
use ndarray::{Array1, Array2};

use super::model::{ClassifierModel, Weights};

/// Optimizer iterations granted per configured epoch.
const ITERATIONS_PER_EPOCH: u64 = 20;

/// Row-major feature matrix with one class index per row.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub features: Array2<f64>,
    pub targets: Array1<usize>,
}

impl TrainingSet {
    /// Stack per-image feature vectors. Every row must have the same length.
    pub fn from_rows(rows: Vec<(Vec<f64>, usize)>) -> Result<Self> {
        let n = rows.len();
        let width = rows.first().map(|(f, _)| f.len()).unwrap_or(0);

        let mut flat = Vec::with_capacity(n * width);
        let mut targets = Vec::with_capacity(n);
        for (features, target) in rows {
            if features.len() != width {
                bail!("Inconsistent feature length {} (expected {})", features.len(), width);
            }
            flat.extend(features);
            targets.push(target);
        }

        let features = Array2::from_shape_vec((n, width), flat)?;
        Ok(Self {
            features,
            targets: Array1::from(targets),
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Fits a classifier over extracted features.
pub trait Trainer: Send + Sync {
    fn fit(
        &self,
        train: &TrainingSet,
        class_names: &[String],
        input_size: u32,
    ) -> Result<ClassifierModel>;
}

/// Multinomial logistic regression through linfa.
#[derive(Debug, Clone)]
pub struct LogisticTrainer {
    max_iterations: u64,
}

impl LogisticTrainer {
    pub fn from_epochs(epochs: u64) -> Self {
        Self {
            max_iterations: epochs.max(1).saturating_mul(ITERATIONS_PER_EPOCH),
        }
    }
}

impl Default for LogisticTrainer {
    fn default() -> Self {
        Self::from_epochs(5)
    }
}

impl Trainer for LogisticTrainer {
    fn fit(
        &self,
        train: &TrainingSet,
        class_names: &[String],
        input_size: u32,
    ) -> Result<ClassifierModel> {
        if train.is_empty() {
            bail!("No training samples");
        }
        let num_classes = class_names.len();

        let weights = if num_classes <= 1 {
            Weights::Constant { class: 0 }
        } else {
            let dataset = Dataset::new(train.features.clone(), train.targets.clone());
            let fitted = MultiLogisticRegression::<f64>::default()
                .max_iterations(self.max_iterations)
                .fit(&dataset)
                .map_err(|e| anyhow!("Logistic regression failed: {}", e))?;

            // Columns follow sorted class order, i.e. class index, when every
            // class has at least one sample.
            let params = fitted.params().to_owned();
            let intercept = fitted.intercept().to_owned();
            if params.ncols() != num_classes || intercept.len() != num_classes {
                bail!(
                    "Trainer fitted {} classes, expected {} (every label needs training samples)",
                    params.ncols(),
                    num_classes
                );
            }

            Weights::Linear {
                weights: params,
                intercept,
            }
        };

        Ok(ClassifierModel {
            class_names: class_names.to_vec(),
            input_size,
            weights,
        })
    }
}

/// Fraction of `set` the model labels correctly.
pub fn accuracy(model: &ClassifierModel, set: &TrainingSet) -> Result<f64> {
    if set.is_empty() {
        return Ok(0.0);
    }
    let mut correct = 0usize;
    for (row, target) in set.features.rows().into_iter().zip(set.targets.iter()) {
        let features = row.to_vec();
        if model.predict_features(&features)?.class_index == *target {
            correct += 1;
        }
    }
    Ok(correct as f64 / set.len() as f64)
}
