//! One training run, from dataset catalog to hot-swapped model.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::{TrainingError, TrainingGuard, TrainingPhase, TrainingStatus};
use crate::classifier::{self, features, LogisticTrainer, Trainer, TrainingSet};
use crate::config::{StorageConfig, TrainingConfig};
use crate::dataset::{Catalog, DatasetStore};
use crate::db::{Database, NewModel};
use crate::prediction::Predictor;

/// Name recorded on every model row. The artifact path is shared by all runs.
const MODEL_NAME: &str = "latest_model";

#[derive(Debug, Clone, Serialize)]
pub struct TrainingOutcome {
    pub model_id: i64,
    pub labels: Vec<String>,
    pub num_images: usize,
    pub validation_accuracy: f64,
    /// Images moved into the trained set (label-scoped runs only).
    pub migrated: usize,
}

pub struct Orchestrator {
    db: Arc<Database>,
    store: DatasetStore,
    storage: StorageConfig,
    training: TrainingConfig,
    predictor: Arc<Predictor>,
    trainer: Arc<dyn Trainer>,
    status: Arc<TrainingStatus>,
}

/// Per-label train/validation files.
struct LabelSplit<'a> {
    label: &'a str,
    train: &'a [PathBuf],
    validation: &'a [PathBuf],
}

/// Extracted features ready for fitting.
struct LoadedData {
    class_names: Vec<String>,
    train: TrainingSet,
    validation: TrainingSet,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        storage: StorageConfig,
        training: TrainingConfig,
        predictor: Arc<Predictor>,
        status: Arc<TrainingStatus>,
    ) -> Self {
        Self {
            db,
            store: DatasetStore::new(storage.dataset_dir.clone()),
            trainer: Arc::new(LogisticTrainer::from_epochs(training.epochs)),
            storage,
            training,
            predictor,
            status,
        }
    }

    pub fn with_trainer(mut self, trainer: Arc<dyn Trainer>) -> Self {
        self.trainer = trainer;
        self
    }

    pub fn status(&self) -> &Arc<TrainingStatus> {
        &self.status
    }

    /// Run on the current thread. `labels` restricts the run to those label
    /// directories and migrates them afterwards.
    pub fn run(&self, labels: Option<Vec<String>>) -> Result<TrainingOutcome, TrainingError> {
        let guard = self.status.try_acquire().ok_or(TrainingError::Busy)?;
        self.run_guarded(&guard, labels)
    }

    /// Claim the training slot now and run on the blocking pool.
    /// Returns `Busy` immediately when another run holds the slot.
    pub fn start(
        self: &Arc<Self>,
        labels: Option<Vec<String>>,
    ) -> Result<JoinHandle<Option<TrainingOutcome>>, TrainingError> {
        let guard = self.status.try_acquire().ok_or(TrainingError::Busy)?;
        let this = Arc::clone(self);
        Ok(tokio::task::spawn_blocking(move || {
            this.run_guarded(&guard, labels).ok()
        }))
    }

    fn run_guarded(
        &self,
        guard: &TrainingGuard,
        labels: Option<Vec<String>>,
    ) -> Result<TrainingOutcome, TrainingError> {
        let result = self.execute(guard, labels);
        match &result {
            Ok(outcome) => tracing::info!(
                model_id = outcome.model_id,
                classes = outcome.labels.len(),
                images = outcome.num_images,
                validation_accuracy = outcome.validation_accuracy,
                migrated = outcome.migrated,
                "Training complete"
            ),
            Err(e @ (TrainingError::Storage(_) | TrainingError::Trainer(_))) => {
                tracing::error!(phase = guard.phase().as_str(), error = %e, "Training aborted");
                guard.fail(&e.to_string());
            }
            Err(e) => {
                tracing::warn!(phase = guard.phase().as_str(), error = %e, "Training aborted");
                guard.fail(&e.to_string());
            }
        }
        result
    }

    fn execute(
        &self,
        guard: &TrainingGuard,
        labels: Option<Vec<String>>,
    ) -> Result<TrainingOutcome, TrainingError> {
        guard.set_phase(TrainingPhase::Preparing);

        // The staging copy lives until this function returns.
        let staged = match &labels {
            Some(labels) => Some(
                self.store
                    .stage_labels(labels)
                    .map_err(TrainingError::Storage)?,
            ),
            None => None,
        };
        let catalog = match &staged {
            Some(staged) => staged.catalog().clone(),
            None => self.store.catalog().map_err(TrainingError::Storage)?,
        };

        let found = catalog.total_images();
        tracing::info!(labels = catalog.num_labels(), images = found, "Dataset cataloged");
        if found < self.training.min_images {
            return Err(TrainingError::InsufficientData {
                found,
                required: self.training.min_images,
            });
        }

        guard.set_phase(TrainingPhase::Loading);
        let data = self.load(&catalog)?;

        guard.set_phase(TrainingPhase::Building);
        tracing::info!(
            classes = data.class_names.len(),
            train = data.train.len(),
            validation = data.validation.len(),
            "Building classifier"
        );

        guard.set_phase(TrainingPhase::Training);
        let model = self
            .trainer
            .fit(&data.train, &data.class_names, self.training.target_size)
            .map_err(TrainingError::Trainer)?;
        let validation_accuracy =
            classifier::accuracy(&model, &data.validation).map_err(TrainingError::Trainer)?;
        tracing::info!(validation_accuracy, "Validation finished");

        guard.set_phase(TrainingPhase::Saving);
        let path = self.storage.model_path();
        let sha = model.save(&path).map_err(TrainingError::Storage)?;
        let filepath = path.to_string_lossy();
        let num_images = data.train.len() + data.validation.len();
        let model_id = self
            .db
            .insert_model(&NewModel {
                name: MODEL_NAME,
                filepath: &filepath,
                artifact_sha256: &sha,
                num_classes: data.class_names.len(),
                num_images,
                validation_accuracy: Some(validation_accuracy),
            })
            .map_err(TrainingError::Storage)?;

        // Uploads that landed after cataloging were never read by this run.
        // They are neither linked nor migrated and wait for the next one.
        let seen = cataloged_files(&catalog);
        let mut contributing: HashMap<String, Vec<i64>> = HashMap::new();
        for image in self
            .db
            .get_untrained_images_for_labels(&data.class_names)
            .map_err(TrainingError::Storage)?
        {
            let key = (image.label, image.filename);
            if seen.contains(&key) {
                contributing.entry(key.0).or_default().push(image.id);
            } else {
                tracing::debug!(image_id = image.id, label = %key.0, "Skipping upload newer than the run");
            }
        }
        let linked: Vec<i64> = data
            .class_names
            .iter()
            .filter_map(|label| contributing.get(label))
            .flatten()
            .copied()
            .collect();
        self.db
            .link_model_images(model_id, &linked)
            .map_err(TrainingError::Storage)?;

        let mut migrated = 0;
        if labels.is_some() {
            guard.set_phase(TrainingPhase::Migrating);
            for label in &data.class_names {
                let ids = contributing.get(label).map(Vec::as_slice).unwrap_or(&[]);
                match self.db.move_images(label, ids, model_id) {
                    Ok(moved) => {
                        tracing::info!(label = %label, moved, model_id, "Migrated label");
                        migrated += moved;
                    }
                    Err(e) => {
                        tracing::error!(label = %label, error = %e, "Migration failed, label left untrained");
                    }
                }
            }
        }

        self.predictor.replace(model);
        guard.set_phase(TrainingPhase::Complete);

        Ok(TrainingOutcome {
            model_id,
            labels: data.class_names,
            num_images,
            validation_accuracy,
            migrated,
        })
    }

    /// Split each label, decode its files and assign class indexes.
    fn load(&self, catalog: &Catalog) -> Result<LoadedData, TrainingError> {
        let size = self.training.target_size;
        let mut class_names = Vec::new();
        let mut train_rows = Vec::new();
        let mut validation_rows = Vec::new();

        for split in split_catalog(catalog, self.training.validation_split) {
            let train = extract_all(split.train, size);
            if train.is_empty() {
                tracing::warn!(label = split.label, "No decodable training images, dropping label");
                continue;
            }
            let validation = extract_all(split.validation, size);

            let class = class_names.len();
            class_names.push(split.label.to_string());
            train_rows.extend(train.into_iter().map(|f| (f, class)));
            validation_rows.extend(validation.into_iter().map(|f| (f, class)));
        }

        if train_rows.is_empty() {
            return Err(TrainingError::EmptyPartition("training"));
        }
        if validation_rows.is_empty() {
            return Err(TrainingError::EmptyPartition("validation"));
        }

        Ok(LoadedData {
            class_names,
            train: TrainingSet::from_rows(train_rows).map_err(TrainingError::Trainer)?,
            validation: TrainingSet::from_rows(validation_rows).map_err(TrainingError::Trainer)?,
        })
    }
}

/// For each label with `n` name-sorted files, the first `floor(n * split)`
/// are validation and the rest training.
/// `(label, filename)` of every file the run cataloged.
fn cataloged_files(catalog: &Catalog) -> HashSet<(String, String)> {
    catalog
        .entries
        .iter()
        .flat_map(|entry| {
            entry.files.iter().filter_map(move |file| {
                let name = file.file_name()?.to_string_lossy().to_string();
                Some((entry.label.clone(), name))
            })
        })
        .collect()
}

fn split_catalog(catalog: &Catalog, split: f64) -> Vec<LabelSplit<'_>> {
    let split = split.clamp(0.0, 1.0);
    catalog
        .entries
        .iter()
        .map(|entry| {
            let n = entry.files.len();
            let cut = ((n as f64 * split).floor() as usize).min(n);
            LabelSplit {
                label: &entry.label,
                train: &entry.files[cut..],
                validation: &entry.files[..cut],
            }
        })
        .collect()
}

fn extract_all(files: &[PathBuf], size: u32) -> Vec<Vec<f64>> {
    files
        .par_iter()
        .filter_map(|path| match features::extract_file(path, size) {
            Ok(features) => Some(features),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping undecodable image");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifierModel;
    use crate::dataset::LabelEntry;
    use crate::db::test_db;
    use crate::upload;
    use anyhow::bail;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::Path;

    fn png(color: [u8; 3]) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb(color)));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        store: DatasetStore,
        storage: StorageConfig,
        predictor: Arc<Predictor>,
        orchestrator: Arc<Orchestrator>,
    }

    fn fixture_with(training: TrainingConfig, trainer: Option<Arc<dyn Trainer>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::rooted_at(dir.path());
        let db = Arc::new(test_db(dir.path()));
        let predictor = Arc::new(Predictor::new(ClassifierModel::untrained(
            training.target_size,
        )));
        let mut orchestrator = Orchestrator::new(
            Arc::clone(&db),
            storage.clone(),
            training,
            Arc::clone(&predictor),
            Arc::new(TrainingStatus::with_lock_file(storage.training_lock_path())),
        );
        if let Some(trainer) = trainer {
            orchestrator = orchestrator.with_trainer(trainer);
        }
        Fixture {
            store: DatasetStore::new(storage.dataset_dir.clone()),
            _dir: dir,
            db,
            storage,
            predictor,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            TrainingConfig {
                target_size: 4,
                ..TrainingConfig::default()
            },
            None,
        )
    }

    fn seed(f: &Fixture, label: &str, count: usize, color: fn(u8) -> [u8; 3]) {
        for i in 0..count {
            let bytes = png(color(200 + (i as u8) * 10));
            upload::upload(&f.db, &f.store, &bytes, &format!("{label}{i}.png"), Some(label))
                .unwrap();
        }
    }

    fn red(v: u8) -> [u8; 3] {
        [v, 10, 10]
    }

    fn blue(v: u8) -> [u8; 3] {
        [10, 10, v]
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_insufficient_data_creates_no_model() {
        let f = fixture();
        seed(&f, "cat", 1, red);

        let err = f.orchestrator.run(None).unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientData { found: 1, required: 2 }));

        assert_eq!(f.db.count_models().unwrap(), 0);
        let status = f.orchestrator.status().snapshot();
        assert!(!status.is_training);
        assert_eq!(status.progress, TrainingPhase::Preparing);
        assert!(status.last_error.unwrap().contains("Not enough images"));
    }

    #[test]
    fn test_scoped_run_migrates_requested_labels() {
        let f = fixture();
        seed(&f, "cat", 5, red);
        seed(&f, "dog", 5, blue);
        seed(&f, "bird", 2, red);

        let outcome = f
            .orchestrator
            .run(Some(vec!["cat".to_string(), "dog".to_string()]))
            .unwrap();

        assert_eq!(outcome.labels, vec!["cat", "dog"]);
        assert_eq!(outcome.num_images, 10);
        assert_eq!(outcome.migrated, 10);

        assert_eq!(f.db.get_untrained_labels().unwrap(), vec!["bird"]);
        assert_eq!(f.db.get_trained_images("cat").unwrap().len(), 5);
        assert_eq!(f.db.get_trained_images("dog").unwrap().len(), 5);
        assert_eq!(f.db.get_model_image_ids(outcome.model_id).unwrap().len(), 10);

        let model = f.predictor.current();
        assert!(model.is_trained());
        assert_eq!(model.class_names, vec!["cat", "dog"]);
        assert_eq!(f.orchestrator.status().snapshot().progress, TrainingPhase::Complete);

        // The staging copy is gone and the dataset itself is untouched.
        let parent = f.storage.dataset_dir.parent().unwrap();
        let leftovers = std::fs::read_dir(parent)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(files_in(&f.storage.dataset_dir.join("cat")), 5);
    }

    #[test]
    fn test_full_runs_share_one_artifact() {
        let f = fixture();
        seed(&f, "cat", 5, red);
        seed(&f, "dog", 5, blue);

        let first = f.orchestrator.run(None).unwrap();
        let second = f.orchestrator.run(None).unwrap();

        assert_ne!(first.model_id, second.model_id);
        assert_eq!(first.migrated, 0);
        assert_eq!(f.db.count_models().unwrap(), 2);
        assert_eq!(files_in(&f.storage.model_dir), 1);
        // Full runs leave the untrained set in place.
        assert_eq!(f.db.count_untrained_images().unwrap(), 10);

        let latest = f.db.get_latest_model().unwrap().unwrap();
        assert_eq!(
            latest.artifact_sha256.unwrap(),
            classifier::file_sha256(&f.storage.model_path()).unwrap()
        );
    }

    #[test]
    fn test_second_trigger_is_busy() {
        let f = fixture();
        seed(&f, "cat", 5, red);

        let _held = f.orchestrator.status().try_acquire().unwrap();
        assert!(matches!(f.orchestrator.run(None), Err(TrainingError::Busy)));
        assert!(matches!(f.orchestrator.start(None), Err(TrainingError::Busy)));
        assert_eq!(f.db.count_models().unwrap(), 0);
    }

    /// A second process over the same storage, with its own status.
    fn offline_orchestrator(f: &Fixture) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&f.db),
            f.storage.clone(),
            TrainingConfig {
                target_size: 4,
                ..TrainingConfig::default()
            },
            Arc::new(Predictor::new(ClassifierModel::untrained(4))),
            Arc::new(TrainingStatus::with_lock_file(f.storage.training_lock_path())),
        )
    }

    #[test]
    fn test_offline_run_is_busy_while_server_trains() {
        let f = fixture();
        seed(&f, "cat", 5, red);
        seed(&f, "dog", 5, blue);
        let offline = offline_orchestrator(&f);
        let scope = || Some(vec!["cat".to_string(), "dog".to_string()]);

        let held = f.orchestrator.status().try_acquire().unwrap();
        assert!(matches!(offline.run(scope()), Err(TrainingError::Busy)));
        assert!(!offline.status().is_training());
        assert_eq!(f.db.count_models().unwrap(), 0);
        assert_eq!(f.db.count_untrained_images().unwrap(), 10);
        assert!(!f.storage.model_path().exists());

        drop(held);
        let outcome = offline.run(scope()).unwrap();
        assert_eq!(outcome.migrated, 10);

        // And the other way round: the server waits for the offline run.
        let held = offline.status().try_acquire().unwrap();
        assert!(matches!(f.orchestrator.run(None), Err(TrainingError::Busy)));
        drop(held);
        assert!(!f.storage.training_lock_path().exists());
    }

    /// Uploads one more `cat` image while the model is being fitted.
    struct LateUploadTrainer {
        db: Arc<Database>,
        store: DatasetStore,
    }

    impl Trainer for LateUploadTrainer {
        fn fit(
            &self,
            set: &TrainingSet,
            class_names: &[String],
            target_size: u32,
        ) -> anyhow::Result<ClassifierModel> {
            upload::upload(&self.db, &self.store, &png(red(90)), "late.png", Some("cat"))?;
            LogisticTrainer::default().fit(set, class_names, target_size)
        }
    }

    #[test]
    fn test_upload_during_run_waits_for_next_run() {
        let f = fixture();
        seed(&f, "cat", 5, red);
        seed(&f, "dog", 5, blue);
        let orchestrator = offline_orchestrator(&f).with_trainer(Arc::new(LateUploadTrainer {
            db: Arc::clone(&f.db),
            store: f.store.clone(),
        }));

        let outcome = orchestrator
            .run(Some(vec!["cat".to_string(), "dog".to_string()]))
            .unwrap();

        assert_eq!(outcome.num_images, 10);
        assert_eq!(outcome.migrated, 10);
        assert_eq!(f.db.get_model_image_ids(outcome.model_id).unwrap().len(), 10);
        assert_eq!(f.db.get_trained_images("cat").unwrap().len(), 5);

        let pending = f.db.get_sample_images("cat", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].filename, "late.png");
    }

    #[test]
    fn test_empty_validation_partition_aborts() {
        let f = fixture_with(
            TrainingConfig {
                target_size: 4,
                validation_split: 0.0,
                ..TrainingConfig::default()
            },
            None,
        );
        seed(&f, "cat", 3, red);

        let err = f.orchestrator.run(None).unwrap_err();
        assert!(matches!(err, TrainingError::EmptyPartition("validation")));
        assert_eq!(f.orchestrator.status().snapshot().progress, TrainingPhase::Loading);
    }

    #[test]
    fn test_undecodable_files_are_skipped() {
        let f = fixture();
        seed(&f, "cat", 5, red);
        seed(&f, "dog", 5, blue);
        f.store.save("cat", "zz-broken.png", b"not a png").unwrap();

        let outcome = f.orchestrator.run(None).unwrap();
        assert_eq!(outcome.num_images, 10);
    }

    struct FailingTrainer;

    impl Trainer for FailingTrainer {
        fn fit(&self, _: &TrainingSet, _: &[String], _: u32) -> anyhow::Result<ClassifierModel> {
            bail!("out of memory")
        }
    }

    #[test]
    fn test_trainer_failure_releases_guard() {
        let f = fixture_with(
            TrainingConfig {
                target_size: 4,
                ..TrainingConfig::default()
            },
            Some(Arc::new(FailingTrainer)),
        );
        seed(&f, "cat", 5, red);
        seed(&f, "dog", 5, blue);

        assert!(matches!(f.orchestrator.run(None), Err(TrainingError::Trainer(_))));

        let status = f.orchestrator.status().snapshot();
        assert!(!status.is_training);
        assert_eq!(status.progress, TrainingPhase::Training);
        assert!(status.last_error.unwrap().contains("out of memory"));
        assert_eq!(f.db.count_models().unwrap(), 0);
        assert!(!f.storage.model_path().exists());
        assert!(!f.predictor.current().is_trained());
    }

    #[tokio::test]
    async fn test_start_runs_in_background() {
        let f = fixture();
        seed(&f, "cat", 5, red);
        seed(&f, "dog", 5, blue);

        let handle = f.orchestrator.start(None).unwrap();
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(outcome.labels.len(), 2);
        assert!(!f.orchestrator.status().is_training());
    }

    #[test]
    fn test_split_takes_first_files_for_validation() {
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("{i}.png"))).collect();
        let catalog = Catalog {
            entries: vec![LabelEntry {
                label: "cat".to_string(),
                files,
            }],
        };

        let splits = split_catalog(&catalog, 0.2);
        assert_eq!(splits[0].validation, &[PathBuf::from("0.png")]);
        assert_eq!(splits[0].train.len(), 4);
    }
}
