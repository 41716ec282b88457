use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by CORS. `["*"]` allows any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the labeled working set: `<dataset_dir>/<label>/<filename>`.
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: PathBuf,

    /// Where images submitted for prediction are kept.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Holds the single `latest_model.json` artifact.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_dataset_dir() -> PathBuf {
    PathBuf::from("dataset").join("train")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("model")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data").join("snapclass.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dataset_dir: default_dataset_dir(),
            upload_dir: default_upload_dir(),
            model_dir: default_model_dir(),
            db_path: default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Well-known artifact path. Every successful run overwrites it.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(crate::classifier::ARTIFACT_FILENAME)
    }

    /// Lock file shared by every process training into `model_dir`.
    pub fn training_lock_path(&self) -> PathBuf {
        self.model_dir.join(".training.lock")
    }

    /// Storage rooted under a single directory, used by tests and the offline trainer.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            dataset_dir: root.join("dataset").join("train"),
            upload_dir: root.join("uploads"),
            model_dir: root.join("model"),
            db_path: root.join("snapclass.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Square edge, in pixels, every image is resized to before feature extraction.
    #[serde(default = "default_target_size")]
    pub target_size: u32,

    /// Passes over the training partition; scaled into the solver's iteration budget.
    #[serde(default = "default_epochs")]
    pub epochs: u64,

    /// Fraction of each label folder held out for validation.
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,

    /// Runs with fewer images than this abort before loading anything.
    #[serde(default = "default_min_images")]
    pub min_images: usize,
}

fn default_target_size() -> u32 {
    64
}

fn default_epochs() -> u64 {
    5
}

fn default_validation_split() -> f64 {
    0.2
}

fn default_min_images() -> usize {
    2
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            epochs: default_epochs(),
            validation_split: default_validation_split(),
            min_images: default_min_images(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    3
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling log file when journald is unavailable.
    #[serde(default = "default_log_dir")]
    pub directory: PathBuf,

    #[serde(default = "default_journald")]
    pub journald: bool,
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("snapclass")
        .join("logs")
}

fn default_journald() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
            journald: default_journald(),
        }
    }
}

impl Config {
    /// Load from `$SNAPCLASS_CONFIG` or the default location, writing defaults on first run.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var_os("SNAPCLASS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(Self::config_path);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("snapclass")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [training]
            epochs = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.training.epochs, 12);
        assert_eq!(config.training.target_size, 64);
        assert!((config.training.validation_split - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.matching.top_k, 3);
        assert_eq!(config.storage.dataset_dir, PathBuf::from("dataset/train"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.storage = StorageConfig::rooted_at(dir.path());
        config.matching.top_k = 5;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.matching.top_k, 5);
        assert_eq!(loaded.storage.db_path, dir.path().join("snapclass.db"));
        assert_eq!(
            loaded.storage.model_path(),
            dir.path().join("model").join("latest_model.json")
        );
    }
}
