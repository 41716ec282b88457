//! Background training runs and their shared status.

mod orchestrator;

pub use orchestrator::{Orchestrator, TrainingOutcome};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Why a run stopped early.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Training already in progress")]
    Busy,
    #[error("Not enough images to train: found {found}, need at least {required}")]
    InsufficientData { found: usize, required: usize },
    #[error("No usable {0} images after splitting")]
    EmptyPartition(&'static str),
    #[error("Trainer failed: {0}")]
    Trainer(#[source] anyhow::Error),
    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingPhase {
    Idle,
    Preparing,
    Loading,
    Building,
    Training,
    Saving,
    Migrating,
    Complete,
}

impl TrainingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingPhase::Idle => "idle",
            TrainingPhase::Preparing => "preparing",
            TrainingPhase::Loading => "loading",
            TrainingPhase::Building => "building",
            TrainingPhase::Training => "training",
            TrainingPhase::Saving => "saving",
            TrainingPhase::Migrating => "migrating",
            TrainingPhase::Complete => "complete",
        }
    }
}

/// Point-in-time view returned by `/training-status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub is_training: bool,
    pub progress: TrainingPhase,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            is_training: false,
            progress: TrainingPhase::Idle,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Single-slot training state.
///
/// With a lock file the slot is shared by every process pointing at the
/// same model directory, so the server and `snapclass-train` exclude each
/// other. Without one it only covers the current process.
#[derive(Debug, Default)]
pub struct TrainingStatus {
    state: Mutex<StatusSnapshot>,
    lock_path: Option<PathBuf>,
}

impl TrainingStatus {
    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::default(),
            lock_path: Some(path.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        // A panic mid-run must not wedge the status forever.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    pub fn is_training(&self) -> bool {
        self.lock().is_training
    }

    /// Claim the slot. Returns `None` while another run holds it, in this
    /// process or, through the lock file, in another one.
    pub fn try_acquire(self: &Arc<Self>) -> Option<TrainingGuard> {
        let mut state = self.lock();
        if state.is_training {
            return None;
        }
        if let Some(path) = &self.lock_path {
            if !create_lock_file(path) {
                return None;
            }
        }
        *state = StatusSnapshot {
            is_training: true,
            progress: TrainingPhase::Preparing,
            last_error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        };
        Some(TrainingGuard {
            status: Arc::clone(self),
        })
    }
}

/// Held for the duration of one run; releases the slot on drop.
#[derive(Debug)]
pub struct TrainingGuard {
    status: Arc<TrainingStatus>,
}

impl TrainingGuard {
    pub fn set_phase(&self, phase: TrainingPhase) {
        tracing::info!(phase = phase.as_str(), "Training progress");
        self.status.lock().progress = phase;
    }

    pub fn phase(&self) -> TrainingPhase {
        self.status.lock().progress
    }

    /// Record why the run aborted. The phase reached is kept.
    pub fn fail(&self, reason: &str) {
        self.status.lock().last_error = Some(reason.to_string());
    }
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.status.lock_path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove training lock");
            }
        }
        let mut state = self.status.lock();
        state.is_training = false;
        state.finished_at = Some(Utc::now());
    }
}

/// Exclusively create the lock file, recording the owning pid.
fn create_lock_file(path: &std::path::Path) -> bool {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %e, "Cannot create lock directory");
            return false;
        }
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", std::process::id());
            true
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            tracing::info!(
                path = %path.display(),
                "Training lock held by another process; remove it if no run is active"
            );
            false
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to create training lock");
            false
        }
    }
}
