//! SQLite metadata store.
//!
//! Untrained uploads live in `images`/`labels`; rows consumed by a
//! label-scoped training run are moved into `trained_images`/`trained_labels`.
//! `models` is an append-only history of successful runs.

mod schema;
pub mod images;
pub mod models;
pub mod trained;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub use schema::SCHEMA;
pub use models::{ModelRecord, NewModel};

/// Where an untrained image row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    /// Uploaded with a label; training material.
    Upload,
    /// Submitted to `/predict` and logged with the predicted label.
    Prediction,
}

impl ImageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageOrigin::Upload => "upload",
            ImageOrigin::Prediction => "prediction",
        }
    }
}

/// A file reference as returned by the listing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub filename: String,
    pub filepath: String,
}

/// An image row joined with its label.
#[derive(Debug, Clone)]
pub struct LabeledImage {
    pub id: i64,
    pub filename: String,
    pub filepath: String,
    pub label: String,
}

/// Per-label count with up to three sample filenames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelSummary {
    pub label: String,
    pub count: i64,
    pub sample_files: Vec<String>,
}

pub(crate) const SUMMARY_SAMPLES: usize = 3;

/// Fold `(label, filename)` rows ordered by label into summaries.
pub(crate) fn summarize(rows: Vec<(String, String)>) -> Vec<LabelSummary> {
    let mut summaries: Vec<LabelSummary> = Vec::new();
    for (label, filename) in rows {
        match summaries.last_mut() {
            Some(last) if last.label == label => {
                last.count += 1;
                if last.sample_files.len() < SUMMARY_SAMPLES {
                    last.sample_files.push(filename);
                }
            }
            _ => summaries.push(LabelSummary {
                label,
                count: 1,
                sample_files: vec![filename],
            }),
        }
    }
    summaries
}

/// Parse SQLite's `CURRENT_TIMESTAMP` format ("YYYY-MM-DD HH:MM:SS", UTC).
pub(crate) fn parse_db_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database lock poisoned: {}", e))
    }
}

#[cfg(test)]
pub(crate) fn test_db(dir: &Path) -> Database {
    let db = Database::open(&dir.join("test.db")).unwrap();
    db.initialize().unwrap();
    db
}
