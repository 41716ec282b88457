//! Model history and image provenance links.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{parse_db_timestamp, Database};

/// A completed training run.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRecord {
    pub id: i64,
    pub name: String,
    pub filepath: String,
    pub trained_at: Option<DateTime<Utc>>,
    pub artifact_sha256: Option<String>,
    pub num_classes: i64,
    pub num_images: i64,
    pub validation_accuracy: Option<f64>,
}

/// Fields recorded when a run finishes.
#[derive(Debug, Clone)]
pub struct NewModel<'a> {
    pub name: &'a str,
    pub filepath: &'a str,
    pub artifact_sha256: &'a str,
    pub num_classes: usize,
    pub num_images: usize,
    pub validation_accuracy: Option<f64>,
}

const MODEL_COLUMNS: &str = "id, name, filepath, trained_at, artifact_sha256, num_classes, num_images, validation_accuracy";

fn row_to_model(row: &rusqlite::Row) -> rusqlite::Result<ModelRecord> {
    let trained_at: Option<String> = row.get(3)?;
    Ok(ModelRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        filepath: row.get(2)?,
        trained_at: trained_at.as_deref().and_then(parse_db_timestamp),
        artifact_sha256: row.get(4)?,
        num_classes: row.get(5)?,
        num_images: row.get(6)?,
        validation_accuracy: row.get(7)?,
    })
}

impl Database {
    pub fn insert_model(&self, model: &NewModel<'_>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO models (name, filepath, artifact_sha256, num_classes, num_images, validation_accuracy)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                model.name,
                model.filepath,
                model.artifact_sha256,
                model.num_classes as i64,
                model.num_images as i64,
                model.validation_accuracy,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record which untrained images a model consumed.
    pub fn link_model_images(&self, model_id: i64, image_ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut linked = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO model_images (model_id, image_id) VALUES (?, ?)",
            )?;
            for image_id in image_ids {
                linked += stmt.execute(params![model_id, image_id])?;
            }
        }
        tx.commit()?;
        Ok(linked)
    }

    #[cfg(test)]
    pub fn get_model_image_ids(&self, model_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT image_id FROM model_images WHERE model_id = ? ORDER BY image_id")?;
        let ids = stmt
            .query_map([model_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// All models, newest first.
    pub fn get_models(&self) -> Result<Vec<ModelRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODEL_COLUMNS} FROM models ORDER BY id DESC"
        ))?;
        let models = stmt
            .query_map([], row_to_model)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(models)
    }

    pub fn get_model(&self, model_id: i64) -> Result<Option<ModelRecord>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = ?"),
            [model_id],
            row_to_model,
        );
        match result {
            Ok(model) => Ok(Some(model)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_latest_model(&self) -> Result<Option<ModelRecord>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("SELECT {MODEL_COLUMNS} FROM models ORDER BY id DESC LIMIT 1"),
            [],
            row_to_model,
        );
        match result {
            Ok(model) => Ok(Some(model)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn count_models(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))?;
        Ok(count)
    }
}
