//! Trained image set and the untrained → trained migration.

use anyhow::{Context, Result};
use rusqlite::params;

use super::{summarize, Database, ImageRef, LabelSummary};

/// A trained image joined with its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainedImage {
    pub id: i64,
    pub filename: String,
    pub filepath: String,
    pub label: String,
    pub model_id: Option<i64>,
}

fn row_to_trained_image(row: &rusqlite::Row) -> rusqlite::Result<TrainedImage> {
    Ok(TrainedImage {
        id: row.get(0)?,
        filename: row.get(1)?,
        filepath: row.get(2)?,
        label: row.get(3)?,
        model_id: row.get(4)?,
    })
}

impl Database {
    /// Move the given untrained uploads of `label` into the trained tables.
    ///
    /// Runs in a single transaction: either all listed rows move or, on
    /// error, the transaction rolls back and nothing changes. Ids that are
    /// gone, carry another label or came from `/predict` are skipped.
    /// Returns the number of images moved.
    pub fn move_images(&self, label: &str, image_ids: &[i64], model_id: i64) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut moved = 0;
        for image_id in image_ids {
            let row = tx.query_row(
                r#"
                SELECT i.filename, i.filepath
                FROM images i
                JOIN labels l ON i.id = l.image_id
                WHERE i.id = ? AND l.label = ? AND i.origin = 'upload'
                "#,
                params![image_id, label],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            );
            let (filename, filepath) = match row {
                Ok(row) => row,
                Err(rusqlite::Error::QueryReturnedNoRows) => continue,
                Err(e) => return Err(e.into()),
            };

            tx.execute(
                "INSERT INTO trained_images (filename, filepath, model_id) VALUES (?, ?, ?)",
                params![filename, filepath, model_id],
            )
            .with_context(|| format!("Failed to copy image {} into trained set", image_id))?;
            let trained_image_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO trained_labels (trained_image_id, label) VALUES (?, ?)",
                params![trained_image_id, label],
            )?;
            tx.execute("DELETE FROM labels WHERE image_id = ?", [image_id])?;
            tx.execute("DELETE FROM images WHERE id = ?", [image_id])?;
            moved += 1;
        }

        tx.commit()?;
        Ok(moved)
    }

    /// Trained images for `label` in insertion order.
    pub fn get_trained_images(&self, label: &str) -> Result<Vec<TrainedImage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT ti.id, ti.filename, ti.filepath, tl.label, ti.model_id
            FROM trained_images ti
            JOIN trained_labels tl ON ti.id = tl.trained_image_id
            WHERE tl.label = ?
            ORDER BY ti.id
            "#,
        )?;
        let images = stmt
            .query_map([label], row_to_trained_image)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    /// Up to `limit` trained images from any label.
    pub fn get_any_trained_images(&self, limit: usize) -> Result<Vec<TrainedImage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT ti.id, ti.filename, ti.filepath, tl.label, ti.model_id
            FROM trained_images ti
            JOIN trained_labels tl ON ti.id = tl.trained_image_id
            ORDER BY ti.id
            LIMIT ?
            "#,
        )?;
        let images = stmt
            .query_map([limit as i64], row_to_trained_image)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    pub fn get_trained_image_refs(&self, label: &str) -> Result<Vec<ImageRef>> {
        Ok(self
            .get_trained_images(label)?
            .into_iter()
            .map(|image| ImageRef {
                filename: image.filename,
                filepath: image.filepath,
            })
            .collect())
    }

    /// Per-label counts and sample filenames for the trained set.
    pub fn get_training_summary(&self) -> Result<Vec<LabelSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tl.label, ti.filename
            FROM trained_labels tl
            JOIN trained_images ti ON tl.trained_image_id = ti.id
            ORDER BY tl.label, ti.id
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(summarize(rows))
    }

    pub fn count_trained_images(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM trained_images", [], |row| row.get(0))?;
        Ok(count)
    }
}
