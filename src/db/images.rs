//! Untrained image and label rows.

use anyhow::Result;
use rusqlite::params;

use super::{summarize, Database, ImageOrigin, ImageRef, LabelSummary, LabeledImage};

impl Database {
    /// Insert an image and its label in one transaction, returning the image id.
    pub fn insert_labeled_image(
        &self,
        filename: &str,
        filepath: &str,
        label: &str,
        origin: ImageOrigin,
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO images (filename, filepath, origin) VALUES (?, ?, ?)",
            params![filename, filepath, origin.as_str()],
        )?;
        let image_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO labels (image_id, label) VALUES (?, ?)",
            params![image_id, label],
        )?;

        tx.commit()?;
        Ok(image_id)
    }

    /// Labels attached to an untrained image.
    pub fn get_image_labels(&self, image_id: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT label FROM labels WHERE image_id = ? ORDER BY id")?;
        let labels = stmt
            .query_map([image_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(labels)
    }

    /// Look up an untrained image row by id.
    pub fn get_image(&self, image_id: i64) -> Result<Option<ImageRef>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT filename, filepath FROM images WHERE id = ?",
            [image_id],
            |row| {
                Ok(ImageRef {
                    filename: row.get(0)?,
                    filepath: row.get(1)?,
                })
            },
        );
        match result {
            Ok(image) => Ok(Some(image)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Distinct labels of untrained uploads, alphabetical.
    pub fn get_untrained_labels(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT l.label
            FROM labels l
            JOIN images i ON i.id = l.image_id
            WHERE i.origin = 'upload'
            ORDER BY l.label
            "#,
        )?;
        let labels = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(labels)
    }

    /// Up to `limit` untrained uploads carrying `label`, oldest first.
    pub fn get_sample_images(&self, label: &str, limit: usize) -> Result<Vec<ImageRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT i.filename, i.filepath
            FROM images i
            JOIN labels l ON i.id = l.image_id
            WHERE l.label = ? AND i.origin = 'upload'
            ORDER BY i.id
            LIMIT ?
            "#,
        )?;
        let images = stmt
            .query_map(params![label, limit as i64], |row| {
                Ok(ImageRef {
                    filename: row.get(0)?,
                    filepath: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    /// Per-label counts and sample filenames for the untrained upload set.
    pub fn get_uploaded_summary(&self) -> Result<Vec<LabelSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT l.label, i.filename
            FROM labels l
            JOIN images i ON l.image_id = i.id
            WHERE i.origin = 'upload'
            ORDER BY l.label, i.id
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(summarize(rows))
    }

    /// Untrained uploads whose label is one of `labels`.
    pub fn get_untrained_images_for_labels(&self, labels: &[String]) -> Result<Vec<LabeledImage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT i.id, i.filename, i.filepath, l.label
            FROM images i
            JOIN labels l ON i.id = l.image_id
            WHERE l.label = ? AND i.origin = 'upload'
            ORDER BY i.id
            "#,
        )?;

        let mut images = Vec::new();
        for label in labels {
            let rows = stmt
                .query_map([label], |row| {
                    Ok(LabeledImage {
                        id: row.get(0)?,
                        filename: row.get(1)?,
                        filepath: row.get(2)?,
                        label: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            images.extend(rows);
        }
        Ok(images)
    }

    pub fn count_untrained_images(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM images WHERE origin = 'upload'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
