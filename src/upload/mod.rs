//! Labeled image intake.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

use crate::dataset::DatasetStore;
use crate::db::{Database, ImageOrigin};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("Invalid label: {0:?}")]
    InvalidLabel(String),
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("Uploaded file is empty")]
    EmptyFile,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub image_id: i64,
    pub filename: String,
    pub label: String,
    pub filepath: String,
}

/// Reduce a client-supplied name to its final path component.
pub fn sanitize_filename(filename: &str) -> Result<String, UploadError> {
    // Treat both separators as separators regardless of platform.
    let last = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let name = Path::new(last)
        .file_name()
        .map(|n| n.to_string_lossy().trim().to_string())
        .unwrap_or_default();

    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::InvalidFilename(filename.to_string()));
    }
    Ok(name)
}

/// Labels become directory names, so they must be a single plain component.
/// Dot-prefixed names are rejected too: the dataset catalog skips hidden
/// directories, so such a label could never be trained.
pub fn validate_label(label: &str) -> Result<String, UploadError> {
    let label = label.trim();
    if label.is_empty()
        || label.starts_with('.')
        || label.contains('/')
        || label.contains('\\')
        || label.contains('\0')
    {
        return Err(UploadError::InvalidLabel(label.to_string()));
    }
    Ok(label.to_string())
}

/// Label implied by a filename: its stem (`cat1.jpg` → `cat1`).
pub fn derive_label(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string())
}

/// Store `bytes` under `<dataset>/<label>/<filename>` and record it.
/// A blank or missing label falls back to the filename stem.
pub fn upload(
    db: &Database,
    store: &DatasetStore,
    bytes: &[u8],
    filename: &str,
    label: Option<&str>,
) -> Result<UploadResult> {
    if bytes.is_empty() {
        return Err(UploadError::EmptyFile.into());
    }
    let filename = sanitize_filename(filename)?;
    let label = match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => validate_label(label)?,
        None => validate_label(&derive_label(&filename))?,
    };

    let path = store.save(&label, &filename, bytes)?;
    let filepath = path.to_string_lossy().to_string();
    let image_id = db.insert_labeled_image(&filename, &filepath, &label, ImageOrigin::Upload)?;

    tracing::info!(image_id, label = %label, filename = %filename, "Stored upload");

    Ok(UploadResult {
        image_id,
        filename,
        label,
        filepath,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_upload_with_label() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path());
        let store = DatasetStore::new(dir.path().join("train"));

        let result = upload(&db, &store, b"jpeg", "whiskers.jpg", Some("cat")).unwrap();

        let expected = dir.path().join("train").join("cat").join("whiskers.jpg");
        assert!(expected.exists());
        assert_eq!(result.label, "cat");
        assert_eq!(db.get_image_labels(result.image_id).unwrap(), vec!["cat"]);
    }

    #[test]
    fn test_upload_without_label_uses_stem() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path());
        let store = DatasetStore::new(dir.path().join("train"));

        let result = upload(&db, &store, b"jpeg", "cat1.jpg", None).unwrap();
        assert_eq!(result.label, "cat1");
        assert!(dir.path().join("train/cat1/cat1.jpg").exists());

        let blank = upload(&db, &store, b"jpeg", "dog2.png", Some("  ")).unwrap();
        assert_eq!(blank.label, "dog2");
    }

    #[test]
    fn test_upload_cannot_escape_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path());
        let store = DatasetStore::new(dir.path().join("train"));

        let result = upload(&db, &store, b"x", "../../etc/evil.jpg", Some("cat")).unwrap();
        assert_eq!(result.filename, "evil.jpg");
        assert!(dir.path().join("train/cat/evil.jpg").exists());

        for bad in ["..", "a/b", "a\\b", "."] {
            let err = upload(&db, &store, b"x", "a.jpg", Some(bad)).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<UploadError>(),
                Some(UploadError::InvalidLabel(_))
            ));
        }
    }

    #[test]
    fn test_hidden_labels_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path());
        let store = DatasetStore::new(dir.path().join("train"));

        let err = upload(&db, &store, b"x", "a.jpg", Some(".cats")).unwrap_err();
        assert_eq!(
            err.downcast_ref::<UploadError>(),
            Some(&UploadError::InvalidLabel(".cats".to_string()))
        );

        // The stem of a dotfile is hidden as well.
        let err = upload(&db, &store, b"x", ".hidden.png", None).unwrap_err();
        assert_eq!(
            err.downcast_ref::<UploadError>(),
            Some(&UploadError::InvalidLabel(".hidden".to_string()))
        );

        assert_eq!(db.count_untrained_images().unwrap(), 0);
        assert!(!dir.path().join("train/.cats").exists());

        // A dotfile under a plain label is still catalogued.
        upload(&db, &store, b"x", ".hidden.png", Some("cat")).unwrap();
        assert_eq!(store.catalog().unwrap().total_images(), 1);
        assert_eq!(validate_label(" cat.v2 ").unwrap(), "cat.v2");
    }

    #[test]
    fn test_empty_body_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path());
        let store = DatasetStore::new(dir.path().join("train"));

        let err = upload(&db, &store, b"", "a.jpg", Some("cat")).unwrap_err();
        assert_eq!(err.downcast_ref::<UploadError>(), Some(&UploadError::EmptyFile));
        assert_eq!(db.count_untrained_images().unwrap(), 0);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("C:\\photos\\cat.jpg").unwrap(), "cat.jpg");
        assert_eq!(sanitize_filename("dir/dog.png").unwrap(), "dog.png");
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("foo/..").is_err());
    }
}
