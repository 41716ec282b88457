//! Filesystem dataset store.
//!
//! Images live at `<root>/<label>/<filename>`. Training never walks the
//! directory tree itself; it asks for a [`Catalog`], optionally from a
//! per-run staging copy of a label subset.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// All files under one label directory, sorted by file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub label: String,
    pub files: Vec<PathBuf>,
}

/// `(label, files)` listing of a dataset directory, sorted by label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub entries: Vec<LabelEntry>,
}

impl Catalog {
    pub fn total_images(&self) -> usize {
        self.entries.iter().map(|e| e.files.len()).sum()
    }

    pub fn num_labels(&self) -> usize {
        self.entries.len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.label.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.total_images() == 0
    }
}

/// A private snapshot of some label directories, removed when dropped.
pub struct StagedDataset {
    dir: TempDir,
    catalog: Catalog,
}

impl StagedDataset {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensure the dataset root exists
    pub fn ensure_root(&self) -> Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).context("Failed to create dataset directory")?;
        }
        Ok(())
    }

    /// Write `bytes` to `<root>/<label>/<filename>`, replacing any existing file.
    pub fn save(&self, label: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let label_dir = self.root.join(label);
        fs::create_dir_all(&label_dir)
            .with_context(|| format!("Failed to create label directory {}", label_dir.display()))?;

        let path = label_dir.join(filename);
        fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Catalog the whole store.
    pub fn catalog(&self) -> Result<Catalog> {
        catalog_dir(&self.root)
    }

    /// Copy the requested label directories into a fresh temporary directory
    /// and catalog the copy. Labels with no directory are skipped.
    pub fn stage_labels(&self, labels: &[String]) -> Result<StagedDataset> {
        self.ensure_root()?;
        // Sibling of the root, so cataloging the root never sees a staging copy.
        let parent = match self.root.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let dir = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)
            .context("Failed to create staging directory")?;

        for label in labels {
            let src = self.root.join(label);
            if !src.is_dir() {
                tracing::warn!(label = %label, "Requested label has no dataset directory, skipping");
                continue;
            }
            copy_dir(&src, &dir.path().join(label))?;
        }

        let catalog = catalog_dir(dir.path())?;
        Ok(StagedDataset { dir, catalog })
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1).max_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let target = dst.join(entry.file_name());
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to stage {} into {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

fn catalog_dir(root: &Path) -> Result<Catalog> {
    if !root.exists() {
        return Ok(Catalog::default());
    }

    let mut entries = Vec::new();
    for label_dir in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let label_dir = label_dir?;
        if !label_dir.file_type().is_dir() {
            continue;
        }
        let label = label_dir.file_name().to_string_lossy().to_string();
        if label.starts_with('.') {
            continue;
        }

        let mut files = Vec::new();
        for file in WalkDir::new(label_dir.path())
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let file = file?;
            if file.file_type().is_file() {
                files.push(file.into_path());
            }
        }
        entries.push(LabelEntry { label, files });
    }

    Ok(Catalog { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("train"));

        let first = store.save("cat", "a.jpg", b"one").unwrap();
        let second = store.save("cat", "a.jpg", b"two").unwrap();

        assert_eq!(first, dir.path().join("train").join("cat").join("a.jpg"));
        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), b"two");
    }

    #[test]
    fn test_catalog_lists_labels_and_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("train"));
        store.save("dog", "b.jpg", b"x").unwrap();
        store.save("dog", "a.jpg", b"x").unwrap();
        store.save("cat", "c.jpg", b"x").unwrap();

        let catalog = store.catalog().unwrap();
        assert_eq!(catalog.labels(), vec!["cat", "dog"]);
        assert_eq!(catalog.total_images(), 3);
        let dog_files: Vec<_> = catalog.entries[1]
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(dog_files, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_missing_root_is_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("nope"));
        assert!(store.catalog().unwrap().is_empty());
    }

    #[test]
    fn test_staging_copies_subset_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("train"));
        store.save("cat", "c.jpg", b"x").unwrap();
        store.save("dog", "d.jpg", b"x").unwrap();
        store.save("bird", "b.jpg", b"x").unwrap();

        let staged_path = {
            let staged = store
                .stage_labels(&["cat".to_string(), "dog".to_string(), "fish".to_string()])
                .unwrap();
            assert_eq!(staged.catalog().labels(), vec!["cat", "dog"]);
            assert!(staged.path().join("cat").join("c.jpg").exists());
            staged.path().to_path_buf()
        };

        assert!(!staged_path.exists());
        // The source store is untouched and never catalogs the staging copy.
        assert_eq!(store.catalog().unwrap().labels(), vec!["bird", "cat", "dog"]);
    }

    #[test]
    fn test_concurrent_stagings_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path().join("train"));
        store.save("cat", "c.jpg", b"x").unwrap();

        let a = store.stage_labels(&["cat".to_string()]).unwrap();
        let b = store.stage_labels(&["cat".to_string()]).unwrap();
        assert_ne!(a.path(), b.path());

        drop(a);
        assert!(b.path().join("cat").join("c.jpg").exists());
    }
}
