//! Dataset persistence with file locking.
//!
//! The `Store` trait is the repository seam: the engine is constructed
//! with a store instead of reaching for a hidden data directory. The
//! whole dataset persists as one JSON document so a commit is a single
//! atomic rename covering every collection at once.

use crate::types::Dataset;
use crate::{Error, Result};
use fs2::FileExt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Repository seam for the whole dataset
///
/// `commit` must persist the full dataset atomically: a failed commit
/// leaves the previously stored dataset intact.
pub trait Store {
    fn load(&self) -> Result<Dataset>;
    fn commit(&self, dataset: &Dataset) -> Result<()>;
}

/// JSON-file-backed store (`dataset.json` in the data directory)
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store rooted at the given data directory
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("dataset.json"),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Store for JsonStore {
    /// Load the dataset with shared locking
    ///
    /// Returns the default (empty) dataset if the file doesn't exist.
    /// A corrupt file is an error: business data is never silently
    /// replaced with defaults.
    fn load(&self) -> Result<Dataset> {
        if !self.path.exists() {
            tracing::info!("No dataset file found, starting empty");
            return Ok(Dataset::default());
        }

        let file = File::open(&self.path)?;
        file.lock_shared()?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        let read_result = reader.read_to_string(&mut contents);
        file.unlock()?;
        read_result?;

        let dataset: Dataset = serde_json::from_str(&contents).map_err(|e| {
            Error::State(format!(
                "Dataset file {:?} is corrupt: {}",
                self.path, e
            ))
        })?;

        tracing::debug!("Loaded dataset from {:?}", self.path);
        Ok(dataset)
    }

    /// Commit the dataset with exclusive locking
    ///
    /// Atomically writes by:
    /// 1. Writing to a temp file in the same directory
    /// 2. Syncing to disk
    /// 3. Renaming over the original
    fn commit(&self, dataset: &Dataset) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = NamedTempFile::new_in(self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "dataset path missing parent")
        })?)?;

        // Exclusive lock on the temp file serializes concurrent writers
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(dataset)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        // Atomically replace the old dataset file
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Committed dataset to {:?}", self.path);
        Ok(())
    }
}

/// In-memory store for tests
#[derive(Default)]
pub struct MemStore {
    dataset: Mutex<Dataset>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(dataset: Dataset) -> Self {
        Self {
            dataset: Mutex::new(dataset),
        }
    }
}

impl Store for MemStore {
    fn load(&self) -> Result<Dataset> {
        Ok(self
            .dataset
            .lock()
            .map_err(|_| Error::State("MemStore lock poisoned".into()))?
            .clone())
    }

    fn commit(&self, dataset: &Dataset) -> Result<()> {
        *self
            .dataset
            .lock()
            .map_err(|_| Error::State("MemStore lock poisoned".into()))? = dataset.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Patient, Vial};
    use chrono::Utc;
    use uuid::Uuid;

    fn dataset_with_one_patient() -> Dataset {
        let mut dataset = Dataset::default();
        dataset.patients.push(Patient {
            id: Uuid::new_v4(),
            name: "Maria".into(),
            phone: Some("11 99999-0000".into()),
            birth_date: None,
            height_cm: Some(165.0),
            weight_kg: Some(70.0),
            treatment_start: Some(Utc::now()),
            default_dose_mg: 5.0,
            default_price: 220.0,
            doses: vec![],
            evolutions: vec![],
            points: 0,
            point_history: vec![],
            referred_by: None,
            created_at: Utc::now(),
        });
        dataset.vials.push(Vial {
            id: Uuid::new_v4(),
            purchase_date: Utc::now(),
            total_mg: 100.0,
            cost: 2500.0,
            remaining_mg: 100.0,
            sold_mg: 0.0,
        });
        dataset
    }

    #[test]
    fn test_commit_and_load_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(temp_dir.path());

        let dataset = dataset_with_one_patient();
        store.commit(&dataset).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.patients.len(), 1);
        assert_eq!(loaded.patients[0].name, "Maria");
        assert_eq!(loaded.vials.len(), 1);
        assert_eq!(loaded.vials[0].total_mg, 100.0);
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(temp_dir.path());

        let dataset = store.load().unwrap();
        assert!(dataset.patients.is_empty());
        assert!(dataset.sales.is_empty());
        // Default settings seeded
        assert!(!dataset.settings.dose_prices.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(temp_dir.path());

        std::fs::write(store.path(), "{ invalid json }").unwrap();

        let result = store.load();
        assert!(matches!(result, Err(Error::State(_))));
    }

    #[test]
    fn test_atomic_commit_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(temp_dir.path());

        store.commit(&Dataset::default()).unwrap();

        assert!(store.path().exists());
        let extras: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "dataset.json")
            .collect();
        assert!(
            extras.is_empty(),
            "Expected only dataset.json, found extras: {:?}",
            extras
        );
    }

    #[test]
    fn test_mem_store_roundtrip() {
        let store = MemStore::new();
        store.commit(&dataset_with_one_patient()).unwrap();
        assert_eq!(store.load().unwrap().patients.len(), 1);
    }
}
