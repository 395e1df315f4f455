use crate::common::{Result, RidgelineError};
use crate::core::features::{Descriptor, Keypoint};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const STORAGE_VERSION: u32 = 1;

/// Features extracted from one accepted enrollment frame. Immutable once
/// created; the two vectors are parallel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

/// The persisted unit: one file per subject, an append-only template list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub version: u32,
    pub subject_id: String,
    pub templates: Vec<Template>,
}

/// Durable collection of enrolled subjects, one bincode file each, keyed by
/// `{user}_{finger-label}`.
pub struct TemplateStore {
    data_dir: PathBuf,
}

impl TemplateStore {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn subject_path(&self, subject_id: &str) -> PathBuf {
        // Sanitize: subject ids never address outside the data dir.
        let safe = subject_id.replace(['/', '\\'], "_");
        self.data_dir.join(format!("{}.bincode", safe))
    }

    /// Append templates to a subject, creating it on first enrollment.
    /// Existing templates are never overwritten.
    pub fn append_templates(&self, subject_id: &str, templates: Vec<Template>) -> Result<()> {
        let mut record = self.load_subject(subject_id)?.unwrap_or(SubjectRecord {
            version: STORAGE_VERSION,
            subject_id: subject_id.to_string(),
            templates: Vec::new(),
        });
        record.templates.extend(templates);
        self.save(&record)
    }

    fn save(&self, record: &SubjectRecord) -> Result<()> {
        let encoded = bincode::serialize(record)
            .map_err(|e| RidgelineError::Storage(format!("Failed to serialize: {}", e)))?;
        fs::write(self.subject_path(&record.subject_id), encoded)?;
        Ok(())
    }

    /// Load one subject. `Ok(None)` when not enrolled; a corrupt file is an
    /// error here (the store-wide walk is where corruption gets skipped).
    pub fn load_subject(&self, subject_id: &str) -> Result<Option<SubjectRecord>> {
        let path = self.subject_path(subject_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        let record: SubjectRecord = bincode::deserialize(&data)
            .map_err(|e| RidgelineError::Storage(format!("Failed to deserialize: {}", e)))?;
        Ok(Some(record))
    }

    /// Load every subject on disk. Unreadable or corrupt units are logged
    /// and skipped so one bad file never takes down the whole database.
    pub fn load_all(&self) -> Result<Vec<SubjectRecord>> {
        let mut records = Vec::new();
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.data_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("bincode"))
            .collect();
        paths.sort();

        for path in paths {
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("Skipping unreadable subject file {}: {}", path.display(), e);
                }
            }
        }
        Ok(records)
    }

    /// Remove one subject. False when it was not enrolled.
    pub fn delete_subject(&self, subject_id: &str) -> Result<bool> {
        let path = self.subject_path(subject_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    /// Remove every subject belonging to `user`. Returns how many went.
    pub fn delete_user(&self, user: &str) -> Result<usize> {
        let prefix = format!("{}_", user);
        let mut removed = 0;
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) == Some("bincode")
                && stem.starts_with(&prefix)
            {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Finger labels enrolled for `user`, sorted, derived from the subject
    /// id prefix scan.
    pub fn list_fingers(&self, user: &str) -> Result<Vec<String>> {
        let prefix = format!("{}_", user);
        let mut fingers = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bincode") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some(finger) = stem.strip_prefix(&prefix) {
                    fingers.push(finger.to_string());
                }
            }
        }
        fingers.sort();
        Ok(fingers)
    }
}

fn read_record(path: &Path) -> Result<SubjectRecord> {
    let data = fs::read(path)?;
    let mut record: SubjectRecord = bincode::deserialize(&data)
        .map_err(|e| RidgelineError::Storage(format!("Failed to deserialize: {}", e)))?;
    if record.version < STORAGE_VERSION {
        record.version = STORAGE_VERSION;
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::DESCRIPTOR_LEN;

    fn template(n: usize) -> Template {
        let keypoints = (0..n)
            .map(|i| Keypoint {
                x: i as f32,
                y: (i * 2) as f32,
                size: 16.0,
                angle: 0.0,
                response: 1.0,
                octave: 0,
                class_id: -1,
            })
            .collect();
        let descriptors = (0..n).map(|i| {
            let mut d = vec![0.0f32; DESCRIPTOR_LEN];
            d[i % DESCRIPTOR_LEN] = 1.0;
            d
        });
        Template {
            keypoints,
            descriptors: descriptors.collect(),
        }
    }

    fn store() -> (tempfile::TempDir, TemplateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    #[test]
    fn round_trips_a_subject() {
        let (_dir, store) = store();
        store
            .append_templates("alice_right-index", vec![template(6)])
            .unwrap();
        let record = store.load_subject("alice_right-index").unwrap().unwrap();
        assert_eq!(record.subject_id, "alice_right-index");
        assert_eq!(record.templates.len(), 1);
        assert_eq!(record.templates[0].keypoints.len(), 6);
    }

    #[test]
    fn append_never_overwrites() {
        let (_dir, store) = store();
        store
            .append_templates("alice_right-index", vec![template(6)])
            .unwrap();
        store
            .append_templates("alice_right-index", vec![template(4), template(5)])
            .unwrap();
        let record = store.load_subject("alice_right-index").unwrap().unwrap();
        assert_eq!(record.templates.len(), 3);
        assert_eq!(record.templates[0].keypoints.len(), 6);
    }

    #[test]
    fn delete_missing_subject_is_false_not_error() {
        let (_dir, store) = store();
        assert!(!store.delete_subject("nobody_right-index").unwrap());
    }

    #[test]
    fn delete_user_removes_all_their_fingers() {
        let (_dir, store) = store();
        store
            .append_templates("bob_right-index", vec![template(6)])
            .unwrap();
        store
            .append_templates("bob_left-thumb", vec![template(6)])
            .unwrap();
        store
            .append_templates("alice_right-index", vec![template(6)])
            .unwrap();

        assert_eq!(store.delete_user("bob").unwrap(), 2);
        assert!(store.list_fingers("bob").unwrap().is_empty());
        assert_eq!(store.list_fingers("alice").unwrap(), vec!["right-index"]);
    }

    #[test]
    fn list_fingers_is_sorted_and_prefix_scoped() {
        let (_dir, store) = store();
        store
            .append_templates("carol_right-index", vec![template(6)])
            .unwrap();
        store
            .append_templates("carol_left-thumb", vec![template(6)])
            .unwrap();
        store
            .append_templates("caroline_right-middle", vec![template(6)])
            .unwrap();

        assert_eq!(
            store.list_fingers("carol").unwrap(),
            vec!["left-thumb", "right-index"]
        );
    }

    #[test]
    fn corrupt_unit_is_skipped_on_full_load() {
        let (dir, store) = store();
        store
            .append_templates("alice_right-index", vec![template(6)])
            .unwrap();
        store
            .append_templates("bob_left-thumb", vec![template(6)])
            .unwrap();
        std::fs::write(dir.path().join("mallory_right-index.bincode"), b"garbage").unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.subject_id != "mallory_right-index"));
    }

    #[test]
    fn subject_ids_cannot_escape_the_data_dir() {
        let (dir, store) = store();
        store
            .append_templates("../evil_right-index", vec![template(6)])
            .unwrap();
        // The file must have landed inside the store directory.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
