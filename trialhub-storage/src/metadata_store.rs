// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Experiment and trial metadata persistence.
//!
//! # Layout
//!
//! ```text
//! {root}/experiments/{experiment_id}.json
//! {root}/trials/{trial_id}.json
//! {root}/contexts/{experiment_id}.ctx
//! ```
//!
//! Documents are replaced atomically (temp file, fsync, rename), so a crash
//! leaves either the old or the new version on disk. Model contexts are
//! bincode rather than JSON so file contents stay byte-exact.
//!
//! A store opened with [`MetadataStore::open_read_only`] never creates,
//! replaces or removes anything; it serves a process that does not own the
//! data directory.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use trialhub_core::{
    ExperimentId, ExperimentRecord, ModelContext, Result, TrialId, TrialRecord, TrialhubError,
};

const EXPERIMENTS_DIR: &str = "experiments";
const TRIALS_DIR: &str = "trials";
const CONTEXTS_DIR: &str = "contexts";

pub struct MetadataStore {
    root: PathBuf,
    next_experiment: AtomicU64,
    next_trial: AtomicU64,
    read_only: bool,
}

impl MetadataStore {
    /// Open (or create) the metadata directories and resume id allocation
    /// after the highest persisted id.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(EXPERIMENTS_DIR))?;
        fs::create_dir_all(root.join(TRIALS_DIR))?;
        fs::create_dir_all(root.join(CONTEXTS_DIR))?;

        let max_experiment = max_document_id(&root.join(EXPERIMENTS_DIR))?;
        let max_trial = max_document_id(&root.join(TRIALS_DIR))?;

        Ok(Self {
            root,
            next_experiment: AtomicU64::new(max_experiment + 1),
            next_trial: AtomicU64::new(max_trial + 1),
            read_only: false,
        })
    }

    /// Open without creating directories. Every write is rejected.
    pub fn open_read_only(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let max_experiment = max_document_id(&root.join(EXPERIMENTS_DIR))?;
        let max_trial = max_document_id(&root.join(TRIALS_DIR))?;
        Ok(Self {
            root,
            next_experiment: AtomicU64::new(max_experiment + 1),
            next_trial: AtomicU64::new(max_trial + 1),
            read_only: true,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allocate_experiment_id(&self) -> ExperimentId {
        ExperimentId(self.next_experiment.fetch_add(1, Ordering::SeqCst))
    }

    pub fn allocate_trial_id(&self) -> TrialId {
        TrialId(self.next_trial.fetch_add(1, Ordering::SeqCst))
    }

    pub fn put_experiment(&self, record: &ExperimentRecord) -> Result<()> {
        self.ensure_writable()?;
        write_document(&self.experiment_path(record.id), record)
    }

    pub fn load_experiments(&self) -> Result<Vec<ExperimentRecord>> {
        let mut records: Vec<ExperimentRecord> = load_documents(&self.root.join(EXPERIMENTS_DIR))?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    pub fn delete_experiment(&self, id: ExperimentId) -> Result<bool> {
        self.ensure_writable()?;
        remove_document(&self.experiment_path(id))
    }

    pub fn put_trial(&self, record: &TrialRecord) -> Result<()> {
        self.ensure_writable()?;
        write_document(&self.trial_path(record.id), record)
    }

    pub fn load_trials(&self) -> Result<Vec<TrialRecord>> {
        let mut records: Vec<TrialRecord> = load_documents(&self.root.join(TRIALS_DIR))?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    pub fn delete_trial(&self, id: TrialId) -> Result<bool> {
        self.ensure_writable()?;
        remove_document(&self.trial_path(id))
    }

    pub fn put_context(&self, id: ExperimentId, context: &ModelContext) -> Result<()> {
        self.ensure_writable()?;
        let bytes = bincode::serialize(context)?;
        atomic_write_bytes(&self.context_path(id), &bytes)
    }

    /// The model context submitted with an experiment; empty if none was stored.
    pub fn load_context(&self, id: ExperimentId) -> Result<ModelContext> {
        match fs::read(self.context_path(id)) {
            Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ModelContext::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_context(&self, id: ExperimentId) -> Result<bool> {
        self.ensure_writable()?;
        remove_document(&self.context_path(id))
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TrialhubError::InvalidState(format!(
                "metadata store at {} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn experiment_path(&self, id: ExperimentId) -> PathBuf {
        self.root.join(EXPERIMENTS_DIR).join(format!("{}.json", id))
    }

    fn trial_path(&self, id: TrialId) -> PathBuf {
        self.root.join(TRIALS_DIR).join(format!("{}.json", id))
    }

    fn context_path(&self, id: ExperimentId) -> PathBuf {
        self.root.join(CONTEXTS_DIR).join(format!("{}.ctx", id))
    }
}

fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn remove_document(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed metadata document");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn document_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if is_json && !is_temp {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn load_documents<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for path in document_paths(dir)? {
        let bytes = fs::read(&path)?;
        match serde_json::from_slice(&bytes) {
            Ok(doc) => out.push(doc),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable metadata document");
            }
        }
    }
    Ok(out)
}

fn max_document_id(dir: &Path) -> Result<u64> {
    Ok(document_paths(dir)?
        .iter()
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()))
        .filter_map(|s| s.parse::<u64>().ok())
        .max()
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trialhub_core::{ExperimentConfig, TrialState};

    fn experiment(store: &MetadataStore) -> ExperimentRecord {
        let config = ExperimentConfig::new(json!({"entrypoint": "no_op"})).unwrap();
        ExperimentRecord::new(store.allocate_experiment_id(), config, "tester", false)
    }

    #[test]
    fn test_round_trip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();

        let mut record = experiment(&store);
        record.labels.insert("baseline".into());
        store.put_experiment(&record).unwrap();

        let loaded = store.load_experiments().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, record.id);
        assert!(loaded[0].labels.contains("baseline"));

        assert!(store.delete_experiment(record.id).unwrap());
        assert!(!store.delete_experiment(record.id).unwrap());
        assert!(store.load_experiments().unwrap().is_empty());
    }

    #[test]
    fn test_ids_resume_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MetadataStore::open(dir.path()).unwrap();
            let record = experiment(&store);
            assert_eq!(record.id, ExperimentId(1));
            store.put_experiment(&record).unwrap();

            let mut trial = TrialRecord::new(store.allocate_trial_id(), record.id, 2).unwrap();
            trial.finish(TrialState::Completed).unwrap();
            store.put_trial(&trial).unwrap();
        }

        let store = MetadataStore::open(dir.path()).unwrap();
        assert_eq!(store.allocate_experiment_id(), ExperimentId(2));
        assert_eq!(store.allocate_trial_id(), TrialId(2));
        let trials = store.load_trials().unwrap();
        assert_eq!(trials[0].state, TrialState::Completed);
    }

    #[test]
    fn test_context_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        assert!(store.load_context(ExperimentId(5)).unwrap().is_empty());

        let mut context = ModelContext::new();
        context.insert("model_def.py", b"print('x')\0\xff".to_vec());
        store.put_context(ExperimentId(5), &context).unwrap();
        assert_eq!(store.load_context(ExperimentId(5)).unwrap(), context);
        assert!(store.delete_context(ExperimentId(5)).unwrap());
    }

    #[test]
    fn test_unreadable_documents_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(EXPERIMENTS_DIR).join("9.json"), b"{broken").unwrap();
        fs::write(dir.path().join(EXPERIMENTS_DIR).join(".9.json.tmp.1.2"), b"{}").unwrap();
        assert!(store.load_experiments().unwrap().is_empty());
    }

    #[test]
    fn test_read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let empty = MetadataStore::open_read_only(dir.path().join("missing")).unwrap();
        assert!(empty.load_trials().unwrap().is_empty());
        assert!(!dir.path().join("missing").exists());

        let writer = MetadataStore::open(dir.path()).unwrap();
        let record = experiment(&writer);
        writer.put_experiment(&record).unwrap();

        let reader = MetadataStore::open_read_only(dir.path()).unwrap();
        assert!(reader.is_read_only());
        assert_eq!(reader.load_experiments().unwrap().len(), 1);
        assert!(matches!(
            reader.put_experiment(&record),
            Err(TrialhubError::InvalidState(_))
        ));
        assert!(matches!(
            reader.delete_experiment(record.id),
            Err(TrialhubError::InvalidState(_))
        ));
        assert_eq!(writer.load_experiments().unwrap().len(), 1);
    }
}
