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

//! Log Store - durable, append-only, per-trial record of log output
//!
//! Each trial owns one segment file plus an in-memory index of its records,
//! kept both in arrival order (for `follow`) and per rank (for the merged
//! view). Records are shared as `Arc<LogRecord>` so snapshots never copy
//! payloads.
//!
//! # Concurrency
//!
//! - Appends are serialized per trial by the segment writer lock, so file
//!   order and arrival order agree.
//! - Readers hold the index read lock only long enough to copy lengths or a
//!   single `Arc`; they never wait on disk I/O.
//! - A snapshot is just the per-rank lengths at the time it was taken. Since
//!   records are never removed or rewritten, iterating a snapshot later
//!   yields exactly what was visible when it was taken.

use crate::merge::KWayMerge;
use crate::segment::{self, SegmentWriter};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use trialhub_core::{LogRecord, RankIndex, Result, TrialId, TrialhubError};

const SEGMENT_EXTENSION: &str = "seg";

/// Observable ingest progress of one trial log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogProgress {
    /// Records appended so far (arrival count).
    pub appended: usize,
    /// No further records will be appended.
    pub sealed: bool,
}

#[derive(Default)]
struct LogIndex {
    arrival: Vec<Arc<LogRecord>>,
    ranks: BTreeMap<RankIndex, Vec<Arc<LogRecord>>>,
}

/// One trial's log stream.
pub struct TrialLog {
    trial_id: TrialId,
    index: RwLock<LogIndex>,
    writer: Mutex<Option<SegmentWriter>>,
    progress: watch::Sender<LogProgress>,
    sync_on_seal: bool,
}

impl std::fmt::Debug for TrialLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialLog")
            .field("trial_id", &self.trial_id)
            .finish_non_exhaustive()
    }
}

impl TrialLog {
    fn create(trial_id: TrialId, path: &Path, sync_on_seal: bool) -> Result<Self> {
        let writer = SegmentWriter::create(path)?;
        let (progress, _) = watch::channel(LogProgress::default());
        Ok(Self {
            trial_id,
            index: RwLock::new(LogIndex::default()),
            writer: Mutex::new(Some(writer)),
            progress,
            sync_on_seal,
        })
    }

    /// A log rebuilt from disk. It is sealed: the process that wrote it is gone.
    fn recovered(trial_id: TrialId, records: Vec<LogRecord>) -> Self {
        let mut index = LogIndex::default();
        for record in records {
            let record = Arc::new(record);
            index
                .ranks
                .entry(record.rank)
                .or_default()
                .push(Arc::clone(&record));
            index.arrival.push(record);
        }
        let (progress, _) = watch::channel(LogProgress {
            appended: index.arrival.len(),
            sealed: true,
        });
        Self {
            trial_id,
            index: RwLock::new(index),
            writer: Mutex::new(None),
            progress,
            sync_on_seal: false,
        }
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    /// Append records atomically, in the given order.
    ///
    /// The batch is written to the segment and flushed before it becomes
    /// visible to readers.
    pub fn append_batch(&self, records: Vec<LogRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut writer_guard = self.writer.lock();
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| TrialhubError::Closed(format!("log for trial {} is sealed", self.trial_id)))?;

        for record in &records {
            writer.append(record)?;
        }
        writer.flush()?;

        let count = records.len();
        let mut index = self.index.write();
        for record in records {
            let record = Arc::new(record);
            index
                .ranks
                .entry(record.rank)
                .or_default()
                .push(Arc::clone(&record));
            index.arrival.push(record);
        }
        let appended = index.arrival.len();
        self.progress.send_modify(|p| p.appended = appended);
        Ok(count)
    }

    /// Close the segment for writing. Idempotent.
    pub fn seal(&self) -> Result<()> {
        let mut writer_guard = self.writer.lock();
        if let Some(mut writer) = writer_guard.take() {
            if self.sync_on_seal {
                writer.sync()?;
            } else {
                writer.flush()?;
            }
            debug!(trial_id = %self.trial_id, frames = writer.frames(), "sealed trial log");
        }
        self.progress.send_modify(|p| p.sealed = true);
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.progress.borrow().sealed
    }

    pub fn len(&self) -> usize {
        self.index.read().arrival.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn progress(&self) -> LogProgress {
        *self.progress.borrow()
    }

    /// Watch appends and sealing without polling.
    pub fn subscribe(&self) -> watch::Receiver<LogProgress> {
        self.progress.subscribe()
    }

    /// Capture what is visible right now.
    pub fn snapshot(self: &Arc<Self>) -> LogSnapshot {
        let index = self.index.read();
        let rank_lens = index
            .ranks
            .iter()
            .map(|(rank, records)| (*rank, records.len()))
            .collect();
        let len = index.arrival.len();
        let sealed = self.progress.borrow().sealed;
        drop(index);

        LogSnapshot {
            log: Arc::clone(self),
            rank_lens,
            len,
            sealed,
        }
    }

    /// Records in arrival order starting at `from`, at most `limit` of them.
    pub fn arrivals(&self, from: usize, limit: usize) -> Vec<Arc<LogRecord>> {
        let index = self.index.read();
        index
            .arrival
            .iter()
            .skip(from)
            .take(limit)
            .cloned()
            .collect()
    }

    fn rank_record(&self, rank: RankIndex, pos: usize) -> Option<Arc<LogRecord>> {
        self.index
            .read()
            .ranks
            .get(&rank)
            .and_then(|records| records.get(pos))
            .cloned()
    }
}

/// Point-in-time view of a trial log in merge-key order.
///
/// Iteration is lazy and can be restarted any number of times.
#[derive(Clone)]
pub struct LogSnapshot {
    log: Arc<TrialLog>,
    rank_lens: Vec<(RankIndex, usize)>,
    len: usize,
    sealed: bool,
}

impl LogSnapshot {
    pub fn trial_id(&self) -> TrialId {
        self.log.trial_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the log was already sealed when the snapshot was taken.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn iter(&self) -> KWayMerge<RankCursor> {
        let cursors = self
            .rank_lens
            .iter()
            .map(|(rank, end)| RankCursor {
                log: Arc::clone(&self.log),
                rank: *rank,
                pos: 0,
                end: *end,
            })
            .collect();
        KWayMerge::new(cursors)
    }

    /// First `n` records, or all of them when fewer exist.
    pub fn head(&self, n: usize) -> Vec<Arc<LogRecord>> {
        self.iter().take(n).collect()
    }

    /// Last `n` records, or all of them when fewer exist.
    pub fn tail(&self, n: usize) -> Vec<Arc<LogRecord>> {
        if n == 0 {
            return Vec::new();
        }
        let mut window = VecDeque::with_capacity(n.min(self.len));
        for record in self.iter() {
            if window.len() == n {
                window.pop_front();
            }
            window.push_back(record);
        }
        window.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a LogSnapshot {
    type Item = Arc<LogRecord>;
    type IntoIter = KWayMerge<RankCursor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Reads one rank's records up to a snapshot bound.
pub struct RankCursor {
    log: Arc<TrialLog>,
    rank: RankIndex,
    pos: usize,
    end: usize,
}

impl Iterator for RankCursor {
    type Item = Arc<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let record = self.log.rank_record(self.rank, self.pos)?;
        self.pos += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.pos;
        (remaining, Some(remaining))
    }
}

/// Directory of trial segments.
pub struct LogStore {
    dir: PathBuf,
    logs: DashMap<TrialId, Arc<TrialLog>>,
    sync_on_seal: bool,
    read_only: bool,
}

impl LogStore {
    /// Open (or create) a log directory and load every segment in it.
    pub fn open(dir: impl AsRef<Path>, sync_on_seal: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Self::load(dir, sync_on_seal, false)
    }

    /// Load the segments as they are on disk right now. Torn tails are
    /// skipped, not truncated, and `create`/`delete` are rejected.
    pub fn open_read_only(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load(dir.as_ref().to_path_buf(), false, true)
    }

    fn load(dir: PathBuf, sync_on_seal: bool, read_only: bool) -> Result<Self> {
        let logs = DashMap::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => Some(entries),
            Err(e) if read_only && e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        for entry in entries.into_iter().flatten() {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
                continue;
            }
            let Some(trial_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<TrialId>().ok())
            else {
                warn!(path = %path.display(), "ignoring unrecognised segment file");
                continue;
            };

            let scan = segment::read_segment(&path)?;
            if scan.torn_tail && !read_only {
                warn!(
                    trial_id = %trial_id,
                    valid_len = scan.valid_len,
                    "truncating torn tail of trial log"
                );
                segment::truncate_segment(&path, scan.valid_len)?;
            }
            logs.insert(trial_id, Arc::new(TrialLog::recovered(trial_id, scan.records)));
        }

        info!(dir = %dir.display(), trials = logs.len(), read_only, "opened log store");
        Ok(Self {
            dir,
            logs,
            sync_on_seal,
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TrialhubError::InvalidState(format!(
                "log store at {} is read-only",
                self.dir.display()
            )));
        }
        Ok(())
    }

    /// Start a fresh, empty log for a trial.
    pub fn create(&self, trial_id: TrialId) -> Result<Arc<TrialLog>> {
        self.ensure_writable()?;
        match self.logs.entry(trial_id) {
            Entry::Occupied(_) => Err(TrialhubError::InvalidState(format!(
                "log for trial {} already exists",
                trial_id
            ))),
            Entry::Vacant(slot) => {
                let log = Arc::new(TrialLog::create(
                    trial_id,
                    &self.segment_path(trial_id),
                    self.sync_on_seal,
                )?);
                slot.insert(Arc::clone(&log));
                debug!(trial_id = %trial_id, "created trial log");
                Ok(log)
            }
        }
    }

    pub fn get(&self, trial_id: TrialId) -> Result<Arc<TrialLog>> {
        self.logs
            .get(&trial_id)
            .map(|log| Arc::clone(log.value()))
            .ok_or_else(|| TrialhubError::NotFound(format!("log for trial {}", trial_id)))
    }

    pub fn contains(&self, trial_id: TrialId) -> bool {
        self.logs.contains_key(&trial_id)
    }

    /// Remove a trial's log from memory and disk. Returns whether it existed.
    pub fn delete(&self, trial_id: TrialId) -> Result<bool> {
        self.ensure_writable()?;
        let Some((_, log)) = self.logs.remove(&trial_id) else {
            return Ok(false);
        };
        log.seal()?;
        match std::fs::remove_file(self.segment_path(trial_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(trial_id = %trial_id, records = log.len(), "deleted trial log");
        Ok(true)
    }

    pub fn trial_ids(&self) -> Vec<TrialId> {
        let mut ids: Vec<_> = self.logs.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    fn segment_path(&self, trial_id: TrialId) -> PathBuf {
        self.dir.join(format!("{}.{}", trial_id, SEGMENT_EXTENSION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rank: RankIndex, seq: u64, ts: u64, payload: &str) -> LogRecord {
        LogRecord {
            trial_id: TrialId(1),
            rank,
            seq,
            timestamp_us: ts,
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_snapshot_ignores_later_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).unwrap();
        let log = store.create(TrialId(1)).unwrap();

        log.append_batch(vec![record(0, 0, 10, "a"), record(1, 0, 5, "b")])
            .unwrap();
        let snapshot = log.snapshot();
        log.append_batch(vec![record(0, 1, 20, "c")]).unwrap();

        assert_eq!(snapshot.len(), 2);
        let payloads: Vec<_> = snapshot.iter().map(|r| r.payload.clone()).collect();
        assert_eq!(payloads, vec![b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(log.snapshot().len(), 3);
    }

    #[test]
    fn test_snapshot_iteration_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).unwrap();
        let log = store.create(TrialId(1)).unwrap();
        log.append_batch((0..5).map(|i| record(0, i, i, "x")).collect())
            .unwrap();

        let snapshot = log.snapshot();
        assert_eq!(snapshot.iter().count(), 5);
        assert_eq!(snapshot.iter().count(), 5);
        assert_eq!(snapshot.head(3).len(), 3);
        assert_eq!(snapshot.tail(2).iter().map(|r| r.seq).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(snapshot.head(50).len(), 5);
        assert!(snapshot.tail(0).is_empty());
    }

    #[test]
    fn test_sealed_log_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), true).unwrap();
        let log = store.create(TrialId(1)).unwrap();
        log.seal().unwrap();
        log.seal().unwrap();
        assert!(log.is_sealed());
        assert!(matches!(
            log.append_batch(vec![record(0, 0, 1, "late")]),
            Err(TrialhubError::Closed(_))
        ));
    }

    #[test]
    fn test_reopen_recovers_records_sealed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(dir.path(), true).unwrap();
            let log = store.create(TrialId(4)).unwrap();
            log.append_batch(vec![record(0, 0, 1, "one\0two")]).unwrap();
            log.seal().unwrap();
        }

        let store = LogStore::open(dir.path(), true).unwrap();
        let log = store.get(TrialId(4)).unwrap();
        assert!(log.is_sealed());
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot().head(1)[0].payload, b"one\0two".to_vec());
    }

    #[test]
    fn test_duplicate_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).unwrap();
        store.create(TrialId(2)).unwrap();
        assert!(store.create(TrialId(2)).is_err());

        assert!(store.delete(TrialId(2)).unwrap());
        assert!(!store.delete(TrialId(2)).unwrap());
        assert!(store.get(TrialId(2)).unwrap_err().is_not_found());
        assert!(!dir.path().join("2.seg").exists());
    }

    #[test]
    fn test_read_only_open_leaves_segments_alone() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(dir.path(), true).unwrap();
            let log = store.create(TrialId(3)).unwrap();
            log.append_batch(vec![record(0, 0, 1, "kept")]).unwrap();
            log.seal().unwrap();
        }
        let path = dir.path().join("3.seg");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[40, 0, 0, 0, 1, 2]);
        std::fs::write(&path, &bytes).unwrap();

        let store = LogStore::open_read_only(dir.path()).unwrap();
        assert!(store.is_read_only());
        assert_eq!(store.get(TrialId(3)).unwrap().len(), 1);
        assert_eq!(std::fs::read(&path).unwrap().len(), bytes.len());
        assert!(store.create(TrialId(4)).is_err());
        assert!(store.delete(TrialId(3)).is_err());
        assert!(path.exists());

        let missing = LogStore::open_read_only(dir.path().join("absent")).unwrap();
        assert!(missing.trial_ids().is_empty());
    }

    #[test]
    fn test_arrivals_paging() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).unwrap();
        let log = store.create(TrialId(1)).unwrap();
        log.append_batch((0..10).map(|i| record(0, i, i, "x")).collect())
            .unwrap();

        let page = log.arrivals(8, 5);
        assert_eq!(page.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![8, 9]);
        assert_eq!(log.progress().appended, 10);
    }
}
