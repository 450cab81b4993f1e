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

//! Log Ingestion Pipeline
//!
//! One pipeline per trial. Every rank gets its own [`RankWriter`]; writers
//! share a bounded queue drained by a single task that validates sequence
//! numbers, clamps timestamps and appends batches to the trial's log.
//!
//! ```text
//! rank 0 ──┐
//! rank 1 ──┼──► bounded mpsc ──► drain task ──► TrialLog (segment + index)
//! rank N ──┘
//! ```
//!
//! A full queue blocks writers; nothing is dropped for lack of space.
//! Per-record violations (duplicate sequence, unknown rank, oversize
//! payload, writes after seal) are logged, counted and dropped without
//! affecting the trial.

use crate::log_store::TrialLog;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trialhub_core::{
    now_micros, IngestConfig, LogRecord, LogSink, RankIndex, Result, TrialId, TrialhubError,
};

/// Upper bound on records appended per drain wake-up.
const MAX_DRAIN_BATCH: usize = 512;

/// Counters for one pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    /// Sequence at or below the last accepted sequence of the rank
    pub duplicate: u64,
    /// Rank index outside 0..rank_count
    pub unknown_rank: u64,
    pub oversize: u64,
    /// Arrived after the pipeline was sealed
    pub late: u64,
    /// Records lost to a storage failure
    pub write_failures: u64,
}

impl IngestStats {
    pub fn rejected(&self) -> u64 {
        self.duplicate + self.unknown_rank + self.oversize + self.late
    }
}

#[derive(Default)]
struct StatCounters {
    accepted: AtomicU64,
    duplicate: AtomicU64,
    unknown_rank: AtomicU64,
    oversize: AtomicU64,
    late: AtomicU64,
    write_failures: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            unknown_rank: self.unknown_rank.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

struct Submission {
    rank: RankIndex,
    seq: u64,
    timestamp_us: u64,
    payload: Vec<u8>,
}

enum IngestMessage {
    Record(Submission),
    Seal(oneshot::Sender<()>),
}

#[derive(Default, Clone, Copy)]
struct RankProgress {
    next_seq: u64,
    last_timestamp_us: u64,
}

/// Per-trial ingestion front end.
pub struct IngestPipeline {
    trial_id: TrialId,
    rank_count: u32,
    tx: mpsc::Sender<IngestMessage>,
    log: Arc<TrialLog>,
    stats: Arc<StatCounters>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl IngestPipeline {
    /// Start a pipeline over a freshly created log.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(log: Arc<TrialLog>, rank_count: u32, config: &IngestConfig) -> Arc<Self> {
        let trial_id = log.trial_id();
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let stats = Arc::new(StatCounters::default());

        let drainer = Drainer {
            trial_id,
            log: Arc::clone(&log),
            stats: Arc::clone(&stats),
            ranks: vec![RankProgress::default(); rank_count as usize],
            max_payload_bytes: config.max_payload_bytes,
        };
        let handle = tokio::spawn(drainer.run(rx));

        info!(
            trial_id = %trial_id,
            rank_count,
            capacity = config.buffer_capacity,
            "opened ingestion pipeline"
        );

        Arc::new(Self {
            trial_id,
            rank_count,
            tx,
            log,
            stats,
            drain: Mutex::new(Some(handle)),
        })
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    pub fn rank_count(&self) -> u32 {
        self.rank_count
    }

    pub fn log(&self) -> &Arc<TrialLog> {
        &self.log
    }

    /// Open the write stream of one rank. Ranks open independently; opening
    /// the same rank twice yields two writers that both start at sequence 0,
    /// so the second one's records are rejected as duplicates.
    pub fn writer(&self, rank: RankIndex) -> Result<RankWriter> {
        if rank >= self.rank_count {
            return Err(TrialhubError::NotFound(format!(
                "rank {} of trial {} (rank count {})",
                rank, self.trial_id, self.rank_count
            )));
        }
        Ok(RankWriter {
            trial_id: self.trial_id,
            rank,
            next_seq: 0,
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
        })
    }

    pub fn stats(&self) -> IngestStats {
        self.stats.snapshot()
    }

    pub fn is_sealed(&self) -> bool {
        self.log.is_sealed()
    }

    /// Flush everything queued so far, then close the log. Writes that
    /// arrive afterwards are rejected as late. Idempotent.
    pub async fn seal(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(IngestMessage::Seal(ack_tx)).await.is_ok() && ack_rx.await.is_ok() {
            self.reap().await;
            return Ok(());
        }

        // Someone else sealed first; wait for the log to say so.
        let mut progress = self.log.subscribe();
        progress
            .wait_for(|p| p.sealed)
            .await
            .map_err(|_| TrialhubError::Closed(format!("pipeline for trial {}", self.trial_id)))?;
        self.reap().await;
        Ok(())
    }

    async fn reap(&self) {
        let handle = self.drain.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(trial_id = %self.trial_id, error = %e, "ingestion drain task failed");
            }
        }
    }
}

/// Write handle of one rank.
pub struct RankWriter {
    trial_id: TrialId,
    rank: RankIndex,
    next_seq: u64,
    tx: mpsc::Sender<IngestMessage>,
    stats: Arc<StatCounters>,
}

impl std::fmt::Debug for RankWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankWriter")
            .field("trial_id", &self.trial_id)
            .field("rank", &self.rank)
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl RankWriter {
    pub fn rank(&self) -> RankIndex {
        self.rank
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    /// Sequence the next write will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append one payload with the next sequence number, stamped now.
    /// Waits while the queue is full.
    pub async fn write(&mut self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.submit(seq, now_micros(), payload.into()).await
    }

    /// Blocking variant of [`write`](Self::write) for rank code running on a
    /// plain thread. Must not be called from an async context.
    pub fn blocking_write(&mut self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let message = IngestMessage::Record(Submission {
            rank: self.rank,
            seq,
            timestamp_us: now_micros(),
            payload: payload.into(),
        });
        self.tx.blocking_send(message).map_err(|_| self.closed())
    }

    /// Submit a record with an explicit sequence and timestamp, as a remote
    /// rank would. Sequence violations are rejected by the drain task.
    pub async fn submit(&self, seq: u64, timestamp_us: u64, payload: Vec<u8>) -> Result<()> {
        let message = IngestMessage::Record(Submission {
            rank: self.rank,
            seq,
            timestamp_us,
            payload,
        });
        self.tx.send(message).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> TrialhubError {
        self.stats.late.fetch_add(1, Ordering::Relaxed);
        debug!(trial_id = %self.trial_id, rank = self.rank, "write after pipeline sealed");
        TrialhubError::Closed(format!(
            "pipeline for trial {} is sealed",
            self.trial_id
        ))
    }
}

impl LogSink for RankWriter {
    fn emit(&mut self, payload: &[u8]) {
        if let Err(e) = self.blocking_write(payload.to_vec()) {
            debug!(trial_id = %self.trial_id, rank = self.rank, error = %e, "dropped log output");
        }
    }
}

struct Drainer {
    trial_id: TrialId,
    log: Arc<TrialLog>,
    stats: Arc<StatCounters>,
    ranks: Vec<RankProgress>,
    max_payload_bytes: usize,
}

impl Drainer {
    async fn run(mut self, mut rx: mpsc::Receiver<IngestMessage>) {
        let mut acks = Vec::new();

        while let Some(first) = rx.recv().await {
            let mut batch = Vec::new();
            let mut sealing = self.accept(first, &mut batch, &mut acks);

            while !sealing && batch.len() < MAX_DRAIN_BATCH {
                match rx.try_recv() {
                    Ok(next) => sealing = self.accept(next, &mut batch, &mut acks),
                    Err(_) => break,
                }
            }

            self.append(batch);
            if sealing {
                break;
            }
        }

        // Anything still queued was sent after the seal request.
        rx.close();
        while let Some(message) = rx.recv().await {
            match message {
                IngestMessage::Record(late) => {
                    self.stats.late.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        trial_id = %self.trial_id,
                        rank = late.rank,
                        seq = late.seq,
                        "dropping log record received after seal"
                    );
                }
                IngestMessage::Seal(ack) => acks.push(ack),
            }
        }

        if let Err(e) = self.log.seal() {
            error!(trial_id = %self.trial_id, error = %e, "failed to seal trial log");
        }
        let stats = self.stats.snapshot();
        info!(
            trial_id = %self.trial_id,
            accepted = stats.accepted,
            rejected = stats.rejected(),
            "ingestion pipeline sealed"
        );
        for ack in acks {
            let _ = ack.send(());
        }
    }

    /// Returns true when the message is a seal request.
    fn accept(
        &mut self,
        message: IngestMessage,
        batch: &mut Vec<LogRecord>,
        acks: &mut Vec<oneshot::Sender<()>>,
    ) -> bool {
        match message {
            IngestMessage::Seal(ack) => {
                acks.push(ack);
                true
            }
            IngestMessage::Record(submission) => {
                match self.check(submission) {
                    Ok(record) => batch.push(record),
                    Err(e) => warn!(trial_id = %self.trial_id, error = %e, "rejected log record"),
                }
                false
            }
        }
    }

    fn check(&mut self, submission: Submission) -> Result<LogRecord> {
        let Submission {
            rank,
            seq,
            timestamp_us,
            payload,
        } = submission;

        let Some(progress) = self.ranks.get_mut(rank as usize) else {
            self.stats.unknown_rank.fetch_add(1, Ordering::Relaxed);
            return Err(TrialhubError::IngestionOverflow(format!(
                "rank {} outside rank count {}",
                rank,
                self.ranks.len()
            )));
        };

        if seq < progress.next_seq {
            self.stats.duplicate.fetch_add(1, Ordering::Relaxed);
            return Err(TrialhubError::IngestionOverflow(format!(
                "rank {} sequence {} already seen (expected {})",
                rank, seq, progress.next_seq
            )));
        }

        if payload.len() > self.max_payload_bytes {
            self.stats.oversize.fetch_add(1, Ordering::Relaxed);
            return Err(TrialhubError::IngestionOverflow(format!(
                "rank {} payload of {} bytes exceeds {}",
                rank,
                payload.len(),
                self.max_payload_bytes
            )));
        }

        if seq > progress.next_seq {
            warn!(
                trial_id = %self.trial_id,
                rank,
                expected = progress.next_seq,
                seq,
                "sequence gap in rank stream"
            );
        }

        progress.next_seq = seq + 1;
        progress.last_timestamp_us = progress.last_timestamp_us.max(timestamp_us);

        Ok(LogRecord {
            trial_id: self.trial_id,
            rank,
            seq,
            timestamp_us: progress.last_timestamp_us,
            payload,
        })
    }

    fn append(&self, batch: Vec<LogRecord>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len() as u64;
        match self.log.append_batch(batch) {
            Ok(_) => {
                self.stats.accepted.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(count, Ordering::Relaxed);
                error!(
                    trial_id = %self.trial_id,
                    records = count,
                    error = %e,
                    "failed to append log batch"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::LogStore;

    fn open(dir: &std::path::Path, rank_count: u32, config: &IngestConfig) -> Arc<IngestPipeline> {
        let store = LogStore::open(dir, false).unwrap();
        let log = store.create(TrialId(1)).unwrap();
        IngestPipeline::open(log, rank_count, config)
    }

    #[tokio::test]
    async fn test_seal_flushes_everything_queued() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = open(dir.path(), 2, &IngestConfig::default());

        let mut w0 = pipeline.writer(0).unwrap();
        let mut w1 = pipeline.writer(1).unwrap();
        for i in 0..100 {
            w0.write(format!("r0 {}", i)).await.unwrap();
            w1.write(format!("r1 {}", i)).await.unwrap();
        }
        pipeline.seal().await.unwrap();

        assert!(pipeline.is_sealed());
        assert_eq!(pipeline.log().len(), 200);
        assert_eq!(pipeline.stats().accepted, 200);
        assert!(w0.write("late").await.is_err());
        assert_eq!(pipeline.stats().late, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = open(dir.path(), 1, &IngestConfig::default());
        assert!(pipeline.writer(1).unwrap_err().is_not_found());

        let w = pipeline.writer(0).unwrap();
        w.submit(0, 10, b"a".to_vec()).await.unwrap();
        w.submit(0, 11, b"dup".to_vec()).await.unwrap();
        w.submit(3, 12, b"gap".to_vec()).await.unwrap();
        w.submit(2, 13, b"behind".to_vec()).await.unwrap();
        pipeline.seal().await.unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.duplicate, 2);
        let seqs: Vec<_> = pipeline.log().arrivals(0, 10).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 3]);
    }

    #[tokio::test]
    async fn test_timestamps_clamped_per_rank() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = open(dir.path(), 1, &IngestConfig::default());
        let w = pipeline.writer(0).unwrap();
        w.submit(0, 50, b"first".to_vec()).await.unwrap();
        w.submit(1, 20, b"clock went back".to_vec()).await.unwrap();
        pipeline.seal().await.unwrap();

        let stamps: Vec<_> = pipeline
            .log()
            .arrivals(0, 10)
            .iter()
            .map(|r| r.timestamp_us)
            .collect();
        assert_eq!(stamps, vec![50, 50]);
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig {
            buffer_capacity: 4,
            max_payload_bytes: 8,
        };
        let pipeline = open(dir.path(), 1, &config);
        let mut w = pipeline.writer(0).unwrap();
        w.write(vec![0u8; 9]).await.unwrap();
        w.write(vec![0u8; 8]).await.unwrap();
        pipeline.seal().await.unwrap();

        assert_eq!(pipeline.stats().oversize, 1);
        assert_eq!(pipeline.log().len(), 1);
    }

    #[tokio::test]
    async fn test_small_buffer_applies_backpressure_without_loss() {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig {
            buffer_capacity: 1,
            ..IngestConfig::default()
        };
        let pipeline = open(dir.path(), 4, &config);

        let mut tasks = Vec::new();
        for rank in 0..4 {
            let mut w = pipeline.writer(rank).unwrap();
            tasks.push(tokio::spawn(async move {
                for i in 0..250 {
                    w.write(format!("rank {} line {}", rank, i)).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        pipeline.seal().await.unwrap();
        pipeline.seal().await.unwrap();

        assert_eq!(pipeline.log().len(), 1000);
        assert_eq!(pipeline.stats().rejected(), 0);
    }

    #[tokio::test]
    async fn test_blocking_writer_from_plain_thread() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = open(dir.path(), 1, &IngestConfig::default());
        let mut w = pipeline.writer(0).unwrap();
        tokio::task::spawn_blocking(move || {
            w.emit(b"nul\0byte");
            w.emit(b"second");
        })
        .await
        .unwrap();
        pipeline.seal().await.unwrap();

        let records = pipeline.log().arrivals(0, 10);
        assert_eq!(records[0].payload, b"nul\0byte".to_vec());
        assert_eq!(records[1].seq, 1);
    }
}
