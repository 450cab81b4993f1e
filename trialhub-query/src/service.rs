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

//! Log Query Service
//!
//! Read side of the trial logs. Every query resolves the trial's log in the
//! [`LogStore`] and works either on a snapshot (`full`, `head`, `tail`) or on
//! the live arrival stream (`contains`, `follow`).
//!
//! **Thread Safety:**
//! - Queries never take the segment writer lock, so they never block ingestion
//! - Snapshot queries return the same answer however much is appended later
//! - `contains` and `follow` suspend on the log's progress channel instead of
//!   polling

use crate::follow::LogFollower;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use trialhub_core::{LogRecord, QueryConfig, Result, TrialId, TrialhubError};
use trialhub_storage::{LogSnapshot, LogStore};

/// Which part of a trial's merged log to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSelection {
    Full,
    Head(usize),
    Tail(usize),
}

pub struct LogQueryService {
    logs: Arc<LogStore>,
    config: QueryConfig,
}

impl LogQueryService {
    pub fn new(logs: Arc<LogStore>, config: QueryConfig) -> Self {
        Self { logs, config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// The whole merged log as of now. The returned snapshot iterates lazily
    /// in merge-key order and can be iterated again from the start.
    pub fn full(&self, trial_id: TrialId) -> Result<LogSnapshot> {
        Ok(self.logs.get(trial_id)?.snapshot())
    }

    /// First `n` records in merge-key order, or all of them if fewer exist.
    pub fn head(&self, trial_id: TrialId, n: usize) -> Result<Vec<Arc<LogRecord>>> {
        Ok(self.full(trial_id)?.head(n))
    }

    /// Last `n` records of a snapshot taken now. Later appends are excluded.
    pub fn tail(&self, trial_id: TrialId, n: usize) -> Result<Vec<Arc<LogRecord>>> {
        Ok(self.full(trial_id)?.tail(n))
    }

    pub fn select(&self, trial_id: TrialId, selection: LogSelection) -> Result<Vec<Arc<LogRecord>>> {
        let snapshot = self.full(trial_id)?;
        Ok(match selection {
            LogSelection::Full => snapshot.iter().collect(),
            LogSelection::Head(n) => snapshot.head(n),
            LogSelection::Tail(n) => snapshot.tail(n),
        })
    }

    /// Wait until some record's payload contains `needle`.
    ///
    /// Returns `Ok(true)` as soon as a match is ingested and `Ok(false)` once
    /// the log is sealed and every record has been checked. If the log is
    /// still open when `timeout` elapses the result is
    /// [`TrialhubError::Timeout`].
    pub async fn contains(
        &self,
        trial_id: TrialId,
        needle: &[u8],
        timeout: Duration,
    ) -> Result<bool> {
        let log = self.logs.get(trial_id)?;
        let mut progress = log.subscribe();
        let deadline = Instant::now() + timeout;
        let mut scanned = 0usize;

        loop {
            let seen = *progress.borrow_and_update();
            let fresh = log.arrivals(scanned, usize::MAX);
            scanned += fresh.len();
            if fresh.iter().any(|r| r.payload_contains(needle)) {
                debug!(trial_id = %trial_id, scanned, "contains matched");
                return Ok(true);
            }
            if seen.sealed && scanned >= seen.appended {
                return Ok(false);
            }

            match tokio::time::timeout_at(deadline, progress.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(TrialhubError::Closed(format!("log for trial {}", trial_id)))
                }
                Err(_) => {
                    return Err(TrialhubError::Timeout(format!(
                        "no match in trial {} after {:?} ({} records scanned)",
                        trial_id, timeout, scanned
                    )))
                }
            }
        }
    }

    /// [`contains`](Self::contains) with the configured default timeout.
    pub async fn contains_default(&self, trial_id: TrialId, needle: &[u8]) -> Result<bool> {
        self.contains(trial_id, needle, self.config.default_contains_timeout())
            .await
    }

    /// Stream every record of the trial in arrival order, waiting for new
    /// ones until the log is sealed or `cancel` fires.
    pub fn follow(&self, trial_id: TrialId, cancel: CancellationToken) -> Result<LogFollower> {
        let log = self.logs.get(trial_id)?;
        Ok(LogFollower::new(log, cancel, self.config.follow_batch_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialhub_core::IngestConfig;
    use trialhub_storage::IngestPipeline;

    fn service(dir: &std::path::Path) -> (Arc<LogStore>, LogQueryService) {
        let logs = Arc::new(LogStore::open(dir, false).unwrap());
        let service = LogQueryService::new(Arc::clone(&logs), QueryConfig::default());
        (logs, service)
    }

    #[tokio::test]
    async fn test_unknown_trial_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_logs, service) = service(dir.path());
        assert!(service.head(TrialId(9), 1).unwrap_err().is_not_found());
        assert!(service
            .contains(TrialId(9), b"x", Duration::from_millis(10))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_contains_waits_for_ingestion() {
        let dir = tempfile::tempdir().unwrap();
        let (logs, service) = service(dir.path());
        let pipeline = IngestPipeline::open(logs.create(TrialId(1)).unwrap(), 2, &IngestConfig::default());

        let mut writer = pipeline.writer(1).unwrap();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write("finished train_batch for rank 1").await.unwrap();
        });

        assert!(service
            .contains(TrialId(1), b"finished train_batch for rank 1", Duration::from_secs(5))
            .await
            .unwrap());
        producer.await.unwrap();
        pipeline.seal().await.unwrap();
    }

    #[tokio::test]
    async fn test_contains_on_sealed_log_without_match() {
        let dir = tempfile::tempdir().unwrap();
        let (logs, service) = service(dir.path());
        let pipeline = IngestPipeline::open(logs.create(TrialId(1)).unwrap(), 1, &IngestConfig::default());
        pipeline.writer(0).unwrap().write("hello").await.unwrap();
        pipeline.seal().await.unwrap();

        assert!(!service
            .contains(TrialId(1), b"goodbye", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_contains_times_out_on_open_log() {
        let dir = tempfile::tempdir().unwrap();
        let (logs, service) = service(dir.path());
        let _log = logs.create(TrialId(1)).unwrap();

        let err = service
            .contains(TrialId(1), b"never", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TrialhubError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_select_modes() {
        let dir = tempfile::tempdir().unwrap();
        let (logs, service) = service(dir.path());
        let pipeline = IngestPipeline::open(logs.create(TrialId(1)).unwrap(), 1, &IngestConfig::default());
        let writer = pipeline.writer(0).unwrap();
        for seq in 0..5u64 {
            writer.submit(seq, 100 + seq, vec![b'a' + seq as u8]).await.unwrap();
        }
        pipeline.seal().await.unwrap();

        let payloads = |records: Vec<Arc<LogRecord>>| -> Vec<u8> {
            records.iter().map(|r| r.payload[0]).collect()
        };
        assert_eq!(payloads(service.select(TrialId(1), LogSelection::Full).unwrap()), b"abcde");
        assert_eq!(payloads(service.select(TrialId(1), LogSelection::Head(2)).unwrap()), b"ab");
        assert_eq!(payloads(service.select(TrialId(1), LogSelection::Tail(2)).unwrap()), b"de");
        assert_eq!(payloads(service.select(TrialId(1), LogSelection::Tail(50)).unwrap()), b"abcde");
    }
}
