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

//! Live tail of a trial log.

use futures::stream::{BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use trialhub_core::{LogRecord, Result, TrialId, TrialhubError};
use trialhub_storage::{LogProgress, TrialLog};

/// Unbounded stream of a trial's records in arrival order.
///
/// Ends once the log is sealed and every record has been yielded, or as soon
/// as the cancellation token fires. Dropping the follower at any point is
/// safe; it holds no lock and never writes.
pub struct LogFollower {
    trial_id: TrialId,
    cancel: CancellationToken,
    inner: BoxStream<'static, Arc<LogRecord>>,
}

struct FollowState {
    log: Arc<TrialLog>,
    progress: watch::Receiver<LogProgress>,
    cancel: CancellationToken,
    cursor: usize,
    batch_size: usize,
    buffered: VecDeque<Arc<LogRecord>>,
}

impl LogFollower {
    pub(crate) fn new(log: Arc<TrialLog>, cancel: CancellationToken, batch_size: usize) -> Self {
        let trial_id = log.trial_id();
        let state = FollowState {
            progress: log.subscribe(),
            log,
            cancel: cancel.clone(),
            cursor: 0,
            batch_size: batch_size.max(1),
            buffered: VecDeque::new(),
        };
        let inner = futures::stream::unfold(state, next_record).boxed();
        Self {
            trial_id,
            cancel,
            inner,
        }
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    /// Stop the stream; the next poll returns `None`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next record, failing with [`TrialhubError::Timeout`] if nothing
    /// arrives in time. `Ok(None)` means the log is final.
    pub async fn next_within(&mut self, timeout: Duration) -> Result<Option<Arc<LogRecord>>> {
        tokio::time::timeout(timeout, self.inner.next())
            .await
            .map_err(|_| {
                TrialhubError::Timeout(format!(
                    "no new log output from trial {} within {:?}",
                    self.trial_id, timeout
                ))
            })
    }
}

impl Stream for LogFollower {
    type Item = Arc<LogRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

async fn next_record(mut state: FollowState) -> Option<(Arc<LogRecord>, FollowState)> {
    loop {
        if state.cancel.is_cancelled() {
            return None;
        }
        if let Some(record) = state.buffered.pop_front() {
            return Some((record, state));
        }

        let seen = *state.progress.borrow_and_update();
        let batch = state.log.arrivals(state.cursor, state.batch_size);
        if !batch.is_empty() {
            state.cursor += batch.len();
            state.buffered.extend(batch);
            continue;
        }
        if seen.sealed && state.cursor >= seen.appended {
            return None;
        }

        tokio::select! {
            _ = state.cancel.cancelled() => return None,
            changed = state.progress.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialhub_core::IngestConfig;
    use trialhub_storage::{IngestPipeline, LogStore};

    #[tokio::test]
    async fn test_follow_yields_live_records_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).unwrap();
        let log = store.create(TrialId(1)).unwrap();
        let pipeline = IngestPipeline::open(Arc::clone(&log), 1, &IngestConfig::default());
        let mut follower = LogFollower::new(log, CancellationToken::new(), 2);

        let mut writer = pipeline.writer(0).unwrap();
        writer.write("early").await.unwrap();
        let first = follower.next().await.unwrap();
        assert_eq!(first.payload, b"early".to_vec());

        let producer = tokio::spawn(async move {
            for i in 0..5 {
                writer.write(format!("line {}", i)).await.unwrap();
            }
            pipeline.seal().await.unwrap();
        });

        let rest: Vec<_> = follower.collect().await;
        producer.await.unwrap();
        assert_eq!(rest.len(), 5);
        assert_eq!(rest[4].payload, b"line 4".to_vec());
    }

    #[tokio::test]
    async fn test_cancel_ends_a_waiting_follower() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).unwrap();
        let log = store.create(TrialId(1)).unwrap();
        let token = CancellationToken::new();
        let mut follower = LogFollower::new(Arc::clone(&log), token.clone(), 16);

        let waiter = tokio::spawn(async move { follower.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert!(waiter.await.unwrap().is_none());

        // The log itself is untouched by the cancelled reader.
        log.append_batch(vec![LogRecord {
            trial_id: TrialId(1),
            rank: 0,
            seq: 0,
            timestamp_us: 1,
            payload: b"after".to_vec(),
        }])
        .unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_next_within_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), false).unwrap();
        let log = store.create(TrialId(1)).unwrap();
        let mut follower = LogFollower::new(log, CancellationToken::new(), 16);
        assert!(matches!(
            follower.next_within(Duration::from_millis(20)).await,
            Err(TrialhubError::Timeout(_))
        ));
    }
}
