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

//! Trial Supervisor
//!
//! Creates trials, tracks the exit of every rank and decides each trial's
//! terminal state:
//!
//! - `COMPLETED` once every rank reported success
//! - `ERRORED` as soon as any rank reports failure; remaining ranks are told
//!   to stop and are not waited for
//! - `CANCELED` when the trial is canceled from outside
//!
//! Whatever the outcome, the trial's ingestion pipeline is sealed (all queued
//! records flushed to the log) before the terminal state is recorded, so a
//! terminal trial always has a final, queryable log. Terminal transitions are
//! then announced on the [`TrialEvent`] channel.
//!
//! A trial can turn `ERRORED` while some of its ranks are still running. Each
//! rank's exit is tracked separately; [`TrialSupervisor::all_ranks_reported`]
//! tells whether anything is still outstanding, and the report that closes
//! the last rank of an already terminal trial emits one more event.

use crate::executor::{RankReporter, TrialExecutor, TrialLaunch};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use trialhub_core::{
    ExperimentConfig, ExperimentId, IngestConfig, ModelContext, RankExit, RankIndex, Result,
    TrialId, TrialRecord, TrialState, TrialhubError,
};
use trialhub_storage::{IngestPipeline, IngestStats, LogStore, MetadataStore};

/// What the supervisor hands out for a newly created trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialDescriptor {
    pub trial_id: TrialId,
    pub experiment_id: ExperimentId,
    pub rank_count: u32,
}

/// A trial reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialEvent {
    pub trial_id: TrialId,
    pub experiment_id: ExperimentId,
    pub state: TrialState,
}

/// Counts from a cascade delete of an experiment's trials.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrialPurgeStats {
    pub trials_deleted: u64,
    pub log_segments_deleted: u64,
    pub log_records_deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RankSlot {
    Pending,
    Started,
    Finished(RankExit),
}

struct TrialSlot {
    record: Mutex<TrialRecord>,
    ranks: Mutex<Vec<RankSlot>>,
    pipeline: Option<Arc<IngestPipeline>>,
    /// Set by whoever drives the trial to its terminal state.
    finishing: AtomicBool,
}

pub struct TrialSupervisor {
    metadata: Arc<MetadataStore>,
    logs: Arc<LogStore>,
    ingest: IngestConfig,
    executor: Arc<dyn TrialExecutor>,
    trials: DashMap<TrialId, Arc<TrialSlot>>,
    events: mpsc::UnboundedSender<TrialEvent>,
}

impl TrialSupervisor {
    pub fn new(
        metadata: Arc<MetadataStore>,
        logs: Arc<LogStore>,
        ingest: IngestConfig,
        executor: Arc<dyn TrialExecutor>,
    ) -> (Self, mpsc::UnboundedReceiver<TrialEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            metadata,
            logs,
            ingest,
            executor,
            trials: DashMap::new(),
            events,
        };
        (supervisor, rx)
    }

    /// Re-register persisted trials. Trials that were still running lost
    /// their ranks with the previous process and are marked `ERRORED`.
    /// Returns the experiments whose trials changed state.
    pub fn recover(&self, records: Vec<TrialRecord>) -> Result<Vec<ExperimentId>> {
        let mut touched = Vec::new();
        for mut record in records {
            if record.state == TrialState::Running {
                record.failure = Some("orchestrator restarted while the trial was running".into());
                record.finish(TrialState::Errored)?;
                self.metadata.put_trial(&record)?;
                warn!(
                    trial_id = %record.id,
                    experiment_id = %record.experiment_id,
                    "marked interrupted trial as errored"
                );
                if !touched.contains(&record.experiment_id) {
                    touched.push(record.experiment_id);
                }
            }
            self.register_persisted(record);
        }
        Ok(touched)
    }

    /// Register persisted trials exactly as stored, for a process that does
    /// not own the data directory. Nothing is written.
    pub fn attach(&self, records: Vec<TrialRecord>) {
        for record in records {
            self.register_persisted(record);
        }
    }

    fn register_persisted(&self, record: TrialRecord) {
        let exit = match record.state {
            TrialState::Completed => Some(RankExit::Success),
            TrialState::Running => None,
            _ => Some(RankExit::Failure("rank exit lost on restart".into())),
        };
        let ranks = match exit {
            Some(exit) => vec![RankSlot::Finished(exit); record.rank_count as usize],
            None => vec![RankSlot::Pending; record.rank_count as usize],
        };
        self.trials.insert(
            record.id,
            Arc::new(TrialSlot {
                record: Mutex::new(record),
                ranks: Mutex::new(ranks),
                pipeline: None,
                finishing: AtomicBool::new(true),
            }),
        );
    }

    /// Allocate a trial, open its log and ingestion pipeline and register
    /// `rank_count` rank slots. Must be called within a tokio runtime.
    pub fn create_trial(&self, experiment_id: ExperimentId, rank_count: u32) -> Result<TrialDescriptor> {
        let trial_id = self.metadata.allocate_trial_id();
        let record = TrialRecord::new(trial_id, experiment_id, rank_count)?;

        let log = self.logs.create(trial_id)?;
        let pipeline = IngestPipeline::open(log, rank_count, &self.ingest);
        self.metadata.put_trial(&record)?;

        self.trials.insert(
            trial_id,
            Arc::new(TrialSlot {
                record: Mutex::new(record),
                ranks: Mutex::new(vec![RankSlot::Pending; rank_count as usize]),
                pipeline: Some(pipeline),
                finishing: AtomicBool::new(false),
            }),
        );

        info!(trial_id = %trial_id, experiment_id = %experiment_id, rank_count, "created trial");
        Ok(TrialDescriptor {
            trial_id,
            experiment_id,
            rank_count,
        })
    }

    /// Create `count` trials. If one of them cannot be created, the ones
    /// already created are canceled and the error is returned.
    pub async fn create_trials(
        &self,
        experiment_id: ExperimentId,
        count: u32,
        rank_count: u32,
    ) -> Result<Vec<TrialDescriptor>> {
        let mut created = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.create_trial(experiment_id, rank_count) {
                Ok(trial) => created.push(trial),
                Err(e) => {
                    error!(
                        experiment_id = %experiment_id,
                        created = created.len(),
                        error = %e,
                        "trial creation failed, canceling created trials"
                    );
                    for trial in &created {
                        if let Err(cancel_error) = self.cancel_trial(trial.trial_id).await {
                            warn!(
                                trial_id = %trial.trial_id,
                                error = %cancel_error,
                                "failed to cancel partially created trial"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    /// Hand a created trial to the executor.
    pub async fn launch(
        self: &Arc<Self>,
        trial: TrialDescriptor,
        config: ExperimentConfig,
        context: Arc<ModelContext>,
    ) -> Result<()> {
        let pipeline = self.pipeline(trial.trial_id)?;
        let writers = (0..trial.rank_count)
            .map(|rank| pipeline.writer(rank))
            .collect::<Result<Vec<_>>>()?;

        let launch = TrialLaunch {
            trial,
            config,
            context,
            writers,
            reporter: RankReporter::new(Arc::clone(self), trial.trial_id),
        };
        if let Err(e) = self.executor.launch(launch).await {
            error!(trial_id = %trial.trial_id, error = %e, "trial launch failed");
            self.close_ranks(trial.trial_id, "launch failed")?;
            self.finish(trial.trial_id, TrialState::Errored, Some(format!("launch failed: {}", e)))
                .await?;
            return Err(e);
        }
        Ok(())
    }

    pub fn report_rank_started(&self, trial_id: TrialId, rank: RankIndex) -> Result<()> {
        let slot = self.slot(trial_id)?;
        let mut ranks = slot.ranks.lock();
        let entry = rank_slot(&mut ranks, trial_id, rank)?;
        if *entry == RankSlot::Pending {
            *entry = RankSlot::Started;
            debug!(trial_id = %trial_id, rank, "rank started");
        }
        Ok(())
    }

    /// Record a rank's exit. Repeated reports for the same rank are ignored.
    /// Returns the trial's state after the report.
    pub async fn report_rank_finished(
        &self,
        trial_id: TrialId,
        rank: RankIndex,
        exit: RankExit,
    ) -> Result<TrialState> {
        let slot = self.slot(trial_id)?;

        let (verdict, closed_last) = {
            let mut ranks = slot.ranks.lock();
            let entry = rank_slot(&mut ranks, trial_id, rank)?;
            if matches!(entry, RankSlot::Finished(_)) {
                debug!(trial_id = %trial_id, rank, "duplicate rank exit ignored");
                (None, false)
            } else {
                *entry = RankSlot::Finished(exit.clone());
                let closed_last = ranks.iter().all(|r| matches!(r, RankSlot::Finished(_)));
                let verdict = match &exit {
                    RankExit::Failure(reason) => {
                        warn!(trial_id = %trial_id, rank, reason = %reason, "rank failed");
                        Some((TrialState::Errored, Some(format!("rank {}: {}", rank, reason))))
                    }
                    RankExit::Success => {
                        let all_done = ranks
                            .iter()
                            .all(|r| matches!(r, RankSlot::Finished(RankExit::Success)));
                        all_done.then_some((TrialState::Completed, None))
                    }
                };
                (verdict, closed_last)
            }
        };

        if let Some((state, failure)) = verdict {
            self.finish(trial_id, state, failure).await?;
        } else if closed_last {
            let record = slot.record.lock().clone();
            if record.state.is_terminal() {
                debug!(trial_id = %trial_id, state = %record.state, "last rank of terminal trial reported");
                let _ = self.events.send(TrialEvent {
                    trial_id,
                    experiment_id: record.experiment_id,
                    state: record.state,
                });
            }
        }
        let state = slot.record.lock().state;
        Ok(state)
    }

    /// Whether every rank of the trial has exited. Unknown trials count as
    /// reported.
    pub fn all_ranks_reported(&self, trial_id: TrialId) -> bool {
        match self.trials.get(&trial_id) {
            Some(slot) => slot
                .ranks
                .lock()
                .iter()
                .all(|r| matches!(r, RankSlot::Finished(_))),
            None => true,
        }
    }

    /// Mark ranks that never started as finished. Started ranks still
    /// report their own exit.
    fn close_pending_ranks(&self, trial_id: TrialId, reason: &str) -> Result<()> {
        let slot = self.slot(trial_id)?;
        for entry in slot.ranks.lock().iter_mut() {
            if *entry == RankSlot::Pending {
                *entry = RankSlot::Finished(RankExit::Failure(reason.to_string()));
            }
        }
        Ok(())
    }

    /// Mark every rank without an exit as finished.
    fn close_ranks(&self, trial_id: TrialId, reason: &str) -> Result<()> {
        let slot = self.slot(trial_id)?;
        for entry in slot.ranks.lock().iter_mut() {
            if !matches!(entry, RankSlot::Finished(_)) {
                *entry = RankSlot::Finished(RankExit::Failure(reason.to_string()));
            }
        }
        Ok(())
    }

    pub async fn cancel_trial(&self, trial_id: TrialId) -> Result<()> {
        self.close_pending_ranks(trial_id, "canceled before start")?;
        self.finish(trial_id, TrialState::Canceled, None).await
    }

    /// Cancel every non-terminal trial of an experiment.
    pub async fn cancel_experiment_trials(&self, experiment_id: ExperimentId) -> Result<()> {
        for trial in self.trials_for(experiment_id) {
            if !trial.state.is_terminal() {
                self.cancel_trial(trial.id).await?;
            }
        }
        Ok(())
    }

    /// Drive a trial to a terminal state: stop ranks if needed, flush its
    /// logs, persist the record, announce it. Only the first caller does the
    /// work; later callers return immediately.
    ///
    /// If the logs cannot be sealed or the transition is refused, the trial
    /// stays non-terminal and a later call may try again. Once the
    /// transition is applied it is announced even if persisting it fails.
    async fn finish(&self, trial_id: TrialId, state: TrialState, failure: Option<String>) -> Result<()> {
        let slot = self.slot(trial_id)?;
        if slot.finishing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if state != TrialState::Completed {
            if let Err(e) = self.executor.stop(trial_id).await {
                warn!(trial_id = %trial_id, error = %e, "failed to stop ranks");
            }
        }

        if let Some(pipeline) = &slot.pipeline {
            if let Err(e) = pipeline.seal().await {
                error!(trial_id = %trial_id, error = %e, "failed to seal trial logs");
                slot.finishing.store(false, Ordering::Release);
                return Err(e);
            }
            let stats = pipeline.stats();
            debug!(
                trial_id = %trial_id,
                accepted = stats.accepted,
                rejected = stats.rejected(),
                "trial logs final"
            );
        }

        let record = {
            let mut record = slot.record.lock();
            let finished = record.finish(state);
            if let Err(e) = finished {
                drop(record);
                slot.finishing.store(false, Ordering::Release);
                return Err(e);
            }
            record.failure = failure;
            record.clone()
        };
        let persisted = self.metadata.put_trial(&record);
        match &persisted {
            Ok(()) => info!(
                trial_id = %trial_id,
                experiment_id = %record.experiment_id,
                state = %state,
                "trial finished"
            ),
            Err(e) => error!(
                trial_id = %trial_id,
                experiment_id = %record.experiment_id,
                state = %state,
                error = %e,
                "trial finished but its record was not persisted"
            ),
        }

        let _ = self.events.send(TrialEvent {
            trial_id,
            experiment_id: record.experiment_id,
            state,
        });
        persisted
    }

    pub fn get(&self, trial_id: TrialId) -> Result<TrialRecord> {
        Ok(self.slot(trial_id)?.record.lock().clone())
    }

    /// Trials of an experiment ordered by id.
    pub fn trials_for(&self, experiment_id: ExperimentId) -> Vec<TrialRecord> {
        let mut trials: Vec<_> = self
            .trials
            .iter()
            .map(|e| e.value().record.lock().clone())
            .filter(|r| r.experiment_id == experiment_id)
            .collect();
        trials.sort_by_key(|r| r.id);
        trials
    }

    /// Every experiment that owns at least one trial.
    pub fn experiment_ids(&self) -> Vec<ExperimentId> {
        let mut ids: Vec<_> = self
            .trials
            .iter()
            .map(|e| e.value().record.lock().experiment_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn pipeline(&self, trial_id: TrialId) -> Result<Arc<IngestPipeline>> {
        self.slot(trial_id)?
            .pipeline
            .clone()
            .ok_or_else(|| TrialhubError::InvalidState(format!("trial {} is no longer ingesting", trial_id)))
    }

    pub fn ingest_stats(&self, trial_id: TrialId) -> Result<Option<IngestStats>> {
        Ok(self.slot(trial_id)?.pipeline.as_ref().map(|p| p.stats()))
    }

    /// Cascade delete: cancel, then remove trial records and their logs.
    pub async fn purge_experiment(&self, experiment_id: ExperimentId) -> Result<TrialPurgeStats> {
        self.cancel_experiment_trials(experiment_id).await?;

        let mut stats = TrialPurgeStats::default();
        for trial in self.trials_for(experiment_id) {
            if let Ok(log) = self.logs.get(trial.id) {
                stats.log_records_deleted += log.len() as u64;
            }
            if self.logs.delete(trial.id)? {
                stats.log_segments_deleted += 1;
            }
            if self.metadata.delete_trial(trial.id)? {
                stats.trials_deleted += 1;
            }
            self.trials.remove(&trial.id);
        }
        info!(
            experiment_id = %experiment_id,
            trials = stats.trials_deleted,
            segments = stats.log_segments_deleted,
            records = stats.log_records_deleted,
            "purged experiment trials"
        );
        Ok(stats)
    }

    fn slot(&self, trial_id: TrialId) -> Result<Arc<TrialSlot>> {
        self.trials
            .get(&trial_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| TrialhubError::NotFound(format!("trial {}", trial_id)))
    }
}

fn rank_slot<'a>(ranks: &'a mut [RankSlot], trial_id: TrialId, rank: RankIndex) -> Result<&'a mut RankSlot> {
    let count = ranks.len();
    ranks.get_mut(rank as usize).ok_or_else(|| {
        TrialhubError::NotFound(format!(
            "rank {} of trial {} (rank count {})",
            rank, trial_id, count
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Executor that starts nothing and counts stop requests.
    #[derive(Default)]
    struct Inert {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl TrialExecutor for Inert {
        async fn launch(&self, _launch: TrialLaunch) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _trial_id: TrialId) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn supervisor(
        dir: &std::path::Path,
    ) -> (Arc<TrialSupervisor>, Arc<Inert>, mpsc::UnboundedReceiver<TrialEvent>) {
        let metadata = Arc::new(MetadataStore::open(dir).unwrap());
        let logs = Arc::new(LogStore::open(dir.join("logs"), false).unwrap());
        let executor = Arc::new(Inert::default());
        let (supervisor, events) =
            TrialSupervisor::new(metadata, logs, IngestConfig::default(), executor.clone());
        (Arc::new(supervisor), executor, events)
    }

    #[tokio::test]
    async fn test_completes_only_after_every_rank_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, executor, mut events) = supervisor(dir.path());
        let trial = sup.create_trial(ExperimentId(1), 3).unwrap();

        for rank in 0..3 {
            sup.report_rank_started(trial.trial_id, rank).unwrap();
            sup.report_rank_started(trial.trial_id, rank).unwrap();
        }
        assert_eq!(
            sup.report_rank_finished(trial.trial_id, 0, RankExit::Success).await.unwrap(),
            TrialState::Running
        );
        // Duplicate report of the same rank does not count twice.
        assert_eq!(
            sup.report_rank_finished(trial.trial_id, 0, RankExit::Success).await.unwrap(),
            TrialState::Running
        );
        sup.report_rank_finished(trial.trial_id, 1, RankExit::Success).await.unwrap();
        let state = sup
            .report_rank_finished(trial.trial_id, 2, RankExit::Success)
            .await
            .unwrap();
        assert_eq!(state, TrialState::Completed);

        let event = events.recv().await.unwrap();
        assert_eq!(event.state, TrialState::Completed);
        assert!(sup.get(trial.trial_id).unwrap().end_time.is_some());
        assert_eq!(executor.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_failure_errors_trial_after_draining_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, executor, mut events) = supervisor(dir.path());
        let trial = sup.create_trial(ExperimentId(1), 2).unwrap();

        let mut writer = sup.pipeline(trial.trial_id).unwrap().writer(1).unwrap();
        for i in 0..50 {
            writer.write(format!("line {}", i)).await.unwrap();
        }

        let state = sup
            .report_rank_finished(trial.trial_id, 1, RankExit::Failure("boom".into()))
            .await
            .unwrap();
        assert_eq!(state, TrialState::Errored);
        assert_eq!(executor.stops.load(Ordering::SeqCst), 1);

        // Logs were flushed before the terminal state became visible.
        let pipeline = sup.pipeline(trial.trial_id).unwrap();
        assert!(pipeline.is_sealed());
        assert_eq!(pipeline.log().len(), 50);

        let record = sup.get(trial.trial_id).unwrap();
        assert!(record.failure.unwrap().contains("boom"));
        assert_eq!(events.recv().await.unwrap().state, TrialState::Errored);

        // The straggler's late success changes nothing.
        let state = sup
            .report_rank_finished(trial.trial_id, 0, RankExit::Success)
            .await
            .unwrap();
        assert_eq!(state, TrialState::Errored);
    }

    #[tokio::test]
    async fn test_unknown_trial_and_rank() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _executor, _events) = supervisor(dir.path());
        assert!(sup.report_rank_started(TrialId(42), 0).unwrap_err().is_not_found());
        let trial = sup.create_trial(ExperimentId(1), 1).unwrap();
        assert!(sup.report_rank_started(trial.trial_id, 1).unwrap_err().is_not_found());
        assert!(sup.create_trial(ExperimentId(1), 0).is_err());
    }

    #[tokio::test]
    async fn test_purge_removes_records_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _executor, _events) = supervisor(dir.path());
        let a = sup.create_trial(ExperimentId(1), 1).unwrap();
        let b = sup.create_trial(ExperimentId(2), 1).unwrap();
        sup.pipeline(a.trial_id).unwrap().writer(0).unwrap().write("x").await.unwrap();

        let stats = sup.purge_experiment(ExperimentId(1)).await.unwrap();
        assert_eq!(stats.trials_deleted, 1);
        assert_eq!(stats.log_segments_deleted, 1);
        assert_eq!(stats.log_records_deleted, 1);
        assert!(sup.get(a.trial_id).unwrap_err().is_not_found());
        assert!(sup.get(b.trial_id).is_ok());
    }

    #[tokio::test]
    async fn test_recover_marks_running_trials_errored() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let mut done = TrialRecord::new(TrialId(1), ExperimentId(1), 1).unwrap();
        done.finish(TrialState::Completed).unwrap();
        let running = TrialRecord::new(TrialId(2), ExperimentId(3), 2).unwrap();

        let (sup, _executor, _events) = supervisor(dir.path());
        let touched = sup.recover(vec![done, running]).unwrap();
        assert_eq!(touched, vec![ExperimentId(3)]);
        assert_eq!(sup.get(TrialId(2)).unwrap().state, TrialState::Errored);
        assert_eq!(metadata.load_trials().unwrap()[0].state, TrialState::Errored);
        assert!(sup.all_ranks_reported(TrialId(1)));
        assert!(sup.all_ranks_reported(TrialId(2)));
    }

    #[tokio::test]
    async fn test_attach_leaves_records_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let running = TrialRecord::new(TrialId(7), ExperimentId(1), 2).unwrap();
        let (sup, _executor, _events) = supervisor(dir.path());
        sup.attach(vec![running]);

        assert_eq!(sup.get(TrialId(7)).unwrap().state, TrialState::Running);
        assert!(!sup.all_ranks_reported(TrialId(7)));
        assert!(sup.metadata.load_trials().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_errored_trial_waits_for_remaining_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _executor, mut events) = supervisor(dir.path());
        let trial = sup.create_trial(ExperimentId(1), 2).unwrap();

        sup.report_rank_finished(trial.trial_id, 0, RankExit::Failure("boom".into()))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().state, TrialState::Errored);
        assert!(!sup.all_ranks_reported(trial.trial_id));

        sup.report_rank_finished(trial.trial_id, 1, RankExit::Success)
            .await
            .unwrap();
        assert!(sup.all_ranks_reported(trial.trial_id));
        let event = events.recv().await.unwrap();
        assert_eq!(event.trial_id, trial.trial_id);
        assert_eq!(event.state, TrialState::Errored);
    }

    #[tokio::test]
    async fn test_unpersisted_finish_is_still_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _executor, mut events) = supervisor(dir.path());
        let trial = sup.create_trial(ExperimentId(1), 1).unwrap();
        std::fs::remove_dir_all(dir.path().join("trials")).unwrap();

        let result = sup
            .report_rank_finished(trial.trial_id, 0, RankExit::Failure("boom".into()))
            .await;
        assert!(result.is_err());
        assert_eq!(sup.get(trial.trial_id).unwrap().state, TrialState::Errored);
        assert_eq!(events.recv().await.unwrap().state, TrialState::Errored);
    }

    #[tokio::test]
    async fn test_partial_creation_cancels_created_trials() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, executor, _events) = supervisor(dir.path());
        // The second allocated id collides with an existing log.
        sup.logs.create(TrialId(2)).unwrap();

        assert!(sup.create_trials(ExperimentId(1), 3, 1).await.is_err());
        let trials = sup.trials_for(ExperimentId(1));
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].id, TrialId(1));
        assert_eq!(trials[0].state, TrialState::Canceled);
        assert!(sup.all_ranks_reported(TrialId(1)));
        assert_eq!(executor.stops.load(Ordering::SeqCst), 1);
    }
}
