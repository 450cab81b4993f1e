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

//! Orchestrator
//!
//! Single entry point over the experiment manager, trial supervisor, log
//! query service and test-mode validator.
//!
//! ## Architecture
//!
//! ```text
//! create_experiment ──► TestModeValidator (test mode, nothing persisted)
//!        │
//!        ▼
//! ExperimentManager ──► TrialSupervisor ──► TrialExecutor (ranks)
//!        ▲                    │                   │
//!        │   TrialEvent       │                   ▼
//!        └──── settle ◄───────┘            IngestPipeline ──► LogStore
//!                                                              │
//!                                         LogQueryService ◄────┘
//! ```
//!
//! Terminal trial events are consumed by a background task that applies the
//! experiment completion rule. Compound operations on one experiment
//! (spawning trials, cancel, delete) are serialized by a per-experiment
//! async lock.
//!
//! ## Ownership
//!
//! The first orchestrator to open a data directory holds its `LOCK` file and
//! runs recovery. Any other process opening the same directory while the
//! lock is held gets a read-only view: persisted state as it was at open,
//! no recovery, and every mutating operation fails with `InvalidState`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::open(TrialhubConfig::default(), registry).await?;
//! let outcome = orchestrator.create_experiment(request).await?;
//! ```

use crate::executor::{LocalExecutor, TrialExecutor};
use crate::manager::{ExperimentManager, TrialsOutcome};
use crate::registry::DefinitionRegistry;
use crate::supervisor::{TrialEvent, TrialPurgeStats, TrialSupervisor};
use crate::validator::{TestModeValidator, ValidationReport};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trialhub_core::{
    ExperimentConfig, ExperimentId, ExperimentRecord, ExperimentState, LogRecord, ModelContext,
    Result, TrialId, TrialRecord, TrialState, TrialhubConfig, TrialhubError,
};
use trialhub_query::{LogFollower, LogQueryService, LogSelection};
use trialhub_storage::{DataDirLock, LockAttempt, LogSnapshot, LogStore, MetadataStore};

/// Everything needed to create an experiment.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub config: ExperimentConfig,
    pub context: ModelContext,
    pub owner: String,
    /// Create in `PAUSED` without spawning trials.
    pub paused: bool,
    /// Only validate the trial definition; persist nothing.
    pub test_mode: bool,
}

impl CreateRequest {
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            config,
            context: ModelContext::new(),
            owner: "trialhub".to_string(),
            paused: false,
            test_mode: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(ExperimentRecord),
    /// Test mode passed; carries the success message.
    Validated(String),
}

/// Trial line inside [`ExperimentView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialSummary {
    pub id: TrialId,
    pub state: TrialState,
    pub rank_count: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&TrialRecord> for TrialSummary {
    fn from(record: &TrialRecord) -> Self {
        Self {
            id: record.id,
            state: record.state,
            rank_count: record.rank_count,
            start_time: record.start_time,
            end_time: record.end_time,
            failure: record.failure.clone(),
        }
    }
}

/// Point-in-time description of an experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentView {
    pub id: ExperimentId,
    pub state: ExperimentState,
    pub archived: bool,
    pub labels: BTreeSet<String>,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub revision: u64,
    pub config: ExperimentConfig,
    pub trials: Vec<TrialSummary>,
}

/// Counts from deleting an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExperimentDeleteStats {
    pub experiment_id: ExperimentId,
    pub trials_deleted: u64,
    pub log_segments_deleted: u64,
    pub log_records_deleted: u64,
}

pub struct Orchestrator {
    config: TrialhubConfig,
    metadata: Arc<MetadataStore>,
    manager: Arc<ExperimentManager>,
    supervisor: Arc<TrialSupervisor>,
    query: LogQueryService,
    validator: TestModeValidator,
    ops: DashMap<ExperimentId, Arc<tokio::sync::Mutex<()>>>,
    events_task: tokio::task::JoinHandle<()>,
    access: Access,
}

enum Access {
    Owner(DataDirLock),
    /// Another process holds the lock.
    ReadOnly { holder: Option<u32> },
}

impl Orchestrator {
    /// Open the data directory with ranks running in this process.
    pub async fn open(config: TrialhubConfig, registry: Arc<DefinitionRegistry>) -> Result<Arc<Self>> {
        let executor = Arc::new(LocalExecutor::new(Arc::clone(&registry)));
        Self::open_with_executor(config, registry, executor).await
    }

    /// Open the data directory, recover persisted state and resume any
    /// active experiment whose trials were never spawned. If another
    /// process owns the directory the orchestrator opens read-only.
    pub async fn open_with_executor(
        config: TrialhubConfig,
        registry: Arc<DefinitionRegistry>,
        executor: Arc<dyn TrialExecutor>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let data_dir = config.storage.data_dir.clone();
        let (access, metadata, logs) = match DataDirLock::try_acquire(&data_dir)? {
            LockAttempt::Acquired(lock) => (
                Access::Owner(lock),
                MetadataStore::open(&data_dir)?,
                LogStore::open(data_dir.join("logs"), config.storage.sync_on_seal)?,
            ),
            LockAttempt::HeldBy(holder) => {
                warn!(
                    data_dir = %data_dir.display(),
                    holder = ?holder,
                    "data directory in use by another process, opening read-only"
                );
                (
                    Access::ReadOnly { holder },
                    MetadataStore::open_read_only(&data_dir)?,
                    LogStore::open_read_only(data_dir.join("logs"))?,
                )
            }
        };
        let metadata = Arc::new(metadata);
        let logs = Arc::new(logs);

        let manager = Arc::new(ExperimentManager::load(Arc::clone(&metadata))?);
        let (supervisor, events) = TrialSupervisor::new(
            Arc::clone(&metadata),
            Arc::clone(&logs),
            config.ingest.clone(),
            executor,
        );
        let supervisor = Arc::new(supervisor);
        let touched = match access {
            Access::Owner(_) => supervisor.recover(metadata.load_trials()?)?,
            Access::ReadOnly { .. } => {
                supervisor.attach(metadata.load_trials()?);
                Vec::new()
            }
        };

        let events_task = tokio::spawn(settle_on_events(
            Arc::clone(&manager),
            Arc::clone(&supervisor),
            events,
        ));

        let orchestrator = Arc::new(Self {
            query: LogQueryService::new(Arc::clone(&logs), config.query.clone()),
            validator: TestModeValidator::new(registry, config.validator.clone()),
            config,
            metadata,
            manager,
            supervisor,
            ops: DashMap::new(),
            events_task,
            access,
        });
        if !orchestrator.is_read_only() {
            orchestrator.recover(&logs, touched).await?;
        }
        info!(
            data_dir = %data_dir.display(),
            experiments = orchestrator.manager.list().len(),
            read_only = orchestrator.is_read_only(),
            "orchestrator ready"
        );
        Ok(orchestrator)
    }

    async fn recover(&self, logs: &LogStore, touched: Vec<ExperimentId>) -> Result<()> {
        for experiment_id in self.supervisor.experiment_ids() {
            if !self.manager.contains(experiment_id) {
                warn!(experiment_id = %experiment_id, "purging trials of missing experiment");
                self.supervisor.purge_experiment(experiment_id).await?;
            }
        }
        for trial_id in logs.trial_ids() {
            if self.supervisor.get(trial_id).is_err() {
                warn!(trial_id = %trial_id, "deleting log without trial record");
                logs.delete(trial_id)?;
            }
        }

        for experiment_id in touched {
            if self.manager.contains(experiment_id) {
                settle(&self.manager, &self.supervisor, experiment_id);
            }
        }

        for record in self.manager.list() {
            if record.state == ExperimentState::Active && !record.trials_spawned {
                info!(experiment_id = %record.id, "resuming experiment without trials");
                let context = self.metadata.load_context(record.id)?;
                self.spawn_trials(&record, Arc::new(context)).await?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &TrialhubConfig {
        &self.config
    }

    /// Whether another process owns the data directory.
    pub fn is_read_only(&self) -> bool {
        matches!(self.access, Access::ReadOnly { .. })
    }

    /// The lock file held by this orchestrator, if it owns the directory.
    pub fn lock_path(&self) -> Option<&std::path::Path> {
        match &self.access {
            Access::Owner(lock) => Some(lock.path()),
            Access::ReadOnly { .. } => None,
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match &self.access {
            Access::Owner(_) => Ok(()),
            Access::ReadOnly { holder: Some(pid) } => Err(TrialhubError::InvalidState(format!(
                "data directory in use by process {}; opened read-only",
                pid
            ))),
            Access::ReadOnly { holder: None } => Err(TrialhubError::InvalidState(
                "data directory in use by another process; opened read-only".into(),
            )),
        }
    }

    pub fn query(&self) -> &LogQueryService {
        &self.query
    }

    pub fn manager(&self) -> &ExperimentManager {
        &self.manager
    }

    pub fn supervisor(&self) -> &Arc<TrialSupervisor> {
        &self.supervisor
    }

    /// Create an experiment, or in test mode only validate its definition.
    ///
    /// Test mode never writes an experiment, trial or log; a failed
    /// validation is a `ValidationError` carrying the diagnostic.
    pub async fn create_experiment(&self, request: CreateRequest) -> Result<CreateOutcome> {
        let CreateRequest {
            config,
            context,
            owner,
            paused,
            test_mode,
        } = request;

        if test_mode {
            let report = self
                .validator
                .validate(&config, Arc::new(context), CancellationToken::new())
                .await?;
            if let ValidationReport::Failed { diagnostic } = &report {
                debug!(diagnostic = %diagnostic, "test mode rejected experiment");
            }
            return report.into_result().map(CreateOutcome::Validated);
        }

        self.ensure_writable()?;
        let record = self.manager.create(config, owner, paused)?;
        if let Err(e) = self.metadata.put_context(record.id, &context) {
            error!(experiment_id = %record.id, error = %e, "failed to persist model context");
            if let Err(rollback) = self.manager.remove(record.id) {
                warn!(
                    experiment_id = %record.id,
                    error = %rollback,
                    "failed to remove experiment after context write failed"
                );
            }
            return Err(e);
        }

        if !paused {
            let lock = self.op_lock(record.id);
            let _guard = lock.lock().await;
            self.spawn_trials(&record, Arc::new(context)).await?;
        }
        Ok(CreateOutcome::Created(self.manager.get(record.id)?))
    }

    /// Create every trial of the experiment, mark the experiment as having
    /// trials, then launch them. Caller holds the experiment's op lock.
    /// Does nothing unless the experiment is still active without trials.
    async fn spawn_trials(&self, record: &ExperimentRecord, context: Arc<ModelContext>) -> Result<()> {
        let current = self.manager.get(record.id)?;
        if current.state != ExperimentState::Active || current.trials_spawned {
            debug!(
                experiment_id = %record.id,
                state = %current.state,
                trials_spawned = current.trials_spawned,
                "skipping trial spawn"
            );
            return Ok(());
        }

        let trials = self
            .supervisor
            .create_trials(
                record.id,
                record.config.max_trials(),
                record.config.slots_per_trial(),
            )
            .await?;
        self.manager.mark_trials_spawned(record.id)?;

        for trial in trials {
            if let Err(e) = self
                .supervisor
                .launch(trial, record.config.clone(), Arc::clone(&context))
                .await
            {
                warn!(experiment_id = %record.id, trial_id = %trial.trial_id, error = %e, "trial did not launch");
            }
        }
        settle(&self.manager, &self.supervisor, record.id);
        Ok(())
    }

    pub fn describe(&self, id: ExperimentId) -> Result<ExperimentView> {
        let record = self.manager.get(id)?;
        Ok(self.view(record))
    }

    pub fn list_experiments(&self) -> Vec<ExperimentView> {
        self.manager
            .list()
            .into_iter()
            .map(|record| self.view(record))
            .collect()
    }

    fn view(&self, record: ExperimentRecord) -> ExperimentView {
        let trials = self
            .supervisor
            .trials_for(record.id)
            .iter()
            .map(TrialSummary::from)
            .collect();
        ExperimentView {
            id: record.id,
            state: record.state,
            archived: record.archived,
            labels: record.labels,
            owner: record.owner,
            created_at: record.created_at,
            revision: record.revision,
            config: record.config,
            trials,
        }
    }

    /// Delete an experiment with its trials, logs and context. Requires the
    /// administrative capability.
    pub async fn delete(&self, id: ExperimentId, admin: bool) -> Result<ExperimentDeleteStats> {
        if !admin {
            return Err(TrialhubError::InvalidState(format!(
                "deleting experiment {} requires the administrative capability",
                id
            )));
        }
        self.ensure_writable()?;
        let lock = self.op_lock(id);
        let guard = lock.lock().await;

        self.manager.remove(id)?;
        let TrialPurgeStats {
            trials_deleted,
            log_segments_deleted,
            log_records_deleted,
        } = self.supervisor.purge_experiment(id).await?;

        drop(guard);
        self.ops.remove(&id);
        Ok(ExperimentDeleteStats {
            experiment_id: id,
            trials_deleted,
            log_segments_deleted,
            log_records_deleted,
        })
    }

    pub fn archive(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.ensure_writable()?;
        self.manager.archive(id)
    }

    pub fn unarchive(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.ensure_writable()?;
        self.manager.unarchive(id)
    }

    /// Cancel the experiment and stop its running trials. Waits for a
    /// concurrent activation to finish spawning first.
    pub async fn cancel(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.ensure_writable()?;
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = self.manager.cancel(id)?;
        self.supervisor.cancel_experiment_trials(id).await?;
        Ok(record)
    }

    pub fn pause(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.ensure_writable()?;
        self.manager.pause(id)
    }

    /// Resume a paused experiment. Trials are spawned on the first
    /// activation; afterwards any deferred completion is applied.
    pub async fn activate(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.ensure_writable()?;
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = self.manager.activate(id)?;
        if !record.trials_spawned {
            let context = self.metadata.load_context(id)?;
            self.spawn_trials(&record, Arc::new(context)).await?;
        } else {
            settle(&self.manager, &self.supervisor, id);
        }
        self.manager.get(id)
    }

    pub fn add_label(&self, id: ExperimentId, label: &str) -> Result<ExperimentRecord> {
        self.ensure_writable()?;
        self.manager.add_label(id, label)
    }

    pub fn remove_label(&self, id: ExperimentId, label: &str) -> Result<ExperimentRecord> {
        self.ensure_writable()?;
        self.manager.remove_label(id, label)
    }

    pub fn list_trials(&self, id: ExperimentId) -> Result<Vec<TrialRecord>> {
        self.manager.get(id)?;
        Ok(self.supervisor.trials_for(id))
    }

    pub fn trial_logs(&self, trial_id: TrialId, selection: LogSelection) -> Result<Vec<Arc<LogRecord>>> {
        self.query.select(trial_id, selection)
    }

    pub fn full_logs(&self, trial_id: TrialId) -> Result<LogSnapshot> {
        self.query.full(trial_id)
    }

    pub async fn logs_contain(&self, trial_id: TrialId, needle: &[u8], timeout: Duration) -> Result<bool> {
        self.query.contains(trial_id, needle, timeout).await
    }

    pub fn follow_logs(&self, trial_id: TrialId, cancel: CancellationToken) -> Result<LogFollower> {
        self.query.follow(trial_id, cancel)
    }

    /// Wait until the experiment reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: ExperimentId, timeout: Duration) -> Result<ExperimentRecord> {
        let deadline = Instant::now() + timeout;
        let mut changes = self.manager.subscribe();
        loop {
            let record = self.manager.get(id)?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(TrialhubError::Closed("experiment manager shut down".into()))
                }
                Err(_) => {
                    return Err(TrialhubError::Timeout(format!(
                        "experiment {} still {} after {:?}",
                        id, record.state, timeout
                    )))
                }
            }
        }
    }

    fn op_lock(&self, id: ExperimentId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.ops.entry(id).or_default().value())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}

async fn settle_on_events(
    manager: Arc<ExperimentManager>,
    supervisor: Arc<TrialSupervisor>,
    mut events: mpsc::UnboundedReceiver<TrialEvent>,
) {
    while let Some(event) = events.recv().await {
        debug!(
            trial_id = %event.trial_id,
            experiment_id = %event.experiment_id,
            state = %event.state,
            "trial event"
        );
        settle(&manager, &supervisor, event.experiment_id);
    }
}

/// Apply the completion rule: once every trial is terminal and every rank
/// has exited, the experiment becomes `ERRORED` if any trial errored,
/// `COMPLETED` otherwise.
fn settle(manager: &ExperimentManager, supervisor: &TrialSupervisor, id: ExperimentId) {
    let record = match manager.get(id) {
        Ok(record) => record,
        Err(_) => return,
    };
    if record.state != ExperimentState::Active || !record.trials_spawned {
        return;
    }

    let trials = supervisor.trials_for(id);
    if trials.iter().any(|t| !t.state.is_terminal()) {
        return;
    }
    if let Some(waiting) = trials.iter().find(|t| !supervisor.all_ranks_reported(t.id)) {
        debug!(experiment_id = %id, trial_id = %waiting.id, "waiting for remaining ranks");
        return;
    }
    let outcome = if trials.is_empty() || trials.iter().any(|t| t.state == TrialState::Errored) {
        TrialsOutcome::SomeErrored
    } else {
        TrialsOutcome::AllCompleted
    };
    match manager.settle(id, outcome) {
        Ok(record) => debug!(experiment_id = %id, state = %record.state, "settled experiment"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(experiment_id = %id, error = %e, "failed to settle experiment"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open(dir: &std::path::Path) -> Arc<Orchestrator> {
        let config = TrialhubConfig::default().with_data_dir(dir);
        Orchestrator::open(config, Arc::new(DefinitionRegistry::with_builtins()))
            .await
            .unwrap()
    }

    fn request(raw: serde_json::Value) -> CreateRequest {
        CreateRequest::new(ExperimentConfig::new(raw).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_experiment_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let orch = open(dir.path()).await;

        let outcome = orch
            .create_experiment(request(json!({
                "entrypoint": "no_op",
                "resources": {"slots_per_trial": 2},
                "searcher": {"max_trials": 2}
            })))
            .await
            .unwrap();
        let CreateOutcome::Created(record) = outcome else {
            panic!("expected a created experiment");
        };

        let done = orch.wait_for_terminal(record.id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(done.state, ExperimentState::Completed);

        let view = orch.describe(record.id).unwrap();
        assert_eq!(view.trials.len(), 2);
        assert!(view.trials.iter().all(|t| t.state == TrialState::Completed && t.end_time.is_some()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_test_mode_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let orch = open(dir.path()).await;

        let mut req = request(json!({"entrypoint": "no_op"}));
        req.test_mode = true;
        match orch.create_experiment(req).await.unwrap() {
            CreateOutcome::Validated(message) => assert_eq!(message, "Model definition test succeeded"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(orch.list_experiments().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_requires_admin() {
        let dir = tempfile::tempdir().unwrap();
        let orch = open(dir.path()).await;

        let mut req = request(json!({"entrypoint": "no_op"}));
        req.paused = true;
        let CreateOutcome::Created(record) = orch.create_experiment(req).await.unwrap() else {
            panic!("expected a created experiment");
        };

        let err = orch.delete(record.id, false).await.unwrap_err();
        assert!(matches!(err, TrialhubError::InvalidState(_)));
        assert!(orch.describe(record.id).is_ok());

        let stats = orch.delete(record.id, true).await.unwrap();
        assert_eq!(stats.trials_deleted, 0);
        assert!(orch.describe(record.id).unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_for_terminal_times_out_while_paused() {
        let dir = tempfile::tempdir().unwrap();
        let orch = open(dir.path()).await;

        let mut req = request(json!({"entrypoint": "no_op"}));
        req.paused = true;
        let CreateOutcome::Created(record) = orch.create_experiment(req).await.unwrap() else {
            panic!("expected a created experiment");
        };
        let err = orch
            .wait_for_terminal(record.id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TrialhubError::Timeout(_)));
    }
}
