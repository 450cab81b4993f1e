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

//! Experiment State Manager
//!
//! Owns experiment records: configuration, labels, lifecycle state and the
//! archived flag.
//!
//! **Concurrency:**
//! - Each experiment has its own lock. A mutation takes the lock, re-reads
//!   the current record, validates against it, persists and only then
//!   publishes the new version, so two racing requests are applied one after
//!   the other and the second one sees the first one's result.
//! - Every committed change bumps `revision`; readers get cloned snapshots.
//! - Deletion marks the entry dead under its lock, so a request that was
//!   waiting on the lock fails with `NotFound` instead of resurrecting it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use trialhub_core::{
    ExperimentConfig, ExperimentEvent, ExperimentId, ExperimentRecord, ExperimentState, Result,
    TrialhubError,
};
use trialhub_storage::MetadataStore;

struct ExperimentEntry {
    record: ExperimentRecord,
    deleted: bool,
}

/// Result of applying the trial-completion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialsOutcome {
    AllCompleted,
    SomeErrored,
}

pub struct ExperimentManager {
    metadata: Arc<MetadataStore>,
    entries: DashMap<ExperimentId, Arc<Mutex<ExperimentEntry>>>,
    changes: watch::Sender<u64>,
}

impl ExperimentManager {
    /// Load every persisted experiment.
    pub fn load(metadata: Arc<MetadataStore>) -> Result<Self> {
        let entries = DashMap::new();
        for record in metadata.load_experiments()? {
            record.check_invariants()?;
            entries.insert(
                record.id,
                Arc::new(Mutex::new(ExperimentEntry {
                    record,
                    deleted: false,
                })),
            );
        }
        info!(experiments = entries.len(), "loaded experiments");
        let (changes, _) = watch::channel(0);
        Ok(Self {
            metadata,
            entries,
            changes,
        })
    }

    pub fn create(
        &self,
        config: ExperimentConfig,
        owner: impl Into<String>,
        paused: bool,
    ) -> Result<ExperimentRecord> {
        let id = self.metadata.allocate_experiment_id();
        let record = ExperimentRecord::new(id, config, owner, paused);
        self.metadata.put_experiment(&record)?;
        self.entries.insert(
            id,
            Arc::new(Mutex::new(ExperimentEntry {
                record: record.clone(),
                deleted: false,
            })),
        );
        info!(experiment_id = %id, state = %record.state, "created experiment");
        self.notify();
        Ok(record)
    }

    pub fn get(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        let entry = self.entry(id)?;
        let guard = entry.lock();
        if guard.deleted {
            return Err(not_found(id));
        }
        Ok(guard.record.clone())
    }

    pub fn contains(&self, id: ExperimentId) -> bool {
        self.entries.contains_key(&id)
    }

    /// All live experiments ordered by id.
    pub fn list(&self) -> Vec<ExperimentRecord> {
        let entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut records: Vec<_> = entries
            .iter()
            .filter_map(|entry| {
                let guard = entry.lock();
                (!guard.deleted).then(|| guard.record.clone())
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn pause(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.transition(id, ExperimentEvent::Pause)
    }

    pub fn activate(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.transition(id, ExperimentEvent::Activate)
    }

    /// Cancel an active or paused experiment. Canceling an experiment that
    /// already reached a terminal state changes nothing.
    pub fn cancel(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.mutate(id, |record| {
            if record.state.is_terminal() {
                debug!(experiment_id = %record.id, state = %record.state, "cancel on terminal experiment ignored");
                return Ok(false);
            }
            record.state = record.state.transition(ExperimentEvent::Cancel)?;
            Ok(true)
        })
    }

    /// Apply the trial-completion rule. Deferred while paused; ignored once
    /// the experiment is terminal.
    pub fn settle(&self, id: ExperimentId, outcome: TrialsOutcome) -> Result<ExperimentRecord> {
        self.mutate(id, |record| {
            if record.state != ExperimentState::Active {
                debug!(
                    experiment_id = %record.id,
                    state = %record.state,
                    "trial completion rule deferred"
                );
                return Ok(false);
            }
            let event = match outcome {
                TrialsOutcome::AllCompleted => ExperimentEvent::TrialsCompleted,
                TrialsOutcome::SomeErrored => ExperimentEvent::TrialsErrored,
            };
            record.state = record.state.transition(event)?;
            Ok(true)
        })
    }

    /// Archive a terminal experiment. Archiving twice is a no-op.
    pub fn archive(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.mutate(id, |record| {
            if !record.state.is_terminal() {
                return Err(TrialhubError::InvalidState(format!(
                    "cannot archive experiment {} in state {}",
                    record.id, record.state
                )));
            }
            if record.archived {
                return Ok(false);
            }
            record.archived = true;
            Ok(true)
        })
    }

    pub fn unarchive(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.mutate(id, |record| {
            if !record.archived {
                return Ok(false);
            }
            record.archived = false;
            Ok(true)
        })
    }

    pub fn add_label(&self, id: ExperimentId, label: &str) -> Result<ExperimentRecord> {
        let label = label.trim();
        if label.is_empty() {
            return Err(TrialhubError::Validation("label must not be empty".into()));
        }
        self.mutate(id, |record| Ok(record.labels.insert(label.to_string())))
    }

    pub fn remove_label(&self, id: ExperimentId, label: &str) -> Result<ExperimentRecord> {
        let label = label.trim();
        self.mutate(id, |record| Ok(record.labels.remove(label)))
    }

    /// Record that the experiment's trials have been created.
    pub fn mark_trials_spawned(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        self.mutate(id, |record| {
            if record.trials_spawned {
                return Ok(false);
            }
            record.trials_spawned = true;
            Ok(true)
        })
    }

    /// Remove an experiment. A non-terminal experiment is canceled first.
    /// Returns the final record; later lookups fail with `NotFound`.
    pub fn remove(&self, id: ExperimentId) -> Result<ExperimentRecord> {
        let entry = self.entry(id)?;
        let mut guard = entry.lock();
        if guard.deleted {
            return Err(not_found(id));
        }

        let mut last = guard.record.clone();
        if !last.state.is_terminal() {
            last.state = last.state.transition(ExperimentEvent::Cancel)?;
            last.revision += 1;
            info!(experiment_id = %id, "canceled experiment ahead of deletion");
        }

        self.metadata.delete_experiment(id)?;
        self.metadata.delete_context(id)?;
        guard.record = last.clone();
        guard.deleted = true;
        self.entries.remove(&id);
        drop(guard);

        info!(experiment_id = %id, "deleted experiment");
        self.notify();
        Ok(last)
    }

    /// Watch for committed changes to any experiment.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn transition(&self, id: ExperimentId, event: ExperimentEvent) -> Result<ExperimentRecord> {
        self.mutate(id, |record| {
            record.state = record.state.transition(event)?;
            Ok(true)
        })
    }

    /// Run `change` on a copy of the current record under the experiment's
    /// lock. When it reports a change the copy is persisted and published
    /// with the next revision; on error nothing is committed.
    fn mutate<F>(&self, id: ExperimentId, change: F) -> Result<ExperimentRecord>
    where
        F: FnOnce(&mut ExperimentRecord) -> Result<bool>,
    {
        let entry = self.entry(id)?;
        let mut guard = entry.lock();
        if guard.deleted {
            return Err(not_found(id));
        }

        let mut next = guard.record.clone();
        if !change(&mut next)? {
            return Ok(next);
        }
        next.revision += 1;
        next.check_invariants()?;
        self.metadata.put_experiment(&next)?;

        debug!(
            experiment_id = %id,
            revision = next.revision,
            state = %next.state,
            archived = next.archived,
            "experiment updated"
        );
        if guard.record.state != next.state {
            info!(
                experiment_id = %id,
                from = %guard.record.state,
                to = %next.state,
                "experiment state transition"
            );
        }
        guard.record = next.clone();
        drop(guard);
        self.notify();
        Ok(next)
    }

    fn entry(&self, id: ExperimentId) -> Result<Arc<Mutex<ExperimentEntry>>> {
        self.entries
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| not_found(id))
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n += 1);
    }
}

fn not_found(id: ExperimentId) -> TrialhubError {
    TrialhubError::NotFound(format!("experiment {}", id))
}
