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

//! Trial executors
//!
//! Placement of ranks onto hosts lives behind [`TrialExecutor`]. The
//! orchestrator hands an executor everything a trial needs (one log writer
//! per rank and a reporter for rank exits) and otherwise never looks at how
//! ranks run. [`LocalExecutor`] runs every rank on the blocking thread pool
//! of the current process.

use crate::registry::DefinitionRegistry;
use crate::supervisor::{TrialDescriptor, TrialSupervisor};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trialhub_core::{
    ExperimentConfig, ModelContext, RankExit, RankIndex, Result, TrialContext, TrialDefinition,
    TrialId,
};
use trialhub_storage::RankWriter;

/// Everything needed to start one trial.
pub struct TrialLaunch {
    pub trial: TrialDescriptor,
    pub config: ExperimentConfig,
    pub context: Arc<ModelContext>,
    /// One writer per rank, indexed by rank.
    pub writers: Vec<RankWriter>,
    pub reporter: RankReporter,
}

#[async_trait]
pub trait TrialExecutor: Send + Sync {
    /// Start every rank of the trial. Returns once the ranks are started;
    /// their exits arrive later through the launch's [`RankReporter`].
    async fn launch(&self, launch: TrialLaunch) -> Result<()>;

    /// Ask every rank of the trial to stop. Unknown trials are ignored.
    async fn stop(&self, trial_id: TrialId) -> Result<()>;
}

/// Channel from running ranks back to the supervisor.
#[derive(Clone)]
pub struct RankReporter {
    supervisor: Arc<TrialSupervisor>,
    trial_id: TrialId,
}

impl RankReporter {
    pub(crate) fn new(supervisor: Arc<TrialSupervisor>, trial_id: TrialId) -> Self {
        Self {
            supervisor,
            trial_id,
        }
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    pub fn started(&self, rank: RankIndex) -> Result<()> {
        self.supervisor.report_rank_started(self.trial_id, rank)
    }

    pub async fn finished(&self, rank: RankIndex, exit: RankExit) -> Result<()> {
        self.supervisor
            .report_rank_finished(self.trial_id, rank, exit)
            .await
            .map(|_| ())
    }
}

/// Runs ranks as blocking tasks in this process.
pub struct LocalExecutor {
    registry: Arc<DefinitionRegistry>,
    running: Arc<DashMap<TrialId, CancellationToken>>,
}

impl LocalExecutor {
    pub fn new(registry: Arc<DefinitionRegistry>) -> Self {
        Self {
            registry,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn running_trials(&self) -> usize {
        self.running.len()
    }
}

#[async_trait]
impl TrialExecutor for LocalExecutor {
    async fn launch(&self, launch: TrialLaunch) -> Result<()> {
        let TrialLaunch {
            trial,
            config,
            context,
            writers,
            reporter,
        } = launch;

        let token = CancellationToken::new();
        self.running.insert(trial.trial_id, token.clone());
        let remaining = Arc::new(AtomicUsize::new(writers.len()));
        let definition = self.registry.resolve(config.entrypoint());
        let batches = config.max_batches();

        info!(
            trial_id = %trial.trial_id,
            ranks = writers.len(),
            entrypoint = config.entrypoint(),
            "launching trial locally"
        );

        for writer in writers {
            let rank = writer.rank();
            let ctx = TrialContext {
                config: config.clone(),
                context: Arc::clone(&context),
                rank,
                rank_count: trial.rank_count,
                test_mode: false,
            };
            let definition = definition.as_ref().map(Arc::clone).map_err(|e| e.to_string());
            let reporter = reporter.clone();
            let token = token.clone();
            let remaining = Arc::clone(&remaining);
            let running = Arc::clone(&self.running);
            let trial_id = trial.trial_id;

            tokio::spawn(async move {
                if let Err(e) = reporter.started(rank) {
                    warn!(trial_id = %trial_id, rank, error = %e, "rank start not recorded");
                }

                let exit = match definition {
                    Err(import_error) => RankExit::Failure(import_error),
                    Ok(definition) => {
                        let handle = tokio::task::spawn_blocking(move || {
                            run_rank(definition.as_ref(), &ctx, writer, batches, &token)
                        });
                        match handle.await {
                            Ok(exit) => exit,
                            Err(join_error) => {
                                RankExit::Failure(format!("rank {} panicked: {}", rank, join_error))
                            }
                        }
                    }
                };

                debug!(trial_id = %trial_id, rank, ?exit, "rank exited");
                if let Err(e) = reporter.finished(rank, exit).await {
                    warn!(trial_id = %trial_id, rank, error = %e, "rank exit not recorded");
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    running.remove(&trial_id);
                }
            });
        }
        Ok(())
    }

    async fn stop(&self, trial_id: TrialId) -> Result<()> {
        if let Some(token) = self.running.get(&trial_id) {
            info!(trial_id = %trial_id, "stopping trial");
            token.cancel();
        }
        Ok(())
    }
}

fn run_rank(
    definition: &dyn TrialDefinition,
    ctx: &TrialContext,
    mut writer: RankWriter,
    batches: u64,
    token: &CancellationToken,
) -> RankExit {
    let mut instance = match definition.construct(ctx) {
        Ok(instance) => instance,
        Err(e) => return RankExit::Failure(e.to_string()),
    };
    for batch in 0..batches {
        if token.is_cancelled() {
            return RankExit::Failure(format!("rank {} stopped before batch {}", ctx.rank, batch));
        }
        if let Err(e) = instance.train_batch(batch, &mut writer) {
            return RankExit::Failure(e.to_string());
        }
    }
    RankExit::Success
}
