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


//! Trialhub Experiments
//!
//! Experiment lifecycle, trial supervision and test-mode validation, tied
//! together by the [`Orchestrator`].
//!
//! ## Architecture
//!
//! - [`ExperimentManager`]: lifecycle state machine, labels, archive flag
//! - [`TrialSupervisor`]: trials, rank exits, terminal trial states
//! - [`TrialExecutor`]: where ranks run; [`LocalExecutor`] runs them in-process
//! - [`TestModeValidator`]: construct-and-discard check of a trial definition
//! - [`DefinitionRegistry`]: entrypoint to trial definition lookup

pub mod builtin;
pub mod executor;
pub mod manager;
pub mod orchestrator;
pub mod registry;
pub mod supervisor;
pub mod validator;

pub use builtin::NoOpDefinition;
pub use executor::{LocalExecutor, RankReporter, TrialExecutor, TrialLaunch};
pub use manager::{ExperimentManager, TrialsOutcome};
pub use orchestrator::{
    CreateOutcome, CreateRequest, ExperimentDeleteStats, ExperimentView, Orchestrator,
    TrialSummary,
};
pub use registry::DefinitionRegistry;
pub use supervisor::{TrialDescriptor, TrialEvent, TrialPurgeStats, TrialSupervisor};
pub use validator::{TestModeValidator, ValidationReport, TEST_MODE_SUCCESS};
