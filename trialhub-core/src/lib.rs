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

//! Trialhub Core
//!
//! Data model shared by the storage, query and orchestration crates:
//! experiments, trials, log records, the trial definition capability,
//! configuration and the error taxonomy.

pub mod config;
pub mod definition;
pub mod error;
pub mod experiment;
pub mod ids;
pub mod log;
pub mod trial;

pub use config::{
    IngestConfig, QueryConfig, SecurityConfig, StorageConfig, TrialhubConfig, ValidatorConfig,
    DEFAULT_ADMIN_ENV_VAR, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_PAYLOAD_BYTES,
};
pub use definition::{
    DefinitionError, LogSink, ModelContext, TrialContext, TrialDefinition, TrialInstance,
};
pub use error::{ErrorKind, Result, TrialhubError};
pub use experiment::{ExperimentConfig, ExperimentEvent, ExperimentRecord, ExperimentState};
pub use ids::{ExperimentId, RankIndex, TrialId};
pub use log::{contains_bytes, now_micros, LogRecord, MergeKey};
pub use trial::{RankExit, TrialRecord, TrialState};
