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

//! Trialhub Storage Layer
//!
//! File-backed persistence for experiment metadata and trial logs.
//!
//! ## Architecture
//!
//! - **Metadata**: one JSON document per experiment and per trial, replaced
//!   atomically on every change.
//! - **Logs**: one append-only segment per trial with CRC-framed records and
//!   an in-memory index serving snapshot reads.
//! - **Ingestion**: a bounded, per-trial queue that sequences and batches
//!   rank output into the trial's log.
//! - **Ownership**: a `LOCK` file marks the process that may write the data
//!   directory; other processes open the stores read-only.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use trialhub_storage::{IngestPipeline, LogStore};
//!
//! let store = LogStore::open("./data/logs", true)?;
//! let pipeline = IngestPipeline::open(store.create(trial_id)?, 2, &config.ingest);
//! let mut writer = pipeline.writer(0)?;
//! writer.write("starting rank 0").await?;
//! pipeline.seal().await?;
//! ```

pub mod lock;
pub mod log_store;
pub mod merge;
pub mod metadata_store;
pub mod pipeline;
pub mod segment;

pub use lock::{DataDirLock, LockAttempt};
pub use log_store::{LogProgress, LogSnapshot, LogStore, RankCursor, TrialLog};
pub use merge::KWayMerge;
pub use metadata_store::MetadataStore;
pub use pipeline::{IngestPipeline, IngestStats, RankWriter};
