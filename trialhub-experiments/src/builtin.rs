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

//! Built-in trial definitions.
//!
//! `no_op` trains nothing. It exists so that the orchestration paths (rank
//! fan-out, log ingestion, failure propagation, test mode) can be exercised
//! without real training code. Hyperparameters:
//!
//! | name                | effect                                             |
//! |---------------------|----------------------------------------------------|
//! | `write_null`        | also emit a payload with an embedded NUL byte      |
//! | `fail_on_construct` | construction fails                                 |
//! | `fail_on_batch`     | rank 0 fails when it reaches that batch            |

use trialhub_core::{
    DefinitionError, LogSink, RankIndex, TrialContext, TrialDefinition, TrialInstance,
};

pub struct NoOpDefinition;

impl NoOpDefinition {
    pub const ENTRYPOINT: &'static str = "no_op";
}

impl TrialDefinition for NoOpDefinition {
    fn construct(&self, ctx: &TrialContext) -> Result<Box<dyn TrialInstance>, DefinitionError> {
        let flag = |name: &str| {
            ctx.config
                .hyperparameter(name)
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        };

        if flag("fail_on_construct") {
            return Err(DefinitionError::new(format!(
                "no_op construction failed on rank {}: fail_on_construct is set",
                ctx.rank
            )));
        }

        Ok(Box::new(NoOpTrial {
            rank: ctx.rank,
            write_null: flag("write_null"),
            fail_on_batch: ctx
                .config
                .hyperparameter("fail_on_batch")
                .and_then(|v| v.as_u64()),
        }))
    }
}

struct NoOpTrial {
    rank: RankIndex,
    write_null: bool,
    fail_on_batch: Option<u64>,
}

impl TrialInstance for NoOpTrial {
    fn train_batch(&mut self, batch: u64, sink: &mut dyn LogSink) -> Result<(), DefinitionError> {
        if batch == 0 {
            sink.emit(format!("starting rank {}", self.rank).as_bytes());
        }
        if self.rank == 0 && self.fail_on_batch == Some(batch) {
            return Err(DefinitionError::new(format!(
                "train_batch failed at batch {}: fail_on_batch is set",
                batch
            )));
        }
        if self.write_null {
            let mut payload = format!("rank {} batch {} ", self.rank, batch).into_bytes();
            payload.extend_from_slice(b"before\0after");
            sink.emit(&payload);
        }
        sink.emit(format!("finished train_batch for rank {} (batch {})", self.rank, batch).as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use trialhub_core::{ExperimentConfig, ModelContext};

    fn ctx(hparams: serde_json::Value, rank: RankIndex) -> TrialContext {
        TrialContext {
            config: ExperimentConfig::new(json!({
                "entrypoint": "no_op",
                "hyperparameters": hparams,
            }))
            .unwrap(),
            context: Arc::new(ModelContext::new()),
            rank,
            rank_count: 2,
            test_mode: false,
        }
    }

    #[test]
    fn test_no_op_logs_per_batch() {
        let mut instance = NoOpDefinition.construct(&ctx(json!({}), 1)).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        instance.train_batch(0, &mut out).unwrap();
        instance.train_batch(1, &mut out).unwrap();

        assert_eq!(out[0], b"starting rank 1".to_vec());
        assert_eq!(out.len(), 3);
        assert!(out[2].starts_with(b"finished train_batch for rank 1"));
    }

    #[test]
    fn test_write_null_keeps_bytes_after_nul() {
        let mut instance = NoOpDefinition
            .construct(&ctx(json!({"write_null": true}), 0))
            .unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        instance.train_batch(0, &mut out).unwrap();
        assert!(out.iter().any(|p| p.ends_with(b"before\0after")));
    }

    #[test]
    fn test_failure_switches() {
        assert!(NoOpDefinition
            .construct(&ctx(json!({"fail_on_construct": true}), 0))
            .is_err());

        let mut rank0 = NoOpDefinition.construct(&ctx(json!({"fail_on_batch": 1}), 0)).unwrap();
        let mut rank1 = NoOpDefinition.construct(&ctx(json!({"fail_on_batch": 1}), 1)).unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        assert!(rank0.train_batch(0, &mut out).is_ok());
        assert!(rank0.train_batch(1, &mut out).is_err());
        assert!(rank1.train_batch(1, &mut out).is_ok());
    }
}
