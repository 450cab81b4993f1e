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

//! Test-Mode Validator
//!
//! Checks that a trial definition can be imported, constructed and run for
//! one batch, without touching any store: no experiment or trial record, no
//! log segment, a single rank whose output is captured in memory.
//!
//! The check runs on the blocking pool. A hung definition is abandoned when
//! the timeout or the caller's cancellation fires; the thread it occupies
//! keeps nothing but its own in-memory output.

use crate::registry::DefinitionRegistry;
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trialhub_core::{
    ExperimentConfig, ModelContext, Result, TrialContext, TrialhubError, ValidatorConfig,
};

pub const TEST_MODE_SUCCESS: &str = "Model definition test succeeded";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReport {
    Passed {
        message: String,
        /// Raw output of the smoke batch.
        output: Vec<Vec<u8>>,
    },
    Failed {
        diagnostic: String,
    },
}

impl ValidationReport {
    pub fn is_passed(&self) -> bool {
        matches!(self, ValidationReport::Passed { .. })
    }

    /// Failure as a `ValidationError`, success as `Ok(message)`.
    pub fn into_result(self) -> Result<String> {
        match self {
            ValidationReport::Passed { message, .. } => Ok(message),
            ValidationReport::Failed { diagnostic } => Err(TrialhubError::Validation(diagnostic)),
        }
    }
}

pub struct TestModeValidator {
    registry: Arc<DefinitionRegistry>,
    config: ValidatorConfig,
}

impl TestModeValidator {
    pub fn new(registry: Arc<DefinitionRegistry>, config: ValidatorConfig) -> Self {
        Self { registry, config }
    }

    /// Construct one instance of the configured entrypoint and run one batch.
    ///
    /// Definition failures (unknown entrypoint, construction error, batch
    /// error, panic) come back as [`ValidationReport::Failed`]. Running out
    /// of time is [`TrialhubError::Timeout`]; caller cancellation is
    /// [`TrialhubError::Closed`].
    pub async fn validate(
        &self,
        config: &ExperimentConfig,
        context: Arc<ModelContext>,
        cancel: CancellationToken,
    ) -> Result<ValidationReport> {
        let entrypoint = config.entrypoint().to_string();
        let definition = match self.registry.resolve(&entrypoint) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(entrypoint = %entrypoint, "test mode: import failed");
                return Ok(ValidationReport::Failed {
                    diagnostic: e.to_string(),
                });
            }
        };

        let ctx = TrialContext {
            config: config.clone(),
            context,
            rank: 0,
            rank_count: 1,
            test_mode: true,
        };
        let check = tokio::task::spawn_blocking(move || {
            let mut instance = definition
                .construct(&ctx)
                .map_err(|e| format!("trial construction failed: {}", e))?;
            let mut output: Vec<Vec<u8>> = Vec::new();
            instance
                .train_batch(0, &mut output)
                .map_err(|e| format!("smoke batch failed: {}", e))?;
            Ok::<_, String>(output)
        });

        let timeout = self.config.timeout();
        let report = tokio::select! {
            joined = check => match joined {
                Ok(Ok(output)) => ValidationReport::Passed {
                    message: TEST_MODE_SUCCESS.to_string(),
                    output,
                },
                Ok(Err(diagnostic)) => ValidationReport::Failed { diagnostic },
                Err(join_error) if join_error.is_panic() => ValidationReport::Failed {
                    diagnostic: format!(
                        "trial definition panicked: {}",
                        panic_message(join_error.into_panic())
                    ),
                },
                Err(join_error) => ValidationReport::Failed {
                    diagnostic: format!("validation task failed: {}", join_error),
                },
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(entrypoint = %entrypoint, ?timeout, "test mode: validation timed out");
                return Err(TrialhubError::Timeout(format!(
                    "validation of {} did not finish within {:?}",
                    entrypoint, timeout
                )));
            }
            _ = cancel.cancelled() => {
                return Err(TrialhubError::Closed("validation cancelled".into()));
            }
        };

        match &report {
            ValidationReport::Passed { .. } => info!(entrypoint = %entrypoint, "test mode: passed"),
            ValidationReport::Failed { diagnostic } => {
                warn!(entrypoint = %entrypoint, diagnostic = %diagnostic, "test mode: failed")
            }
        }
        Ok(report)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use trialhub_core::{DefinitionError, LogSink, TrialDefinition, TrialInstance};

    struct Panics;

    impl TrialDefinition for Panics {
        fn construct(&self, _ctx: &TrialContext) -> std::result::Result<Box<dyn TrialInstance>, DefinitionError> {
            panic!("exploded during construction");
        }
    }

    struct Hangs;

    struct HangingInstance;

    impl TrialDefinition for Hangs {
        fn construct(&self, _ctx: &TrialContext) -> std::result::Result<Box<dyn TrialInstance>, DefinitionError> {
            Ok(Box::new(HangingInstance))
        }
    }

    impl TrialInstance for HangingInstance {
        fn train_batch(&mut self, _batch: u64, _sink: &mut dyn LogSink) -> std::result::Result<(), DefinitionError> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(())
        }
    }

    fn validator(timeout_ms: u64) -> TestModeValidator {
        let registry = Arc::new(DefinitionRegistry::with_builtins());
        registry.register("panics", Arc::new(Panics));
        registry.register("hangs", Arc::new(Hangs));
        TestModeValidator::new(registry, ValidatorConfig { timeout_ms })
    }

    fn config(entrypoint: &str, hparams: serde_json::Value) -> ExperimentConfig {
        ExperimentConfig::new(json!({"entrypoint": entrypoint, "hyperparameters": hparams})).unwrap()
    }

    async fn run(v: &TestModeValidator, cfg: &ExperimentConfig) -> Result<ValidationReport> {
        v.validate(cfg, Arc::new(ModelContext::new()), CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_passes_valid_definition() {
        let report = run(&validator(5_000), &config("no_op", json!({}))).await.unwrap();
        match report {
            ValidationReport::Passed { message, output } => {
                assert_eq!(message, TEST_MODE_SUCCESS);
                assert_eq!(output[0], b"starting rank 0".to_vec());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reports_construction_error() {
        let report = run(&validator(5_000), &config("no_op", json!({"fail_on_construct": true})))
            .await
            .unwrap();
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, TrialhubError::Validation(ref d) if d.contains("fail_on_construct")));
    }

    #[tokio::test]
    async fn test_unknown_entrypoint_is_import_failure() {
        let report = run(&validator(5_000), &config("model_def:Nope", json!({}))).await.unwrap();
        assert!(!report.is_passed());
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let report = run(&validator(5_000), &config("panics", json!({}))).await.unwrap();
        match report {
            ValidationReport::Failed { diagnostic } => {
                assert!(diagnostic.contains("exploded during construction"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_and_cancellation() {
        let v = validator(50);
        let err = run(&v, &config("hangs", json!({}))).await.unwrap_err();
        assert!(matches!(err, TrialhubError::Timeout(_)));

        let v = validator(60_000);
        let token = CancellationToken::new();
        token.cancel();
        let err = v
            .validate(&config("hangs", json!({})), Arc::new(ModelContext::new()), token)
            .await
            .unwrap_err();
        assert!(matches!(err, TrialhubError::Closed(_)));
    }
}
