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

//! Experiment records and the experiment lifecycle state machine.

use crate::error::{Result, TrialhubError};
use crate::ids::ExperimentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentState {
    Active,
    Paused,
    Canceled,
    Completed,
    Errored,
}

impl ExperimentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExperimentState::Canceled | ExperimentState::Completed | ExperimentState::Errored
        )
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExperimentState::Active => "ACTIVE",
            ExperimentState::Paused => "PAUSED",
            ExperimentState::Canceled => "CANCELED",
            ExperimentState::Completed => "COMPLETED",
            ExperimentState::Errored => "ERRORED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentEvent {
    Pause,
    Activate,
    Cancel,
    /// Every trial finished successfully.
    TrialsCompleted,
    /// Every trial is terminal and at least one errored.
    TrialsErrored,
}

impl ExperimentState {
    pub fn transition(self, event: ExperimentEvent) -> Result<ExperimentState> {
        use ExperimentEvent::*;
        use ExperimentState::*;

        let next = match (self, event) {
            (Active, Pause) => Paused,
            (Paused, Activate) => Active,
            (Active, Cancel) | (Paused, Cancel) => Canceled,
            (Active, TrialsCompleted) => Completed,
            (Active, TrialsErrored) => Errored,
            _ => {
                return Err(TrialhubError::InvalidState(format!(
                    "illegal transition {:?} from {}",
                    event, self
                )))
            }
        };

        Ok(next)
    }
}

/// Opaque experiment configuration document.
///
/// Only the keys the orchestrator needs are interpreted; everything else is
/// carried verbatim for the trial definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentConfig(serde_json::Value);

impl ExperimentConfig {
    /// Wrap and check a raw document.
    pub fn new(raw: serde_json::Value) -> Result<Self> {
        let config = Self(raw);
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(s)
            .map_err(|e| TrialhubError::Validation(format!("malformed configuration: {}", e)))?;
        Self::new(raw)
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn entrypoint(&self) -> &str {
        self.0
            .get("entrypoint")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    /// Number of ranks per trial (`resources.slots_per_trial`, default 1).
    pub fn slots_per_trial(&self) -> u32 {
        self.pointer_u64("/resources/slots_per_trial").unwrap_or(1) as u32
    }

    /// Number of trials to run (`searcher.max_trials`, default 1).
    pub fn max_trials(&self) -> u32 {
        self.pointer_u64("/searcher/max_trials").unwrap_or(1) as u32
    }

    /// Batches each rank trains for (`searcher.max_length.batches`, default 1).
    pub fn max_batches(&self) -> u64 {
        self.pointer_u64("/searcher/max_length/batches").unwrap_or(1)
    }

    pub fn hyperparameters(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0
            .get("hyperparameters")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default()
    }

    pub fn hyperparameter(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get("hyperparameters").and_then(|h| h.get(name))
    }

    fn pointer_u64(&self, pointer: &str) -> Option<u64> {
        self.0.pointer(pointer).and_then(|v| v.as_u64())
    }

    fn validate(&self) -> Result<()> {
        let obj = self
            .0
            .as_object()
            .ok_or_else(|| invalid("configuration must be a JSON object"))?;

        match obj.get("entrypoint") {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {}
            Some(_) => return Err(invalid("entrypoint must be a non-empty string")),
            None => return Err(invalid("entrypoint is required")),
        }

        for pointer in [
            "/resources/slots_per_trial",
            "/searcher/max_trials",
            "/searcher/max_length/batches",
        ] {
            if let Some(v) = self.0.pointer(pointer) {
                match v.as_u64() {
                    Some(n) if n >= 1 && n <= u32::MAX as u64 => {}
                    _ => {
                        return Err(invalid(&format!(
                            "{} must be a positive integer, got {}",
                            pointer.trim_start_matches('/').replace('/', "."),
                            v
                        )))
                    }
                }
            }
        }

        if let Some(h) = obj.get("hyperparameters") {
            if !h.is_object() {
                return Err(invalid("hyperparameters must be an object"));
            }
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> TrialhubError {
    TrialhubError::Validation(msg.to_string())
}

/// Persisted experiment document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub config: ExperimentConfig,
    pub labels: BTreeSet<String>,
    pub state: ExperimentState,
    pub archived: bool,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    /// Bumped on every state transition or label change.
    pub revision: u64,
    /// Set once trials have been spawned; prevents re-spawning on resume.
    #[serde(default)]
    pub trials_spawned: bool,
}

impl ExperimentRecord {
    pub fn new(id: ExperimentId, config: ExperimentConfig, owner: impl Into<String>, paused: bool) -> Self {
        Self {
            id,
            config,
            labels: BTreeSet::new(),
            state: if paused {
                ExperimentState::Paused
            } else {
                ExperimentState::Active
            },
            archived: false,
            owner: owner.into(),
            created_at: Utc::now(),
            revision: 1,
            trials_spawned: false,
        }
    }

    /// `archived` may only be set while the state is terminal.
    pub fn check_invariants(&self) -> Result<()> {
        if self.archived && !self.state.is_terminal() {
            return Err(TrialhubError::Corruption(format!(
                "experiment {} archived while {}",
                self.id, self.state
            )));
        }
        Ok(())
    }
}
