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

//! Trial records.

use crate::error::{Result, TrialhubError};
use crate::ids::{ExperimentId, TrialId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialState {
    Running,
    Completed,
    Errored,
    Canceled,
}

impl TrialState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TrialState::Running)
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrialState::Running => "RUNNING",
            TrialState::Completed => "COMPLETED",
            TrialState::Errored => "ERRORED",
            TrialState::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// Outcome a rank reports when it exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankExit {
    Success,
    Failure(String),
}

impl RankExit {
    pub fn is_success(&self) -> bool {
        matches!(self, RankExit::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: TrialId,
    pub experiment_id: ExperimentId,
    pub rank_count: u32,
    pub state: TrialState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// First failure reported by a rank, if any.
    #[serde(default)]
    pub failure: Option<String>,
}

impl TrialRecord {
    pub fn new(id: TrialId, experiment_id: ExperimentId, rank_count: u32) -> Result<Self> {
        if rank_count == 0 {
            return Err(TrialhubError::Validation(
                "rank count must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            id,
            experiment_id,
            rank_count,
            state: TrialState::Running,
            start_time: Utc::now(),
            end_time: None,
            failure: None,
        })
    }

    /// Move a running trial to a terminal state, stamping its end time.
    pub fn finish(&mut self, state: TrialState) -> Result<()> {
        if !state.is_terminal() {
            return Err(TrialhubError::InvalidState(format!(
                "trial {} cannot finish as {}",
                self.id, state
            )));
        }
        if self.state.is_terminal() {
            return Err(TrialhubError::InvalidState(format!(
                "trial {} already {}",
                self.id, self.state
            )));
        }
        self.state = state;
        self.end_time = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_sets_end_time_once() {
        let mut trial = TrialRecord::new(TrialId(1), ExperimentId(1), 2).unwrap();
        assert!(trial.end_time.is_none());
        trial.finish(TrialState::Completed).unwrap();
        assert!(trial.end_time.is_some());
        assert!(trial.finish(TrialState::Errored).is_err());
    }

    #[test]
    fn test_zero_ranks_rejected() {
        assert!(TrialRecord::new(TrialId(1), ExperimentId(1), 0).is_err());
    }

    #[test]
    fn test_cannot_finish_as_running() {
        let mut trial = TrialRecord::new(TrialId(1), ExperimentId(1), 1).unwrap();
        assert!(trial.finish(TrialState::Running).is_err());
    }
}
