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

//! Entity identifiers.
//!
//! Experiments and trials are numbered from 1 in allocation order; ranks are
//! zero-based indices within a trial.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rank index within a distributed trial (`0..rank_count`).
pub type RankIndex = u32;

macro_rules! numeric_id {
    ($name:ident, $label:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }

            pub fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::TrialhubError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u64>().map($name).map_err(|_| {
                    crate::TrialhubError::Validation(format!(
                        "invalid {} id: {:?}",
                        $label, s
                    ))
                })
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

numeric_id!(ExperimentId, "experiment");
numeric_id!(TrialId, "trial");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: ExperimentId = " 42".parse().unwrap();
        assert_eq!(id, ExperimentId(42));
        assert_eq!(id.to_string(), "42");
        assert_eq!(id.next(), ExperimentId(43));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("abc".parse::<TrialId>().is_err());
        assert!("-1".parse::<TrialId>().is_err());
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&TrialId(7)).unwrap();
        assert_eq!(json, "7");
    }
}
