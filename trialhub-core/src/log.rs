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

//! Log records and the merge key.
//!
//! Payloads are raw bytes. Nothing in the log path interprets them as text,
//! so embedded NUL bytes and partial UTF-8 survive ingestion and queries.

use crate::ids::{RankIndex, TrialId};
use serde::{Deserialize, Serialize};

/// Total order over records from independently sequenced ranks:
/// timestamp, then rank, then per-rank sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MergeKey {
    pub timestamp_us: u64,
    pub rank: RankIndex,
    pub seq: u64,
}

/// One immutable line of trial output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub trial_id: TrialId,
    pub rank: RankIndex,
    /// Per-rank sequence, starting at 0.
    pub seq: u64,
    /// Wall clock, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn merge_key(&self) -> MergeKey {
        MergeKey {
            timestamp_us: self.timestamp_us,
            rank: self.rank,
            seq: self.seq,
        }
    }

    /// Byte-level substring test.
    pub fn payload_contains(&self, needle: &[u8]) -> bool {
        contains_bytes(&self.payload, needle)
    }

    /// Payload rendered lossily, for human display only.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

pub fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Current wall clock in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: u64, rank: RankIndex, seq: u64) -> LogRecord {
        LogRecord {
            trial_id: TrialId(1),
            rank,
            seq,
            timestamp_us: ts,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_merge_key_breaks_timestamp_ties_by_rank_then_seq() {
        let a = record(100, 0, 5).merge_key();
        let b = record(100, 1, 0).merge_key();
        let c = record(100, 1, 1).merge_key();
        let d = record(99, 7, 9).merge_key();
        let mut keys = vec![c, a, d, b];
        keys.sort();
        assert_eq!(keys, vec![d, a, b, c]);
    }

    #[test]
    fn test_contains_bytes_past_nul() {
        let mut r = record(1, 0, 0);
        r.payload = b"before\0after".to_vec();
        assert!(r.payload_contains(b"after"));
        assert!(r.payload_contains(b"\0a"));
        assert!(!r.payload_contains(b"missing"));
        assert!(r.payload_contains(b""));
    }
}
