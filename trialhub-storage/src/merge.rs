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

//! Streaming K-way merge of per-rank log streams.
//!
//! Each input must already be ordered by merge key; the pipeline guarantees
//! this per rank by clamping timestamps to be non-decreasing.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use trialhub_core::{LogRecord, MergeKey};

pub struct KWayMerge<I: Iterator<Item = Arc<LogRecord>>> {
    heap: BinaryHeap<Reverse<HeapEntry<I>>>,
}

struct HeapEntry<I: Iterator<Item = Arc<LogRecord>>> {
    key: MergeKey,
    current: Arc<LogRecord>,
    iterator: I,
}

impl<I: Iterator<Item = Arc<LogRecord>>> Ord for HeapEntry<I> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl<I: Iterator<Item = Arc<LogRecord>>> PartialOrd for HeapEntry<I> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<I: Iterator<Item = Arc<LogRecord>>> PartialEq for HeapEntry<I> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<I: Iterator<Item = Arc<LogRecord>>> Eq for HeapEntry<I> {}

impl<I: Iterator<Item = Arc<LogRecord>>> KWayMerge<I> {
    pub fn new(iterators: Vec<I>) -> Self {
        let mut heap = BinaryHeap::with_capacity(iterators.len());

        for mut iter in iterators {
            if let Some(current) = iter.next() {
                heap.push(Reverse(HeapEntry {
                    key: current.merge_key(),
                    current,
                    iterator: iter,
                }));
            }
        }

        Self { heap }
    }
}

impl<I: Iterator<Item = Arc<LogRecord>>> Iterator for KWayMerge<I> {
    type Item = Arc<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(mut entry) = self.heap.pop()?;

        match entry.iterator.next() {
            Some(next) => {
                entry.key = next.merge_key();
                let result = std::mem::replace(&mut entry.current, next);
                self.heap.push(Reverse(entry));
                Some(result)
            }
            None => Some(entry.current),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialhub_core::TrialId;

    fn stream(rank: u32, stamps: &[u64]) -> std::vec::IntoIter<Arc<LogRecord>> {
        stamps
            .iter()
            .enumerate()
            .map(|(seq, ts)| {
                Arc::new(LogRecord {
                    trial_id: TrialId(1),
                    rank,
                    seq: seq as u64,
                    timestamp_us: *ts,
                    payload: Vec::new(),
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_merge_orders_by_timestamp_rank_seq() {
        let merged: Vec<_> = KWayMerge::new(vec![
            stream(1, &[10, 20, 20]),
            stream(0, &[10, 15, 30]),
            stream(2, &[]),
        ])
        .map(|r| (r.timestamp_us, r.rank, r.seq))
        .collect();

        assert_eq!(
            merged,
            vec![
                (10, 0, 0),
                (10, 1, 0),
                (15, 0, 1),
                (20, 1, 1),
                (20, 1, 2),
                (30, 0, 2),
            ]
        );
    }

    #[test]
    fn test_merge_of_nothing_is_empty() {
        let mut merge = KWayMerge::new(Vec::<std::vec::IntoIter<Arc<LogRecord>>>::new());
        assert!(merge.next().is_none());
    }
}
