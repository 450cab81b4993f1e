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

//! Trial definition capability.
//!
//! Training code is opaque to the orchestrator. It is reached only through
//! [`TrialDefinition`], which can construct a [`TrialInstance`] and nothing
//! else; the instance trains batches and writes output to a [`LogSink`].

use crate::experiment::ExperimentConfig;
use crate::ids::RankIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Files submitted alongside an experiment (model code, fixtures).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelContext {
    files: BTreeMap<String, Vec<u8>>,
}

impl ModelContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: Vec<u8>) {
        self.files.insert(path.into(), contents);
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.values().map(|v| v.len()).sum()
    }
}

/// Everything a definition may look at while constructing an instance.
#[derive(Debug, Clone)]
pub struct TrialContext {
    pub config: ExperimentConfig,
    pub context: Arc<ModelContext>,
    pub rank: RankIndex,
    pub rank_count: u32,
    /// Set when constructed by the test-mode validator.
    pub test_mode: bool,
}

/// Failure raised by training code, during construction or a batch.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DefinitionError(pub String);

impl DefinitionError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Destination for a rank's raw output.
pub trait LogSink: Send {
    fn emit(&mut self, payload: &[u8]);
}

impl LogSink for Vec<Vec<u8>> {
    fn emit(&mut self, payload: &[u8]) {
        self.push(payload.to_vec());
    }
}

pub trait TrialDefinition: Send + Sync {
    fn construct(&self, ctx: &TrialContext) -> Result<Box<dyn TrialInstance>, DefinitionError>;
}

pub trait TrialInstance: Send {
    fn train_batch(&mut self, batch: u64, sink: &mut dyn LogSink) -> Result<(), DefinitionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_context_accounting() {
        let mut ctx = ModelContext::new();
        assert!(ctx.is_empty());
        ctx.insert("model_def.py", b"class Trial: pass\n".to_vec());
        ctx.insert("data/blob.bin", vec![0, 1, 2]);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.total_bytes(), 21);
        assert_eq!(ctx.get("data/blob.bin"), Some(&[0u8, 1, 2][..]));
        assert_eq!(ctx.paths().collect::<Vec<_>>(), vec!["data/blob.bin", "model_def.py"]);
    }

    #[test]
    fn test_vec_sink_keeps_bytes() {
        let mut sink: Vec<Vec<u8>> = Vec::new();
        sink.emit(b"a\0b");
        assert_eq!(sink, vec![b"a\0b".to_vec()]);
    }
}
