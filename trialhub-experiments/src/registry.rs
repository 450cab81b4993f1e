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

//! Entrypoint resolution.

use crate::builtin::NoOpDefinition;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use trialhub_core::{Result, TrialDefinition, TrialhubError};

/// Maps an experiment's `entrypoint` to the definition that implements it.
#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<dyn TrialDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in definitions.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(NoOpDefinition::ENTRYPOINT, Arc::new(NoOpDefinition));
        registry
    }

    /// Register (or replace) a definition.
    pub fn register(&self, entrypoint: impl Into<String>, definition: Arc<dyn TrialDefinition>) {
        let entrypoint = entrypoint.into();
        debug!(entrypoint = %entrypoint, "registered trial definition");
        self.definitions.write().insert(entrypoint, definition);
    }

    /// Look up an entrypoint. An unknown entrypoint is an import failure.
    pub fn resolve(&self, entrypoint: &str) -> Result<Arc<dyn TrialDefinition>> {
        self.definitions
            .read()
            .get(entrypoint)
            .cloned()
            .ok_or_else(|| {
                TrialhubError::Validation(format!(
                    "cannot import entrypoint {:?}: no such trial definition",
                    entrypoint
                ))
            })
    }

    pub fn entrypoints(&self) -> Vec<String> {
        let mut names: Vec<_> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }
}
