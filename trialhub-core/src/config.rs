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

//! Service configuration
//!
//! Loaded from a TOML file; every section has defaults so an empty file (or
//! no file) yields a working local configuration.

use crate::error::{Result, TrialhubError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default depth of each trial's ingestion queue
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Default largest accepted log payload (1 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default environment variable granting the administrative capability
pub const DEFAULT_ADMIN_ENV_VAR: &str = "TRIALHUB_ADMIN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialhubConfig {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    pub validator: ValidatorConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the experiments/, trials/ and logs/ directories
    pub data_dir: PathBuf,
    /// fsync a segment when its trial's pipeline is sealed
    pub sync_on_seal: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./trialhub-data"),
            sync_on_seal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Bounded queue depth; writers block when it is full
    pub buffer_capacity: usize,
    pub max_payload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_contains_timeout_ms: u64,
    /// Records handed out per wake-up by `follow`
    pub follow_batch_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_contains_timeout_ms: 30_000,
            follow_batch_size: 256,
        }
    }
}

impl QueryConfig {
    pub fn default_contains_timeout(&self) -> Duration {
        Duration::from_millis(self.default_contains_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub timeout_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { timeout_ms: 60_000 }
    }
}

impl ValidatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub admin_env_var: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            admin_env_var: DEFAULT_ADMIN_ENV_VAR.to_string(),
        }
    }
}

impl TrialhubConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: TrialhubConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = data_dir.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.buffer_capacity == 0 {
            return Err(TrialhubError::Config(
                "ingest.buffer_capacity must be at least 1".into(),
            ));
        }
        if self.ingest.max_payload_bytes == 0 {
            return Err(TrialhubError::Config(
                "ingest.max_payload_bytes must be at least 1".into(),
            ));
        }
        if self.query.follow_batch_size == 0 {
            return Err(TrialhubError::Config(
                "query.follow_batch_size must be at least 1".into(),
            ));
        }
        if self.security.admin_env_var.is_empty() {
            return Err(TrialhubError::Config(
                "security.admin_env_var must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Whether the process environment grants the administrative capability
    pub fn admin_from_env(&self) -> bool {
        std::env::var(&self.security.admin_env_var)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}
