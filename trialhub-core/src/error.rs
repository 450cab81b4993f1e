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

//! Trialhub error types

use thiserror::Error;

/// Result type for trialhub operations
pub type Result<T> = std::result::Result<T, TrialhubError>;

/// Errors that can occur across the orchestration service
#[derive(Debug, Error)]
pub enum TrialhubError {
    /// Illegal lifecycle transition or missing privilege
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Reference to a missing or deleted experiment, trial or rank
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed configuration or failed trial construction
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Rank stream sequence violation; absorbed by the pipeline
    #[error("Ingestion overflow: {0}")]
    IngestionOverflow(String),

    /// Bounded wait expired before the trial terminated
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Pipeline or query handle used after it was closed
    #[error("Closed: {0}")]
    Closed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`TrialhubError`], used by callers that only
/// need to branch on the failure family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    NotFound,
    Validation,
    IngestionOverflow,
    Timeout,
    Closed,
    Internal,
}

impl TrialhubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrialhubError::InvalidState(_) => ErrorKind::InvalidState,
            TrialhubError::NotFound(_) => ErrorKind::NotFound,
            TrialhubError::Validation(_) => ErrorKind::Validation,
            TrialhubError::IngestionOverflow(_) => ErrorKind::IngestionOverflow,
            TrialhubError::Timeout(_) => ErrorKind::Timeout,
            TrialhubError::Closed(_) => ErrorKind::Closed,
            TrialhubError::Config(_)
            | TrialhubError::Corruption(_)
            | TrialhubError::Serialization(_)
            | TrialhubError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for TrialhubError {
    fn from(e: serde_json::Error) -> Self {
        TrialhubError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for TrialhubError {
    fn from(e: bincode::Error) -> Self {
        TrialhubError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for TrialhubError {
    fn from(e: toml::de::Error) -> Self {
        TrialhubError::Config(e.to_string())
    }
}
