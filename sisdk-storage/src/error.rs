// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Storage error types

use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur reading or writing an event log
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Shared core error (channel identity, decoding)
    #[error(transparent)]
    Core(#[from] sisdk_core::SisdkError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No log file at this path
    #[error("Event log not found: {0}")]
    NotFound(PathBuf),

    /// Write attempted on a log opened read-only
    #[error("Event log is read-only: {0}")]
    ReadOnly(PathBuf),
}
