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

//! Session error types

use sisdk_bus::BusError;
use sisdk_core::SisdkError;
use sisdk_storage::StorageError;
use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Event log error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Message bus error
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Core(#[from] SisdkError),

    /// Playback thread could not be started
    #[error("Failed to spawn playback thread: {0}")]
    Spawn(String),
}
