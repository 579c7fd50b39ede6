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

//! Bus error types

use thiserror::Error;

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded
    #[error("Frame codec error: {0}")]
    Frame(String),

    /// Control envelope is not valid JSON
    #[error("Invalid control envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Broker rejected the connection
    #[error("Broker refused connection: {0}")]
    Refused(String),

    /// Peer closed the connection
    #[error("Connection closed")]
    Closed,

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),
}

impl From<bincode::Error> for BusError {
    fn from(e: bincode::Error) -> Self {
        BusError::Frame(e.to_string())
    }
}
