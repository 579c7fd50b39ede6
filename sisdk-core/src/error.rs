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

//! Core error types

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, SisdkError>;

/// Errors raised by the codec, channel parsing and configuration
#[derive(Debug, Error)]
pub enum SisdkError {
    /// Protobuf decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Atom carries a type tag no payload variant claims
    #[error("Unknown payload type: {0}")]
    UnknownPayload(String),

    /// Sequence message without a header
    #[error("Sequence message has no header")]
    MissingHeader,

    /// Channel name could not be parsed
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for SisdkError {
    fn from(e: toml::de::Error) -> Self {
        SisdkError::Config(e.to_string())
    }
}
