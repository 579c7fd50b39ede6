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

//! SISDK Core
//!
//! Shared vocabulary of the visualization messaging layer:
//!
//! - **Channel identity**: `{kind, instance, mode}` scoping topics, state and logs
//! - **Wire messages**: protobuf sequence envelope carrying delay-tagged atoms
//! - **Payloads**: tagged union of every event a visualization client understands
//! - **Codec**: framing of payload fragments and parsing of inbound client requests
//! - **Configuration**: bus, storage, session and broker settings
//!
//! ```text
//! ┌──────────────────────────── SequenceMessage ────────────────────────────┐
//! │ Header { id, timestamp_us, origin_server, channel, kind }               │
//! │ ┌──────────────────────┐ ┌──────────────────────┐                       │
//! │ │ Atom { tag, wait_ms, │ │ Atom { tag, wait_ms, │  ...                  │
//! │ │        payload }     │ │        payload }     │                       │
//! │ └──────────────────────┘ └──────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod payload;
pub mod time;
pub mod wire;

pub use channel::{ChannelId, Mode};
pub use codec::{
    decode_client_request, encode_client_request, parse_command, ClientRequest, Codec, Fragment,
    InboundRequest, CLIENT_CLOSED, CLIENT_CONNECTED,
};
pub use config::{BrokerConfig, BusBackend, BusConfig, SessionConfig, SisdkConfig, StorageConfig};
pub use error::{Result, SisdkError};
pub use payload::Payload;
pub use time::now_micros;
pub use wire::{AtomMessage, Header, MessageKind, SequenceMessage};
