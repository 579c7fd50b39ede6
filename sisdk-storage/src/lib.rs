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

//! SISDK Storage
//!
//! - [`StateStore`]: in-memory latest value per key, one namespace per channel
//! - [`EventLog`]: SQLite log of published messages and state snapshots,
//!   the source a replay reads from

pub mod error;
pub mod event_log;
pub mod state_store;

pub use error::{StorageError, StorageResult};
pub use event_log::{
    EventLog, EventLogRecord, MessageCursor, SequenceSelector, StateLogRecord, StateSequence,
    StateSnapshot,
};
pub use state_store::{StateBackend, StateEntry, StateStore};
