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

//! SISDK sessions
//!
//! Ties the codec, the bus and storage together per channel:
//!
//! - [`Session`]: publish events and persistent state on a live channel,
//!   answer client reconnects with the current state
//! - [`ReplayEngine`]: re-emit a live channel's recording on its replay
//!   channel with seek, pause and speed control
//! - [`SessionRegistry`]: create-or-get sessions by channel

pub mod error;
pub mod registry;
pub mod replay;
pub mod session;

pub use error::{SessionError, SessionResult};
pub use registry::SessionRegistry;
pub use replay::{ReplayEngine, ReplayStatus};
pub use session::{RequestForwarder, Session};
