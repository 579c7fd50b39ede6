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

//! SISDK Message Bus
//!
//! Topic-based publish/subscribe between sessions and visualization
//! clients. Outbound traffic is fire-and-forget binary sequence messages;
//! inbound traffic is JSON control envelopes read by one listener thread
//! per subscription.
//!
//! Backends:
//!
//! - [`MemoryBus`]: in-process, for embedding and tests
//! - [`TcpBus`]: client of an external [`TcpBroker`] (`sisdk-broker`)

pub mod broker;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod subscription;
pub mod tcp;

mod topics;

pub use broker::{run_broker, TcpBroker};
pub use error::{BusError, BusResult};
pub use memory::{FrameReceiver, MemoryBus};
pub use protocol::{ControlEnvelope, Frame, InboundCommand};
pub use subscription::{CommandHandler, Subscription};
pub use tcp::TcpBus;

use sisdk_core::{BusBackend, BusConfig};
use std::sync::Arc;

/// Best-effort topic bus
pub trait MessageBus: Send + Sync {
    /// Deliver `data` to every current subscriber of `topic`.
    ///
    /// No persistence and no acknowledgement; failures are logged.
    fn publish(&self, topic: &str, data: &[u8]);

    /// Start a listener thread invoking `on_command` for each control
    /// envelope published on `topic`
    fn subscribe(&self, topic: &str, on_command: CommandHandler) -> BusResult<Subscription>;
}

/// Build the bus selected by configuration
pub fn connect(config: &BusConfig) -> Arc<dyn MessageBus> {
    match config.backend {
        BusBackend::Memory => Arc::new(MemoryBus::new()),
        BusBackend::Tcp => Arc::new(TcpBus::new(config)),
    }
}
