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

//! In-process message bus
//!
//! Every attached receiver is one end of an unbounded crossbeam channel.
//! Receivers that have gone away are pruned on the next publish.

use crate::error::{BusError, BusResult};
use crate::protocol::{ControlEnvelope, Frame};
use crate::subscription::{CommandHandler, FrameSource, Subscription};
use crate::topics::TopicTable;
use crate::MessageBus;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Raw frame stream for embedded clients
pub type FrameReceiver = Receiver<Frame>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct MemoryState {
    table: TopicTable,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a raw receiver to `topic`.
    ///
    /// The first frame is always `Subscribed`; every later frame is a
    /// `Message` published on the topic.
    pub fn attach(&self, topic: &str) -> FrameReceiver {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id = state.next_id.saturating_add(1);

        let count = state.table.add(topic, id, sender.clone());
        let _ = sender.send(Frame::Subscribed {
            topic: topic.to_string(),
            subscribers: count,
        });

        debug!(topic = %topic, subscribers = count, "Receiver attached");
        receiver
    }

    /// Publish a control command the way a visualization client would
    pub fn send_command(
        &self,
        control_topic: &str,
        client_id: &str,
        command: &str,
    ) -> BusResult<()> {
        let data = ControlEnvelope::new(client_id, command).encode()?;
        self.publish(control_topic, &data);
        Ok(())
    }

    /// Number of live receivers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.lock().table.count(topic)
    }
}

impl MessageBus for MemoryBus {
    fn publish(&self, topic: &str, data: &[u8]) {
        self.inner.lock().table.fan_out(topic, data);
    }

    fn subscribe(&self, topic: &str, on_command: CommandHandler) -> BusResult<Subscription> {
        let receiver = self.attach(topic);
        Subscription::spawn(topic, MemorySource { receiver }, on_command)
    }
}

struct MemorySource {
    receiver: FrameReceiver,
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> BusResult<Option<Frame>> {
        match self.receiver.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::Closed),
        }
    }
}
