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

//! Topic fan-out table shared by the in-process bus and the TCP broker

use crate::protocol::Frame;
use crossbeam::channel::{Sender, TrySendError};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Subscriber senders per topic, keyed by subscriber id
#[derive(Default)]
pub(crate) struct TopicTable {
    topics: HashMap<String, BTreeMap<u64, Sender<Frame>>>,
}

impl TopicTable {
    /// Register `sender` under `id`; returns the topic's subscriber count
    pub fn add(&mut self, topic: &str, id: u64, sender: Sender<Frame>) -> u32 {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        subscribers.insert(id, sender);
        subscribers.len() as u32
    }

    pub fn remove(&mut self, topic: &str, id: u64) {
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Drop `id` from every topic
    pub fn remove_all(&mut self, id: u64) {
        self.topics.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
    }

    /// Send a `Message` frame to every subscriber of `topic`.
    ///
    /// Subscribers whose receiving end is gone are pruned. Returns the
    /// number of subscribers the frame was handed to.
    pub fn fan_out(&mut self, topic: &str, data: &[u8]) -> usize {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            trace!(topic = %topic, "Publish with no subscribers");
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, sender) in subscribers.iter() {
            let frame = Frame::Message {
                topic: topic.to_string(),
                data: data.to_vec(),
            };
            match sender.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Disconnected(_)) => dropped.push(*id),
                Err(TrySendError::Full(_)) => trace!(topic = %topic, id, "Subscriber full"),
            }
        }

        for id in dropped {
            subscribers.remove(&id);
        }
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        delivered
    }

    pub fn count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}
