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

//! State Store - latest value per key, scoped by channel
//!
//! Holds only the most recent entry for each key; history lives in the
//! event log's state sequences. Namespaces share one [`StateBackend`] so
//! that a live session and its replay counterpart never see each other's
//! keys while still being owned by a single process-wide map.

use dashmap::DashMap;
use sisdk_core::{now_micros, ChannelId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Latest recorded value of one state key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub key: String,
    /// Human-readable rendering, used for diagnostics and fallbacks
    pub human_value: String,
    /// Encoded sequence message that reproduces this state on a client
    pub encoded_message: Vec<u8>,
    pub updated_at_us: i64,
}

/// Process-wide namespace map, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct StateBackend {
    namespaces: Arc<DashMap<ChannelId, BTreeMap<String, StateEntry>>>,
}

impl StateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on one channel's namespace
    pub fn store(&self, channel: &ChannelId) -> StateStore {
        StateStore {
            channel: channel.clone(),
            backend: self.clone(),
        }
    }

    /// Channels that currently hold at least one key
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .namespaces
            .iter()
            .filter(|ns| !ns.value().is_empty())
            .map(|ns| ns.key().clone())
            .collect();
        channels.sort();
        channels
    }
}

/// One channel's view of the state backend
#[derive(Debug, Clone)]
pub struct StateStore {
    channel: ChannelId,
    backend: StateBackend,
}

impl StateStore {
    /// Standalone store with a private backend
    pub fn new(channel: &ChannelId) -> Self {
        StateBackend::new().store(channel)
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Upsert `key` stamped with the current time
    pub fn set(&self, key: &str, human_value: &str, encoded_message: Vec<u8>) -> StateEntry {
        self.set_at(key, human_value, encoded_message, now_micros())
    }

    /// Upsert `key` stamped with `timestamp_us`
    pub fn set_at(
        &self,
        key: &str,
        human_value: &str,
        encoded_message: Vec<u8>,
        timestamp_us: i64,
    ) -> StateEntry {
        let entry = StateEntry {
            key: key.to_string(),
            human_value: human_value.to_string(),
            encoded_message,
            updated_at_us: timestamp_us,
        };
        self.set_entry(entry.clone());
        entry
    }

    pub fn set_entry(&self, entry: StateEntry) {
        self.backend
            .namespaces
            .entry(self.channel.clone())
            .or_default()
            .insert(entry.key.clone(), entry);
    }

    pub fn get(&self, key: &str) -> Option<StateEntry> {
        self.backend
            .namespaces
            .get(&self.channel)
            .and_then(|ns| ns.get(key).cloned())
    }

    pub fn human_value_or(&self, key: &str, default: &str) -> String {
        self.get(key)
            .map(|entry| entry.human_value)
            .unwrap_or_else(|| default.to_string())
    }

    /// Keys ordered by last update, then by name
    pub fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|entry| entry.key).collect()
    }

    /// Entries ordered by last update, then by key
    pub fn entries(&self) -> Vec<StateEntry> {
        let mut entries: Vec<StateEntry> = match self.backend.namespaces.get(&self.channel) {
            Some(ns) => ns.values().cloned().collect(),
            None => return Vec::new(),
        };
        entries.sort_by(|a, b| {
            a.updated_at_us
                .cmp(&b.updated_at_us)
                .then_with(|| a.key.cmp(&b.key))
        });
        entries
    }

    /// Swap the whole namespace for `entries`
    pub fn replace(&self, entries: impl IntoIterator<Item = StateEntry>) {
        let ns: BTreeMap<String, StateEntry> = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        self.backend.namespaces.insert(self.channel.clone(), ns);
    }

    pub fn clear(&self) {
        self.backend.namespaces.remove(&self.channel);
    }

    pub fn len(&self) -> usize {
        self.backend
            .namespaces
            .get(&self.channel)
            .map(|ns| ns.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
