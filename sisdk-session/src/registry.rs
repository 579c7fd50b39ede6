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

//! Session registry
//!
//! Owns the bus, the state backend and every open session, keyed by
//! channel. Opening a channel that is already open returns the existing
//! session.

use crate::error::SessionResult;
use crate::session::{RequestForwarder, Session};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sisdk_bus::MessageBus;
use sisdk_core::{ChannelId, SisdkConfig};
use sisdk_storage::StateBackend;
use std::sync::Arc;
use tracing::info;

pub struct SessionRegistry {
    bus: Arc<dyn MessageBus>,
    backend: StateBackend,
    config: SisdkConfig,
    sessions: DashMap<ChannelId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new(bus: Arc<dyn MessageBus>, config: SisdkConfig) -> Self {
        Self {
            bus,
            backend: StateBackend::new(),
            config,
            sessions: DashMap::new(),
        }
    }

    /// Registry over the bus named in `config.bus`
    pub fn from_config(config: SisdkConfig) -> SessionResult<Self> {
        config.validate()?;
        let bus = sisdk_bus::connect(&config.bus);
        Ok(Self::new(bus, config))
    }

    pub fn config(&self) -> &SisdkConfig {
        &self.config
    }

    pub fn state_backend(&self) -> &StateBackend {
        &self.backend
    }

    /// Open `channel`, or return the session already open on it.
    ///
    /// `forwarder` is only used when a new session is created.
    pub fn open(
        &self,
        channel: &ChannelId,
        forwarder: Option<RequestForwarder>,
    ) -> SessionResult<Arc<Session>> {
        match self.sessions.entry(channel.clone()) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let session = Session::open(
                    channel,
                    Arc::clone(&self.bus),
                    &self.backend,
                    &self.config,
                    forwarder,
                )?;
                slot.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn get(&self, channel: &ChannelId) -> Option<Arc<Session>> {
        self.sessions.get(channel).map(|s| Arc::clone(s.value()))
    }

    /// Shut down and forget the session on `channel`; false if none was open
    pub fn close(&self, channel: &ChannelId) -> bool {
        match self.sessions.remove(channel) {
            Some((_, session)) => {
                session.shutdown();
                info!(channel = %channel, "Session closed");
                true
            }
            None => false,
        }
    }

    /// Open channels, sorted
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    pub fn close_all(&self) {
        for channel in self.channels() {
            self.close(&channel);
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
