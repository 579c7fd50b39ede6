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

//! Session - one channel's publishing and control surface
//!
//! A live session publishes collaborator events, records them in the
//! channel's event log and keeps the state store current. A replay session
//! owns a [`ReplayEngine`] reading the matching live channel's log. Both
//! listen on the channel's control topic for client commands.

use crate::error::SessionResult;
use crate::replay::ReplayEngine;
use parking_lot::Mutex;
use sisdk_bus::{CommandHandler, InboundCommand, MessageBus, Subscription};
use sisdk_core::wire::ClockMode;
use sisdk_core::{
    now_micros, parse_command, ChannelId, Codec, Fragment, InboundRequest, MessageKind, Mode,
    Payload, SessionConfig, SisdkConfig,
};
use sisdk_storage::{EventLog, StateBackend, StateEntry, StateStore};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives client requests the session does not handle itself:
/// `(channel, client_id, raw command)`
pub type RequestForwarder = Arc<dyn Fn(&ChannelId, &str, &str) + Send + Sync>;

pub struct Session {
    channel: ChannelId,
    codec: Codec,
    bus: Arc<dyn MessageBus>,
    store: StateStore,
    /// Live channels only
    log: Option<Arc<EventLog>>,
    /// Replay channels only
    replay: Option<ReplayEngine>,
    forwarder: Option<RequestForwarder>,
    config: SessionConfig,
    /// Last timestamp handed out. Held from taking a timestamp until the log
    /// writes finish, so log ids and timestamps rise together.
    publish_lock: Mutex<i64>,
    subscription: Mutex<Option<Subscription>>,
}

impl Session {
    /// Build a session and start listening on its control topic.
    ///
    /// The channel's state namespace is cleared first. A replay session
    /// reads the log of the live channel with the same kind and instance,
    /// opened read-only; it fails if nothing was recorded there.
    pub fn open(
        channel: &ChannelId,
        bus: Arc<dyn MessageBus>,
        backend: &StateBackend,
        config: &SisdkConfig,
        forwarder: Option<RequestForwarder>,
    ) -> SessionResult<Arc<Self>> {
        let store = backend.store(channel);
        store.clear();

        let (log, replay) = match channel.mode() {
            Mode::Live => {
                let log = EventLog::open_for(&config.storage, channel)?;
                (Some(Arc::new(log)), None)
            }
            Mode::Replay => {
                let live_path = config.storage.log_path(&channel.with_mode(Mode::Live));
                let live_log = EventLog::open_read_only(live_path)?;
                let engine = ReplayEngine::new(
                    channel,
                    &config.session.origin_server,
                    Arc::clone(&bus),
                    Arc::new(live_log),
                    store.clone(),
                    Duration::from_millis(config.session.replay_join_timeout_ms),
                );
                (None, Some(engine))
            }
        };

        let session = Arc::new(Self {
            channel: channel.clone(),
            codec: Codec::new(config.session.origin_server.clone(), channel),
            bus,
            store,
            log,
            replay,
            forwarder,
            config: config.session.clone(),
            publish_lock: Mutex::new(i64::MIN),
            subscription: Mutex::new(None),
        });
        session.listen()?;

        info!(channel = %channel, "Session opened");
        Ok(session)
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn event_log(&self) -> Option<&Arc<EventLog>> {
        self.log.as_ref()
    }

    pub fn replay(&self) -> Option<&ReplayEngine> {
        self.replay.as_ref()
    }

    /// Publish one payload
    pub fn publish(&self, payload: Payload) {
        self.publish_sequence(&[Fragment::new(payload)]);
    }

    /// Publish fragments as one sequence message
    pub fn publish_sequence(&self, fragments: &[Fragment]) {
        let mut last = self.publish_lock.lock();
        let timestamp_us = next_timestamp(&mut last);
        let bytes = self.codec.encode(fragments, MessageKind::Behavior);
        self.bus.publish(&self.channel.topic(), &bytes);
        if let Some(log) = &self.log {
            log.save_message_at(&bytes, timestamp_us);
        }
    }

    /// Publish a persistent value under `name`.
    ///
    /// On a live channel the message row and the state snapshot share one
    /// timestamp, which is what lets a replay apply the snapshot right
    /// after the message.
    pub fn publish_state(&self, name: &str, human_value: &str, payload: Payload) {
        let mut last = self.publish_lock.lock();
        let timestamp_us = next_timestamp(&mut last);
        let bytes = self.codec.encode_payload(payload, MessageKind::Behavior);
        self.bus.publish(&self.channel.topic(), &bytes);
        self.store.set_at(name, human_value, bytes.clone(), timestamp_us);

        if let Some(log) = &self.log {
            log.save_message_at(&bytes, timestamp_us);
            log.save_state_snapshot_at(&self.store.entries(), timestamp_us);
        }
    }

    /// Handle one raw control-topic command
    pub fn on_command(&self, client_id: &str, raw: &str) {
        match parse_command(raw) {
            InboundRequest::Connected => {
                let restored = self.restore_states();
                info!(channel = %self.channel, client_id, restored, "Client connected");
            }
            InboundRequest::Closed => {
                debug!(channel = %self.channel, client_id, "Client closed");
            }
            InboundRequest::Request(request) if request.is_playback() => match &self.replay {
                Some(engine) => {
                    if let Err(e) = engine.handle(&request) {
                        warn!(channel = %self.channel, "Playback request failed: {}", e);
                    }
                }
                None => {
                    debug!(channel = %self.channel, ?request, "Ignoring playback request on live channel");
                }
            },
            InboundRequest::Request(_) | InboundRequest::Unrecognized => match &self.forwarder {
                Some(forward) => forward(&self.channel, client_id, raw),
                None => debug!(channel = %self.channel, client_id, "No forwarder for request"),
            },
        }
    }

    /// Republish every stored state value; returns how many were sent
    pub fn restore_states(&self) -> usize {
        self.restore_states_at(now_micros())
    }

    /// Republish every stored state value as of `now_us`.
    ///
    /// Entries are sent in last-update order. On a live channel the clock
    /// and wall-clock keys are recomputed against `now_us` instead of being
    /// sent as recorded.
    pub fn restore_states_at(&self, now_us: i64) -> usize {
        let topic = self.channel.topic();
        let entries = self.store.entries();
        for entry in &entries {
            let is_clock =
                entry.key == self.config.clock_key || entry.key == self.config.wall_clock_key;
            if is_clock && self.channel.is_live() {
                if let Some(bytes) = self.recompute_clock(entry, now_us) {
                    self.bus.publish(&topic, &bytes);
                    continue;
                }
            }
            self.bus.publish(&topic, &entry.encoded_message);
        }
        entries.len()
    }

    fn recompute_clock(&self, entry: &StateEntry, now_us: i64) -> Option<Vec<u8>> {
        let kind = match Codec::decode(&entry.encoded_message) {
            Ok(message) => message.header.map(|h| h.kind()).unwrap_or(MessageKind::Behavior),
            Err(e) => {
                warn!(channel = %self.channel, key = %entry.key, "Undecodable clock state: {}", e);
                return None;
            }
        };
        let mut fragments = Codec::decode_fragments(&entry.encoded_message).ok()?;
        let elapsed_secs = (now_us - entry.updated_at_us).max(0) as f64 / 1_000_000.0;

        for fragment in fragments.iter_mut() {
            match &mut fragment.payload {
                Payload::Clock(clock) if clock.running => {
                    clock.seconds = match clock.mode() {
                        ClockMode::Countdown => (clock.seconds - elapsed_secs).max(0.0),
                        ClockMode::Elapsed => clock.seconds + elapsed_secs,
                    };
                }
                Payload::WallClock(wall) => wall.unix_ms = now_us / 1_000,
                _ => {}
            }
        }
        Some(self.codec.encode(&fragments, kind))
    }

    fn listen(self: &Arc<Self>) -> SessionResult<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handler: CommandHandler = Arc::new(move |cmd: InboundCommand| {
            if let Some(session) = weak.upgrade() {
                session.on_command(&cmd.client_id, &cmd.command);
            }
        });
        let subscription = self.bus.subscribe(&self.channel.control_topic(), handler)?;
        *self.subscription.lock() = Some(subscription);
        Ok(())
    }

    /// Stop listening and stop any replay. Idempotent.
    pub fn shutdown(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        if let Some(engine) = &self.replay {
            engine.stop();
        }
        debug!(channel = %self.channel, "Session shut down");
    }
}

/// Current time, never earlier than the previous call's
fn next_timestamp(last: &mut i64) -> i64 {
    let timestamp_us = now_micros().max(*last);
    *last = timestamp_us;
    timestamp_us
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
