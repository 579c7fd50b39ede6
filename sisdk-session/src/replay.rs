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

//! Replay Engine - timed re-emission of a recorded live channel
//!
//! ```text
//!   Idle ──start──▶ Playing ◀──resume/pause──▶ Paused
//!                      │                          │
//!                      └──────────stop────────────┴──▶ Stopped
//! ```
//!
//! One playback thread walks the live channel's event log, sleeping the
//! recorded gap between messages divided by the speed multiplier, and
//! republishes every message under the replay channel. State snapshot rows
//! recorded at a message's timestamp are applied to the replay state store
//! right after it, so state and messages stay in lockstep.
//!
//! Seeking replaces the playback thread: the old one is cancelled through a
//! flag and joined with a bounded wait before the new one starts. Pause
//! parks the thread on a condition variable.

use crate::error::{SessionError, SessionResult};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use sisdk_bus::MessageBus;
use sisdk_core::wire::{PlaybackStatus, ProgressEvent};
use sisdk_core::{ChannelId, ClientRequest, Codec, MessageKind, Payload};
use sisdk_storage::{
    EventLog, EventLogRecord, SequenceSelector, StateEntry, StateLogRecord, StateStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Idle,
    Playing,
    Paused,
    /// Terminal
    Stopped,
}

#[derive(Debug)]
struct ControlState {
    status: ReplayStatus,
    speed: f64,
    /// Index of the next record to play
    position: usize,
    total: usize,
    /// Log exhausted; the next resume starts over
    finished: bool,
}

/// Everything the playback thread touches
struct Playback {
    channel: ChannelId,
    codec: Codec,
    bus: Arc<dyn MessageBus>,
    log: Arc<EventLog>,
    store: StateStore,
    state: Mutex<ControlState>,
    wakeup: Condvar,
}

struct Worker {
    cancel: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct ReplayEngine {
    playback: Arc<Playback>,
    worker: Mutex<Option<Worker>>,
    join_timeout: Duration,
}

impl ReplayEngine {
    /// Engine republishing `log` on `channel`, with `store` as the replay
    /// channel's state namespace
    pub fn new(
        channel: &ChannelId,
        origin_server: &str,
        bus: Arc<dyn MessageBus>,
        log: Arc<EventLog>,
        store: StateStore,
        join_timeout: Duration,
    ) -> Self {
        Self {
            playback: Arc::new(Playback {
                channel: channel.clone(),
                codec: Codec::new(origin_server, channel),
                bus,
                log,
                store,
                state: Mutex::new(ControlState {
                    status: ReplayStatus::Idle,
                    speed: 1.0,
                    position: 0,
                    total: 0,
                    finished: false,
                }),
                wakeup: Condvar::new(),
            }),
            worker: Mutex::new(None),
            join_timeout,
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.playback.channel
    }

    pub fn status(&self) -> ReplayStatus {
        self.playback.state.lock().status
    }

    pub fn speed(&self) -> f64 {
        self.playback.state.lock().speed
    }

    /// `(next index, total records)` of the current playback
    pub fn position(&self) -> (usize, usize) {
        let state = self.playback.state.lock();
        (state.position, state.total)
    }

    /// Restore the first snapshot and play from the beginning
    pub fn start(&self) -> SessionResult<()> {
        if self.status() == ReplayStatus::Stopped {
            warn!(channel = %self.channel(), "Start ignored, replay is stopped");
            return Ok(());
        }
        info!(channel = %self.channel(), "Replay starting");
        self.relaunch(0, ReplayStatus::Playing, &SequenceSelector::First)
    }

    /// Jump to `fraction` of the log.
    ///
    /// The snapshot active at the target record is restored and republished
    /// before the new playback thread starts. A paused replay stays paused.
    pub fn seek(&self, fraction: f64) -> SessionResult<()> {
        if !fraction.is_finite() {
            warn!(channel = %self.channel(), "Ignoring seek to {}", fraction);
            return Ok(());
        }
        let fraction = fraction.clamp(0.0, 1.0);

        let total = self.playback.log.message_count()?;
        if total == 0 {
            debug!(channel = %self.channel(), "Seek on empty log");
            return Ok(());
        }
        let index = ((fraction * total as f64).floor() as usize).min(total - 1);
        let Some(record) = self.playback.log.message_at(index)? else {
            return Ok(());
        };

        let status = {
            let state = self.playback.state.lock();
            match state.status {
                ReplayStatus::Stopped => return Ok(()),
                ReplayStatus::Paused if !state.finished => ReplayStatus::Paused,
                _ => ReplayStatus::Playing,
            }
        };

        info!(channel = %self.channel(), fraction, index, total, "Replay seek");
        self.relaunch(index, status, &SequenceSelector::At(record.timestamp_us))
    }

    pub fn pause(&self) {
        let mut state = self.playback.state.lock();
        if state.status == ReplayStatus::Playing {
            state.status = ReplayStatus::Paused;
            self.playback.wakeup.notify_all();
            info!(channel = %self.channel(), "Replay paused");
        }
    }

    /// Continue a paused replay; starts an idle one and restarts a
    /// finished one
    pub fn resume(&self) -> SessionResult<()> {
        let (status, finished) = {
            let state = self.playback.state.lock();
            (state.status, state.finished)
        };
        match status {
            ReplayStatus::Idle => self.start(),
            ReplayStatus::Paused if finished => {
                info!(channel = %self.channel(), "Replay restarting from the beginning");
                self.relaunch(0, ReplayStatus::Playing, &SequenceSelector::First)
            }
            ReplayStatus::Paused => {
                let mut state = self.playback.state.lock();
                if state.status == ReplayStatus::Paused {
                    state.status = ReplayStatus::Playing;
                    self.playback.wakeup.notify_all();
                    info!(channel = %self.channel(), "Replay resumed");
                }
                Ok(())
            }
            ReplayStatus::Playing | ReplayStatus::Stopped => Ok(()),
        }
    }

    /// Change the multiplier; applies from the next computed delay
    pub fn set_speed(&self, multiplier: f64) {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            warn!(channel = %self.channel(), "Ignoring speed {}", multiplier);
            return;
        }
        self.playback.state.lock().speed = multiplier;
        info!(channel = %self.channel(), multiplier, "Replay speed changed");
    }

    /// Stop for good. Idempotent; safe from the playback thread.
    pub fn stop(&self) {
        {
            let mut state = self.playback.state.lock();
            if state.status == ReplayStatus::Stopped {
                return;
            }
            state.status = ReplayStatus::Stopped;
            self.playback.wakeup.notify_all();
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            self.cancel_worker(worker);
        }
        info!(channel = %self.channel(), "Replay stopped");
    }

    /// Dispatch a client playback request
    pub fn handle(&self, request: &ClientRequest) -> SessionResult<()> {
        match request {
            ClientRequest::Seek { fraction } => self.seek(*fraction),
            ClientRequest::Pause => {
                self.pause();
                Ok(())
            }
            ClientRequest::Play => self.resume(),
            ClientRequest::Speed { multiplier } => {
                self.set_speed(*multiplier);
                Ok(())
            }
            ClientRequest::Domain { .. } => Ok(()),
        }
    }

    fn relaunch(
        &self,
        index: usize,
        status: ReplayStatus,
        restore: &SequenceSelector,
    ) -> SessionResult<()> {
        let mut worker = self.worker.lock();
        if let Some(old) = worker.take() {
            self.cancel_worker(old);
        }

        self.playback.restore(restore)?;

        {
            let mut state = self.playback.state.lock();
            if state.status == ReplayStatus::Stopped {
                return Ok(());
            }
            state.status = status;
            state.position = index;
            state.finished = false;
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded(1);
        let playback = Arc::clone(&self.playback);
        let thread_cancel = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name(format!("sisdk-replay-{}", self.playback.channel))
            .spawn(move || {
                playback.run(index, &thread_cancel);
                let _ = done_tx.send(());
            })
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        *worker = Some(Worker {
            cancel,
            done: done_rx,
            handle,
        });
        Ok(())
    }

    fn cancel_worker(&self, worker: Worker) {
        worker.cancel.store(true, Ordering::Release);
        {
            let _state = self.playback.state.lock();
            self.playback.wakeup.notify_all();
        }

        if worker.handle.thread().id() == thread::current().id() {
            return;
        }

        match worker.done.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!(channel = %self.channel(), "Playback thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    channel = %self.channel(),
                    "Playback thread did not stop within {:?}, detaching",
                    self.join_timeout
                );
            }
        }
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Playback {
    fn run(&self, start: usize, cancel: &AtomicBool) {
        let (cursor, total) = match self.log.iter_messages(start) {
            Ok(result) => result,
            Err(e) => {
                error!(channel = %self.channel, "Replay read failed: {}", e);
                self.finish(cancel, 0.0);
                return;
            }
        };
        self.state.lock().total = total;
        debug!(channel = %self.channel, start, total, "Playback loop started");

        let mut prev_timestamp: Option<i64> = None;
        let mut index = start;
        for record in cursor {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    error!(channel = %self.channel, index, "Replay read failed: {}", e);
                    break;
                }
            };
            let fraction = (index as f64 / total.max(1) as f64).min(1.0);

            if !self.wait_while_paused(cancel, fraction) {
                return;
            }
            self.emit_progress(fraction, PlaybackStatus::Playing);

            if let Some(prev) = prev_timestamp {
                if !self.sleep_scaled(record.timestamp_us - prev, cancel) {
                    return;
                }
                if !self.wait_while_paused(cancel, fraction) {
                    return;
                }
            }

            self.republish(&record);
            self.apply_states(record.timestamp_us);

            prev_timestamp = Some(record.timestamp_us);
            index += 1;
            self.state.lock().position = index;
        }

        self.finish(cancel, 1.0);
    }

    /// Block while paused; false once cancelled or stopped
    fn wait_while_paused(&self, cancel: &AtomicBool, fraction: f64) -> bool {
        let mut state = self.state.lock();
        let mut announced = false;
        loop {
            if cancel.load(Ordering::Acquire) || state.status == ReplayStatus::Stopped {
                return false;
            }
            if state.status != ReplayStatus::Paused {
                return true;
            }
            if !announced {
                announced = true;
                MutexGuard::unlocked(&mut state, || {
                    self.emit_progress(fraction, PlaybackStatus::Paused)
                });
                continue;
            }
            self.wakeup.wait(&mut state);
        }
    }

    /// Sleep the recorded gap scaled by speed; false once cancelled or stopped
    fn sleep_scaled(&self, gap_us: i64, cancel: &AtomicBool) -> bool {
        let mut state = self.state.lock();
        let delay_us = gap_us.max(0) as f64 / state.speed;
        let deadline = Instant::now() + Duration::from_micros(delay_us as u64);
        loop {
            if cancel.load(Ordering::Acquire) || state.status == ReplayStatus::Stopped {
                return false;
            }
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                return !cancel.load(Ordering::Acquire) && state.status != ReplayStatus::Stopped;
            }
        }
    }

    /// Park at the end of the log
    fn finish(&self, cancel: &AtomicBool, fraction: f64) {
        {
            let mut state = self.state.lock();
            if cancel.load(Ordering::Acquire) || state.status == ReplayStatus::Stopped {
                return;
            }
            state.status = ReplayStatus::Paused;
            state.finished = true;
        }
        self.emit_progress(fraction, PlaybackStatus::Paused);
        info!(channel = %self.channel, "Replay reached end of log");
    }

    fn emit_progress(&self, fraction: f64, status: PlaybackStatus) {
        let speed = self.state.lock().speed;
        let progress = Payload::Progress(ProgressEvent {
            fraction,
            status: status as i32,
            speed,
        });
        let bytes = self.codec.encode_payload(progress, MessageKind::Command);
        self.bus.publish(&self.channel.topic(), &bytes);
    }

    fn republish(&self, record: &EventLogRecord) {
        match self.codec.rebrand(&record.message) {
            Ok(bytes) => self.bus.publish(&self.channel.topic(), &bytes),
            Err(e) => warn!(
                channel = %self.channel,
                id = record.id,
                "Skipping undecodable record: {}",
                e
            ),
        }
    }

    fn apply_states(&self, timestamp_us: i64) {
        match self.log.states_at(timestamp_us) {
            Ok(records) => {
                for record in &records {
                    self.store.set_entry(self.rebrand_entry(record));
                }
            }
            Err(e) => warn!(channel = %self.channel, "Failed to read states: {}", e),
        }
    }

    /// Load a snapshot into the replay store and republish every entry
    fn restore(&self, selector: &SequenceSelector) -> SessionResult<()> {
        let Some(snapshot) = self.log.get_state_sequence(selector)? else {
            debug!(channel = %self.channel, ?selector, "No snapshot to restore");
            self.store.clear();
            return Ok(());
        };

        let entries: Vec<StateEntry> = snapshot
            .records
            .iter()
            .map(|record| self.rebrand_entry(record))
            .collect();
        self.store.replace(entries.iter().cloned());

        let topic = self.channel.topic();
        for entry in &entries {
            self.bus.publish(&topic, &entry.encoded_message);
        }
        debug!(
            channel = %self.channel,
            seq_id = %snapshot.sequence.seq_id,
            entries = entries.len(),
            "Snapshot restored"
        );
        Ok(())
    }

    fn rebrand_entry(&self, record: &StateLogRecord) -> StateEntry {
        let mut entry = record.to_entry();
        match self.codec.rebrand(&entry.encoded_message) {
            Ok(bytes) => entry.encoded_message = bytes,
            Err(e) => warn!(
                channel = %self.channel,
                key = %entry.key,
                "Keeping state as recorded: {}",
                e
            ),
        }
        entry
    }
}
