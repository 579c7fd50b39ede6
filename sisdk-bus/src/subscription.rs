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

//! Subscription listener threads
//!
//! Each subscription owns one named thread that pulls frames from its
//! source, decodes control envelopes and hands them to the handler. The
//! source returns `Ok(None)` on a read timeout so the loop can observe the
//! running flag without blocking forever.

use crate::error::{BusError, BusResult};
use crate::protocol::{ControlEnvelope, Frame, InboundCommand};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Callback invoked for every inbound control command
pub type CommandHandler = Arc<dyn Fn(InboundCommand) + Send + Sync>;

/// Where a listener thread gets its frames from
pub trait FrameSource: Send + 'static {
    /// Next frame; `Ok(None)` when nothing arrived within the poll interval
    fn next_frame(&mut self) -> BusResult<Option<Frame>>;

    /// Called once when the listener exits
    fn close(&mut self) {}
}

/// Handle on a running listener thread
pub struct Subscription {
    topic: String,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn spawn<S: FrameSource>(
        topic: &str,
        mut source: S,
        handler: CommandHandler,
    ) -> BusResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let thread_topic = topic.to_string();

        let handle = thread::Builder::new()
            .name(format!("sisdk-sub-{}", topic))
            .spawn(move || {
                listen(&thread_topic, &mut source, &handler, &thread_running);
                source.close();
                thread_running.store(false, Ordering::Release);
                debug!(topic = %thread_topic, "Listener exited");
            })
            .map_err(|e| BusError::Spawn(e.to_string()))?;

        info!(topic = %topic, "Subscribed");
        Ok(Self {
            topic: topic.to_string(),
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the listener thread is still running
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the listener. Idempotent.
    ///
    /// Called from inside the handler this only signals the loop; the
    /// thread exits after the handler returns.
    pub fn unsubscribe(&self) {
        self.running.store(false, Ordering::Release);

        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            debug!(topic = %self.topic, "Unsubscribe from listener thread, not joining");
            return;
        }

        if handle.join().is_err() {
            warn!(topic = %self.topic, "Listener thread panicked");
        }
        info!(topic = %self.topic, "Unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

fn listen<S: FrameSource>(
    topic: &str,
    source: &mut S,
    handler: &CommandHandler,
    running: &AtomicBool,
) {
    while running.load(Ordering::Acquire) {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(BusError::Closed) => {
                if running.load(Ordering::Acquire) {
                    warn!(topic = %topic, "Subscription source closed");
                }
                break;
            }
            Err(BusError::Frame(e)) => {
                warn!(topic = %topic, "Skipping undecodable frame: {}", e);
                continue;
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    warn!(topic = %topic, "Subscription receive failed: {}", e);
                }
                break;
            }
        };

        match frame {
            Frame::Subscribed { subscribers, .. } => {
                debug!(topic = %topic, subscribers, "Subscription confirmed");
            }
            Frame::Message { data, .. } => match ControlEnvelope::decode(&data) {
                Ok(envelope) => {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    let command = InboundCommand {
                        topic: topic.to_string(),
                        client_id: envelope.client_id,
                        command: envelope.command,
                    };
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(command)));
                    if let Err(panic) = outcome {
                        warn!(topic = %topic, "Command handler panicked: {}", panic_message(&*panic));
                    }
                }
                Err(e) => warn!(topic = %topic, "Ignoring malformed control message: {}", e),
            },
            Frame::Error { reason } => warn!(topic = %topic, "Broker error: {}", reason),
            other => debug!(topic = %topic, "Ignoring unexpected frame: {:?}", other),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
