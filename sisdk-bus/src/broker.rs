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

//! Fan-out broker for [`TcpBus`](crate::TcpBus) clients
//!
//! # Connection Lifecycle
//!
//! ```text
//! 1. Accept thread polls a non-blocking listener and hands each client
//!    to its own connection thread
//! 2. If a password is configured the first frame must be a matching Auth
//! 3. Subscribe/Unsubscribe/Publish frames update the topic table or fan
//!    out; outbound frames go through a per-client writer thread
//! 4. On disconnect the client is removed from every topic
//! ```

use crate::error::{BusError, BusResult};
use crate::protocol::{write_frame, Frame, FrameReader};
use crate::topics::TopicTable;
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use sisdk_core::BrokerConfig;
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(10);

const READ_TIMEOUT: Duration = Duration::from_millis(500);

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct BrokerShared {
    password: Option<String>,
    table: Mutex<TopicTable>,
    /// Socket clones used to unblock connection threads on shutdown
    connections: Mutex<HashMap<u64, TcpStream>>,
    next_id: AtomicU64,
}

pub struct TcpBroker {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    shared: Arc<BrokerShared>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpBroker {
    /// Bind the listen address and start accepting clients
    pub fn bind(config: &BrokerConfig) -> BusResult<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(BrokerShared {
            password: config.password.clone(),
            table: Mutex::new(TopicTable::default()),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let accept_handle = {
            let running = Arc::clone(&running);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("sisdk-broker-accept".to_string())
                .spawn(move || accept_loop(listener, running, shared))
                .map_err(|e| BusError::Spawn(e.to_string()))?
        };

        info!(
            addr = %local_addr,
            auth = config.password.is_some(),
            "Broker listening"
        );

        Ok(Self {
            local_addr,
            running,
            shared,
            accept_handle: Mutex::new(Some(accept_handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared.table.lock().count(topic)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Block until the broker shuts down
    pub fn wait(&self) {
        let handle = self.accept_handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Broker accept thread panicked");
            }
        }
    }

    /// Stop accepting and disconnect every client. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for (_, stream) in self.shared.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.wait();
        info!(addr = %self.local_addr, "Broker stopped");
    }
}

impl Drop for TcpBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, running: Arc<AtomicBool>, shared: Arc<BrokerShared>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(peer = %peer, "Failed to set client socket blocking: {}", e);
                    continue;
                }

                let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                let running = Arc::clone(&running);
                let shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("sisdk-broker-conn-{}", id))
                    .spawn(move || {
                        if let Err(e) = handle_connection(id, stream, &running, &shared) {
                            debug!(client = id, "Connection ended with error: {}", e);
                        }
                        shared.table.lock().remove_all(id);
                        shared.connections.lock().remove(&id);
                        info!(client = id, peer = %peer, "Client disconnected");
                    });
                if let Err(e) = spawned {
                    error!(peer = %peer, "Failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!("Error accepting client connection: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_connection(
    id: u64,
    mut stream: TcpStream,
    running: &AtomicBool,
    shared: &BrokerShared,
) -> BusResult<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    shared.connections.lock().insert(id, stream.try_clone()?);
    info!(client = id, peer = ?stream.peer_addr().ok(), "Client connected");

    let (tx, rx) = crossbeam::channel::unbounded::<Frame>();
    let mut writer_stream = stream.try_clone()?;
    let writer = thread::Builder::new()
        .name(format!("sisdk-broker-write-{}", id))
        .spawn(move || {
            for frame in rx.iter() {
                if let Err(e) = write_frame(&mut writer_stream, &frame) {
                    debug!(client = id, "Write failed: {}", e);
                    break;
                }
            }
        })
        .map_err(|e| BusError::Spawn(e.to_string()))?;

    let result = read_loop(id, &mut stream, &tx, running, shared);

    // Writer drains until every sender (ours and the topic table's) is gone
    shared.table.lock().remove_all(id);
    drop(tx);
    if writer.join().is_err() {
        warn!(client = id, "Writer thread panicked");
    }
    let _ = stream.shutdown(Shutdown::Both);
    result
}

fn read_loop(
    id: u64,
    stream: &mut TcpStream,
    tx: &Sender<Frame>,
    running: &AtomicBool,
    shared: &BrokerShared,
) -> BusResult<()> {
    let mut reader = FrameReader::new();
    let mut authenticated = shared.password.is_none();

    while running.load(Ordering::Acquire) {
        let frame = match reader.poll(stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(BusError::Closed) => return Ok(()),
            Err(BusError::Frame(e)) => {
                warn!(client = id, "Skipping undecodable frame: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        if !authenticated {
            match frame {
                Frame::Auth { password } if shared.password.as_deref() == Some(password.as_str()) => {
                    authenticated = true;
                    debug!(client = id, "Client authenticated");
                    continue;
                }
                Frame::Auth { .. } => {
                    warn!(client = id, "Rejected client with wrong password");
                    let _ = tx.send(Frame::Error {
                        reason: "invalid password".to_string(),
                    });
                    return Err(BusError::Refused("invalid password".to_string()));
                }
                _ => {
                    warn!(client = id, "Rejected unauthenticated client");
                    let _ = tx.send(Frame::Error {
                        reason: "authentication required".to_string(),
                    });
                    return Err(BusError::Refused("authentication required".to_string()));
                }
            }
        }

        match frame {
            Frame::Auth { .. } => {}
            Frame::Subscribe { topic } => {
                let subscribers = shared.table.lock().add(&topic, id, tx.clone());
                debug!(client = id, topic = %topic, subscribers, "Subscribe");
                let _ = tx.send(Frame::Subscribed { topic, subscribers });
            }
            Frame::Unsubscribe { topic } => {
                shared.table.lock().remove(&topic, id);
                debug!(client = id, topic = %topic, "Unsubscribe");
            }
            Frame::Publish { topic, data } => {
                shared.table.lock().fan_out(&topic, &data);
            }
            other => {
                let _ = tx.send(Frame::Error {
                    reason: format!("unexpected frame from client: {}", frame_name(&other)),
                });
            }
        }
    }
    Ok(())
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Auth { .. } => "Auth",
        Frame::Subscribe { .. } => "Subscribe",
        Frame::Unsubscribe { .. } => "Unsubscribe",
        Frame::Publish { .. } => "Publish",
        Frame::Subscribed { .. } => "Subscribed",
        Frame::Message { .. } => "Message",
        Frame::Error { .. } => "Error",
    }
}

/// Bind a broker from configuration and serve until it is shut down
pub fn run_broker(config: &BrokerConfig) -> BusResult<()> {
    let broker = TcpBroker::bind(config)?;
    broker.wait();
    Ok(())
}
