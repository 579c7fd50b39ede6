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

//! TCP client of an external `sisdk-broker`
//!
//! Publishing shares one lazily opened connection. A failed write drops
//! that connection along with the message; the next publish reconnects.
//! Every subscription opens its own connection read by its listener thread.

use crate::error::{BusError, BusResult};
use crate::protocol::{write_frame, Frame, FrameReader};
use crate::subscription::{CommandHandler, FrameSource, Subscription};
use crate::MessageBus;
use parking_lot::Mutex;
use sisdk_core::BusConfig;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::{debug, warn};

/// Read timeout on subscription sockets, bounds how long unsubscribe waits
const READ_TIMEOUT: Duration = Duration::from_millis(500);

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpBus {
    address: String,
    password: Option<String>,
    publisher: Mutex<Option<TcpStream>>,
}

impl TcpBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            address: config.address(),
            password: config.password.clone(),
            publisher: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self) -> BusResult<TcpStream> {
        let mut stream = TcpStream::connect(&self.address)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        if let Some(password) = &self.password {
            write_frame(
                &mut stream,
                &Frame::Auth {
                    password: password.clone(),
                },
            )?;
        }
        debug!(address = %self.address, "Connected to broker");
        Ok(stream)
    }

    /// Publish, surfacing the error instead of logging it
    pub fn try_publish(&self, topic: &str, data: &[u8]) -> BusResult<()> {
        let mut publisher = self.publisher.lock();
        if publisher.is_none() {
            *publisher = Some(self.connect()?);
        }

        let frame = Frame::Publish {
            topic: topic.to_string(),
            data: data.to_vec(),
        };
        let result = match publisher.as_mut() {
            Some(stream) => write_frame(stream, &frame),
            None => Err(BusError::Closed),
        };
        if result.is_err() {
            *publisher = None;
        }
        result
    }
}

impl MessageBus for TcpBus {
    fn publish(&self, topic: &str, data: &[u8]) {
        if let Err(e) = self.try_publish(topic, data) {
            warn!(topic = %topic, address = %self.address, "Publish dropped: {}", e);
        }
    }

    fn subscribe(&self, topic: &str, on_command: CommandHandler) -> BusResult<Subscription> {
        let mut stream = self.connect()?;
        write_frame(
            &mut stream,
            &Frame::Subscribe {
                topic: topic.to_string(),
            },
        )?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        Subscription::spawn(
            topic,
            TcpSource {
                stream,
                reader: FrameReader::new(),
            },
            on_command,
        )
    }
}

struct TcpSource {
    stream: TcpStream,
    reader: FrameReader,
}

impl FrameSource for TcpSource {
    fn next_frame(&mut self) -> BusResult<Option<Frame>> {
        self.reader.poll(&mut self.stream)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
