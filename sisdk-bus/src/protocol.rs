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

//! Broker wire protocol
//!
//! Every frame on a broker connection is a bincode-encoded [`Frame`]
//! behind a length prefix:
//!
//! ```text
//! ┌──────────────────┬─────────────────────┐
//! │ Length (4 bytes) │ bincode Frame       │
//! │ Big-endian u32   │ (variable size)     │
//! └──────────────────┴─────────────────────┘
//! ```
//!
//! Control commands published by clients are JSON [`ControlEnvelope`]s
//! carried as the `data` of a `Publish` frame.

use crate::error::{BusError, BusResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

/// Upper bound on a single frame body
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    // client -> broker
    Auth { password: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, data: Vec<u8> },

    // broker -> client
    /// Subscription confirmed; carries the topic's subscriber count
    Subscribed { topic: String, subscribers: u32 },
    Message { topic: String, data: Vec<u8> },
    Error { reason: String },
}

pub fn encode_frame(frame: &Frame) -> BusResult<Vec<u8>> {
    let body = bincode::serialize(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(BusError::FrameTooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(LEN_PREFIX + body.len());
    buf.write_u32::<BigEndian>(body.len() as u32)?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> BusResult<()> {
    let buf = encode_frame(frame)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Blocking read of exactly one frame
pub fn read_frame<R: Read>(reader: &mut R) -> BusResult<Frame> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(BusError::Closed),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(BusError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

/// Incremental frame reader for sockets with a read timeout.
///
/// A timeout can land in the middle of a frame, so bytes are buffered
/// across calls instead of using `read_exact` on the stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next complete frame, or `Ok(None)` if the read timed out first
    pub fn poll<R: Read>(&mut self, reader: &mut R) -> BusResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match reader.read(&mut chunk) {
                Ok(0) => return Err(BusError::Closed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_frame(&mut self) -> BusResult<Option<Frame>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = BigEndian::read_u32(&self.buf[..LEN_PREFIX]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(BusError::FrameTooLarge(len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame = bincode::deserialize(&self.buf[LEN_PREFIX..LEN_PREFIX + len]);
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(frame?))
    }
}

pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Command a client publishes on a control topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub client_id: String,
    pub command: String,
}

impl ControlEnvelope {
    pub fn new(client_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            command: command.into(),
        }
    }

    pub fn encode(&self) -> BusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> BusResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A decoded control command delivered to a subscription handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub topic: String,
    pub client_id: String,
    pub command: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    /// Reader that hands out at most `step` bytes per call, then times out once
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
        timed_out: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.timed_out {
                self.timed_out = true;
                return Err(ErrorKind::WouldBlock.into());
            }
            self.timed_out = false;
            let end = (self.pos + self.step).min(self.data.len()).min(self.pos + buf.len());
            let n = end - self.pos;
            buf[..n].copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            Ok(n)
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::Publish {
            topic: "CR_42_LIVE".to_string(),
            data: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        assert_eq!(BigEndian::read_u32(&buf[..4]) as usize, buf.len() - 4);
        assert_eq!(read_frame(&mut Cursor::new(buf)).unwrap(), frame);
    }

    #[test]
    fn test_read_frame_eof_is_closed() {
        let err = read_frame(&mut Cursor::new(Vec::<u8>::new())).unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>((MAX_FRAME_SIZE + 1) as u32).unwrap();
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, BusError::FrameTooLarge(_)));
    }

    #[test]
    fn test_frame_reader_survives_timeouts_mid_frame() {
        let frames = vec![
            Frame::Subscribed {
                topic: "t".to_string(),
                subscribers: 1,
            },
            Frame::Message {
                topic: "t".to_string(),
                data: b"hello".to_vec(),
            },
        ];
        let mut data = Vec::new();
        for frame in &frames {
            data.extend(encode_frame(frame).unwrap());
        }
        let mut source = Trickle {
            data,
            pos: 0,
            step: 3,
            timed_out: false,
        };

        let mut reader = FrameReader::new();
        let mut received = Vec::new();
        let mut timeouts = 0;
        while received.len() < frames.len() {
            match reader.poll(&mut source).unwrap() {
                Some(frame) => received.push(frame),
                None => timeouts += 1,
            }
        }
        assert_eq!(received, frames);
        assert!(timeouts > 1);
        assert!(matches!(reader.poll(&mut source), Ok(None)));
        assert!(matches!(reader.poll(&mut source), Err(BusError::Closed)));
    }

    proptest! {
        #[test]
        fn prop_frame_reader_reassembles_any_split(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 1..8),
            step in 1usize..64,
        ) {
            let frames: Vec<Frame> = payloads
                .into_iter()
                .map(|data| Frame::Message { topic: "CR_1_LIVE".to_string(), data })
                .collect();
            let mut data = Vec::new();
            for frame in &frames {
                data.extend(encode_frame(frame).unwrap());
            }
            let mut source = Trickle { data, pos: 0, step, timed_out: false };

            let mut reader = FrameReader::new();
            let mut received = Vec::new();
            while received.len() < frames.len() {
                if let Some(frame) = reader.poll(&mut source).unwrap() {
                    received.push(frame);
                }
            }
            prop_assert_eq!(received, frames);
        }
    }

    #[test]
    fn test_control_envelope_json() {
        let envelope = ControlEnvelope::decode(br#"{"client_id":"c1","command":"CLIENT_CONNECTED"}"#)
            .unwrap();
        assert_eq!(envelope, ControlEnvelope::new("c1", "CLIENT_CONNECTED"));
        assert!(ControlEnvelope::decode(b"not json").is_err());
    }
}
