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

//! Sequence message codec
//!
//! Outbound, a list of `(payload, wait_ms)` fragments becomes one
//! [`SequenceMessage`]: each fragment is wrapped in an atom tagged with its
//! payload type, and the header gets a fresh id and timestamp.
//!
//! Inbound, control-topic commands are either a sentinel string
//! (`CLIENT_CONNECTED`, `CLIENT_CLOSED`) or a base64 [`RequestEnvelope`].
//! Anything that fails to parse is reported as unrecognized, never as a
//! panic, so a listener loop can log it and move on.

use crate::channel::ChannelId;
use crate::error::{Result, SisdkError};
use crate::payload::Payload;
use crate::time::now_micros;
use crate::wire::{
    request_envelope::Action, AtomMessage, DomainRequest, Header, MessageKind, PauseRequest,
    PlayRequest, RequestEnvelope, SeekRequest, SequenceMessage, SpeedRequest,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use prost::Message;
use tracing::debug;

/// Sentinel sent by a client right after it (re)connects
pub const CLIENT_CONNECTED: &str = "CLIENT_CONNECTED";

/// Sentinel sent by a client when it goes away
pub const CLIENT_CLOSED: &str = "CLIENT_CLOSED";

/// One payload plus the pre-delay the client applies before presenting it
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub payload: Payload,
    pub wait_ms: u32,
}

impl Fragment {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            wait_ms: 0,
        }
    }

    pub fn after(wait_ms: u32, payload: Payload) -> Self {
        Self { payload, wait_ms }
    }
}

/// Frames payload fragments for one channel
#[derive(Debug, Clone)]
pub struct Codec {
    origin_server: String,
    channel: String,
}

impl Codec {
    pub fn new(origin_server: impl Into<String>, channel: &ChannelId) -> Self {
        Self {
            origin_server: origin_server.into(),
            channel: channel.name(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Serialize fragments into a sequence message with a fresh header
    pub fn encode(&self, fragments: &[Fragment], kind: MessageKind) -> Vec<u8> {
        let atoms = fragments
            .iter()
            .map(|fragment| AtomMessage {
                type_tag: fragment.payload.type_tag().to_string(),
                wait_ms: fragment.wait_ms,
                payload: fragment.payload.encode_body(),
            })
            .collect();

        SequenceMessage {
            header: Some(self.header(kind)),
            atoms,
        }
        .encode_to_vec()
    }

    /// Shorthand for a single fragment without delay
    pub fn encode_payload(&self, payload: Payload, kind: MessageKind) -> Vec<u8> {
        self.encode(&[Fragment::new(payload)], kind)
    }

    /// Re-issue a recorded message under this codec's channel.
    ///
    /// Atoms are kept byte-for-byte; the header gets a fresh id and
    /// timestamp so a replayed message looks like any live one.
    pub fn rebrand(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut message = SequenceMessage::decode(bytes)?;
        let kind = message
            .header
            .as_ref()
            .map(|h| h.kind())
            .ok_or(SisdkError::MissingHeader)?;
        message.header = Some(self.header(kind));
        Ok(message.encode_to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<SequenceMessage> {
        let message = SequenceMessage::decode(bytes)?;
        if message.header.is_none() {
            return Err(SisdkError::MissingHeader);
        }
        Ok(message)
    }

    /// Decode a sequence message into typed fragments
    pub fn decode_fragments(bytes: &[u8]) -> Result<Vec<Fragment>> {
        Self::decode(bytes)?
            .atoms
            .iter()
            .map(|atom| {
                Ok(Fragment {
                    payload: Payload::decode(&atom.type_tag, &atom.payload)?,
                    wait_ms: atom.wait_ms,
                })
            })
            .collect()
    }

    fn header(&self, kind: MessageKind) -> Header {
        Header {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp_us: now_micros(),
            origin_server: self.origin_server.clone(),
            channel: self.channel.clone(),
            kind: kind as i32,
        }
    }
}

/// Request a client can send on the control topic
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Seek { fraction: f64 },
    Pause,
    Play,
    Speed { multiplier: f64 },
    Domain { type_tag: String, body: Vec<u8> },
}

impl ClientRequest {
    /// Whether a replay engine handles this request
    pub fn is_playback(&self) -> bool {
        !matches!(self, ClientRequest::Domain { .. })
    }

    /// Base64 form suitable as a control-topic command
    pub fn to_command(&self) -> String {
        STANDARD.encode(encode_client_request(self))
    }
}

/// Classification of a raw control-topic command
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRequest {
    Connected,
    Closed,
    Request(ClientRequest),
    Unrecognized,
}

pub fn encode_client_request(request: &ClientRequest) -> Vec<u8> {
    let action = match request {
        ClientRequest::Seek { fraction } => Action::Seek(SeekRequest {
            fraction: *fraction,
        }),
        ClientRequest::Pause => Action::Pause(PauseRequest {}),
        ClientRequest::Play => Action::Play(PlayRequest {}),
        ClientRequest::Speed { multiplier } => Action::Speed(SpeedRequest {
            multiplier: *multiplier,
        }),
        ClientRequest::Domain { type_tag, body } => Action::Domain(DomainRequest {
            type_tag: type_tag.clone(),
            body: body.clone(),
        }),
    };
    RequestEnvelope {
        action: Some(action),
    }
    .encode_to_vec()
}

/// Parse a request envelope; `None` for anything malformed or unknown
pub fn decode_client_request(bytes: &[u8]) -> Option<ClientRequest> {
    let envelope = RequestEnvelope::decode(bytes).ok()?;
    match envelope.action? {
        Action::Seek(seek) if seek.fraction.is_finite() => Some(ClientRequest::Seek {
            fraction: seek.fraction.clamp(0.0, 1.0),
        }),
        Action::Seek(_) => None,
        Action::Pause(_) => Some(ClientRequest::Pause),
        Action::Play(_) => Some(ClientRequest::Play),
        Action::Speed(speed) if speed.multiplier.is_finite() && speed.multiplier > 0.0 => {
            Some(ClientRequest::Speed {
                multiplier: speed.multiplier,
            })
        }
        Action::Speed(_) => None,
        Action::Domain(domain) if !domain.type_tag.is_empty() => Some(ClientRequest::Domain {
            type_tag: domain.type_tag,
            body: domain.body,
        }),
        Action::Domain(_) => None,
    }
}

/// Classify a control-topic command string
pub fn parse_command(raw: &str) -> InboundRequest {
    let raw = raw.trim();
    match raw {
        CLIENT_CONNECTED => return InboundRequest::Connected,
        CLIENT_CLOSED => return InboundRequest::Closed,
        _ => {}
    }

    let bytes = match STANDARD.decode(raw) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Command is not base64: {}", e);
            return InboundRequest::Unrecognized;
        }
    };

    match decode_client_request(&bytes) {
        Some(request) => InboundRequest::Request(request),
        None => InboundRequest::Unrecognized,
    }
}
