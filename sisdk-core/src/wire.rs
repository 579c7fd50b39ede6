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

//! Protobuf wire messages
//!
//! Visualization clients are not written in Rust, so everything that crosses
//! the bus is protobuf. The equivalent `.proto` schema:
//!
//! ```text
//! message SequenceMessage { Header header = 1; repeated AtomMessage atoms = 2; }
//! message Header { string id = 1; int64 timestamp_us = 2; string origin_server = 3;
//!                  string channel = 4; MessageKind kind = 5; }
//! message AtomMessage { string type_tag = 1; uint32 wait_ms = 2; bytes payload = 3; }
//! message RequestEnvelope { oneof action { SeekRequest seek = 1; PauseRequest pause = 2;
//!                  PlayRequest play = 3; SpeedRequest speed = 4; DomainRequest domain = 5; } }
//! ```

/// Envelope of one or more ordered, delay-tagged fragments
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SequenceMessage {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<Header>,
    #[prost(message, repeated, tag = "2")]
    pub atoms: ::prost::alloc::vec::Vec<AtomMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub timestamp_us: i64,
    #[prost(string, tag = "3")]
    pub origin_server: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub channel: ::prost::alloc::string::String,
    #[prost(enumeration = "MessageKind", tag = "5")]
    pub kind: i32,
}

/// One self-contained payload; `wait_ms` is a pre-delay applied by the client
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AtomMessage {
    #[prost(string, tag = "1")]
    pub type_tag: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub wait_ms: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    Behavior = 0,
    Command = 1,
    Request = 2,
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// Line drawn from attacker to target, optionally followed by an impact
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttackEvent {
    #[prost(string, tag = "1")]
    pub source: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub target: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub technique: ::prost::alloc::string::String,
    #[prost(bool, tag = "4")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopologyEvent {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(enumeration = "TopologyAction", tag = "2")]
    pub action: i32,
    #[prost(string, tag = "3")]
    pub label: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "4")]
    pub links: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TopologyAction {
    Add = 0,
    Remove = 1,
    Update = 2,
}

/// Scoreboard row for one team
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScoreEvent {
    #[prost(string, tag = "1")]
    pub team: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub score: i64,
    #[prost(uint32, tag = "3")]
    pub rank: u32,
}

/// Progress of a team on a task or puzzle
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskEvent {
    #[prost(string, tag = "1")]
    pub task_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub team: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub status: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TextValue {
    #[prost(string, tag = "1")]
    pub text: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageValue {
    #[prost(string, tag = "1")]
    pub url: ::prost::alloc::string::String,
}

/// Elapsed or countdown clock, as of the moment it was published
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClockValue {
    #[prost(enumeration = "ClockMode", tag = "1")]
    pub mode: i32,
    #[prost(double, tag = "2")]
    pub seconds: f64,
    #[prost(bool, tag = "3")]
    pub running: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ClockMode {
    Elapsed = 0,
    Countdown = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WallClockValue {
    #[prost(int64, tag = "1")]
    pub unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FocusEvent {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
}

/// Replay position reported to clients
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProgressEvent {
    #[prost(double, tag = "1")]
    pub fraction: f64,
    #[prost(enumeration = "PlaybackStatus", tag = "2")]
    pub status: i32,
    #[prost(double, tag = "3")]
    pub speed: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PlaybackStatus {
    Playing = 0,
    Paused = 1,
}

// ---------------------------------------------------------------------------
// Inbound requests
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestEnvelope {
    #[prost(oneof = "request_envelope::Action", tags = "1, 2, 3, 4, 5")]
    pub action: ::core::option::Option<request_envelope::Action>,
}

pub mod request_envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Action {
        #[prost(message, tag = "1")]
        Seek(super::SeekRequest),
        #[prost(message, tag = "2")]
        Pause(super::PauseRequest),
        #[prost(message, tag = "3")]
        Play(super::PlayRequest),
        #[prost(message, tag = "4")]
        Speed(super::SpeedRequest),
        #[prost(message, tag = "5")]
        Domain(super::DomainRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SeekRequest {
    #[prost(double, tag = "1")]
    pub fraction: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PauseRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlayRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpeedRequest {
    #[prost(double, tag = "1")]
    pub multiplier: f64,
}

/// Click, focus or any other request only a collaborator understands
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DomainRequest {
    #[prost(string, tag = "1")]
    pub type_tag: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}
