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

//! Payload sum type
//!
//! Every fragment carried by a sequence message is one of these variants.
//! The type tag written into the atom is derived from the variant, and
//! decoding dispatches on that tag.

use crate::error::{Result, SisdkError};
use crate::wire::{
    AttackEvent, ClockValue, FocusEvent, ImageValue, ProgressEvent, ScoreEvent, TaskEvent,
    TextValue, TopologyEvent, WallClockValue,
};
use prost::Message;

pub const ATTACK_TAG: &str = "sisdk.AttackEvent";
pub const TOPOLOGY_TAG: &str = "sisdk.TopologyEvent";
pub const SCORE_TAG: &str = "sisdk.ScoreEvent";
pub const TASK_TAG: &str = "sisdk.TaskEvent";
pub const TEXT_TAG: &str = "sisdk.TextValue";
pub const IMAGE_TAG: &str = "sisdk.ImageValue";
pub const CLOCK_TAG: &str = "sisdk.ClockValue";
pub const WALL_CLOCK_TAG: &str = "sisdk.WallClockValue";
pub const FOCUS_TAG: &str = "sisdk.FocusEvent";
pub const PROGRESS_TAG: &str = "sisdk.ProgressEvent";

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Attack(AttackEvent),
    Topology(TopologyEvent),
    Score(ScoreEvent),
    Task(TaskEvent),
    Text(TextValue),
    Image(ImageValue),
    Clock(ClockValue),
    WallClock(WallClockValue),
    Focus(FocusEvent),
    Progress(ProgressEvent),
}

impl Payload {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Payload::Attack(_) => ATTACK_TAG,
            Payload::Topology(_) => TOPOLOGY_TAG,
            Payload::Score(_) => SCORE_TAG,
            Payload::Task(_) => TASK_TAG,
            Payload::Text(_) => TEXT_TAG,
            Payload::Image(_) => IMAGE_TAG,
            Payload::Clock(_) => CLOCK_TAG,
            Payload::WallClock(_) => WALL_CLOCK_TAG,
            Payload::Focus(_) => FOCUS_TAG,
            Payload::Progress(_) => PROGRESS_TAG,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Payload::Attack(m) => m.encode_to_vec(),
            Payload::Topology(m) => m.encode_to_vec(),
            Payload::Score(m) => m.encode_to_vec(),
            Payload::Task(m) => m.encode_to_vec(),
            Payload::Text(m) => m.encode_to_vec(),
            Payload::Image(m) => m.encode_to_vec(),
            Payload::Clock(m) => m.encode_to_vec(),
            Payload::WallClock(m) => m.encode_to_vec(),
            Payload::Focus(m) => m.encode_to_vec(),
            Payload::Progress(m) => m.encode_to_vec(),
        }
    }

    pub fn decode(type_tag: &str, body: &[u8]) -> Result<Self> {
        let payload = match type_tag {
            ATTACK_TAG => Payload::Attack(AttackEvent::decode(body)?),
            TOPOLOGY_TAG => Payload::Topology(TopologyEvent::decode(body)?),
            SCORE_TAG => Payload::Score(ScoreEvent::decode(body)?),
            TASK_TAG => Payload::Task(TaskEvent::decode(body)?),
            TEXT_TAG => Payload::Text(TextValue::decode(body)?),
            IMAGE_TAG => Payload::Image(ImageValue::decode(body)?),
            CLOCK_TAG => Payload::Clock(ClockValue::decode(body)?),
            WALL_CLOCK_TAG => Payload::WallClock(WallClockValue::decode(body)?),
            FOCUS_TAG => Payload::Focus(FocusEvent::decode(body)?),
            PROGRESS_TAG => Payload::Progress(ProgressEvent::decode(body)?),
            other => return Err(SisdkError::UnknownPayload(other.to_string())),
        };
        Ok(payload)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text(TextValue { text: text.into() })
    }

    pub fn image(url: impl Into<String>) -> Self {
        Payload::Image(ImageValue { url: url.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ClockMode;

    #[test]
    fn test_payload_decode_by_tag() {
        let clock = Payload::Clock(ClockValue {
            mode: ClockMode::Countdown as i32,
            seconds: 300.0,
            running: true,
        });
        let decoded = Payload::decode(clock.type_tag(), &clock.encode_body()).unwrap();
        assert_eq!(decoded, clock);
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let err = Payload::decode("sisdk.Nope", &[]).unwrap_err();
        assert!(matches!(err, SisdkError::UnknownPayload(tag) if tag == "sisdk.Nope"));
    }
}
