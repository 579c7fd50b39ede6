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

//! Channel identity
//!
//! A channel is `{kind, instance, mode}` and renders as `KIND_INSTANCE_MODE`
//! (e.g. `CR_42_LIVE`). The same identity scopes the outbound bus topic, the
//! inbound control topic, the state-store namespace and the event-log file.

use crate::error::{Result, SisdkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Suffix appended to a channel name to form its control topic
const CONTROL_SUFFIX: &str = ".control";

/// Whether a channel carries real-time events or re-emits a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mode {
    Live,
    Replay,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Live => "LIVE",
            Mode::Replay => "REPLAY",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = SisdkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LIVE" => Ok(Mode::Live),
            "REPLAY" => Ok(Mode::Replay),
            other => Err(SisdkError::InvalidChannel(format!("unknown mode '{}'", other))),
        }
    }
}

/// Identity of one session's bus traffic, state and log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId {
    kind: String,
    instance: String,
    mode: Mode,
}

impl ChannelId {
    /// Build a channel identity.
    ///
    /// `kind` may not contain `_` (it separates the name components); both
    /// parts are limited to ASCII alphanumerics, `-` and `_` so the name is
    /// safe as a topic and a file name.
    pub fn new(kind: impl Into<String>, instance: impl Into<String>, mode: Mode) -> Result<Self> {
        let kind = kind.into();
        let instance = instance.into();

        if kind.is_empty() || kind.contains('_') || !is_name_safe(&kind) {
            return Err(SisdkError::InvalidChannel(format!("invalid kind '{}'", kind)));
        }
        if instance.is_empty() || !is_name_safe(&instance) {
            return Err(SisdkError::InvalidChannel(format!(
                "invalid instance '{}'",
                instance
            )));
        }

        Ok(Self {
            kind,
            instance,
            mode,
        })
    }

    pub fn live(kind: impl Into<String>, instance: impl Into<String>) -> Result<Self> {
        Self::new(kind, instance, Mode::Live)
    }

    pub fn replay(kind: impl Into<String>, instance: impl Into<String>) -> Result<Self> {
        Self::new(kind, instance, Mode::Replay)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_live(&self) -> bool {
        self.mode == Mode::Live
    }

    /// Same kind and instance under another mode
    pub fn with_mode(&self, mode: Mode) -> Self {
        Self {
            kind: self.kind.clone(),
            instance: self.instance.clone(),
            mode,
        }
    }

    /// Canonical `KIND_INSTANCE_MODE` name
    pub fn name(&self) -> String {
        format!("{}_{}_{}", self.kind, self.instance, self.mode)
    }

    /// Topic outbound sequence messages are published on
    pub fn topic(&self) -> String {
        self.name()
    }

    /// Topic inbound client commands arrive on
    pub fn control_topic(&self) -> String {
        format!("{}{}", self.name(), CONTROL_SUFFIX)
    }

    /// File name of this channel's event log
    pub fn log_file_name(&self) -> String {
        format!("{}.db", self.name())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.kind, self.instance, self.mode)
    }
}

impl FromStr for ChannelId {
    type Err = SisdkError;

    fn from_str(s: &str) -> Result<Self> {
        let (rest, mode) = s
            .rsplit_once('_')
            .ok_or_else(|| SisdkError::InvalidChannel(s.to_string()))?;
        let (kind, instance) = rest
            .split_once('_')
            .ok_or_else(|| SisdkError::InvalidChannel(s.to_string()))?;
        ChannelId::new(kind, instance, mode.parse()?)
    }
}

fn is_name_safe(part: &str) -> bool {
    part.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
