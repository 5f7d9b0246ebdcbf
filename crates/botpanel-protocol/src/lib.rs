pub mod paths;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest accepted bot name.
pub const MAX_BOT_ID_LEN: usize = 64;
/// Default cap for a single inbound control frame.
pub const MAX_CONTROL_FRAME_BYTES: usize = 8 * 1024;
/// Default cap for one stdin line injected through `command`.
pub const MAX_INPUT_LINE_BYTES: usize = 4 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BotIdError {
    #[error("bot id must not be empty")]
    Empty,

    #[error("bot id longer than {MAX_BOT_ID_LEN} characters")]
    TooLong,

    #[error("bot id must not start with '.'")]
    LeadingDot,

    #[error("bot id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Validated name of a bot: one working directory, at most one live process.
///
/// Only `[A-Za-z0-9_.-]` is allowed and a leading dot is rejected, so a
/// `BotId` can always be joined onto the bots directory without escaping it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BotId(String);

impl BotId {
    pub fn parse(raw: &str) -> Result<Self, BotIdError> {
        if raw.is_empty() {
            return Err(BotIdError::Empty);
        }
        if raw.chars().count() > MAX_BOT_ID_LEN {
            return Err(BotIdError::TooLong);
        }
        if raw.starts_with('.') {
            return Err(BotIdError::LeadingDot);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(BotIdError::InvalidChar(bad));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BotId {
    type Err = BotIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BotId {
    type Error = BotIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BotId> for String {
    fn from(id: BotId) -> Self {
        id.0
    }
}

/// Operator action carried by an `action` event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionCmd {
    Run,
    Stop,
    Install,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub bot_id: String,
    pub cmd: ActionCmd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, alias = "version", skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub bot_id: String,
    pub command: String,
}

/// Client-to-server messages, one JSON text frame each.
///
/// Bot ids stay raw strings here; the gateway validates them so a bad name
/// produces an `error` event instead of a dropped frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Join(String),
    Leave(String),
    Action(ActionRequest),
    Command(CommandRequest),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    pub bot_id: BotId,
    pub seq: u64,
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub bot_id: Option<String>,
}

/// Server-to-client messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Output(OutputPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>, bot_id: Option<&str>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
            bot_id: bot_id.map(str::to_string),
        })
    }
}

/// Entry returned by the read-only status API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub bot_id: BotId,
    pub running: bool,
    pub pid: Option<u32>,
}
