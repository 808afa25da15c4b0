//! Engine lifecycle states and the command surface accepted by the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::location::LocationState;

/// Top-level lifecycle of the engine.
///
/// Exactly one engine exists per process; only the engine state machine
/// mutates this value, under its serializing lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Point-in-time view returned by a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: EngineState,
    /// Label of the resolver candidate applied by the open tunnel, if any.
    pub resolver_label: Option<String>,
    pub location_state: LocationState,
}

/// Commands accepted by the engine's command queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum EngineCommand {
    Start { profile: String },
    Stop,
    Restart { profile: String },
    RunSequence { sequence_id: String },
    QueryStatus,
    RetryPositioning,
    Shutdown,
}

impl EngineCommand {
    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop => "stop",
            Self::Restart { .. } => "restart",
            Self::RunSequence { .. } => "run",
            Self::QueryStatus => "status",
            Self::RetryPositioning => "retry-positioning",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Failure to parse a textual command line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("command {0:?} requires an argument")]
    MissingArgument(&'static str),
}

impl FromStr for EngineCommand {
    type Err = ParseCommandError;

    /// Parse a whitespace separated command line such as `start home`.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ParseCommandError::Empty)?;
        let arg = words.next().map(str::to_string);

        match verb.to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start {
                profile: arg.ok_or(ParseCommandError::MissingArgument("start"))?,
            }),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart {
                profile: arg.ok_or(ParseCommandError::MissingArgument("restart"))?,
            }),
            "run" => Ok(Self::RunSequence {
                sequence_id: arg.ok_or(ParseCommandError::MissingArgument("run"))?,
            }),
            "status" => Ok(Self::QueryStatus),
            "retry-positioning" => Ok(Self::RetryPositioning),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(ParseCommandError::Unknown(other.to_string())),
        }
    }
}
