use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DecodeError;

/// State of a backing compute unit, used for both the desired and the observed side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitState {
    NonExistent,
    Created,
    /// Pending or restarting.
    Pending,
    Running,
    Paused,
    /// Exited or succeeded; success additionally requires exit code 0.
    Exited,
    /// Failed or dead.
    Failed,
    Unknown,
}

impl UnitState {
    pub const ALL: [UnitState; 8] = [
        UnitState::NonExistent,
        UnitState::Created,
        UnitState::Pending,
        UnitState::Running,
        UnitState::Paused,
        UnitState::Exited,
        UnitState::Failed,
        UnitState::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::NonExistent => "non-existent",
            UnitState::Created => "created",
            UnitState::Pending => "pending",
            UnitState::Running => "running",
            UnitState::Paused => "paused",
            UnitState::Exited => "exited",
            UnitState::Failed => "failed",
            UnitState::Unknown => "unknown",
        }
    }

    /// The unit exists in the runtime.
    pub fn exists(self) -> bool {
        self != UnitState::NonExistent
    }

    /// The unit has stopped executing for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Exited | UnitState::Failed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitState {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DecodeError::unknown("unit state", s))
    }
}
