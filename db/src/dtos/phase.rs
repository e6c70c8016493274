use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Stage, Step};
use crate::DecodeError;

/// Pipeline checkpoint of a job.
///
/// Phases advance forward only, except for the abort path which is reachable
/// from every non-terminal phase. The numeric [`Phase::code`] is what gets
/// persisted; decoding an unknown code is a [`DecodeError::PhaseDataCorruption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    New,
    Queued,
    Stage(Stage, Step),
    Idle,
    RemovingUnits,
    Finished,
    Failed,
    Stopped,
    StartingAbort,
    Aborting,
    FinishedAbort,
}

impl Phase {
    pub const TERMINAL: [Phase; 4] = [
        Phase::Finished,
        Phase::Failed,
        Phase::Stopped,
        Phase::FinishedAbort,
    ];

    pub fn code(self) -> i16 {
        match self {
            Phase::New => 0,
            Phase::Queued => 5,
            Phase::Stage(stage, step) => stage.index() * 10 + step.offset(),
            Phase::Idle => 70,
            Phase::RemovingUnits => 80,
            Phase::Finished => 90,
            Phase::Failed => 91,
            Phase::Stopped => 92,
            Phase::StartingAbort => 100,
            Phase::Aborting => 101,
            Phase::FinishedAbort => 102,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, DecodeError> {
        let phase = match code {
            0 => Phase::New,
            5 => Phase::Queued,
            70 => Phase::Idle,
            80 => Phase::RemovingUnits,
            90 => Phase::Finished,
            91 => Phase::Failed,
            92 => Phase::Stopped,
            100 => Phase::StartingAbort,
            101 => Phase::Aborting,
            102 => Phase::FinishedAbort,
            10..=69 => {
                match (Stage::from_index(code / 10), Step::from_offset(code % 10)) {
                    (Some(stage), Some(step)) => Phase::Stage(stage, step),
                    _ => return Err(DecodeError::PhaseDataCorruption { code }),
                }
            }
            _ => return Err(DecodeError::PhaseDataCorruption { code }),
        };

        Ok(phase)
    }

    /// Every phase in code order.
    pub fn all() -> impl Iterator<Item = Phase> {
        let stages = Stage::ALL
            .into_iter()
            .flat_map(|stage| Step::ALL.into_iter().map(move |step| Phase::Stage(stage, step)));

        [Phase::New, Phase::Queued]
            .into_iter()
            .chain(stages)
            .chain([
                Phase::Idle,
                Phase::RemovingUnits,
                Phase::Finished,
                Phase::Failed,
                Phase::Stopped,
                Phase::StartingAbort,
                Phase::Aborting,
                Phase::FinishedAbort,
            ])
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn is_aborting(self) -> bool {
        matches!(self, Phase::StartingAbort | Phase::Aborting)
    }

    /// Whether a job in this phase occupies one of the global compute slots.
    pub fn holds_slot(self) -> bool {
        !matches!(self, Phase::New | Phase::Queued) && !self.is_terminal()
    }

    pub fn stage(self) -> Option<Stage> {
        match self {
            Phase::Stage(stage, _) => Some(stage),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Stage(stage, step) => write!(f, "{}{}", step.as_str(), stage.noun()),
            Phase::New => f.write_str("New"),
            Phase::Queued => f.write_str("Queued"),
            Phase::Idle => f.write_str("Idle"),
            Phase::RemovingUnits => f.write_str("RemovingUnits"),
            Phase::Finished => f.write_str("Finished"),
            Phase::Failed => f.write_str("Failed"),
            Phase::Stopped => f.write_str("Stopped"),
            Phase::StartingAbort => f.write_str("StartingAbort"),
            Phase::Aborting => f.write_str("Aborting"),
            Phase::FinishedAbort => f.write_str("FinishedAbort"),
        }
    }
}

impl FromStr for Phase {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::all()
            .find(|phase| phase.to_string() == s)
            .ok_or_else(|| DecodeError::UnknownPhaseName(s.to_string()))
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}
