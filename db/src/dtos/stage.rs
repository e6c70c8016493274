use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DecodeError;

/// One step of the simulation pipeline. Each stage is backed by its own execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preprocess,
    Simulate,
    Process,
    Postprocess,
    Export,
    Synchronize,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Preprocess,
        Stage::Simulate,
        Stage::Process,
        Stage::Postprocess,
        Stage::Export,
        Stage::Synchronize,
    ];

    /// 1-based position in the pipeline, used to build phase codes.
    pub fn index(self) -> i16 {
        match self {
            Stage::Preprocess => 1,
            Stage::Simulate => 2,
            Stage::Process => 3,
            Stage::Postprocess => 4,
            Stage::Export => 5,
            Stage::Synchronize => 6,
        }
    }

    pub fn from_index(index: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.index() == index)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::Simulate => "simulate",
            Stage::Process => "process",
            Stage::Postprocess => "postprocess",
            Stage::Export => "export",
            Stage::Synchronize => "synchronize",
        }
    }

    /// Noun used in phase names, e.g. `RunningSimulation`.
    pub fn noun(self) -> &'static str {
        match self {
            Stage::Preprocess => "Preprocessing",
            Stage::Simulate => "Simulation",
            Stage::Process => "Processing",
            Stage::Postprocess => "Postprocessing",
            Stage::Export => "Export",
            Stage::Synchronize => "Synchronization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DecodeError::unknown("stage", s))
    }
}

/// Checkpoint inside a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    Allocating,
    Starting,
    Running,
    Finished,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Allocating, Step::Starting, Step::Running, Step::Finished];

    pub fn offset(self) -> i16 {
        match self {
            Step::Allocating => 0,
            Step::Starting => 1,
            Step::Running => 2,
            Step::Finished => 3,
        }
    }

    pub fn from_offset(offset: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.offset() == offset)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Allocating => "Allocating",
            Step::Starting => "Starting",
            Step::Running => "Running",
            Step::Finished => "Finished",
        }
    }
}
