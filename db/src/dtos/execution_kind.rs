use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Stage;
use crate::DecodeError;

/// Which pipeline variant a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Main,
    Reprocess,
    Repostprocess,
    ReprocessAndRepostprocess,
}

impl ExecutionKind {
    pub const ALL: [ExecutionKind; 4] = [
        ExecutionKind::Main,
        ExecutionKind::Reprocess,
        ExecutionKind::Repostprocess,
        ExecutionKind::ReprocessAndRepostprocess,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionKind::Main => "main",
            ExecutionKind::Reprocess => "reprocess",
            ExecutionKind::Repostprocess => "repostprocess",
            ExecutionKind::ReprocessAndRepostprocess => "reprocess_and_repostprocess",
        }
    }

    pub fn stages(self) -> &'static [Stage] {
        match self {
            ExecutionKind::Main => &Stage::ALL,
            ExecutionKind::Reprocess => &[Stage::Process, Stage::Export, Stage::Synchronize],
            ExecutionKind::Repostprocess => {
                &[Stage::Postprocess, Stage::Export, Stage::Synchronize]
            }
            ExecutionKind::ReprocessAndRepostprocess => &[
                Stage::Process,
                Stage::Postprocess,
                Stage::Export,
                Stage::Synchronize,
            ],
        }
    }

    pub fn first_stage(self) -> Stage {
        self.stages()[0]
    }

    /// Stage following `stage` in this variant, `None` after the last one.
    pub fn next_stage(self, stage: Stage) -> Option<Stage> {
        let stages = self.stages();
        let position = stages.iter().position(|candidate| *candidate == stage)?;
        stages.get(position + 1).copied()
    }

    /// Number of stages of this variant that come strictly before `stage`.
    pub fn completed_before(self, stage: Stage) -> usize {
        self.stages()
            .iter()
            .position(|candidate| *candidate == stage)
            .unwrap_or(0)
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::unknown("execution kind", s))
    }
}
