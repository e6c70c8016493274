use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use db::dtos::{ExecutionUnit, Job, Stage, UnitBackend};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use worker::runtime::{LABEL_JOB, LABEL_MANAGED_BY, LABEL_STAGE, LABEL_UNIT};
use worker::UnitSpec;

/// Mount point of `DATA_ROOT` inside every unit.
pub const DATA_MOUNT: &str = "/data";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("failed to read stage templates from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid stage templates: {0}")]
    Parse(#[from] serde_json::Error),
}

fn container() -> UnitBackend {
    UnitBackend::Container
}

/// How to run one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    #[serde(default = "container")]
    pub backend: UnitBackend,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub binds: Vec<String>,
}

impl StageTemplate {
    pub fn container(image: impl Into<String>) -> Self {
        Self {
            backend: UnitBackend::Container,
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            binds: Vec::new(),
        }
    }

    pub fn workflow(definition: impl Into<String>) -> Self {
        Self {
            backend: UnitBackend::Workflow,
            ..Self::container(definition)
        }
    }

    /// Builds the runtime spec for `unit`, labelled so its runtime entry can be
    /// traced back to the job and unit.
    pub fn unit_spec(
        &self,
        job: &Job,
        unit: &ExecutionUnit,
        runtime_label: &str,
        data_root: Option<&str>,
    ) -> UnitSpec {
        let short_id = unit.id.simple().to_string();

        let mut env = self.env.clone();
        env.insert("SIM_JOB_ID".to_string(), job.id.to_string());
        env.insert("SIM_STAGE".to_string(), unit.stage.to_string());

        let mut binds = self.binds.clone();
        if let Some(root) = data_root {
            binds.push(format!("{root}:{DATA_MOUNT}"));
        }

        let labels = BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), runtime_label.to_string()),
            (LABEL_JOB.to_string(), job.id.to_string()),
            (LABEL_UNIT.to_string(), unit.id.to_string()),
            (LABEL_STAGE.to_string(), unit.stage.to_string()),
        ]);

        UnitSpec {
            name: format!("sim-{}-{}-{}", job.key, unit.stage, &short_id[..8]),
            image: self.image.clone(),
            command: self.command.clone(),
            env,
            binds,
            labels,
        }
    }
}

/// Stage name to template, loaded from the `STAGE_TEMPLATES` JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct StageTemplates {
    stages: HashMap<Stage, StageTemplate>,
}

impl StageTemplates {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, TemplateError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn with(mut self, stage: Stage, template: StageTemplate) -> Self {
        self.stages.insert(stage, template);
        self
    }

    /// Every stage runs `image` in a container.
    pub fn uniform(image: &str) -> Self {
        Stage::ALL
            .into_iter()
            .fold(Self::default(), |templates, stage| {
                templates.with(stage, StageTemplate::container(image))
            })
    }

    pub fn get(&self, stage: Stage) -> Option<&StageTemplate> {
        self.stages.get(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
