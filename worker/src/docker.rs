use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, ContainerSummary, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use chrono::DateTime;
use db::dtos::UnitState;
use futures::TryStreamExt;
use tracing::debug;

use crate::runtime::LABEL_MANAGED_BY;
use crate::{RuntimeClient, RuntimeError, SnapshotEntry, UnitSpec};

/// Runs execution units as Docker containers on the local engine.
pub struct DockerRuntime {
    docker: Docker,
    label: String,
}

impl DockerRuntime {
    /// Connects with the local defaults (`DOCKER_HOST` or the unix socket).
    /// Only containers labelled with `label` are considered ours.
    pub fn connect(label: impl Into<String>) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|error| RuntimeError::Unavailable(error.to_string()))?;

        Ok(Self {
            docker,
            label: label.into(),
        })
    }

    fn to_entry(&self, container: ContainerSummary) -> Option<SnapshotEntry> {
        let external_id = container.id?;
        let (observed_state, exit_code) = container
            .status
            .as_deref()
            .map_or((UnitState::Unknown, None), parse_status);

        Some(SnapshotEntry {
            external_id,
            observed_state,
            exit_code,
            started_at: container
                .created
                .and_then(|seconds| DateTime::from_timestamp(seconds, 0)),
            stopped_at: None,
            log_tail: None,
            labels: container.labels.unwrap_or_default().into_iter().collect(),
        })
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(error: bollard::errors::Error) -> Self {
        match error {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } if status_code < 500 => RuntimeError::Rejected(message),
            other => RuntimeError::Unavailable(other.to_string()),
        }
    }
}

/// Docker answers 304 when a container already is in the requested state.
fn is_not_modified(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn is_missing(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn list_units(&self) -> Result<Vec<SnapshotEntry>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED_BY}={}", self.label)],
        );

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers: Vec<ContainerSummary> = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|container| self.to_entry(container))
            .collect())
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<String, RuntimeError> {
        let env = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>();

        let mut labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
        labels.insert(LABEL_MANAGED_BY.to_string(), self.label.clone());

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        });

        let container = self.docker.create_container(options, body).await?;
        debug!(name = %spec.name, external_id = %container.id, "Created container");

        Ok(container.id)
    }

    async fn start_unit(&self, external_id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(external_id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(error) if is_not_modified(&error) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn stop_unit(&self, external_id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let options = Some(StopContainerOptions {
            t: Some(i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX)),
            ..Default::default()
        });

        match self.docker.stop_container(external_id, options).await {
            Ok(()) => Ok(()),
            Err(error) if is_not_modified(&error) || is_missing(&error) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn remove_unit(&self, external_id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = Some(RemoveContainerOptions {
            force,
            ..Default::default()
        });

        match self.docker.remove_container(external_id, options).await {
            Ok(()) => Ok(()),
            Err(error) if is_missing(&error) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn fetch_log(&self, external_id: &str, tail_lines: usize) -> Result<String, RuntimeError> {
        let options = Some(LogsOptions {
            stdout: true,
            stderr: true,
            since: 0,
            until: 0,
            timestamps: false,
            follow: false,
            tail: tail_lines.to_string(),
        });

        let mut stream = self.docker.logs(external_id, options);
        let mut log = String::new();

        while let Some(output) = stream.try_next().await? {
            match output {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    log.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }

        Ok(log)
    }
}

/// Maps the textual container status of a listing (`Up 5 minutes`,
/// `Exited (137) 2 hours ago`, ...) to a unit state and exit code.
pub fn parse_status(status: &str) -> (UnitState, Option<i64>) {
    let status = status.trim();

    if status.starts_with("Up") {
        if status.ends_with("(Paused)") {
            return (UnitState::Paused, None);
        }
        return (UnitState::Running, None);
    }

    if let Some(rest) = status.strip_prefix("Exited") {
        return (UnitState::Exited, parenthesized_code(rest));
    }

    if let Some(rest) = status.strip_prefix("Restarting") {
        return (UnitState::Pending, parenthesized_code(rest));
    }

    match status {
        "Created" => (UnitState::Created, None),
        "Dead" => (UnitState::Failed, None),
        "Removal In Progress" => (UnitState::Exited, None),
        _ => (UnitState::Unknown, None),
    }
}

fn parenthesized_code(rest: &str) -> Option<i64> {
    let rest = rest.trim_start().strip_prefix('(')?;
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}
