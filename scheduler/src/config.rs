use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::templates::{StageTemplates, TemplateError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} must be a number, got `{value}`")]
    Invalid { name: &'static str, value: String },

    #[error(transparent)]
    Templates(#[from] TemplateError),
}

/// Process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub nats_url: Option<String>,
    pub redis_url: Option<String>,
    pub loki_url: Option<String>,
    pub reconcile_interval: Duration,
    pub snapshot_timeout: Duration,
    pub lease_ttl: Duration,
    pub max_concurrent_jobs: usize,
    pub stop_timeout: Duration,
    pub log_tail_lines: usize,
    pub worker_threads: usize,
    pub worker_concurrency: usize,
    pub runtime_label: String,
    pub stage_templates: Option<PathBuf>,
    pub data_root: Option<String>,
}

impl Config {
    /// Reads the process environment after loading `.env`, if any.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let optional = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        Ok(Self {
            database_url: optional("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            max_connections: number(&lookup, "MAX_CONNECTIONS", 10)?,
            nats_url: optional("NATS_URL"),
            redis_url: optional("REDIS_URL"),
            loki_url: optional("LOKI_URL"),
            reconcile_interval: Duration::from_secs(number(&lookup, "RECONCILE_INTERVAL_SECS", 15)?),
            snapshot_timeout: Duration::from_secs(number(&lookup, "SNAPSHOT_TIMEOUT_SECS", 30)?),
            lease_ttl: Duration::from_secs(number(&lookup, "LEASE_TTL_SECS", 120)?),
            max_concurrent_jobs: number(&lookup, "MAX_CONCURRENT_JOBS", 4)?,
            stop_timeout: Duration::from_secs(number(&lookup, "STOP_TIMEOUT_SECS", 30)?),
            log_tail_lines: number(&lookup, "LOG_TAIL_LINES", 200)?,
            worker_threads: number(&lookup, "WORKER_THREADS", 2)?,
            worker_concurrency: number(&lookup, "WORKER_CONCURRENCY", 8)?,
            runtime_label: optional("RUNTIME_LABEL")
                .unwrap_or_else(|| "simulation-manager".to_string()),
            stage_templates: optional("STAGE_TEMPLATES").map(PathBuf::from),
            data_root: optional("DATA_ROOT"),
        })
    }

    /// Loads the stage templates file. Without one every allocation fails its job.
    pub fn load_templates(&self) -> Result<StageTemplates, ConfigError> {
        match &self.stage_templates {
            Some(path) => Ok(StageTemplates::load(path)?),
            None => Ok(StageTemplates::default()),
        }
    }
}

fn number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/sim")]))
            .unwrap();

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.reconcile_interval, Duration::from_secs(15));
        assert_eq!(config.snapshot_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.runtime_label, "simulation-manager");
        assert!(config.nats_url.is_none());
    }

    #[test]
    fn database_url_is_required() {
        let error = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(error, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let error = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/sim"),
            ("MAX_CONCURRENT_JOBS", "many"),
        ]))
        .unwrap_err();

        assert!(matches!(
            error,
            ConfigError::Invalid { name: "MAX_CONCURRENT_JOBS", .. }
        ));
    }
}
