//! Worker configuration: JSON file plus environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use firelancer_infra::{ConfigError, JobQueueConfig};
use firelancer_observability::LogFormat;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_MAX_CONNECTIONS: &str = "FIRELANCER_DB_MAX_CONNECTIONS";
pub const ENV_CONFIG_PATH: &str = "FIRELANCER_WORKER_CONFIG";
pub const ENV_HEALTH_HOSTNAME: &str = "FIRELANCER_HEALTH_HOSTNAME";
pub const ENV_HEALTH_PORT: &str = "FIRELANCER_HEALTH_PORT";
pub const ENV_HEALTH_ROUTE: &str = "FIRELANCER_HEALTH_ROUTE";
pub const ENV_LOG_FORMAT: &str = "FIRELANCER_LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum WorkerConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: {message}")]
    InvalidEnv { name: &'static str, message: String },
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
    #[error(transparent)]
    JobQueue(#[from] ConfigError),
}

/// Where the health-check server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub hostname: String,
    pub port: u16,
    pub route: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 3020,
            route: "/health".to_string(),
        }
    }
}

impl HealthCheckConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// The route with exactly one leading slash.
    pub fn normalized_route(&self) -> String {
        format!("/{}", self.route.trim().trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub log_format: LogFormat,
    pub health_check: HealthCheckConfig,
    pub job_queue: JobQueueConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            log_format: LogFormat::Json,
            health_check: HealthCheckConfig::default(),
            job_queue: JobQueueConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load `.env`, then the optional JSON file named by
    /// `FIRELANCER_WORKER_CONFIG`, then apply environment overrides.
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerConfigError> {
        let mut config = match lookup(ENV_CONFIG_PATH) {
            Some(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };

        if let Some(url) = lookup(ENV_DATABASE_URL) {
            config.database_url = url;
        }
        if let Some(value) = lookup(ENV_MAX_CONNECTIONS) {
            config.max_connections = parse_env(ENV_MAX_CONNECTIONS, &value)?;
        }
        if let Some(hostname) = lookup(ENV_HEALTH_HOSTNAME) {
            config.health_check.hostname = hostname;
        }
        if let Some(value) = lookup(ENV_HEALTH_PORT) {
            config.health_check.port = parse_env(ENV_HEALTH_PORT, &value)?;
        }
        if let Some(route) = lookup(ENV_HEALTH_ROUTE) {
            config.health_check.route = route;
        }
        if let Some(value) = lookup(ENV_LOG_FORMAT) {
            config.log_format = parse_env(ENV_LOG_FORMAT, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, WorkerConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| WorkerConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| WorkerConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), WorkerConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(WorkerConfigError::MissingDatabaseUrl);
        }
        self.job_queue.validate()?;
        Ok(())
    }
}

fn parse_env<T>(name: &'static str, value: &str) -> Result<T, WorkerConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| WorkerConfigError::InvalidEnv {
            name,
            message: e.to_string(),
        })
}
