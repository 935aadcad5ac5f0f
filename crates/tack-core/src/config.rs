//! Engine configuration sourced from the environment.
//!
//! Collaboration parameters (endpoint, identity, project) arrive via
//! environment variables and are validated before any collaborative backend
//! is activated. A missing identity or endpoint is a hard setup failure
//! with a descriptive message, never a silent fallback.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which storage backend a project uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Single-writer JSON file on durable storage
    #[default]
    Local,
    /// Shared SQL database, multi-writer, authoritative
    Relational,
    /// Networked gateway fronting the relational store
    RemoteProxy,
}

impl BackendKind {
    /// Whether this backend needs network or shared-database connectivity
    #[must_use]
    pub const fn is_collaborative(&self) -> bool {
        matches!(self, Self::Relational | Self::RemoteProxy)
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "relational" => Ok(Self::Relational),
            "remote-proxy" | "remote_proxy" | "remote" => Ok(Self::RemoteProxy),
            other => Err(ConfigError::Invalid(format!(
                "unknown backend '{other}', expected local | relational | remote-proxy"
            ))),
        }
    }
}

/// Full engine configuration.
///
/// Constructed once at startup; backends are not hot-swapped mid-operation.
/// Switching backends means building a fresh instance and re-running setup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendKind,
    /// Project scope for all notes
    pub project: String,
    /// Identity used for ownership checks on every mutation
    pub author: String,
    /// Distinguishes this client instance during sync; fresh per process
    pub session_id: String,
    /// Gateway base URL (remote-proxy only)
    pub api_url: Option<String>,
    /// SQLite database path (relational only)
    pub db_path: Option<String>,
    /// Directory holding the local notes file (local only)
    pub notes_dir: Option<String>,
    /// Explicit notes file name; when absent the most recently modified
    /// matching file in `notes_dir` wins
    pub notes_file: Option<String>,
    /// Flush the local file after every mutation
    pub auto_flush: bool,
    /// Sync dispatcher polling interval
    pub poll_interval: Duration,
    /// Initial reconnection backoff delay
    pub retry_base: Duration,
    /// Backoff ceiling
    pub retry_max: Duration,
}

impl EngineConfig {
    /// Minimal config for a local single-user project.
    #[must_use]
    pub fn local(project: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Local,
            project: project.into(),
            author: author.into(),
            session_id: Uuid::now_v7().to_string(),
            api_url: None,
            db_path: None,
            notes_dir: None,
            notes_file: None,
            auto_flush: true,
            poll_interval: Duration::from_secs(5),
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
        }
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = value_or_default(&lookup, "TACK_BACKEND", "local").parse::<BackendKind>()?;

        let project = required_trimmed(&lookup, "TACK_PROJECT")?;
        let author = required_trimmed(&lookup, "TACK_AUTHOR")?;

        let api_url = optional_trimmed(&lookup, "TACK_API_URL");
        let db_path = optional_trimmed(&lookup, "TACK_DB_PATH");
        let notes_dir = optional_trimmed(&lookup, "TACK_NOTES_DIR");
        let notes_file = optional_trimmed(&lookup, "TACK_NOTES_FILE");

        let auto_flush = value_or_default(&lookup, "TACK_AUTO_FLUSH", "true")
            .parse::<bool>()
            .map_err(|_| ConfigError::Invalid("TACK_AUTO_FLUSH must be true or false".into()))?;

        let poll_interval = duration_secs(&lookup, "TACK_POLL_INTERVAL_SECS", 5)?;
        let retry_base = duration_secs(&lookup, "TACK_RETRY_BASE_SECS", 5)?;
        let retry_max = duration_secs(&lookup, "TACK_RETRY_MAX_SECS", 300)?;
        if retry_max < retry_base {
            return Err(ConfigError::Invalid(
                "TACK_RETRY_MAX_SECS must be >= TACK_RETRY_BASE_SECS".to_string(),
            ));
        }

        let config = Self {
            backend,
            project,
            author,
            session_id: Uuid::now_v7().to_string(),
            api_url,
            db_path,
            notes_dir,
            notes_file,
            auto_flush,
            poll_interval,
            retry_base,
            retry_max,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate backend-specific requirements before activation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.author.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "author identity must not be empty".to_string(),
            ));
        }
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "project name must not be empty".to_string(),
            ));
        }
        match self.backend {
            BackendKind::RemoteProxy => {
                let url = self.api_url.as_deref().ok_or(ConfigError::MissingVar(
                    "TACK_API_URL (required for the remote-proxy backend)",
                ))?;
                if !is_http_url(url) {
                    return Err(ConfigError::Invalid(format!(
                        "TACK_API_URL must start with http:// or https://, got '{url}'"
                    )));
                }
            }
            BackendKind::Relational => {
                if self.db_path.is_none() {
                    return Err(ConfigError::MissingVar(
                        "TACK_DB_PATH (required for the relational backend)",
                    ));
                }
            }
            BackendKind::Local => {}
        }
        Ok(())
    }

    /// Gateway base URL with any trailing slash removed.
    #[must_use]
    pub fn normalized_api_url(&self) -> Option<String> {
        self.api_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn required_trimmed(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn value_or_default(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = value_or_default(lookup, name, &default.to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be a positive integer")))?;
    if secs == 0 {
        return Err(ConfigError::Invalid(format!("{name} must be >= 1")));
    }
    Ok(Duration::from_secs(secs))
}
