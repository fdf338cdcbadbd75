//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default dependency install command, run inside the package directory.
pub const DEFAULT_INSTALL_COMMAND: &[&str] = &[
    "python3",
    "-m",
    "pip",
    "install",
    "--quiet",
    "--target",
    ".deps",
    "-r",
    "requirements.txt",
];

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the fleet server.
    pub server_url: String,
    /// Pre-provisioned API key. Replaced by the key returned on registration.
    pub api_key: Option<SecretString>,
    /// Tenant this agent belongs to.
    pub tenant_id: Option<String>,
    /// Root for identity, package cache, execution directories and logs.
    pub data_dir: PathBuf,
    /// Freshness window for cached packages requested without a version.
    pub cache_ttl: Duration,
    /// Packages not checked for this long are evicted by the janitor.
    pub cache_max_age: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Job poll interval.
    pub poll_interval: Duration,
    /// Upper bound for the retry backoff after transport failures.
    pub retry_max: Duration,
    /// Timeout for jobs that do not carry their own.
    pub default_job_timeout: Duration,
    /// Timeout for a single HTTP request.
    pub request_timeout: Duration,
    /// Disables screenshot capture.
    pub headless: bool,
    /// External screenshot command; `{path}` is replaced by the target file.
    pub screenshot_command: Option<Vec<String>>,
    /// Dependency install command.
    pub install_command: Vec<String>,
    /// Declared capabilities, sent on registration.
    pub capabilities: Vec<String>,
    /// Free-form tags, sent on registration.
    pub tags: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            api_key: None,
            tenant_id: None,
            data_dir: PathBuf::from("./data"),
            cache_ttl: Duration::from_secs(3600),          // 1 hour
            cache_max_age: Duration::from_secs(7 * 86400), // 1 week
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            retry_max: Duration::from_secs(300),
            default_job_timeout: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(30),
            headless: false,
            screenshot_command: None,
            install_command: DEFAULT_INSTALL_COMMAND
                .iter()
                .map(|s| s.to_string())
                .collect(),
            capabilities: Vec::new(),
            tags: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `FLEET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server_url = get("FLEET_SERVER_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("FLEET_SERVER_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            match get(key) {
                Some(raw) => parse_value::<u64>(key, &raw).map(Duration::from_secs),
                None => Ok(default),
            }
        };

        let positive_secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            let value = secs(key, default)?;
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1 second".to_string(),
                });
            }
            Ok(value)
        };

        let headless = match get("FLEET_HEADLESS") {
            Some(raw) => parse_bool("FLEET_HEADLESS", &raw)?,
            None => defaults.headless,
        };

        Ok(Self {
            server_url,
            api_key: get("FLEET_API_KEY").map(SecretString::from),
            tenant_id: get("FLEET_TENANT_ID"),
            data_dir: get("FLEET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cache_ttl: secs("FLEET_CACHE_TTL_SECS", defaults.cache_ttl)?,
            cache_max_age: secs("FLEET_CACHE_MAX_AGE_SECS", defaults.cache_max_age)?,
            heartbeat_interval: positive_secs("FLEET_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            poll_interval: positive_secs("FLEET_POLL_SECS", defaults.poll_interval)?,
            retry_max: positive_secs("FLEET_RETRY_MAX_SECS", defaults.retry_max)?,
            default_job_timeout: positive_secs("FLEET_JOB_TIMEOUT_SECS", defaults.default_job_timeout)?,
            request_timeout: positive_secs("FLEET_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            headless,
            screenshot_command: get("FLEET_SCREENSHOT_CMD").map(|raw| split_words(&raw)),
            install_command: get("FLEET_INSTALL_CMD")
                .map(|raw| split_words(&raw))
                .unwrap_or(defaults.install_command),
            capabilities: get("FLEET_CAPABILITIES")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            tags: get("FLEET_TAGS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
        })
    }

    /// Directory holding cached packages and the metadata index.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }

    /// Directory holding per-execution working directories.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("executions")
    }

    /// Directory for the agent's own rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Path of the persisted agent identity.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

fn split_words(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
