// Daemon configuration.
//
// Resolution order (later wins):
//   1. built-in defaults
//   2. TOML file at `$CONCLAVE_CONFIG` or `~/.conclave/daemon.toml`
//   3. `CONCLAVE_*` environment variables

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use conclave_common::{clamped_setting_duration, setting_duration, ConfigError, TimeoutConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PREFIX: &str = "CONCLAVE_";
pub const CONFIG_PATH_ENV: &str = "CONCLAVE_CONFIG";

/// Root directory for daemon state: `~/.conclave/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".conclave"))
}

/// Path to the default config file: `~/.conclave/daemon.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    global_dir().map(|dir| dir.join("daemon.toml"))
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file `{path}`: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("failed to parse config file `{path}`: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Process-wide daemon settings. Immutable once the server starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    /// Accepted hello tokens. Empty disables authentication.
    pub auth_tokens: Vec<String>,
    pub tool_timeout_secs: f64,
    pub ping_interval_secs: f64,
    pub ping_timeout_secs: f64,
    pub hello_timeout_secs: f64,
    pub session_idle_timeout_secs: f64,
    pub expert_poll_interval_secs: f64,
    pub expert_heartbeat_interval_secs: f64,
    pub max_concurrent_calls: usize,
    pub max_concurrent_calls_per_session: usize,
    pub progress_min_interval_ms: u64,
    pub workflow_state_ttl_secs: f64,
    pub max_frame_bytes: usize,
    pub blocking_workers: usize,
    /// Endpoint for the HTTP provider (neutral JSON envelope).
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
    /// Local command fed the prompt on stdin; stdout is the analysis.
    pub provider_command: Option<String>,
    /// Fallback tracing filter when neither `CONCLAVE_LOG` nor `RUST_LOG` is set.
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            auth_tokens: Vec::new(),
            tool_timeout_secs: 120.0,
            ping_interval_secs: 15.0,
            ping_timeout_secs: 10.0,
            hello_timeout_secs: 10.0,
            session_idle_timeout_secs: 1800.0,
            expert_poll_interval_secs: 0.1,
            expert_heartbeat_interval_secs: 5.0,
            max_concurrent_calls: 16,
            max_concurrent_calls_per_session: 4,
            progress_min_interval_ms: 250,
            workflow_state_ttl_secs: 3600.0,
            max_frame_bytes: 4 * 1024 * 1024,
            blocking_workers: 4,
            provider_url: None,
            provider_api_key: None,
            provider_command: None,
            log_filter: "info".into(),
        }
    }
}

impl DaemonConfig {
    /// Load file + environment and validate.
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_with(|key| std::env::var(key))
    }

    /// Testable loader that accepts an environment lookup function.
    pub fn load_with<F>(env: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let path = env(CONFIG_PATH_ENV).ok().map(PathBuf::from).or_else(default_config_path);
        let base = match path {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        let config = base.with_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment, no file. Validated.
    pub fn from_env_fn<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let config = Self::default().with_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file without applying the environment.
    pub fn load_from(path: &Path) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigLoadError::Io { path: path.to_path_buf(), source })?;
        toml::from_str(&contents)
            .map_err(|source| ConfigLoadError::Parse { path: path.to_path_buf(), source })
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigLoadError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| ConfigLoadError::Io { path: parent.to_path_buf(), source })?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|source| ConfigLoadError::Io { path: path.to_path_buf(), source })
    }

    /// Apply `CONCLAVE_*` overrides on top of `self`.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CONCLAVE_LISTEN_ADDR` | `127.0.0.1:8765` |
    /// | `CONCLAVE_AUTH_TOKENS` | *(none: auth disabled)* |
    /// | `CONCLAVE_TOOL_TIMEOUT_SECS` | `120` |
    /// | `CONCLAVE_PING_INTERVAL_SECS` | `15` |
    /// | `CONCLAVE_PING_TIMEOUT_SECS` | `10` |
    /// | `CONCLAVE_HELLO_TIMEOUT_SECS` | `10` |
    /// | `CONCLAVE_SESSION_IDLE_TIMEOUT_SECS` | `1800` |
    /// | `CONCLAVE_EXPERT_POLL_INTERVAL_SECS` | `0.1` |
    /// | `CONCLAVE_EXPERT_HEARTBEAT_INTERVAL_SECS` | `5` |
    /// | `CONCLAVE_MAX_CONCURRENT_CALLS` | `16` |
    /// | `CONCLAVE_MAX_CONCURRENT_CALLS_PER_SESSION` | `4` |
    /// | `CONCLAVE_PROGRESS_MIN_INTERVAL_MS` | `250` |
    /// | `CONCLAVE_WORKFLOW_STATE_TTL_SECS` | `3600` |
    /// | `CONCLAVE_MAX_FRAME_BYTES` | `4194304` |
    /// | `CONCLAVE_BLOCKING_WORKERS` | `4` |
    /// | `CONCLAVE_PROVIDER_URL` | *(none)* |
    /// | `CONCLAVE_PROVIDER_API_KEY` | *(none)* |
    /// | `CONCLAVE_PROVIDER_COMMAND` | *(none)* |
    /// | `CONCLAVE_LOG_FILTER` | `info` |
    pub fn with_env_overrides<F>(mut self, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let lookup = |key: &str| env(&format!("{ENV_PREFIX}{key}")).ok();

        if let Some(raw) = lookup("LISTEN_ADDR") {
            self.listen_addr = parse_value("LISTEN_ADDR", &raw)?;
        }
        if let Some(raw) = lookup("AUTH_TOKENS") {
            self.auth_tokens = raw
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }

        override_parsed(&lookup, "TOOL_TIMEOUT_SECS", &mut self.tool_timeout_secs)?;
        override_parsed(&lookup, "PING_INTERVAL_SECS", &mut self.ping_interval_secs)?;
        override_parsed(&lookup, "PING_TIMEOUT_SECS", &mut self.ping_timeout_secs)?;
        override_parsed(&lookup, "HELLO_TIMEOUT_SECS", &mut self.hello_timeout_secs)?;
        override_parsed(&lookup, "SESSION_IDLE_TIMEOUT_SECS", &mut self.session_idle_timeout_secs)?;
        override_parsed(&lookup, "EXPERT_POLL_INTERVAL_SECS", &mut self.expert_poll_interval_secs)?;
        override_parsed(
            &lookup,
            "EXPERT_HEARTBEAT_INTERVAL_SECS",
            &mut self.expert_heartbeat_interval_secs,
        )?;
        override_parsed(&lookup, "MAX_CONCURRENT_CALLS", &mut self.max_concurrent_calls)?;
        override_parsed(
            &lookup,
            "MAX_CONCURRENT_CALLS_PER_SESSION",
            &mut self.max_concurrent_calls_per_session,
        )?;
        override_parsed(&lookup, "PROGRESS_MIN_INTERVAL_MS", &mut self.progress_min_interval_ms)?;
        override_parsed(&lookup, "WORKFLOW_STATE_TTL_SECS", &mut self.workflow_state_ttl_secs)?;
        override_parsed(&lookup, "MAX_FRAME_BYTES", &mut self.max_frame_bytes)?;
        override_parsed(&lookup, "BLOCKING_WORKERS", &mut self.blocking_workers)?;

        if let Some(raw) = lookup("PROVIDER_URL") {
            self.provider_url = non_empty(raw);
        }
        if let Some(raw) = lookup("PROVIDER_API_KEY") {
            self.provider_api_key = non_empty(raw);
        }
        if let Some(raw) = lookup("PROVIDER_COMMAND") {
            self.provider_command = non_empty(raw);
        }
        if let Some(raw) = lookup("LOG_FILTER") {
            self.log_filter = raw;
        }

        Ok(self)
    }

    /// Startup gate: every numeric setting must be usable and the timeout
    /// hierarchy must be consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts()?;

        for (name, value) in [
            ("ping_interval_secs", self.ping_interval_secs),
            ("ping_timeout_secs", self.ping_timeout_secs),
            ("hello_timeout_secs", self.hello_timeout_secs),
            ("session_idle_timeout_secs", self.session_idle_timeout_secs),
            ("expert_poll_interval_secs", self.expert_poll_interval_secs),
            ("expert_heartbeat_interval_secs", self.expert_heartbeat_interval_secs),
            ("workflow_state_ttl_secs", self.workflow_state_ttl_secs),
        ] {
            setting_duration(name, value)?;
        }

        for (name, value) in [
            ("max_concurrent_calls", self.max_concurrent_calls),
            ("max_concurrent_calls_per_session", self.max_concurrent_calls_per_session),
            ("max_frame_bytes", self.max_frame_bytes),
            ("blocking_workers", self.blocking_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }

        if self.max_concurrent_calls_per_session > self.max_concurrent_calls {
            return Err(ConfigError::Invalid(format!(
                "max_concurrent_calls_per_session ({}) exceeds max_concurrent_calls ({})",
                self.max_concurrent_calls_per_session, self.max_concurrent_calls
            )));
        }

        if let Some(provider_url) = &self.provider_url {
            url::Url::parse(provider_url).map_err(|error| {
                ConfigError::Invalid(format!("provider_url `{provider_url}` is not a URL: {error}"))
            })?;
        }

        Ok(())
    }

    pub fn timeouts(&self) -> Result<TimeoutConfig, ConfigError> {
        TimeoutConfig::from_secs(self.tool_timeout_secs)
    }

    pub fn auth_required(&self) -> bool {
        !self.auth_tokens.is_empty()
    }

    pub fn accepts_token(&self, token: &str) -> bool {
        !self.auth_required() || self.auth_tokens.iter().any(|accepted| accepted == token)
    }

    pub fn ping_interval(&self) -> Duration {
        clamped_setting_duration(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        clamped_setting_duration(self.ping_timeout_secs)
    }

    pub fn hello_timeout(&self) -> Duration {
        clamped_setting_duration(self.hello_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        clamped_setting_duration(self.session_idle_timeout_secs)
    }

    pub fn expert_poll_interval(&self) -> Duration {
        clamped_setting_duration(self.expert_poll_interval_secs)
    }

    pub fn expert_heartbeat_interval(&self) -> Duration {
        clamped_setting_duration(self.expert_heartbeat_interval_secs)
    }

    pub fn progress_min_interval(&self) -> Duration {
        Duration::from_millis(self.progress_min_interval_ms)
    }

    pub fn workflow_state_ttl(&self) -> Duration {
        clamped_setting_duration(self.workflow_state_ttl_secs)
    }
}

fn override_parsed<T, L>(lookup: &L, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = parse_value(key, &raw)?;
    }
    Ok(())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|error| ConfigError::Invalid(format!("{ENV_PREFIX}{key}=`{raw}`: {error}")))
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
