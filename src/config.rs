use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from ratewait.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct WrapperConfig {
    pub agent: AgentConfig,
    pub state: StateConfig,
    pub wait: WaitConfig,
    pub retry: RetryConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    /// Inserted before the user's argument vector on every run.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    pub state_file: PathBuf,
    pub log_file: PathBuf,
    pub lock_file: PathBuf,
    pub max_log_bytes: u64,
}

/// Fallback wait applied when no reset time can be read from the output.
///
/// The day is split into three windows by start hour: day, evening, and
/// night (which wraps past midnight until `day_start_hour`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WaitConfig {
    pub day_start_hour: u32,
    pub evening_start_hour: u32,
    pub night_start_hour: u32,
    pub day_minutes: i64,
    pub evening_minutes: i64,
    pub night_minutes: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub kill_grace_secs: u64,
}

// --- Default implementations ---

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(".claude-wrapper-state.json"),
            log_file: PathBuf::from(".claude-wrapper.log"),
            lock_file: PathBuf::from(".claude-wrapper.lock"),
            max_log_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            day_start_hour: 9,
            evening_start_hour: 18,
            night_start_hour: 23,
            day_minutes: 60,
            evening_minutes: 30,
            night_minutes: 120,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { kill_grace_secs: 5 }
    }
}

impl WaitConfig {
    /// Check that the windows are ordered within a single day and every wait is positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.night_start_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "wait.night_start_hour must be 0-23, got {}",
                self.night_start_hour
            )));
        }
        if !(self.day_start_hour < self.evening_start_hour
            && self.evening_start_hour < self.night_start_hour)
        {
            return Err(ConfigError::Invalid(format!(
                "wait windows must satisfy day_start_hour < evening_start_hour < night_start_hour, got {} / {} / {}",
                self.day_start_hour, self.evening_start_hour, self.night_start_hour
            )));
        }
        for (name, minutes) in [
            ("day_minutes", self.day_minutes),
            ("evening_minutes", self.evening_minutes),
            ("night_minutes", self.night_minutes),
        ] {
            if minutes <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "wait.{name} must be positive, got {minutes}"
                )));
            }
        }
        Ok(())
    }

    /// Minutes to wait when the clock reads `hour` (0-23).
    pub fn minutes_for_hour(&self, hour: u32) -> i64 {
        if hour >= self.day_start_hour && hour < self.evening_start_hour {
            self.day_minutes
        } else if hour >= self.evening_start_hour && hour < self.night_start_hour {
            self.evening_minutes
        } else {
            self.night_minutes
        }
    }
}

impl WrapperConfig {
    /// Anchor relative state paths to `base` (normally the working directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.state.state_file,
            &mut self.state.log_file,
            &mut self.state.lock_file,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

/// Load the config file, falling back to defaults when it does not exist.
pub fn load(path: &Path) -> Result<WrapperConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(WrapperConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let config: WrapperConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.wait.validate()?;
    Ok(config)
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
