use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "console-retry.toml";

/// Top-level configuration loaded from console-retry.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interpreter the command string is handed to (as `<shell> -c <command>`).
    pub shell: String,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Sliding per-line timeout in seconds; 0 disables it.
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub progressive: bool,
    pub skip_timeout_on_last_attempt: bool,
    pub retry_outputs: Vec<String>,
}

// --- Default implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_attempts: 3,
            progressive: false,
            skip_timeout_on_last_attempt: false,
            retry_outputs: Vec::new(),
        }
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A setting is out of range.
    Invalid { message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { message } => write!(f, "invalid config: {}", message),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

/// Load config from `path`.
///
/// When `required` is false a missing file yields the defaults; any other
/// read or parse failure is still an error.
pub fn load(path: &Path, required: bool) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Command-line values layered over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    /// Flags can only switch a setting on.
    pub progressive: bool,
    pub skip_timeout_on_last_attempt: bool,
    /// Appended to the file's list.
    pub retry_outputs: Vec<String>,
}

impl Config {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(t) = overrides.timeout_secs {
            self.retry.timeout_secs = t;
        }
        if let Some(n) = overrides.max_attempts {
            self.retry.max_attempts = n;
        }
        self.retry.progressive |= overrides.progressive;
        self.retry.skip_timeout_on_last_attempt |= overrides.skip_timeout_on_last_attempt;
        for output in overrides.retry_outputs {
            if !self.retry.retry_outputs.contains(&output) {
                self.retry.retry_outputs.push(output);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "max_attempts must be at least 1".to_string(),
            });
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "shell must not be empty".to_string(),
            });
        }
        if self.retry.retry_outputs.iter().any(String::is_empty) {
            return Err(ConfigError::Invalid {
                message: "retry_outputs must not contain empty strings".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve the retry policy. A zero timeout means no timeout.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: match self.retry.timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            max_attempts: self.retry.max_attempts,
            progressive: self.retry.progressive,
            skip_timeout_on_last_attempt: self.retry.skip_timeout_on_last_attempt,
            retry_outputs: self.retry.retry_outputs.clone(),
        }
    }
}

/// Join command words into one shell command line.
///
/// CI systems sometimes inject line breaks into long commands; newlines become
/// spaces and carriage returns are dropped.
pub fn normalize_command(parts: &[String]) -> String {
    parts.join(" ").replace('\n', " ").replace('\r', "")
}
