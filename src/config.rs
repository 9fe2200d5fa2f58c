use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub compositor: CompositorConfig,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Deserialize)]
pub struct CompositorConfig {
    #[serde(default = "d3")]
    pub startup_attempts: u32,
    #[serde(default = "d200")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "d30000")]
    pub reconnect_max_ms: u64,
}
fn d3() -> u32 {
    3
}
fn d200() -> u64 {
    200
}
fn d30000() -> u64 {
    30_000
}
impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            startup_attempts: d3(),
            reconnect_initial_ms: d200(),
            reconnect_max_ms: d30000(),
        }
    }
}

impl CompositorConfig {
    /// At least one attempt, whatever the file says.
    pub fn startup_attempts(&self) -> u32 {
        self.startup_attempts.max(1)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms).max(self.reconnect_initial())
    }
}

#[derive(Debug, Deserialize)]
pub struct Logging {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}
fn default_level() -> String {
    "info".into()
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// `$XDG_CONFIG_HOME/mpris-idle-inhibit/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mpris-idle-inhibit").join("config.toml"))
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Loads `explicit` if given, else the default path. Only a missing default file
    /// falls back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let Some(path) = default_path() else {
            return Ok(Self::default());
        };
        match Self::from_file(&path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }
}
