use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "SHEX_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub cancel: CancelConfig,
    pub harvest: HarvestConfig,
    pub launch: LaunchConfig,
    pub subshell: SubshellConfig,
    pub log: LogConfig,
}

impl Config {
    /// Loads the file named by `SHEX_CONFIG`, or the defaults when unset.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}

/// Tuning for the keyboard snooping done while a foreground stage runs.
/// These are empirical values, not a contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub detach_strikes: u32,
    pub focus_strikes: u32,
    pub pending_input_delay_ms: u64,
    pub confirm_delay_ms: u64,
    /// Hand keys typed while a stage ran to the next prompt instead of
    /// discarding them.
    pub keep_typeahead: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            detach_strikes: 3,
            focus_strikes: 3,
            pending_input_delay_ms: 100,
            confirm_delay_ms: 30,
            keep_typeahead: false,
        }
    }
}

impl MonitorConfig {
    pub fn pending_input_delay(&self) -> Duration {
        Duration::from_millis(self.pending_input_delay_ms)
    }

    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CancelConfig {
    pub grace_period_ms: u64,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self { grace_period_ms: 50 }
    }
}

impl CancelConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Size of the first environment read, before subtracting the page offset.
    pub probe_window: usize,
    /// Granularity used to shrink failed reads.
    pub page_size: usize,
    pub poll_interval_ms: u64,
    pub interpreter: PathBuf,
    pub batch_extensions: Vec<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            probe_window: 64 * 1024,
            page_size: 4096,
            poll_interval_ms: 5,
            interpreter: PathBuf::from("/bin/sh"),
            batch_extensions: vec!["sh".into()],
        }
    }
}

impl HarvestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub opener: PathBuf,
    pub script_extension: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        };

        Self {
            opener: PathBuf::from(opener),
            script_extension: "shx".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubshellConfig {
    /// Overrides `SHEXSPEC` when set.
    pub program: Option<PathBuf>,
    pub switch: String,
}

impl Default for SubshellConfig {
    fn default() -> Self {
        Self {
            program: None,
            switch: "--subshell".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub file_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_name: "shex.log".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [monitor]
            detach_strikes = 5

            [subshell]
            program = "/bin/sh"
            switch = "-c"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.detach_strikes, 5);
        assert_eq!(config.monitor.focus_strikes, 3);
        assert_eq!(config.monitor.confirm_delay(), Duration::from_millis(30));
        assert!(!config.monitor.keep_typeahead);
        assert_eq!(config.cancel.grace_period(), Duration::from_millis(50));
        assert_eq!(config.harvest.probe_window, 65536);
        assert_eq!(config.subshell.program.as_deref(), Some(Path::new("/bin/sh")));
        assert_eq!(config.subshell.switch, "-c");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::from_path(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
