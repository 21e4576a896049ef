use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read `{path}`: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("invalid configuration: {message}")]
    Parse { message: String },
    #[error("invalid value for `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioSettings {
    pub sample_rate: f64,
    pub buffer_size: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 44_100.0,
            buffer_size: 512,
        }
    }
}

impl AudioSettings {
    /// Wall-clock length of one audio buffer.
    pub fn buffer_duration(&self) -> Duration {
        if self.sample_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(f64::from(self.buffer_size) / self.sample_rate)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_execution_time_ms: u64,
    pub compilation_timeout_extension_ms: u64,
    pub register_capacity: usize,
    pub task_queue_capacity: usize,
    pub dispatcher_capacity: usize,
    pub worker_interval_ms: u64,
    pub max_reentrancy_depth: usize,
    pub max_call_depth: usize,
    pub implicit_declarations_in_init: bool,
    pub audio: AudioSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 500,
            compilation_timeout_extension_ms: 5_000,
            register_capacity: 32,
            task_queue_capacity: 1_024,
            dispatcher_capacity: 256,
            worker_interval_ms: 10,
            max_reentrancy_depth: 8,
            max_call_depth: 64,
            implicit_declarations_in_init: true,
            audio: AudioSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|error| ConfigError::Io {
            path: path.to_path_buf(),
            error,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content).map_err(|error| ConfigError::Parse {
            message: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.task_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "task_queue_capacity",
                message: "must be at least 1".into(),
            });
        }
        if self.dispatcher_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatcher_capacity",
                message: "must be at least 1".into(),
            });
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_call_depth",
                message: "must be at least 1".into(),
            });
        }
        if self.audio.sample_rate <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "audio.sample_rate",
                message: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    pub fn compilation_timeout_extension(&self) -> Duration {
        Duration::from_millis(self.compilation_timeout_extension_ms)
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }
}
