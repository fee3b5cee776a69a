use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BUFFERS};

/// Smallest buffer that still holds a full IPv6 header.
pub const MIN_BUFFER_SIZE: usize = 40;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("buffer_size must be at least {min} bytes, got {0}", min = MIN_BUFFER_SIZE)]
    BufferTooSmall(usize),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("nice value {0} outside -20..=19")]
    InvalidNice(i32),
}

mod defaults {
    pub fn buffer_size() -> usize {
        super::DEFAULT_BUFFER_SIZE
    }

    pub fn max_buffers() -> usize {
        super::DEFAULT_MAX_BUFFERS
    }

    pub fn queue_capacity() -> usize {
        1024
    }

    pub fn thread_name() -> String {
        "tun-reader".to_string()
    }

    pub fn nice() -> i32 {
        -8
    }
}

/// TUN reader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Size of each frame buffer in bytes
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,

    /// Upper bound on buffers the pool will create
    #[serde(default = "defaults::max_buffers")]
    pub max_buffers: usize,

    /// Capacity of each device-to-network queue
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Name of the reader thread
    #[serde(default = "defaults::thread_name")]
    pub thread_name: String,

    /// Nice value requested for the reader thread (best-effort)
    #[serde(default = "defaults::nice")]
    pub nice: i32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            buffer_size: defaults::buffer_size(),
            max_buffers: defaults::max_buffers(),
            queue_capacity: defaults::queue_capacity(),
            thread_name: defaults::thread_name(),
            nice: defaults::nice(),
        }
    }
}

impl ReaderConfig {
    /// Load and validate a JSON config file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ReaderConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall(self.buffer_size));
        }
        if self.max_buffers == 0 {
            return Err(ConfigError::Zero("max_buffers"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if !(-20..=19).contains(&self.nice) {
            return Err(ConfigError::InvalidNice(self.nice));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReaderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_size, 16384);
        assert_eq!(config.nice, -8);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: ReaderConfig = serde_json::from_str(r#"{"queue_capacity": 64}"#).unwrap();
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.max_buffers, DEFAULT_MAX_BUFFERS);
        assert_eq!(config.thread_name, "tun-reader");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"buffer_size": 2048, "thread_name": "tun0-rx"}}"#).unwrap();

        let config = ReaderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.buffer_size, 2048);
        assert_eq!(config.thread_name, "tun0-rx");
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_buffers": 0}}"#).unwrap();

        let err = ReaderConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("max_buffers")));
    }

    #[test]
    fn test_validation() {
        let config = ReaderConfig {
            buffer_size: 20,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferTooSmall(20))
        ));

        let config = ReaderConfig {
            nice: -21,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidNice(-21))));
    }

    #[test]
    fn test_missing_file() {
        let err = ReaderConfig::from_file(Path::new("/nonexistent/reader.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
