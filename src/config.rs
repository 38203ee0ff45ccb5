//! Configuration loading and management

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ipc::DEFAULT_MAX_FRAME_LEN;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the Unix domain socket clients connect to
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Largest accepted frame, header included
    pub max_frame_len: usize,

    /// Consecutive malformed frames tolerated before a client is dropped
    pub max_malformed_frames: u32,

    /// Number of recent events for which consumption marks are accepted
    pub consumption_window: usize,

    /// How long a monitored event waits for a consumption mark before it
    /// goes to the default target
    pub consumption_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("/tmp").join("inputd");
        Self {
            socket_path: data_dir.join("inputd.sock"),
            data_dir,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_malformed_frames: 8,
            consumption_window: 256,
            consumption_timeout_ms: 50,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional JSON file named by
    /// `INPUTD_CONFIG`, and the `INPUTD_SOCKET` override, in that order
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("inputd");

        let mut config = match std::env::var_os("INPUTD_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self {
                socket_path: data_dir.join("inputd.sock"),
                data_dir,
                ..Self::default()
            },
        };

        if let Some(socket) = std::env::var_os("INPUTD_SOCKET") {
            config.socket_path = PathBuf::from(socket);
        }

        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_frame_len > crate::ipc::HEADER_LEN,
            "max_frame_len must exceed the frame header"
        );
        anyhow::ensure!(self.consumption_window > 0, "consumption_window must be positive");
        Ok(())
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_load() {
        let config = Config::load().unwrap();
        assert!(config.socket_path.to_string_lossy().contains("inputd"));
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn test_config_from_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inputd.json");
        std::fs::write(&path, r#"{"socket_path":"/run/inputd.sock","max_malformed_frames":2}"#)
            .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/inputd.sock"));
        assert_eq!(config.max_malformed_frames, 2);
        assert_eq!(config.consumption_window, 256);
        assert_eq!(config.consumption_timeout_ms, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_tiny_frames() {
        let config = Config { max_frame_len: 4, ..Config::default() };
        assert!(config.validate().is_err());
    }
}
