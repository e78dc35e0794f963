use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::types::types::{ConfigError, PatchParameters};

/// Write buffer used when streaming a response body to disk.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Unread log lines kept per session before new lines are dropped.
pub const DEFAULT_MAX_PENDING_LOGS: usize = 4096;

/// Undrained samples kept per progress kind in `FullHistory` mode.
pub const DEFAULT_MAX_PENDING_PROGRESS: usize = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub buffer_size: usize,
    pub connect_timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout_secs: 10,
            user_agent: None,
        }
    }
}

/// How progress samples are retained between two drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// Keep only the newest sample per progress kind.
    #[default]
    LatestOnly,
    /// Keep every sample so observers see transient phases.
    FullHistory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Cap on undrained log lines and notices. `0` disables the cap.
    pub max_pending_logs: usize,
    /// Cap on undrained samples per progress kind; the oldest go first.
    /// `0` disables the cap.
    pub max_pending_progress: usize,
    pub progress_mode: ProgressMode,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_pending_logs: DEFAULT_MAX_PENDING_LOGS,
            max_pending_progress: DEFAULT_MAX_PENDING_PROGRESS,
            progress_mode: ProgressMode::LatestOnly,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Channel settings applied to sessions created through the pump.
    pub channel: ChannelConfig,
    pub transport: TransportConfig,
}

/// Loads `PatchParameters` from a JSON file. Missing fields take their defaults.
pub fn load_parameters(path: &Path) -> Result<PatchParameters, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_parameters_reads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "root_path": "/srv/app", "version_info_url": "https://example.com/VersionInfo.info", "use_repair_patch": false }}"#
        )
        .unwrap();

        let params = load_parameters(file.path()).unwrap();
        assert_eq!(params.version_info_url, "https://example.com/VersionInfo.info");
        assert!(!params.use_repair_patch);
        assert!(params.use_installer_patch);
    }

    #[test]
    fn load_parameters_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            load_parameters(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_parameters_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_parameters(&dir.path().join("absent.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn progress_mode_deserializes_snake_case() {
        let cfg: ChannelConfig =
            serde_json::from_str(r#"{ "progress_mode": "full_history" }"#).unwrap();
        assert_eq!(cfg.progress_mode, ProgressMode::FullHistory);
        assert_eq!(cfg.max_pending_logs, DEFAULT_MAX_PENDING_LOGS);
        assert_eq!(cfg.max_pending_progress, DEFAULT_MAX_PENDING_PROGRESS);
    }
}
