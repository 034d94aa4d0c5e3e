//! Persistent storage for device state.
//!
//! The reference device keeps its lifetime stats, provisioned features, Wi-Fi
//! SSID and reward history in one JSON file under the data directory. The
//! file is rewritten on every phase change and read once at boot.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reward::RewardHistory;
use crate::session::SessionStats;
use crate::types::DeviceFeatures;

const STATE_FILE: &str = "device.json";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the file failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file exists but is not valid state JSON.
    #[error("corrupt state file {}: {source}", path.display())]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// No data directory could be determined for this platform.
    #[error("cannot determine a data directory")]
    NoDataDir,
}

/// Everything the device keeps across reboots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedDevice {
    /// Lifetime counters and payback debt.
    pub stats: SessionStats,
    /// Provisioned features.
    pub features: DeviceFeatures,
    /// Configured network.
    pub wifi_ssid: Option<String>,
    /// Reward history, most recent first.
    pub rewards: RewardHistory,
}

/// JSON file storage backend.
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Storage rooted at `data_dir`.
    #[must_use]
    pub const fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Storage at the platform default location.
    ///
    /// # Errors
    ///
    /// [`StorageError::NoDataDir`] when the platform has no data directory.
    pub fn at_default_location() -> Result<Self, StorageError> {
        default_data_dir()
            .map(Self::new)
            .ok_or(StorageError::NoDataDir)
    }

    /// Directory holding the state file.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    /// Load persisted state, `None` on first boot.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(&self) -> Result<Option<PersistedDevice>, StorageError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StorageError::Corrupt { path, source })
    }

    /// Write state, replacing the previous file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, state: &PersistedDevice) -> Result<(), StorageError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StorageError::Io { path, source }
        };

        std::fs::create_dir_all(&self.data_dir).map_err(io(&self.data_dir))?;
        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state).map_err(|source| StorageError::Corrupt {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, content).map_err(io(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(io(&path))?;
        Ok(())
    }
}

/// Default data directory.
///
/// On the Raspberry Pi style deployment: `/var/lib/keyholder/`.
/// For development: the platform data dir, e.g. `~/.local/share/keyholder/`.
#[must_use]
pub fn default_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/var/lib/keyholder"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "keyholder").map(|dirs| dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reward::Reward;

    #[test]
    fn test_first_boot_has_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("nested"));
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());

        let state = PersistedDevice {
            stats: SessionStats {
                streak: 3,
                aborted: 1,
                completed: 7,
                locked_secs: 12_600,
                payback_debt_secs: 600,
            },
            wifi_ssid: Some("home".to_string()),
            rewards: RewardHistory::from(vec![Reward::parse("UDLRUDLR").unwrap()]),
            ..PersistedDevice::default()
        };
        storage.save(&state).unwrap();

        assert_eq!(storage.load().unwrap(), Some(state));
        assert!(!dir.path().join("device.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{not json").unwrap();
        let err = Storage::new(dir.path().to_path_buf()).load().unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
