//! Configuration for handreceipt

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("handreceipt")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding both databases and stored files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Registry database file name (relative to data_dir)
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Ledger database file name (relative to data_dir)
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,

    /// Directory for generated hand receipts and uploaded scans
    #[serde(default = "default_files_dir")]
    pub files_dir: String,

    /// Offers and serial requests require an accepted connection between the two users
    #[serde(default = "default_true")]
    pub require_connection: bool,

    /// Generate a hand receipt document after every accepted transfer
    #[serde(default = "default_true")]
    pub issue_hand_receipts: bool,

    /// Lifetime of presigned receipt URLs
    #[serde(default = "default_presigned_url_ttl")]
    pub presigned_url_ttl_secs: u64,

    /// Capacity of the notification broadcast channel
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Expiry applied to broadcast offers created without one
    #[serde(default)]
    pub default_offer_expiry_days: Option<u32>,
}

fn default_database_file() -> String {
    "handreceipt.db".to_string()
}

fn default_ledger_file() -> String {
    "ledger.db".to_string()
}

fn default_files_dir() -> String {
    "files".to_string()
}

fn default_true() -> bool {
    true
}

fn default_presigned_url_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
            ledger_file: default_ledger_file(),
            files_dir: default_files_dir(),
            require_connection: true,
            issue_hand_receipts: true,
            presigned_url_ttl_secs: default_presigned_url_ttl(),
            event_bus_capacity: default_event_bus_capacity(),
            default_offer_expiry_days: None,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Config that keeps everything under the given directory
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.ledger_file)
    }

    pub fn files_path(&self) -> PathBuf {
        self.data_dir.join(&self.files_dir)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn presigned_url_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.presigned_url_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config = toml::from_str("require_connection = false").unwrap();
        assert!(!config.require_connection);
        assert!(config.issue_hand_receipts);
        assert_eq!(config.database_file, "handreceipt.db");
        assert_eq!(config.presigned_url_ttl_secs, 604_800);
        assert!(config.default_offer_expiry_days.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::with_data_dir(temp.path());
        config.default_offer_expiry_days = Some(3);
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded.data_dir, temp.path());
        assert_eq!(loaded.default_offer_expiry_days, Some(3));
        assert_eq!(loaded.ledger_path(), temp.path().join("ledger.db"));
    }
}
