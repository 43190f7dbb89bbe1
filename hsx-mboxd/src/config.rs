//! mboxd configuration

use libhsx_mbx::{MailboxConfig, Profile};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MboxdConfig {
    /// Engine resource limits
    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log every engine event
    #[serde(default)]
    pub trace_events: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_level: default_log_level(),
            trace_events: false,
        }
    }
}

fn default_socket_path() -> String {
    "/run/hsx/mboxd.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl MboxdConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Replace the engine limits with a named profile
    pub fn apply_profile(&mut self, profile: Profile) {
        self.mailbox = profile.config();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = MboxdConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.socket_path, "/run/hsx/mboxd.sock");
        assert_eq!(config.mailbox, MailboxConfig::default());
        assert!(!config.daemon.trace_events);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mboxd.toml");
        std::fs::write(
            &path,
            "[mailbox]\nmax_descriptors = 32\n\n[daemon]\ntrace_events = true\n",
        )
        .unwrap();

        let config = MboxdConfig::load(&path).unwrap();
        assert_eq!(config.mailbox.max_descriptors, 32);
        assert_eq!(config.mailbox.default_capacity, 64);
        assert!(config.daemon.trace_events);
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/mboxd.toml");

        let mut config = MboxdConfig::default();
        config.apply_profile(Profile::Embedded);
        config.daemon.socket_path = "/tmp/mboxd-test.sock".into();
        config.save(&path).unwrap();

        let loaded = MboxdConfig::load(&path).unwrap();
        assert_eq!(loaded.mailbox, Profile::Embedded.config());
        assert_eq!(loaded.daemon.socket_path, "/tmp/mboxd-test.sock");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[mailbox\nmax_descriptors = ").unwrap();
        assert!(MboxdConfig::load(&path).is_err());
    }
}
