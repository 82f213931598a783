//! Controller settings, persisted as JSON next to the rest of the app's
//! preferences.

use crate::openvpn::retry::{RetryPolicy, RetryPreset};
use relaybar_core::{VpnCredentials, VpnError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_DIR: &str = "relaybar";
pub const SETTINGS_FILE: &str = "settings.json";

fn app_config_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Directory holding the generated config, auth file, socket, pid and log.
    pub config_dir: PathBuf,
    /// Explicit client binary; searched for when unset.
    pub binary_path: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub disconnect_grace_ms: u64,
    pub control_timeout_ms: u64,
    pub process_query_timeout_ms: u64,
    pub retry: RetryPreset,
    pub use_retry: bool,
    pub dns_servers: Vec<String>,
    pub credentials: VpnCredentials,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            config_dir: app_config_root().join("openvpn"),
            binary_path: None,
            connect_timeout_secs: 30,
            poll_interval_ms: 1000,
            disconnect_grace_ms: 1500,
            control_timeout_ms: 5000,
            process_query_timeout_ms: 3000,
            retry: RetryPreset::default(),
            use_retry: true,
            dns_servers: vec!["1.1.1.1".into(), "8.8.8.8".into()],
            credentials: VpnCredentials::default(),
        }
    }
}

impl ControllerSettings {
    pub fn default_path() -> PathBuf {
        app_config_root().join(SETTINGS_FILE)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn process_query_timeout(&self) -> Duration {
        Duration::from_millis(self.process_query_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        if self.use_retry {
            self.retry.policy()
        } else {
            RetryPolicy::none()
        }
    }

    /// Read settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, VpnError> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                VpnError::Io(format!("invalid settings in {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn load_default() -> Result<Self, VpnError> {
        Self::load(&Self::default_path())
    }

    pub fn save(&self, path: &Path) -> Result<(), VpnError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| VpnError::Io(format!("cannot serialise settings: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = ControllerSettings::default();
        assert_eq!(s.connect_timeout(), Duration::from_secs(30));
        assert_eq!(s.poll_interval(), Duration::from_secs(1));
        assert_eq!(s.disconnect_grace(), Duration::from_millis(1500));
        assert_eq!(s.retry_policy(), RetryPolicy::default());
        assert_eq!(s.dns_servers, vec!["1.1.1.1", "8.8.8.8"]);
        assert!(s.config_dir.ends_with("relaybar/openvpn"));
    }

    #[test]
    fn retry_can_be_disabled() {
        let s = ControllerSettings {
            use_retry: false,
            ..Default::default()
        };
        assert_eq!(s.retry_policy().max_attempts, 0);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = ControllerSettings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.connect_timeout_secs, 30);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, r#"{"connect_timeout_secs": 5, "retry": "aggressive"}"#).unwrap();
        let s = ControllerSettings::load(&path).unwrap();
        assert_eq!(s.connect_timeout_secs, 5);
        assert_eq!(s.retry, RetryPreset::Aggressive);
        assert_eq!(s.poll_interval_ms, 1000);
        assert_eq!(s.credentials.username, "vpn");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let s = ControllerSettings {
            binary_path: Some("/opt/homebrew/sbin/openvpn".into()),
            ..Default::default()
        };
        s.save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains('\n'));
        assert!(!text.contains("\"password\""));
        let back = ControllerSettings::load(&path).unwrap();
        assert_eq!(back.binary_path, s.binary_path);
    }

    #[test]
    fn corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(ControllerSettings::load(&path), Err(VpnError::Io(_))));
    }
}
