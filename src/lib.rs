//! # relaybar
//!
//! Headless front end for the VPN session controller. Connects to one
//! relay described by a JSON file, reports state changes and tunnel
//! statistics, and disconnects cleanly on Ctrl-C.

pub mod logging;

use clap::Parser;
use relaybar_core::{
    CredentialProvider, MemoryRecorder, ServerDescriptor, SudoCredentialProvider, VpnError,
};
use relaybar_openvpn::openvpn::service::SessionControllerState;
use relaybar_openvpn::openvpn::{
    ConnectOutcome, ConnectionState, ControllerSettings, OpenVpnBackend, SessionController,
    VpnBackend,
};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Optional sudo password; without it `sudo -n` must succeed on its own.
pub const SUDO_PASSWORD_ENV: &str = "RELAYBAR_SUDO_PASSWORD";

const SUDO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "relaybar")]
#[command(about = "Connect to a public VPN relay and hold the session until Ctrl-C")]
#[command(version)]
pub struct CliArgs {
    /// Server descriptor JSON
    pub server: PathBuf,

    /// Controller settings JSON (defaults to the per-user settings file)
    #[arg(short, long, value_name = "FILE")]
    pub settings: Option<PathBuf>,
}

pub fn load_server(path: &Path) -> Result<ServerDescriptor, VpnError> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| VpnError::Io(format!("invalid server file {}: {}", path.display(), e)))
}

pub fn load_settings(path: Option<&Path>) -> Result<ControllerSettings, VpnError> {
    match path {
        Some(p) => ControllerSettings::load(p),
        None => ControllerSettings::load_default(),
    }
}

fn sudo_provider() -> SudoCredentialProvider {
    match std::env::var(SUDO_PASSWORD_ENV) {
        Ok(pw) if !pw.is_empty() => {
            SudoCredentialProvider::with_password(SecretString::new(pw), SUDO_TIMEOUT)
        }
        _ => SudoCredentialProvider::new(SUDO_TIMEOUT),
    }
}

/// Log every state change and a one-line statistics summary per sample.
fn spawn_reporter(ctl: &SessionControllerState) -> tokio::task::JoinHandle<()> {
    let mut states = ctl.subscribe_state();
    let mut stats = ctl.subscribe_stats();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() { break; }
                    let state = states.borrow_and_update().clone();
                    tracing::info!(%state, "state changed");
                }
                changed = stats.changed() => {
                    if changed.is_err() { break; }
                    let snapshot = stats.borrow_and_update().clone();
                    if let Some(s) = snapshot {
                        tracing::debug!(
                            tunnel_ip = s.tunnel_ip.as_deref().unwrap_or("-"),
                            rx = s.bytes_received,
                            tx = s.bytes_sent,
                            rx_per_sec = s.rx_per_sec,
                            tx_per_sec = s.tx_per_sec,
                            "tunnel statistics"
                        );
                    }
                }
            }
        }
    })
}

/// Connect, hold the session until Ctrl-C or a fatal state, disconnect.
pub async fn run(args: CliArgs) -> Result<(), VpnError> {
    let settings = load_settings(args.settings.as_deref())?;
    let server = load_server(&args.server)?;

    let provider: Arc<dyn CredentialProvider> = Arc::new(sudo_provider());
    let backend = OpenVpnBackend::system(&settings, provider);
    if !backend.is_available() {
        return Err(VpnError::NotInstalled);
    }
    match backend.version().await {
        Ok(v) => tracing::info!(version = %v, "found OpenVPN"),
        Err(e) => tracing::warn!(error = %e, "could not determine OpenVPN version"),
    }

    let recorder = Arc::new(MemoryRecorder::new());
    let ctl = SessionController::new(Arc::new(backend), recorder.clone(), settings);
    let reporter = spawn_reporter(&ctl);
    let _lease = ctl.start_monitoring();

    tracing::info!(server = %server.display_name(), "connecting");
    let server_id = server.id.clone();
    let outcome = tokio::select! {
        r = ctl.connect(server) => r,
        _ = tokio::signal::ctrl_c() => {
            ctl.cancel_connection().await;
            Ok(ConnectOutcome::Cancelled)
        }
    };

    let result = match outcome {
        Ok(ConnectOutcome::Connected) => {
            let mut states = ctl.subscribe_state();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
                _ = states.wait_for(|s| matches!(s, ConnectionState::Error(_))) => {}
            }
            ctl.disconnect().await
        }
        Ok(ConnectOutcome::Cancelled) => Ok(()),
        Err(e) => Err(e),
    };

    if let Some(rate) = recorder.success_rate(&server_id) {
        tracing::info!(server = %server_id, success_rate = rate, "session finished");
    }
    reporter.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_and_settings() {
        let a = CliArgs::try_parse_from(["relaybar", "jp.json", "--settings", "/tmp/s.json"])
            .unwrap();
        assert_eq!(a.server, PathBuf::from("jp.json"));
        assert_eq!(a.settings, Some(PathBuf::from("/tmp/s.json")));

        let a = CliArgs::try_parse_from(["relaybar", "-s", "s.json", "kr.json"]).unwrap();
        assert_eq!(a.server, PathBuf::from("kr.json"));
        assert_eq!(a.settings, Some(PathBuf::from("s.json")));

        let a = CliArgs::try_parse_from(["relaybar", "jp.json"]).unwrap();
        assert_eq!(a.settings, None);
    }

    #[test]
    fn rejects_bad_arguments() {
        use clap::error::ErrorKind;
        let kind = |args: &[&str]| CliArgs::try_parse_from(args).unwrap_err().kind();
        assert_eq!(kind(&["relaybar"]), ErrorKind::MissingRequiredArgument);
        assert_eq!(kind(&["relaybar", "a.json", "b.json"]), ErrorKind::UnknownArgument);
        assert_eq!(kind(&["relaybar", "a.json", "--settings"]), ErrorKind::InvalidValue);
        assert_eq!(kind(&["relaybar", "--verbose", "a.json"]), ErrorKind::UnknownArgument);
    }

    #[test]
    fn loads_server_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jp.json");
        std::fs::write(
            &path,
            r#"{"id":"jp-1","hostname":"public-vpn-1","ip":"219.100.37.10",
                "countryLong":"Japan","countryShort":"JP","score":5,"configBlob":""}"#,
        )
        .unwrap();
        let s = load_server(&path).unwrap();
        assert_eq!(s.display_name(), "public-vpn-1 (JP)");

        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(load_server(&path), Err(VpnError::Io(_))));
    }

    #[test]
    fn explicit_settings_path_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"poll_interval_ms": 250}"#).unwrap();
        let s = load_settings(Some(&path)).unwrap();
        assert_eq!(s.poll_interval_ms, 250);
    }
}
