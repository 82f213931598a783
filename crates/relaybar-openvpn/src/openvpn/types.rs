//! Shared types for the session controller: connection state, parsed
//! control-socket responses, statistics snapshots and session records.

use chrono::{DateTime, Utc};
use relaybar_core::ServerDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The one connection state the rest of the application may read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Error(e) => write!(f, "Error: {}", e),
        }
    }
}

impl ConnectionState {
    /// Tunnel is up, or the client is re-establishing it on its own.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }

    /// A new `connect` may start from here without tearing anything down first.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error(_))
    }
}

/// How a `connect` call ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    Connected,
    /// Interrupted by `cancel_connection`, `disconnect` or a newer `connect`.
    Cancelled,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control socket responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parsed data line of a `state` response:
/// `<unix_ts>,<TOKEN>,<description>,<tunnel_ip>,<remote_ip>`.
///
/// The fourth field is always the local tunnel address and the fifth the
/// relay's address as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLine {
    pub timestamp: u64,
    pub token: String,
    pub description: String,
    pub tunnel_ip: Option<String>,
    pub remote_ip: Option<String>,
}

impl StateLine {
    pub fn connection_state(&self) -> ConnectionState {
        crate::openvpn::management::map_state_token(&self.token)
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.timestamp as i64, 0)
    }
}

/// Cumulative link-level byte counters from a `status` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ByteCounters {
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// One poll of the control socket. `None` fields mean "unknown": the
/// socket was absent or the client did not answer that query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub state: Option<StateLine>,
    pub counters: Option<ByteCounters>,
}

impl ProbeResult {
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state.as_ref().map(|s| s.connection_state())
    }

    pub fn is_unknown(&self) -> bool {
        self.state.is_none() && self.counters.is_none()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Statistics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Recomputed on every poll; see `tunnel::StatsTracker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub connected_since: Option<DateTime<Utc>>,
    pub tunnel_ip: Option<String>,
    pub public_ip: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Bytes received since the previous snapshot.
    pub rx_delta: u64,
    pub tx_delta: u64,
    pub rx_per_sec: f64,
    pub tx_per_sec: f64,
    pub protocol: Option<String>,
    pub port: Option<u16>,
    pub cipher: Option<String>,
}

/// Transport details scanned out of a relay's config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    pub protocol: Option<String>,
    pub remote_host: Option<String>,
    pub port: Option<u16>,
    pub cipher: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Files owned by a session. All of them live in the per-app config
/// directory and are recreated on every connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub config: PathBuf,
    pub auth: PathBuf,
    pub socket: PathBuf,
    pub pid: PathBuf,
    pub log: PathBuf,
}

impl SessionPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join("relaybar.ovpn"),
            auth: dir.join("auth.txt"),
            socket: dir.join("management.sock"),
            pid: dir.join("openvpn.pid"),
            log: dir.join("openvpn.log"),
        }
    }

    /// Files removed when the session ends. The log survives so the next
    /// failure diagnosis and the user can still read it.
    pub fn transient(&self) -> [&Path; 4] {
        [&self.config, &self.auth, &self.socket, &self.pid]
    }
}

/// Runtime record of the current attempt.
#[derive(Debug, Clone)]
pub struct Session {
    pub server: ServerDescriptor,
    pub paths: SessionPaths,
    pub metadata: ConfigMetadata,
    pub started_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Binary location helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process name the client shows up as in the process table.
pub const CLIENT_PROCESS_NAME: &str = "openvpn";

/// Well-known OpenVPN install locations by platform.
pub fn default_binary_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/opt/homebrew/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/local/opt/openvpn/sbin/openvpn"));
        paths.push(PathBuf::from("/opt/local/sbin/openvpn"));
    }
    #[cfg(not(target_os = "macos"))]
    {
        paths.push(PathBuf::from("/usr/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/bin/openvpn"));
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
    }
    paths
}

/// Locate the client binary: explicit override first, then known install
/// paths, then `PATH`.
pub fn find_openvpn_binary(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = override_path {
        return p.exists().then(|| p.to_path_buf());
    }
    for p in default_binary_paths() {
        if p.exists() {
            return Some(p);
        }
    }
    let path_env = std::env::var_os("PATH")?;
    std::env::split_paths(&path_env)
        .map(|dir| dir.join(CLIENT_PROCESS_NAME))
        .find(|full| full.exists())
}

/// Parse an OpenVPN `--version` banner (e.g. "OpenVPN 2.6.8 …").
pub fn parse_version_string(output: &str) -> Option<String> {
    let re = regex::Regex::new(r"OpenVPN\s+(\d+\.\d+\.\d+)").ok()?;
    re.captures(output).map(|c| c[1].to_string())
}
