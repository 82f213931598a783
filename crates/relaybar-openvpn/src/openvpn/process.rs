//! OpenVPN process lifecycle: privileged launch, process-table checks,
//! graceful stop and forced termination.
//!
//! The client daemonises itself, so there is no child handle to wait on.
//! Liveness comes from the OS process table and shutdown goes through the
//! management socket first, `pkill` second.

use crate::openvpn::management::ManagementChannel;
use crate::openvpn::types::*;
use async_trait::async_trait;
use relaybar_core::{CredentialProvider, VpnError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Process table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read access to the OS process table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Number of running processes whose name is exactly `name`.
    async fn count(&self, name: &str) -> Result<usize, VpnError>;
}

/// `pgrep -x` backed table. Each query is bounded; a query that outlives
/// its deadline is killed and reported as `Timeout`.
#[derive(Debug, Clone)]
pub struct SystemProcessTable {
    timeout: Duration,
}

impl SystemProcessTable {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn count(&self, name: &str) -> Result<usize, VpnError> {
        let child = Command::new("pgrep")
            .args(["-x", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(out) => out?,
            Err(_) => return Err(VpnError::Timeout),
        };

        // pgrep: 0 = matches, 1 = none, anything else = failure
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count()),
            Some(1) => Ok(0),
            _ => Err(VpnError::Io(format!(
                "pgrep failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single-quote for `/bin/sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub struct ProcessSupervisor {
    binary: PathBuf,
    process_name: String,
    provider: Arc<dyn CredentialProvider>,
    table: Arc<dyn ProcessTable>,
}

impl ProcessSupervisor {
    pub fn new(
        binary: impl Into<PathBuf>,
        provider: Arc<dyn CredentialProvider>,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            binary: binary.into(),
            process_name: CLIENT_PROCESS_NAME.to_string(),
            provider,
            table,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn launch_command(&self, config: &Path) -> String {
        format!(
            "{} --config {}",
            shell_quote(&self.binary.display().to_string()),
            shell_quote(&config.display().to_string())
        )
    }

    /// Stop whatever client is already running, then start a new one as
    /// root. Returns once the client has daemonised.
    pub async fn launch(
        &self,
        config: &Path,
        channel: &ManagementChannel,
        grace: Duration,
    ) -> Result<(), VpnError> {
        if !self.binary.exists() {
            return Err(VpnError::NotInstalled);
        }
        self.stop_existing(channel, grace).await?;

        let cmd = self.launch_command(config);
        log::info!("Launching OpenVPN with {}", config.display());
        match self.provider.run(&cmd, true).await {
            Ok(_) => Ok(()),
            Err(VpnError::Io(msg)) => Err(VpnError::ConnectionFailed(format!(
                "OpenVPN failed to start: {}",
                msg
            ))),
            Err(e) => Err(e),
        }
    }

    pub async fn running_count(&self) -> Result<usize, VpnError> {
        self.table.count(&self.process_name).await
    }

    /// A table query that fails is treated as "still running" so a flaky
    /// `pgrep` never looks like a crash.
    pub async fn is_running(&self) -> bool {
        match self.running_count().await {
            Ok(n) => n > 0,
            Err(e) => {
                log::warn!("Process table query failed: {}", e);
                true
            }
        }
    }

    /// Poll the table until no client remains or `grace` elapses.
    pub async fn wait_for_exit(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if matches!(self.running_count().await, Ok(0)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Best-effort kill of every client instance.
    pub async fn force_terminate(&self) {
        let cmd = format!("pkill -9 -x {}", shell_quote(&self.process_name));
        match self.provider.run(&cmd, true).await {
            Ok(_) => log::info!("Force-terminated {}", self.process_name),
            // pkill exits 1 when nothing matched
            Err(e) => log::debug!("pkill: {}", e),
        }
    }

    /// SIGTERM through the socket, wait, then force-kill.
    ///
    /// Returns `true` once no client is left.
    pub async fn terminate(&self, channel: &ManagementChannel, grace: Duration) -> bool {
        match channel.signal_terminate().await {
            Ok(true) => log::info!("Sent SIGTERM via management socket"),
            Ok(false) => log::debug!("No management socket; skipping graceful stop"),
            Err(e) => log::warn!("Graceful stop failed: {}", e),
        }
        if self.wait_for_exit(grace).await {
            return true;
        }
        log::warn!("OpenVPN still running after {:?}, forcing", grace);
        self.force_terminate().await;
        self.wait_for_exit(grace).await
    }

    /// Enforce the single-instance rule before a launch.
    pub async fn stop_existing(
        &self,
        channel: &ManagementChannel,
        grace: Duration,
    ) -> Result<(), VpnError> {
        let n = match self.running_count().await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => {
                // Without a process table nothing can be confirmed; stop
                // what the socket reaches and carry on.
                log::warn!("Process table unavailable ({}), not checking for old clients", e);
                if matches!(channel.signal_terminate().await, Ok(true)) {
                    tokio::time::sleep(grace).await;
                }
                return Ok(());
            }
        };
        log::info!("Stopping {} existing OpenVPN instance(s)", n);
        if self.terminate(channel, grace).await {
            Ok(())
        } else {
            Err(VpnError::ConnectionFailed(
                "A previous OpenVPN instance could not be stopped".into(),
            ))
        }
    }

    /// Installed client version, from `--version`. The client exits
    /// non-zero after printing it, so the status is ignored.
    pub async fn detect_version(&self) -> Result<String, VpnError> {
        let child = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let output = tokio::time::timeout(Duration::from_secs(5), child.wait_with_output())
            .await
            .map_err(|_| VpnError::Timeout)??;
        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        parse_version_string(&combined)
            .ok_or_else(|| VpnError::Protocol("could not parse OpenVPN version".into()))
    }
}
