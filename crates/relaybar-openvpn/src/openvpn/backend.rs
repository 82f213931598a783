//! Client backend abstraction and its OpenVPN implementation.
//!
//! The controller only talks to [`VpnBackend`]. Adding another client
//! means another implementation of the trait, nothing else.

use crate::openvpn::config::{remove_session_files, ConfigGenerator};
use crate::openvpn::logging;
use crate::openvpn::management::ManagementChannel;
use crate::openvpn::process::{ProcessSupervisor, ProcessTable, SystemProcessTable};
use crate::openvpn::settings::ControllerSettings;
use crate::openvpn::types::*;
use async_trait::async_trait;
use chrono::Utc;
use relaybar_core::{CredentialProvider, ServerDescriptor, VpnCredentials, VpnError};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait VpnBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// The client binary can be found.
    fn is_available(&self) -> bool;

    /// Validate privilege escalation before anything is spawned.
    async fn ensure_authenticated(&self) -> Result<(), VpnError>;

    /// Write the session files and start the client. Returns once the
    /// client has been handed off to the OS, not once it is connected.
    async fn launch(
        &self,
        server: &ServerDescriptor,
        creds: &VpnCredentials,
    ) -> Result<Session, VpnError>;

    async fn probe(&self, session: &Session) -> ProbeResult;

    async fn is_running(&self) -> bool;

    /// Graceful stop with forced fallback; session files are removed
    /// either way. Fails only if a client is still running afterwards.
    async fn disconnect(&self, session: &Session) -> Result<(), VpnError>;

    /// Like `disconnect`, but best-effort and silent.
    async fn cancel(&self, session: &Session);

    /// Explain why the client died during connect.
    async fn diagnose_exit(&self, session: &Session) -> VpnError;

    /// Kill leftovers of a previous run and remove its files.
    async fn teardown_stale(&self) -> Result<(), VpnError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  OpenVPN
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenVpnBackend {
    generator: ConfigGenerator,
    supervisor: ProcessSupervisor,
    provider: Arc<dyn CredentialProvider>,
    control_timeout: Duration,
    grace: Duration,
}

impl OpenVpnBackend {
    pub fn new(
        settings: &ControllerSettings,
        provider: Arc<dyn CredentialProvider>,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        let binary = find_openvpn_binary(settings.binary_path.as_deref())
            .or_else(|| settings.binary_path.clone())
            .unwrap_or_else(|| CLIENT_PROCESS_NAME.into());
        log::info!("Using OpenVPN binary {}", binary.display());
        Self {
            generator: ConfigGenerator::new(&settings.config_dir, settings.dns_servers.clone()),
            supervisor: ProcessSupervisor::new(binary, provider.clone(), table),
            provider,
            control_timeout: settings.control_timeout(),
            grace: settings.disconnect_grace(),
        }
    }

    /// Backend using the real process table.
    pub fn system(settings: &ControllerSettings, provider: Arc<dyn CredentialProvider>) -> Self {
        let table = Arc::new(SystemProcessTable::new(settings.process_query_timeout()));
        Self::new(settings, provider, table)
    }

    pub fn paths(&self) -> SessionPaths {
        self.generator.paths()
    }

    fn channel(&self, paths: &SessionPaths) -> ManagementChannel {
        ManagementChannel::new(&paths.socket, self.control_timeout)
    }

    pub async fn version(&self) -> Result<String, VpnError> {
        self.supervisor.detect_version().await
    }

    /// Terminate and clean up. `true` when no client is left.
    async fn shut_down(&self, paths: &SessionPaths) -> bool {
        let stopped = self.supervisor.terminate(&self.channel(paths), self.grace).await;
        remove_session_files(paths).await;
        stopped
    }
}

#[async_trait]
impl VpnBackend for OpenVpnBackend {
    fn name(&self) -> &'static str {
        "openvpn"
    }

    fn is_available(&self) -> bool {
        self.supervisor.binary().exists()
    }

    async fn ensure_authenticated(&self) -> Result<(), VpnError> {
        self.provider.ensure_authenticated().await
    }

    async fn launch(
        &self,
        server: &ServerDescriptor,
        creds: &VpnCredentials,
    ) -> Result<Session, VpnError> {
        if !self.is_available() {
            return Err(VpnError::NotInstalled);
        }
        let paths = self.paths();
        let channel = self.channel(&paths);

        // Old client first, while its socket can still take SIGTERM.
        self.supervisor.stop_existing(&channel, self.grace).await?;
        for stale in [&paths.socket, &paths.pid, &paths.log] {
            let _ = tokio::fs::remove_file(stale).await;
        }

        let generated = self.generator.generate(server, creds).await?;
        if let Err(e) = self
            .supervisor
            .launch(&generated.paths.config, &channel, self.grace)
            .await
        {
            remove_session_files(&generated.paths).await;
            return Err(e);
        }

        Ok(Session {
            server: server.clone(),
            paths: generated.paths,
            metadata: generated.metadata,
            started_at: Utc::now(),
        })
    }

    async fn probe(&self, session: &Session) -> ProbeResult {
        self.channel(&session.paths).probe().await
    }

    async fn is_running(&self) -> bool {
        self.supervisor.is_running().await
    }

    async fn disconnect(&self, session: &Session) -> Result<(), VpnError> {
        log::info!("Disconnecting from {}", session.server.display_name());
        if self.shut_down(&session.paths).await {
            Ok(())
        } else {
            Err(VpnError::DisconnectionFailed(
                "OpenVPN is still running after forced termination".into(),
            ))
        }
    }

    async fn cancel(&self, session: &Session) {
        if !self.shut_down(&session.paths).await {
            log::warn!("OpenVPN survived cancellation of {}", session.server.id);
        }
    }

    async fn diagnose_exit(&self, session: &Session) -> VpnError {
        logging::diagnose_log(&session.paths.log).await
    }

    async fn teardown_stale(&self) -> Result<(), VpnError> {
        let paths = self.paths();
        let socket_present = paths.socket.exists();
        let running = self.supervisor.running_count().await.unwrap_or(0) > 0;
        if !socket_present && !running {
            remove_session_files(&paths).await;
            return Ok(());
        }
        log::info!("Tearing down leftover OpenVPN session");
        if self.shut_down(&paths).await {
            Ok(())
        } else {
            Err(VpnError::DisconnectionFailed(
                "Leftover OpenVPN process could not be stopped".into(),
            ))
        }
    }
}
