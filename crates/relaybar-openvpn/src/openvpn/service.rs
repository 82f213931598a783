//! Session controller: the single owner of connection state.
//!
//! Drives one backend session at a time through connect, monitoring and
//! teardown. Every write to the published state goes through
//! [`SessionController::transition`], which drops writes stamped with an
//! outdated session epoch. `connect`, `cancel_connection` and `disconnect`
//! bump the epoch and hold the operation lock, so a stale connect task or
//! poll iteration can never overwrite a newer decision.

use crate::openvpn::backend::VpnBackend;
use crate::openvpn::monitor::{Monitor, MonitorLease};
use crate::openvpn::retry::{cancellable, sleep_or_cancel};
use crate::openvpn::settings::ControllerSettings;
use crate::openvpn::tunnel::StatsTracker;
use crate::openvpn::types::*;
use chrono::Utc;
use relaybar_core::{
    AttemptOutcome, AttemptRecord, AttemptRecorder, ServerDescriptor, VpnCredentials, VpnError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type SessionControllerState = Arc<SessionController>;

pub const UNEXPECTED_EXIT: &str = "VPN process exited unexpectedly";

struct ConnectTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionController {
    backend: Arc<dyn VpnBackend>,
    recorder: Arc<dyn AttemptRecorder>,
    settings: ControllerSettings,

    state_tx: watch::Sender<ConnectionState>,
    stats_tx: watch::Sender<Option<StatisticsSnapshot>>,
    epoch: AtomicU64,

    /// Serialises explicit operations and holds the in-flight connect task.
    ops: tokio::sync::Mutex<Option<ConnectTask>>,
    session: Mutex<Option<Session>>,
    server: Mutex<Option<ServerDescriptor>>,
    tracker: Mutex<StatsTracker>,

    monitor: Arc<Monitor>,
    /// The controller's own lease while a session is alive.
    session_lease: Mutex<Option<MonitorLease>>,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn VpnBackend>,
        recorder: Arc<dyn AttemptRecorder>,
        settings: ControllerSettings,
    ) -> SessionControllerState {
        Arc::new_cyclic(|weak: &Weak<SessionController>| {
            let poll_owner = weak.clone();
            let interval = settings.poll_interval();
            let monitor = Monitor::new(move |token| {
                let owner = poll_owner.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                        let Some(ctl) = owner.upgrade() else { break };
                        ctl.poll_once().await;
                    }
                })
            });
            let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
            let (stats_tx, _) = watch::channel(None);
            Self {
                backend,
                recorder,
                settings,
                state_tx,
                stats_tx,
                epoch: AtomicU64::new(0),
                ops: tokio::sync::Mutex::new(None),
                session: Mutex::new(None),
                server: Mutex::new(None),
                tracker: Mutex::new(StatsTracker::default()),
                monitor,
                session_lease: Mutex::new(None),
            }
        })
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn statistics(&self) -> Option<StatisticsSnapshot> {
        self.stats_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<Option<StatisticsSnapshot>> {
        self.stats_tx.subscribe()
    }

    /// Server of the current or most recent connect.
    pub fn current_server(&self) -> Option<ServerDescriptor> {
        self.server.lock().ok().and_then(|s| s.clone())
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Keep the statistics loop running while the lease is held.
    pub fn start_monitoring(&self) -> MonitorLease {
        self.monitor.acquire()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_active()
    }

    pub fn monitor_leases(&self) -> usize {
        self.monitor.lease_count()
    }

    // ── Internal state plumbing ──────────────────────────────────

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        self.state_tx.send_if_modified(|cur| {
            if self.current_epoch() != epoch || *cur == next {
                return false;
            }
            log::info!("VPN state: {} -> {}", cur, next);
            *cur = next.clone();
            true
        })
    }

    fn publish_stats(&self, epoch: u64, snapshot: Option<StatisticsSnapshot>) {
        self.stats_tx.send_if_modified(|cur| {
            if self.current_epoch() != epoch {
                return false;
            }
            *cur = snapshot;
            true
        });
    }

    /// Publish a snapshot only while a session is still attached; the
    /// session lock orders this against teardown clearing the stats.
    fn record_probe(&self, epoch: u64, probe: &ProbeResult) {
        let Ok(session) = self.session.lock() else { return };
        if session.is_none() {
            return;
        }
        let snapshot = match self.tracker.lock() {
            Ok(mut t) => t.record(probe, Utc::now()),
            Err(_) => return,
        };
        self.publish_stats(epoch, Some(snapshot));
        drop(session);
    }

    fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn set_session(&self, session: Option<Session>) {
        if let Ok(mut s) = self.session.lock() {
            *s = session;
        }
    }

    fn take_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|mut s| s.take())
    }

    fn hold_session_lease(&self) {
        let lease = self.monitor.acquire();
        let previous = match self.session_lease.lock() {
            Ok(mut l) => l.replace(lease),
            Err(_) => None,
        };
        drop(previous);
    }

    fn release_session_lease(&self) {
        let lease = self.session_lease.lock().ok().and_then(|mut l| l.take());
        drop(lease);
    }

    /// Cancel the in-flight connect task and wait for it to finish.
    async fn stop_task(task: &mut Option<ConnectTask>) {
        if let Some(t) = task.take() {
            t.token.cancel();
            if let Err(e) = t.handle.await {
                log::warn!("Connect task ended abnormally: {}", e);
            }
        }
    }

    // ── connect ──────────────────────────────────────────────────

    pub async fn connect(
        self: &Arc<Self>,
        server: ServerDescriptor,
    ) -> Result<ConnectOutcome, VpnError> {
        let creds = self.settings.credentials.clone();
        self.connect_with(server, creds).await
    }

    /// Connect to `server`, replacing any session or attempt in progress.
    ///
    /// Resolves to `Cancelled` if a `cancel_connection`, `disconnect` or a
    /// newer `connect` interrupts this one.
    pub async fn connect_with(
        self: &Arc<Self>,
        server: ServerDescriptor,
        creds: VpnCredentials,
    ) -> Result<ConnectOutcome, VpnError> {
        let rx = {
            let mut task = self.ops.lock().await;
            Self::stop_task(&mut task).await;
            let epoch = self.bump_epoch();

            self.release_session_lease();
            if let Some(old) = self.take_session() {
                log::info!("Replacing session on {}", old.server.display_name());
                self.backend.cancel(&old).await;
            }

            if let Ok(mut s) = self.server.lock() {
                *s = Some(server.clone());
            }
            if let Ok(mut t) = self.tracker.lock() {
                t.reset();
            }
            self.publish_stats(epoch, None);
            self.transition(epoch, ConnectionState::Connecting);
            self.hold_session_lease();

            let token = CancellationToken::new();
            let (tx, rx) = oneshot::channel();
            let ctl = Arc::clone(self);
            let task_token = token.clone();
            let handle = tokio::spawn(async move {
                let result = ctl.run_connect(epoch, server, creds, task_token).await;
                let _ = tx.send(result);
            });
            *task = Some(ConnectTask { token, handle });
            rx
        };

        rx.await.unwrap_or(Ok(ConnectOutcome::Cancelled))
    }

    async fn run_connect(
        self: Arc<Self>,
        epoch: u64,
        server: ServerDescriptor,
        creds: VpnCredentials,
        token: CancellationToken,
    ) -> Result<ConnectOutcome, VpnError> {
        let started = Instant::now();
        log::info!("Connecting to {}", server.display_name());

        let result = self.establish(epoch, &server, &creds, &token).await;

        let (outcome, ret) = match result {
            Ok(()) => {
                self.transition(epoch, ConnectionState::Connected);
                (AttemptOutcome::Connected, Ok(ConnectOutcome::Connected))
            }
            Err(e) if e.is_cancellation() => {
                log::info!("Connect to {} cancelled", server.display_name());
                (AttemptOutcome::Cancelled, Ok(ConnectOutcome::Cancelled))
            }
            Err(e) => {
                let reason = e.user_message();
                log::warn!("Connect to {} failed: {}", server.display_name(), e);
                if self.current_epoch() == epoch {
                    if let Some(session) = self.take_session() {
                        self.backend.cancel(&session).await;
                    }
                }
                self.publish_stats(epoch, None);
                self.transition(epoch, ConnectionState::Error(reason.clone()));
                if self.current_epoch() == epoch {
                    self.release_session_lease();
                }
                (AttemptOutcome::Failed(reason), Err(e))
            }
        };

        self.recorder
            .record(AttemptRecord::new(server.id.clone(), outcome, started.elapsed()));
        ret
    }

    async fn establish(
        &self,
        epoch: u64,
        server: &ServerDescriptor,
        creds: &VpnCredentials,
        token: &CancellationToken,
    ) -> Result<(), VpnError> {
        cancellable(token, self.backend.ensure_authenticated()).await?;

        self.settings
            .retry_policy()
            .run(token, VpnError::is_retryable, |attempt| async move {
                if attempt > 0 {
                    log::info!("Retry {} for {}", attempt, server.display_name());
                }
                self.attempt_once(epoch, server, creds, token).await
            })
            .await
    }

    /// Launch once and wait for the client to report `CONNECTED`.
    async fn attempt_once(
        &self,
        epoch: u64,
        server: &ServerDescriptor,
        creds: &VpnCredentials,
        token: &CancellationToken,
    ) -> Result<(), VpnError> {
        let session = self.backend.launch(server, creds).await?;
        if let Ok(mut t) = self.tracker.lock() {
            t.reset();
            t.set_metadata(session.metadata.clone());
        }
        self.set_session(Some(session.clone()));

        let deadline = Instant::now() + self.settings.connect_timeout();
        loop {
            let probe = self.backend.probe(&session).await;
            if probe.connection_state() == Some(ConnectionState::Connected) {
                self.record_probe(epoch, &probe);
                log::info!("Connected to {}", server.display_name());
                return Ok(());
            }
            if probe.is_unknown() && !self.backend.is_running().await {
                return Err(self.backend.diagnose_exit(&session).await);
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "No CONNECTED state from {} within {:?}",
                    server.display_name(),
                    self.settings.connect_timeout()
                );
                return Err(VpnError::Timeout);
            }
            sleep_or_cancel(token, self.settings.poll_interval()).await?;
        }
    }

    // ── cancel / disconnect ──────────────────────────────────────

    /// Abort a connect in progress. Ends in `Disconnected`; nothing is
    /// reported as an error.
    pub async fn cancel_connection(&self) {
        let mut task = self.ops.lock().await;
        let had_task = task.is_some();
        Self::stop_task(&mut task).await;
        let epoch = self.bump_epoch();
        self.release_session_lease();

        match self.take_session() {
            Some(session) => self.backend.cancel(&session).await,
            None if had_task => {
                if let Err(e) = self.backend.teardown_stale().await {
                    log::warn!("Cleanup after cancel: {}", e);
                }
            }
            None => {}
        }
        self.publish_stats(epoch, None);
        self.transition(epoch, ConnectionState::Disconnected);
    }

    /// Stop the session: graceful SIGTERM, forced kill after the grace
    /// period, session files removed regardless.
    pub async fn disconnect(&self) -> Result<(), VpnError> {
        let mut task = self.ops.lock().await;
        let epoch = self.bump_epoch();
        self.transition(epoch, ConnectionState::Disconnecting);
        Self::stop_task(&mut task).await;
        self.release_session_lease();

        let result = match self.take_session() {
            Some(session) => self.backend.disconnect(&session).await,
            None => self.backend.teardown_stale().await,
        };
        self.publish_stats(epoch, None);
        match result {
            Ok(()) => {
                self.transition(epoch, ConnectionState::Disconnected);
                Ok(())
            }
            Err(e) => {
                self.transition(epoch, ConnectionState::Error(e.user_message()));
                Err(e)
            }
        }
    }

    // ── Poll loop ────────────────────────────────────────────────

    async fn poll_once(&self) {
        let epoch = self.current_epoch();
        let Some(session) = self.current_session() else {
            return;
        };
        let probe = self.backend.probe(&session).await;
        log::debug!("Poll: {:?}", probe.connection_state());
        self.record_probe(epoch, &probe);

        let current = self.state();
        if !current.is_established() {
            return;
        }
        match probe.connection_state() {
            Some(ConnectionState::Reconnecting) => {
                self.transition(epoch, ConnectionState::Reconnecting);
            }
            Some(ConnectionState::Connected) => {
                self.transition(epoch, ConnectionState::Connected);
            }
            Some(other) => log::debug!("Client reports {} while {}", other, current),
            None => {
                if probe.is_unknown() && !self.backend.is_running().await {
                    self.handle_unexpected_exit(epoch).await;
                }
            }
        }
    }

    async fn handle_unexpected_exit(&self, epoch: u64) {
        let _ops = self.ops.lock().await;
        if self.current_epoch() != epoch {
            return;
        }
        log::warn!("OpenVPN is gone while {}", self.state());
        if let Some(session) = self.take_session() {
            self.backend.cancel(&session).await;
        }
        self.publish_stats(epoch, None);
        self.transition(epoch, ConnectionState::Error(UNEXPECTED_EXIT.into()));
        // May abort this very task; nothing may follow.
        self.release_session_lease();
    }
}
