//! Tunnel credentials and the privilege-escalation provider.
//!
//! The session controller never asks the user for anything itself. It
//! calls [`CredentialProvider::ensure_authenticated`] before a connect
//! attempt starts and routes every command that needs root through
//! [`CredentialProvider::run`].

use crate::error::VpnError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::{Output, Stdio};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tunnel credentials
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn public_relay_password() -> String {
    "vpn".into()
}

/// Username/password pair written to the client's auth file.
///
/// The password is never serialised; a settings file without one falls
/// back to the well-known public relay password.
#[derive(Clone, Serialize, Deserialize)]
pub struct VpnCredentials {
    pub username: String,
    #[serde(skip_serializing, default = "public_relay_password")]
    pub password: String,
}

impl VpnCredentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Content of an `auth-user-pass` file.
    pub fn to_auth_file(&self) -> String {
        format!("{}\n{}\n", self.username, self.password)
    }
}

impl Default for VpnCredentials {
    fn default() -> Self {
        Self::basic("vpn", public_relay_password())
    }
}

impl fmt::Debug for VpnCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Provider contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Supplies the privilege-escalation secret and runs commands with it.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Make sure a usable secret is available before anything is spawned.
    ///
    /// Returns `AuthenticationCancelled` when the user dismissed the
    /// prompt and `PermissionDenied` when the secret was rejected.
    async fn ensure_authenticated(&self) -> Result<(), VpnError>;

    /// Run a shell command, optionally as root, returning its stdout.
    async fn run(&self, command: &str, privileged: bool) -> Result<String, VpnError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  sudo-backed provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SUDO_REJECTION_MARKERS: &[&str] = &[
    "incorrect password",
    "Sorry, try again",
    "a password is required",
    "no password was provided",
    "is not in the sudoers file",
];

/// Escalates through `sudo`, feeding the stored secret on stdin.
///
/// Without a stored secret it only succeeds when `sudo` has a cached
/// timestamp or a NOPASSWD rule (`sudo -n`).
pub struct SudoCredentialProvider {
    secret: RwLock<Option<SecretString>>,
    timeout: Duration,
}

impl SudoCredentialProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            secret: RwLock::new(None),
            timeout,
        }
    }

    pub fn with_password(password: SecretString, timeout: Duration) -> Self {
        Self {
            secret: RwLock::new(Some(password)),
            timeout,
        }
    }

    /// Replace the stored secret (e.g. after a Keychain or Touch ID unlock).
    pub fn set_password(&self, password: SecretString) {
        if let Ok(mut guard) = self.secret.write() {
            *guard = Some(password);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.secret.write() {
            *guard = None;
        }
    }

    fn password(&self) -> Option<String> {
        self.secret
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.expose_secret().clone()))
    }

    /// Spawn and wait with a deadline. The child is killed if the deadline
    /// wins, so the caller observes exactly one result.
    async fn exec(
        &self,
        program: &str,
        args: &[&str],
        stdin_data: Option<String>,
    ) -> Result<Output, VpnError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
            }
        }

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                log::warn!("{} did not finish within {:?}", program, self.timeout);
                Err(VpnError::Timeout)
            }
        }
    }
}

fn is_sudo_rejection(stderr: &str) -> bool {
    SUDO_REJECTION_MARKERS.iter().any(|m| stderr.contains(m))
}

#[async_trait]
impl CredentialProvider for SudoCredentialProvider {
    async fn ensure_authenticated(&self) -> Result<(), VpnError> {
        let output = match self.password() {
            Some(pw) => self.exec("sudo", &["-S", "-p", "", "-v"], Some(pw)).await?,
            None => {
                let out = self.exec("sudo", &["-n", "-v"], None).await?;
                if !out.status.success() {
                    log::info!("no cached sudo credentials and no secret supplied");
                    return Err(VpnError::AuthenticationCancelled);
                }
                out
            }
        };
        if output.status.success() {
            Ok(())
        } else {
            Err(VpnError::PermissionDenied)
        }
    }

    async fn run(&self, command: &str, privileged: bool) -> Result<String, VpnError> {
        let output = if !privileged {
            self.exec("/bin/sh", &["-c", command], None).await?
        } else {
            match self.password() {
                Some(pw) => {
                    self.exec("sudo", &["-S", "-p", "", "/bin/sh", "-c", command], Some(pw))
                        .await?
                }
                None => self.exec("sudo", &["-n", "/bin/sh", "-c", command], None).await?,
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if privileged && is_sudo_rejection(&stderr) {
            return Err(VpnError::PermissionDenied);
        }
        Err(VpnError::Io(format!(
            "command exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}
