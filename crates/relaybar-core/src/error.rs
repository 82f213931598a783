//! Error taxonomy for the VPN session controller and its collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything that can go wrong while driving the external VPN client.
///
/// `Cancelled` travels through `?` like any other variant but is not a
/// failure: callers check [`VpnError::is_cancellation`] and turn it into a
/// normal outcome instead of surfacing it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum VpnError {
    #[error("OpenVPN is not installed")]
    NotInstalled,

    #[error("Failed to create VPN configuration: {0}")]
    ConfigurationCreationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Disconnection failed: {0}")]
    DisconnectionFailed(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Connection timed out")]
    Timeout,

    #[error("Authentication cancelled")]
    AuthenticationCancelled,

    #[error("Authentication Failed")]
    AuthenticationFailed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Control protocol error: {0}")]
    Protocol(String),
}

impl VpnError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Transient failures worth another attempt. User cancellation and
    /// privilege problems never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Timeout)
    }

    /// Text stored in `ConnectionState::Error` and shown by the UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionFailed(reason) | Self::DisconnectionFailed(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for VpnError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<VpnError> for String {
    fn from(e: VpnError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(VpnError::ConnectionFailed("flaky".into()).is_retryable());
        assert!(VpnError::Timeout.is_retryable());
        assert!(!VpnError::AuthenticationCancelled.is_retryable());
        assert!(!VpnError::PermissionDenied.is_retryable());
        assert!(!VpnError::Cancelled.is_retryable());
        assert!(!VpnError::NotInstalled.is_retryable());
    }

    #[test]
    fn cancellation_is_distinct() {
        assert!(VpnError::Cancelled.is_cancellation());
        assert!(!VpnError::Timeout.is_cancellation());
    }

    #[test]
    fn user_message_strips_prefix() {
        let e = VpnError::ConnectionFailed("Connection failed, check log".into());
        assert_eq!(e.user_message(), "Connection failed, check log");
        assert_eq!(VpnError::AuthenticationFailed.user_message(), "Authentication Failed");
    }

    #[test]
    fn serde_roundtrip() {
        let e = VpnError::ConfigurationCreationFailed("bad base64".into());
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("configuration_creation_failed"));
        let back: VpnError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: VpnError = io.into();
        assert!(matches!(e, VpnError::Io(ref m) if m.contains("gone")));
        let s: String = e.into();
        assert!(s.starts_with("I/O error"));
    }
}
