//! Client log inspection used to explain why a launch died.

use relaybar_core::VpnError;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// How much of the log end is scanned.
pub const TAIL_BYTES: u64 = 16 * 1024;

pub const AUTH_FAILED_MARKER: &str = "AUTH_FAILED";
pub const GENERIC_FAILURE: &str = "Connection failed, check log";

/// Last `max_bytes` of a file as lossy UTF-8, `None` if it cannot be read.
pub async fn read_tail(path: &Path, max_bytes: u64) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let len = file.metadata().await.ok()?.len();
    if len > max_bytes {
        file.seek(std::io::SeekFrom::Start(len - max_bytes)).await.ok()?;
    }
    let mut buf = Vec::with_capacity(len.min(max_bytes) as usize);
    file.read_to_end(&mut buf).await.ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Failure reported for a client that exited during connect.
pub fn diagnose(tail: &str) -> VpnError {
    if tail.contains(AUTH_FAILED_MARKER) {
        VpnError::AuthenticationFailed
    } else {
        VpnError::ConnectionFailed(GENERIC_FAILURE.into())
    }
}

/// Last line that looks like an error, for the application log.
pub fn last_error_line(tail: &str) -> Option<&str> {
    tail.lines().rev().map(str::trim).find(|l| {
        let lower = l.to_lowercase();
        lower.contains("error") || lower.contains("fatal") || lower.contains("auth_failed")
    })
}

pub async fn diagnose_log(path: &Path) -> VpnError {
    match read_tail(path, TAIL_BYTES).await {
        Some(tail) => {
            if let Some(line) = last_error_line(&tail) {
                log::warn!("OpenVPN log: {}", line);
            }
            diagnose(&tail)
        }
        None => {
            log::warn!("OpenVPN exited and {} is unreadable", path.display());
            VpnError::ConnectionFailed(GENERIC_FAILURE.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failed_is_specific() {
        let tail = "Tue Jan 2 SENT CONTROL [vpn]: 'PUSH_REQUEST'\n\
                    Tue Jan 2 AUTH: Received control message: AUTH_FAILED\n\
                    Tue Jan 2 SIGTERM[soft,auth-failure] received, process exiting\n";
        let err = diagnose(tail);
        assert_eq!(err, VpnError::AuthenticationFailed);
        assert_eq!(err.user_message(), "Authentication Failed");
    }

    #[test]
    fn other_exits_are_generic() {
        let err = diagnose("Cannot resolve host address\nExiting due to fatal error\n");
        assert_eq!(err.user_message(), GENERIC_FAILURE);
    }

    #[test]
    fn finds_last_error_line() {
        let tail = "ok\nERROR: first\nfine\nOptions error: second\nbye\n";
        assert_eq!(last_error_line(tail), Some("Options error: second"));
        assert_eq!(last_error_line("all good\n"), None);
    }

    #[tokio::test]
    async fn tail_reads_only_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openvpn.log");
        let mut content = "x".repeat(100);
        content.push_str("AUTH_FAILED");
        std::fs::write(&path, &content).unwrap();
        let tail = read_tail(&path, 11).await.unwrap();
        assert_eq!(tail, "AUTH_FAILED");
        assert_eq!(diagnose_log(&path).await, VpnError::AuthenticationFailed);
    }

    #[tokio::test]
    async fn unreadable_log_is_generic() {
        let dir = tempfile::tempdir().unwrap();
        let err = diagnose_log(&dir.path().join("missing.log")).await;
        assert!(matches!(err, VpnError::ConnectionFailed(_)));
    }
}
