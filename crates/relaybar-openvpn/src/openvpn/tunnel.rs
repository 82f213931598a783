//! Live tunnel statistics derived from successive management-socket polls.

use crate::openvpn::types::*;
use chrono::{DateTime, Utc};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Statistics tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turns raw probes into [`StatisticsSnapshot`]s.
///
/// Only the previous snapshot is kept. It supplies the delta baseline and
/// fills in whatever the latest probe did not report.
#[derive(Debug, Default)]
pub struct StatsTracker {
    previous: Option<StatisticsSnapshot>,
    metadata: ConfigMetadata,
}

impl StatsTracker {
    pub fn new(metadata: ConfigMetadata) -> Self {
        Self {
            previous: None,
            metadata,
        }
    }

    /// Forget the previous snapshot. Called when a fresh session starts.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn set_metadata(&mut self, metadata: ConfigMetadata) {
        self.metadata = metadata;
    }

    pub fn last(&self) -> Option<&StatisticsSnapshot> {
        self.previous.as_ref()
    }

    pub fn record(&mut self, probe: &ProbeResult, now: DateTime<Utc>) -> StatisticsSnapshot {
        let prev = self.previous.as_ref();

        let (bytes_received, bytes_sent) = match (probe.counters, prev) {
            (Some(c), _) => (c.bytes_received, c.bytes_sent),
            (None, Some(p)) => (p.bytes_received, p.bytes_sent),
            (None, None) => (0, 0),
        };

        // A smaller total means the client restarted; count from zero.
        let (base_rx, base_tx) = match prev {
            Some(p) if bytes_received >= p.bytes_received && bytes_sent >= p.bytes_sent => {
                (p.bytes_received, p.bytes_sent)
            }
            Some(_) => {
                log::debug!("Byte counters went backwards; resetting baseline");
                (0, 0)
            }
            None => (0, 0),
        };
        let rx_delta = bytes_received - base_rx;
        let tx_delta = bytes_sent - base_tx;

        let elapsed = prev
            .map(|p| (now - p.sampled_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        let rate = |delta: u64| if elapsed > 0.0 { delta as f64 / elapsed } else { 0.0 };

        let state = probe.state.as_ref();
        let connected_since = match state {
            Some(s) if s.connection_state() == ConnectionState::Connected => prev
                .and_then(|p| p.connected_since)
                .or_else(|| s.since())
                .or(Some(now)),
            _ => prev.and_then(|p| p.connected_since),
        };

        let snapshot = StatisticsSnapshot {
            sampled_at: now,
            connected_since,
            tunnel_ip: state
                .and_then(|s| s.tunnel_ip.clone())
                .or_else(|| prev.and_then(|p| p.tunnel_ip.clone())),
            public_ip: state
                .and_then(|s| s.remote_ip.clone())
                .or_else(|| prev.and_then(|p| p.public_ip.clone())),
            bytes_received,
            bytes_sent,
            rx_delta,
            tx_delta,
            rx_per_sec: rate(rx_delta),
            tx_per_sec: rate(tx_delta),
            protocol: self.metadata.protocol.clone(),
            port: self.metadata.port,
            cipher: self.metadata.cipher.clone(),
        };
        self.previous = Some(snapshot.clone());
        snapshot
    }
}
