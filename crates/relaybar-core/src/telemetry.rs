//! Connect-attempt telemetry.
//!
//! The controller reports exactly one [`AttemptRecord`] per `connect`
//! call. Aggregation and scoring happen elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Connected,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub server_id: String,
    pub outcome: AttemptOutcome,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(server_id: impl Into<String>, outcome: AttemptOutcome, elapsed: Duration) -> Self {
        Self {
            server_id: server_id.into(),
            outcome,
            elapsed,
            at: Utc::now(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Append-only sink for attempt outcomes.
pub trait AttemptRecorder: Send + Sync {
    fn record(&self, record: AttemptRecord);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopRecorder;

impl AttemptRecorder for NoopRecorder {
    fn record(&self, _record: AttemptRecord) {}
}

/// Keeps records in memory; used by the headless front end and tests.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<AttemptRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Share of finished (non-cancelled) attempts that connected.
    pub fn success_rate(&self, server_id: &str) -> Option<f64> {
        let records = self.records();
        let finished: Vec<&AttemptRecord> = records
            .iter()
            .filter(|r| r.server_id == server_id && r.outcome != AttemptOutcome::Cancelled)
            .collect();
        if finished.is_empty() {
            return None;
        }
        let ok = finished
            .iter()
            .filter(|r| r.outcome == AttemptOutcome::Connected)
            .count();
        Some(ok as f64 / finished.len() as f64)
    }
}

impl AttemptRecorder for MemoryRecorder {
    fn record(&self, record: AttemptRecord) {
        log::debug!("attempt on {}: {:?}", record.server_id, record.outcome);
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
