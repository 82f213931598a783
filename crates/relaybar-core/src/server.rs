//! Relay server descriptors as produced by the server catalog.

use serde::{Deserialize, Serialize};

/// An immutable description of one public relay.
///
/// `config_blob` is the base64-encoded client configuration published by
/// the relay operator. It is only decoded when a session is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub country_long: String,
    pub country_short: String,
    pub score: u64,
    #[serde(default)]
    pub ping_ms: Option<u32>,
    #[serde(default)]
    pub speed_bps: Option<u64>,
    pub config_blob: String,
}

impl ServerDescriptor {
    /// Label shown in menus and logs, e.g. `public-vpn-42 (JP)`.
    pub fn display_name(&self) -> String {
        if self.country_short.is_empty() {
            self.hostname.clone()
        } else {
            format!("{} ({})", self.hostname, self.country_short)
        }
    }

    /// Advertised throughput in Mbit/s, if the catalog reported one.
    pub fn speed_mbps(&self) -> Option<f64> {
        self.speed_bps.map(|bps| bps as f64 / 1_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerDescriptor {
        ServerDescriptor {
            id: "public-vpn-42".into(),
            hostname: "public-vpn-42".into(),
            ip: "219.100.37.10".into(),
            country_long: "Japan".into(),
            country_short: "JP".into(),
            score: 1_250_000,
            ping_ms: Some(14),
            speed_bps: Some(85_000_000),
            config_blob: String::new(),
        }
    }

    #[test]
    fn display_name_includes_country() {
        assert_eq!(sample().display_name(), "public-vpn-42 (JP)");
        let mut s = sample();
        s.country_short.clear();
        assert_eq!(s.display_name(), "public-vpn-42");
    }

    #[test]
    fn speed_in_mbps() {
        assert_eq!(sample().speed_mbps(), Some(85.0));
    }

    #[test]
    fn deserialize_without_hints() {
        let json = r#"{
            "id": "a", "hostname": "a", "ip": "1.2.3.4",
            "countryLong": "Korea Republic of", "countryShort": "KR",
            "score": 10, "configBlob": "Y2xpZW50"
        }"#;
        let s: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert!(s.ping_ms.is_none());
        assert!(s.speed_bps.is_none());
        assert_eq!(s.country_short, "KR");
    }
}
