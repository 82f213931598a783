//! Client configuration generation from a relay's embedded config blob.

use crate::openvpn::types::*;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use relaybar_core::{ServerDescriptor, VpnCredentials, VpnError};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Controller-owned directives
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Directives stripped from relay configs, commented out or not. The
/// managed block re-adds them pointing at session files.
const OWNED_DIRECTIVES: &[&str] = &[
    "auth-user-pass",
    "management",
    "daemon",
    "log",
    "log-append",
    "writepid",
];

/// Directive families owned as a whole: `management-hold`,
/// `management-query-passwords` and friends would hand control of the
/// client to a socket peer that never answers them.
const OWNED_FAMILIES: &[&str] = &["auth-user-pass", "management"];

const DATA_CIPHERS: &str = "AES-256-GCM:AES-128-GCM:CHACHA20-POLY1305:AES-128-CBC";
const DATA_CIPHERS_FALLBACK: &str = "AES-128-CBC";

/// First word of a config line once any comment marker is removed.
fn directive_of(line: &str) -> Option<&str> {
    let body = line
        .trim()
        .trim_start_matches(|c| c == '#' || c == ';')
        .trim_start();
    body.split_whitespace().next()
}

fn is_owned(line: &str) -> bool {
    let Some(d) = directive_of(line) else {
        return false;
    };
    let d = d.to_ascii_lowercase();
    OWNED_DIRECTIVES.iter().any(|o| d == *o)
        || OWNED_FAMILIES
            .iter()
            .any(|f| d.strip_prefix(f).is_some_and(|rest| rest.starts_with('-')))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Decoding & rewriting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decode a relay's base64 config blob into text.
pub fn decode_blob(blob: &str) -> Result<String, VpnError> {
    let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| VpnError::ConfigurationCreationFailed(format!("invalid base64: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| VpnError::ConfigurationCreationFailed(format!("config is not UTF-8: {}", e)))
}

/// Drop controller-owned lines from the relay's config.
pub fn strip_owned_directives(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.lines().filter(|l| !is_owned(l)) {
        out.push_str(line.trim_end_matches('\r'));
        out.push('\n');
    }
    out
}

/// The block appended after the relay's own directives.
pub fn managed_block(paths: &SessionPaths, dns_servers: &[String]) -> String {
    let mut lines = vec![
        "# --- managed by relaybar ---".to_string(),
        format!("auth-user-pass {}", quote_path(&paths.auth)),
        "auth-nocache".to_string(),
        format!("management {} unix", quote_path(&paths.socket)),
        "daemon".to_string(),
        format!("log {}", quote_path(&paths.log)),
        format!("writepid {}", quote_path(&paths.pid)),
        "persist-tun".to_string(),
        "persist-key".to_string(),
        format!("data-ciphers {}", DATA_CIPHERS),
        format!("data-ciphers-fallback {}", DATA_CIPHERS_FALLBACK),
        "redirect-gateway def1".to_string(),
    ];
    for dns in dns_servers {
        lines.push(format!("dhcp-option DNS {}", dns));
    }
    let mut block = lines.join("\n");
    block.push('\n');
    block
}

/// OpenVPN config syntax accepts double-quoted arguments.
fn quote_path(p: &Path) -> String {
    let s = p.display().to_string();
    if s.contains(char::is_whitespace) {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s
    }
}

/// Extract transport details for statistics display.
pub fn parse_metadata(source: &str) -> ConfigMetadata {
    let mut meta = ConfigMetadata::default();
    for raw in source.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut words = line.split_whitespace();
        let Some(directive) = words.next() else { continue };
        let args: Vec<&str> = words.collect();
        match directive.to_lowercase().as_str() {
            "proto" => {
                if let Some(p) = args.first() {
                    meta.protocol = Some(p.to_lowercase());
                }
            }
            "remote" if meta.remote_host.is_none() => {
                meta.remote_host = args.first().map(|h| h.to_string());
                if let Some(port) = args.get(1).and_then(|p| p.parse().ok()) {
                    meta.port = Some(port);
                }
                if let Some(proto) = args.get(2) {
                    meta.protocol.get_or_insert_with(|| proto.to_lowercase());
                }
            }
            "port" if meta.port.is_none() => {
                meta.port = args.first().and_then(|p| p.parse().ok());
            }
            "cipher" => meta.cipher = args.first().map(|c| c.to_uppercase()),
            "data-ciphers" | "ncp-ciphers" if meta.cipher.is_none() => {
                meta.cipher = args
                    .first()
                    .and_then(|list| list.split(':').next())
                    .map(|c| c.to_uppercase());
            }
            _ => {}
        }
    }
    meta
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Generator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a successful generation.
#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub paths: SessionPaths,
    pub metadata: ConfigMetadata,
}

/// Writes the launch-ready config and the auth file into one directory.
/// Starts no process.
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    dir: PathBuf,
    dns_servers: Vec<String>,
}

impl ConfigGenerator {
    pub fn new(dir: impl Into<PathBuf>, dns_servers: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            dns_servers,
        }
    }

    pub fn paths(&self) -> SessionPaths {
        SessionPaths::in_dir(&self.dir)
    }

    pub async fn generate(
        &self,
        server: &ServerDescriptor,
        creds: &VpnCredentials,
    ) -> Result<GeneratedConfig, VpnError> {
        let source = decode_blob(&server.config_blob)?;
        let metadata = parse_metadata(&source);
        let paths = self.paths();

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            VpnError::ConfigurationCreationFailed(format!(
                "cannot create {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut body = strip_owned_directives(&source);
        if !body.ends_with('\n') && !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&managed_block(&paths, &self.dns_servers));

        // Relay configs may embed <key> material; both files are owner-only.
        write_private(&paths.auth, creds.to_auth_file().as_bytes()).await?;
        write_private(&paths.config, body.as_bytes()).await?;

        log::info!(
            "Generated config for {} at {}",
            server.display_name(),
            paths.config.display()
        );
        Ok(GeneratedConfig { paths, metadata })
    }
}

/// Owner-only file; an existing file is replaced so stale permissions
/// never carry over.
async fn write_private(path: &Path, data: &[u8]) -> Result<(), VpnError> {
    let _ = tokio::fs::remove_file(path).await;
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let fail = |e: std::io::Error| {
        VpnError::ConfigurationCreationFailed(format!("{}: {}", path.display(), e))
    };
    let mut file = opts.open(path).await.map_err(fail)?;
    file.write_all(data).await.map_err(fail)?;
    file.flush().await.map_err(fail)?;
    Ok(())
}

/// Remove a session's transient files. Missing files are fine.
pub async fn remove_session_files(paths: &SessionPaths) {
    for f in paths.transient() {
        match tokio::fs::remove_file(f).await {
            Ok(()) => log::debug!("Removed {}", f.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove {}: {}", f.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "client\n\
dev tun\n\
proto udp\n\
remote 219.100.37.10 1194\n\
cipher AES-128-CBC\n\
auth-user-pass\n\
#auth-user-pass /etc/pass\n\
; management 127.0.0.1 7505\n\
log-append /var/log/x\n\
<ca>\n-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n</ca>\n";

    fn server_with(blob: String) -> ServerDescriptor {
        ServerDescriptor {
            id: "jp-1".into(),
            hostname: "public-vpn-1".into(),
            ip: "219.100.37.10".into(),
            country_long: "Japan".into(),
            country_short: "JP".into(),
            score: 1,
            ping_ms: None,
            speed_bps: None,
            config_blob: blob,
        }
    }

    #[test]
    fn strips_owned_and_commented_directives() {
        let out = strip_owned_directives(SAMPLE);
        assert!(!out.contains("auth-user-pass"));
        assert!(!out.contains("management"));
        assert!(!out.contains("log-append"));
        assert!(out.contains("remote 219.100.37.10 1194"));
        assert!(out.contains("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn directive_detection_is_word_based() {
        assert!(is_owned("  # daemon"));
        assert!(is_owned("LOG /tmp/x"));
        // "logger" or "log-level" style words are not "log"
        assert!(!is_owned("verb 3"));
        assert!(!is_owned("logfile-ish something"));
    }

    #[test]
    fn management_and_auth_families_are_stripped() {
        let out = strip_owned_directives(
            "client\nmanagement-hold\nmanagement-query-passwords\n#management-client-auth\n\
             auth-user-pass-verify /bin/true via-env\nauth-user-pass\nauth-nocache\n",
        );
        assert_eq!(out, "client\nauth-nocache\n");
        assert!(!is_owned("managementx 1"));
        assert!(!is_owned("auth SHA256"));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        let err = decode_blob("!!!not base64!!!").unwrap_err();
        assert!(matches!(err, VpnError::ConfigurationCreationFailed(_)));
    }

    #[test]
    fn decode_rejects_non_utf8() {
        let blob = STANDARD.encode([0xff, 0xfe, 0xfd]);
        let err = decode_blob(&blob).unwrap_err();
        assert!(matches!(err, VpnError::ConfigurationCreationFailed(ref m) if m.contains("UTF-8")));
    }

    #[test]
    fn decode_tolerates_wrapped_lines() {
        let blob = STANDARD.encode("client\ndev tun\n");
        let wrapped = format!("{}\n{}", &blob[..8], &blob[8..]);
        assert_eq!(decode_blob(&wrapped).unwrap(), "client\ndev tun\n");
    }

    #[test]
    fn metadata_from_source() {
        let meta = parse_metadata(SAMPLE);
        assert_eq!(meta.protocol.as_deref(), Some("udp"));
        assert_eq!(meta.port, Some(1194));
        assert_eq!(meta.remote_host.as_deref(), Some("219.100.37.10"));
        assert_eq!(meta.cipher.as_deref(), Some("AES-128-CBC"));
    }

    #[test]
    fn metadata_protocol_from_remote_line() {
        let meta = parse_metadata("remote vpn.example.com 443 tcp\ndata-ciphers aes-256-gcm:aes-128-gcm\n");
        assert_eq!(meta.protocol.as_deref(), Some("tcp"));
        assert_eq!(meta.port, Some(443));
        assert_eq!(meta.cipher.as_deref(), Some("AES-256-GCM"));
    }

    #[test]
    fn managed_block_lists_session_paths() {
        let paths = SessionPaths::in_dir(Path::new("/tmp/rb"));
        let block = managed_block(&paths, &["1.1.1.1".into()]);
        assert!(block.contains("auth-user-pass /tmp/rb/auth.txt\n"));
        assert!(block.contains("management /tmp/rb/management.sock unix\n"));
        assert!(block.contains("writepid /tmp/rb/openvpn.pid\n"));
        assert!(block.contains("log /tmp/rb/openvpn.log\n"));
        assert!(block.contains("\ndaemon\n"));
        assert!(block.contains("persist-tun\npersist-key\n"));
        assert!(block.contains("dhcp-option DNS 1.1.1.1\n"));
    }

    #[test]
    fn paths_with_spaces_are_quoted() {
        let paths = SessionPaths::in_dir(Path::new("/Users/me/Application Support/rb"));
        let block = managed_block(&paths, &[]);
        assert!(block.contains("management \"/Users/me/Application Support/rb/management.sock\" unix"));
    }

    #[tokio::test]
    async fn generate_writes_config_and_private_auth() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ConfigGenerator::new(dir.path(), vec!["8.8.8.8".into()]);
        let server = server_with(STANDARD.encode(SAMPLE));
        let out = generator
            .generate(&server, &VpnCredentials::basic("u", "p"))
            .await
            .unwrap();

        let cfg = std::fs::read_to_string(&out.paths.config).unwrap();
        assert_eq!(cfg.matches("auth-user-pass").count(), 1);
        assert_eq!(cfg.matches("management ").count(), 1);
        assert!(cfg.contains("dhcp-option DNS 8.8.8.8"));
        assert_eq!(std::fs::read_to_string(&out.paths.auth).unwrap(), "u\np\n");
        assert_eq!(out.metadata.port, Some(1194));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&out.paths.auth).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let cfg_mode = std::fs::metadata(&out.paths.config).unwrap().permissions().mode();
            assert_eq!(cfg_mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn generate_fails_before_writing_on_bad_blob() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ConfigGenerator::new(dir.path(), vec![]);
        let err = generator
            .generate(&server_with("%%%".into()), &VpnCredentials::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VpnError::ConfigurationCreationFailed(_)));
        assert!(!generator.paths().auth.exists());
    }

    #[tokio::test]
    async fn remove_session_files_keeps_log() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::in_dir(dir.path());
        for f in paths.transient() {
            std::fs::write(f, "x").unwrap();
        }
        std::fs::write(&paths.log, "log").unwrap();
        remove_session_files(&paths).await;
        assert!(paths.transient().iter().all(|f| !f.exists()));
        assert!(paths.log.exists());
        // second pass over missing files is quiet
        remove_session_files(&paths).await;
    }
}
