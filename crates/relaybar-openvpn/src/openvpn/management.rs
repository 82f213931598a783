//! OpenVPN management-socket client.
//!
//! The client is started with `management <path> unix`. Every query here
//! opens a fresh connection, writes one command, collects the response up
//! to its terminator and closes. A missing socket file means no client is
//! running yet, so queries answer `Ok(None)` instead of failing.

use crate::openvpn::types::*;
use lazy_static::lazy_static;
use regex::Regex;
use relaybar_core::VpnError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

lazy_static! {
    /// Data lines of a `state` response start with a numeric timestamp.
    static ref STATE_DATA_LINE: Option<Regex> = Regex::new(r"^\d+,").ok();
}

fn is_state_data_line(line: &str) -> bool {
    STATE_DATA_LINE
        .as_ref()
        .map(|re| re.is_match(line))
        .unwrap_or(false)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Commands the controller sends.
pub struct MgmtCommands;

impl MgmtCommands {
    pub const STATE: &'static str = "state";
    pub const STATUS: &'static str = "status";
    pub const SIGTERM: &'static str = "signal SIGTERM";

    pub fn signal(name: &str) -> String {
        format!("signal {}", name)
    }
}

/// How the response to a command ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    /// Block responses (`state`, `status`) end with `END`.
    End,
    /// One-shot commands end with `SUCCESS:` or `ERROR:`.
    Verdict,
}

fn terminator_for(cmd: &str) -> Terminator {
    if cmd.starts_with("state") || cmd.starts_with("status") {
        Terminator::End
    } else {
        Terminator::Verdict
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tokenizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One classified response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    /// `>TYPE:payload` real-time notification, interleaved anywhere.
    Notification(&'a str),
    End,
    Success(&'a str),
    Error(&'a str),
    Data(&'a str),
}

impl<'a> Line<'a> {
    pub fn classify(raw: &'a str) -> Option<Self> {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }
        Some(if let Some(rest) = line.strip_prefix('>') {
            Line::Notification(rest)
        } else if line == "END" {
            Line::End
        } else if let Some(rest) = line.strip_prefix("SUCCESS:") {
            Line::Success(rest.trim())
        } else if let Some(rest) = line.strip_prefix("ERROR:") {
            Line::Error(rest.trim())
        } else {
            Line::Data(line)
        })
    }

    fn terminates(&self, t: Terminator) -> bool {
        match t {
            Terminator::End => matches!(self, Line::End | Line::Error(_)),
            Terminator::Verdict => matches!(self, Line::Success(_) | Line::Error(_)),
        }
    }
}

/// Split a raw response into classified lines, dropping blanks.
pub fn tokenize(response: &str) -> impl Iterator<Item = Line<'_>> {
    response.lines().filter_map(Line::classify)
}

fn data_lines(response: &str) -> Result<Vec<&str>, VpnError> {
    let mut data = Vec::new();
    for line in tokenize(response) {
        match line {
            Line::Data(d) => data.push(d),
            Line::Error(e) => return Err(VpnError::Protocol(e.to_string())),
            Line::Notification(_) | Line::End | Line::Success(_) => {}
        }
    }
    Ok(data)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Parsers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse the response to `state`. The last data line wins when the
/// client returns history.
pub fn parse_state_response(response: &str) -> Result<StateLine, VpnError> {
    let line = data_lines(response)?
        .into_iter()
        .filter(|l| is_state_data_line(l))
        .last()
        .ok_or_else(|| VpnError::Protocol("no state line in response".into()))?;

    let fields: Vec<&str> = line.split(',').collect();
    let timestamp = fields[0]
        .parse()
        .map_err(|_| VpnError::Protocol(format!("bad timestamp in {:?}", line)))?;
    let token = fields
        .get(1)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| VpnError::Protocol(format!("missing state token in {:?}", line)))?;
    let non_empty = |i: usize| {
        fields
            .get(i)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(StateLine {
        timestamp,
        token,
        description: non_empty(2).unwrap_or_default(),
        tunnel_ip: non_empty(3),
        remote_ip: non_empty(4),
    })
}

/// Value after the first comma following `label`, wherever it sits in the line.
fn counter_after(line: &str, label: &str) -> Option<u64> {
    let at = line.find(label)?;
    let rest = &line[at + label.len()..];
    let (_, value) = rest.split_once(',')?;
    value.split(',').next()?.trim().parse().ok()
}

/// Parse the `status` block for the link-level byte counters.
pub fn parse_status_response(response: &str) -> Result<ByteCounters, VpnError> {
    let mut read = None;
    let mut written = None;
    for line in data_lines(response)? {
        if let Some(n) = counter_after(line, "TCP/UDP read bytes") {
            read = Some(n);
        } else if let Some(n) = counter_after(line, "TCP/UDP write bytes") {
            written = Some(n);
        }
    }
    match (read, written) {
        (Some(bytes_received), Some(bytes_sent)) => Ok(ByteCounters {
            bytes_received,
            bytes_sent,
        }),
        _ => Err(VpnError::Protocol("status block lacks TCP/UDP byte counters".into())),
    }
}

/// Map a state token onto the controller's connection state.
pub fn map_state_token(token: &str) -> ConnectionState {
    match token.trim().to_uppercase().as_str() {
        "CONNECTED" => ConnectionState::Connected,
        "WAIT" | "AUTH" | "GET_CONFIG" | "ASSIGN_IP" | "CONNECTING" => ConnectionState::Connecting,
        "RECONNECTING" => ConnectionState::Reconnecting,
        _ => ConnectionState::Disconnected,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Query handle bound to one management socket path.
#[derive(Debug, Clone)]
pub struct ManagementChannel {
    socket: PathBuf,
    timeout: Duration,
}

impl ManagementChannel {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn socket_exists(&self) -> bool {
        self.socket.exists()
    }

    /// Send one command and return the raw response.
    ///
    /// `Ok(None)` when nothing is listening: the socket file is absent, or
    /// left behind by a client that is gone. The exchange is bounded by the
    /// channel timeout; whatever arrived before the deadline is returned.
    pub async fn send(&self, cmd: &str) -> Result<Option<String>, VpnError> {
        if !self.socket_exists() {
            return Ok(None);
        }
        let stream = match UnixStream::connect(&self.socket).await {
            Ok(s) => s,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                log::debug!("Management socket {} not accepting: {}", self.socket.display(), e);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let terminator = terminator_for(cmd);
        let mut collected: Vec<String> = Vec::new();
        let fut = exchange(stream, cmd, terminator, &mut collected);
        let outcome = tokio::time::timeout(self.timeout, fut).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) if collected.is_empty() => return Err(e.into()),
            Ok(Err(e)) => log::debug!("Management read for {:?} cut short: {}", cmd, e),
            Err(_) => log::debug!(
                "Management command {:?} timed out after {:?} ({} lines read)",
                cmd,
                self.timeout,
                collected.len()
            ),
        }
        Ok(Some(collected.join("\n")))
    }

    pub async fn query_state(&self) -> Result<Option<StateLine>, VpnError> {
        match self.send(MgmtCommands::STATE).await? {
            Some(resp) => parse_state_response(&resp).map(Some),
            None => Ok(None),
        }
    }

    pub async fn query_status(&self) -> Result<Option<ByteCounters>, VpnError> {
        match self.send(MgmtCommands::STATUS).await? {
            Some(resp) => parse_status_response(&resp).map(Some),
            None => Ok(None),
        }
    }

    /// Ask the client to shut down. `Ok(false)` if no client was listening.
    pub async fn signal_terminate(&self) -> Result<bool, VpnError> {
        let Some(resp) = self.send(MgmtCommands::SIGTERM).await? else {
            return Ok(false);
        };
        for line in tokenize(&resp) {
            if let Line::Error(e) = line {
                return Err(VpnError::Protocol(format!("signal rejected: {}", e)));
            }
        }
        // The client may exit before acknowledging; a written command counts.
        Ok(true)
    }

    /// Poll both queries. Failures of either half are logged and reported
    /// as unknown.
    pub async fn probe(&self) -> ProbeResult {
        let state = match self.query_state().await {
            Ok(s) => s,
            Err(e) => {
                log::debug!("state query failed: {}", e);
                None
            }
        };
        let counters = match self.query_status().await {
            Ok(c) => c,
            Err(e) => {
                log::debug!("status query failed: {}", e);
                None
            }
        };
        ProbeResult { state, counters }
    }
}

async fn exchange(
    stream: UnixStream,
    cmd: &str,
    terminator: Terminator,
    collected: &mut Vec<String>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("{}\n", cmd).as_bytes()).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let done = Line::classify(&line)
            .map(|l| l.terminates(terminator))
            .unwrap_or(false);
        collected.push(line);
        if done {
            break;
        }
    }
    Ok(())
}
