// src/control.rs
//
// Async client for Tor's control-port line protocol: authenticates once,
// then issues EXTENDCIRCUIT commands and demultiplexes asynchronous
// `650 CIRC` event lines onto a channel the coordinator drains. Framed by
// hand over a raw `tokio::net::TcpStream`, the same way the teacher's
// `dns.rs` hand-frames DNS-over-TCP rather than reaching for a generic
// protocol crate -- the control port's CRLF-terminated text protocol is a
// comparably small surface.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::error::ScanError;

/// Credentials the adapter authenticates the control connection with.
#[derive(Debug, Clone)]
pub enum ControlAuth {
    CookieFile(std::path::PathBuf),
    Password(String),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Launched,
    Built,
    Failed,
    Closed,
}

impl CircuitStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "LAUNCHED" => Some(Self::Launched),
            "BUILT" => Some(Self::Built),
            "FAILED" => Some(Self::Failed),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// One `650 CIRC` event, normalized from the wire line.
#[derive(Debug, Clone)]
pub struct CircuitEvent {
    pub id: u32,
    pub status: CircuitStatus,
    pub path: Vec<String>,
    pub reason: Option<String>,
}

/// One `650 STREAM` event carrying a `NEW` stream's target. With
/// `__LeaveStreamsUnattached=1` set, Tor holds every new stream for the
/// controller to place explicitly via `ATTACHSTREAM`; the target domain is
/// how the coordinator maps a stream back to the probe that opened it,
/// since every query name is unique for the run (see query name generator).
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub id: u32,
    pub target: String,
}

fn parse_stream_event(rest: &str) -> Option<StreamEvent> {
    let mut fields = rest.split_whitespace();
    if fields.next()? != "STREAM" {
        return None;
    }
    let id: u32 = fields.next()?.parse().ok()?;
    if fields.next()? != "NEW" {
        return None;
    }
    fields.next()?; // circ id, always 0 while unattached
    let target = fields.next()?;
    let target = target.rsplit_once(':').map(|(host, _)| host).unwrap_or(target);
    Some(StreamEvent {
        id,
        target: target.to_string(),
    })
}

/// Either half of what the control port pushes asynchronously.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Circuit(CircuitEvent),
    Stream(StreamEvent),
}

struct ControlReply {
    code: u16,
    lines: Vec<String>,
}

type PendingQueue = Arc<Mutex<VecDeque<oneshot::Sender<ControlReply>>>>;

/// A connected, authenticated control channel plus the event stream it feeds.
pub struct ControlClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingQueue,
}

/// Handle for draining circuit and stream lifecycle events. Owned by the
/// coordinator.
pub struct CircuitEvents {
    rx: mpsc::UnboundedReceiver<ControlEvent>,
}

impl CircuitEvents {
    pub async fn recv(&mut self) -> Option<ControlEvent> {
        self.rx.recv().await
    }
}

impl ControlClient {
    /// Connects, authenticates, and spawns the background line reader.
    /// Returns the client plus the event stream it will publish to for the
    /// lifetime of the connection.
    pub async fn connect(addr: &str, auth: &ControlAuth) -> Result<(Self, CircuitEvents)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ScanError::ControlConnect {
                addr: addr.to_string(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));

        spawn_reader(read_half, event_tx, pending.clone());

        let client = ControlClient {
            writer: Mutex::new(write_half),
            pending,
        };

        client.authenticate(auth).await?;
        client.send_command("SETEVENTS CIRC STREAM").await?;

        Ok((client, CircuitEvents { rx: event_rx }))
    }

    /// Tells Tor to hold every new stream for explicit placement instead of
    /// attaching it to whatever circuit is already open, so the coordinator
    /// can pin each probe's stream to the exact circuit it requested.
    pub async fn leave_streams_unattached(&self) -> Result<()> {
        let reply = self
            .send_command("SETCONF __LeaveStreamsUnattached=1")
            .await?;
        if reply.code != 250 {
            bail!("SETCONF __LeaveStreamsUnattached failed: {}", reply.lines.join("; "));
        }
        Ok(())
    }

    pub async fn attach_stream(&self, stream_id: u32, circuit_id: u32) -> Result<()> {
        let reply = self
            .send_command(&format!("ATTACHSTREAM {stream_id} {circuit_id}"))
            .await?;
        if reply.code != 250 {
            bail!("ATTACHSTREAM failed: {}", reply.lines.join("; "));
        }
        Ok(())
    }

    async fn authenticate(&self, auth: &ControlAuth) -> Result<()> {
        let token = match auth {
            ControlAuth::Null => String::new(),
            ControlAuth::Password(pw) => format!("\"{pw}\""),
            ControlAuth::CookieFile(path) => hex_encode_cookie(path)?,
        };
        let reply = self.send_command(&format!("AUTHENTICATE {token}")).await?;
        if reply.code != 250 {
            bail!(ScanError::ControlAuth(reply.lines.join("; ")));
        }
        Ok(())
    }

    /// Requests a fixed-path circuit. Returns immediately; the eventual
    /// BUILT/FAILED is delivered on the `CircuitEvents` stream, correlated
    /// by the circuit id this call returns.
    pub async fn new_circuit(&self, path: &[String]) -> Result<u32> {
        let joined = path.join(",");
        let reply = self
            .send_command(&format!("EXTENDCIRCUIT 0 {joined}"))
            .await?;
        if reply.code != 250 {
            bail!("EXTENDCIRCUIT failed: {}", reply.lines.join("; "));
        }
        let first = reply.lines.first().context("empty EXTENDCIRCUIT reply")?;
        let id_str = first
            .strip_prefix("EXTENDED ")
            .context("unexpected EXTENDCIRCUIT reply shape")?;
        id_str
            .trim()
            .parse::<u32>()
            .context("non-numeric circuit id in EXTENDCIRCUIT reply")
    }

    /// Advisory -- Tor may have already torn the circuit down on its own.
    pub async fn close_circuit(&self, id: u32) {
        if let Err(e) = self.send_command(&format!("CLOSECIRCUIT {id}")).await {
            debug!(circuit_id = id, error = %e, "CLOSECIRCUIT failed (advisory, ignoring)");
        }
    }

    async fn send_command(&self, cmd: &str) -> Result<ControlReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.push_back(tx);
        self.writer
            .lock()
            .await
            .write_all(format!("{cmd}\r\n").as_bytes())
            .await
            .context("writing to Tor control port")?;
        rx.await.context("control connection closed before reply")
    }
}

fn hex_encode_cookie(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading control auth cookie {path:?}"))?;
    let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    Ok(hex)
}

/// Reads lines off the control connection forever: `650` lines become
/// `CircuitEvent`s on `event_tx`, everything else is a reply to the oldest
/// still-unanswered command in `pending` (the control protocol never
/// interleaves two in-flight command replies, so FIFO correlation is exact).
fn spawn_reader(
    read_half: OwnedReadHalf,
    event_tx: mpsc::UnboundedSender<ControlEvent>,
    pending: PendingQueue,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Tor control connection closed by peer");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "error reading from Tor control port");
                    return;
                }
            }
            let text = line.trim_end_matches(['\r', '\n']).to_string();
            trace!(line = %text, "control <-");

            if let Some(rest) = text.strip_prefix("650 ") {
                if let Some(event) = parse_circ_event(rest) {
                    let _ = event_tx.send(ControlEvent::Circuit(event));
                } else if let Some(event) = parse_stream_event(rest) {
                    let _ = event_tx.send(ControlEvent::Stream(event));
                }
                continue;
            }

            if let Some(reply) = collect_reply(&mut reader, &text).await {
                if let Some(sender) = pending.lock().await.pop_front() {
                    let _ = sender.send(reply);
                } else {
                    warn!("received control reply with no pending command");
                }
            } else {
                warn!("Tor control connection closed mid-reply");
                return;
            }
        }
    });
}

async fn collect_reply(
    reader: &mut BufReader<OwnedReadHalf>,
    first_line: &str,
) -> Option<ControlReply> {
    let mut lines = Vec::new();
    let mut code = first_line.get(0..3)?.parse::<u16>().ok()?;
    let mut separator = first_line.as_bytes().get(3).copied().unwrap_or(b' ');
    lines.push(first_line[4.min(first_line.len())..].to_string());

    while separator == b'-' || separator == b'+' {
        let mut next = String::new();
        if reader.read_line(&mut next).await.ok()? == 0 {
            return None;
        }
        let next = next.trim_end_matches(['\r', '\n']).to_string();
        code = next.get(0..3)?.parse::<u16>().unwrap_or(code);
        separator = next.as_bytes().get(3).copied().unwrap_or(b' ');
        lines.push(next[4.min(next.len())..].to_string());
    }

    Some(ControlReply { code, lines })
}

fn parse_circ_event(rest: &str) -> Option<CircuitEvent> {
    let mut fields = rest.split_whitespace();
    if fields.next()? != "CIRC" {
        return None;
    }
    let id: u32 = fields.next()?.parse().ok()?;
    let status = CircuitStatus::parse(fields.next()?)?;
    let mut path = Vec::new();
    let mut reason = None;
    for field in fields {
        if let Some(r) = field.strip_prefix("REASON=") {
            reason = Some(r.to_string());
        } else if field.contains('$') || field.contains(',') {
            path = field
                .split(',')
                .map(|hop| hop.trim_start_matches('$').to_string())
                .collect();
        }
    }
    Some(CircuitEvent {
        id,
        status,
        path,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_built_event_with_path_and_no_reason() {
        let event = parse_circ_event(
            "1 BUILT $AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA~Guard,$BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB~Exit PURPOSE=GENERAL",
        )
        .unwrap();
        assert_eq!(event.id, 1);
        assert_eq!(event.status, CircuitStatus::Built);
        assert_eq!(event.path.len(), 2);
        assert_eq!(event.reason, None);
    }

    #[test]
    fn parses_failed_event_with_reason() {
        let event = parse_circ_event("7 FAILED $AAAA REASON=TIMEOUT").unwrap();
        assert_eq!(event.status, CircuitStatus::Failed);
        assert_eq!(event.reason.as_deref(), Some("TIMEOUT"));
    }

    #[test]
    fn ignores_non_circ_events() {
        assert!(parse_circ_event("STREAM 1 NEW 0 example.com:0").is_none());
    }

    #[test]
    fn parses_stream_new_event_and_strips_port() {
        let event = parse_stream_event("STREAM 42 NEW 0 r.1.120.AAAA.tor.exit.validator.example:0").unwrap();
        assert_eq!(event.id, 42);
        assert_eq!(event.target, "r.1.120.AAAA.tor.exit.validator.example");
    }

    #[test]
    fn ignores_non_stream_events() {
        assert!(parse_stream_event("CIRC 1 BUILT $AAAA").is_none());
    }
}
