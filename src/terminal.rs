//! Terminal Bridge: connects a browser websocket to an interactive shell in a sandbox.
//!
//! A session goes through handshake, attach and drain. When the shell ends
//! the socket stays open: the client gets a notice, then keepalive pings
//! until it disconnects.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::cluster::TerminalSize;
use crate::exec::{Executor, SessionEnd, TerminalInput, TerminalIo};
use crate::identity::SandboxRef;

pub const SESSION_ENDED_NOTICE: &str =
    "\r\nSessão do terminal encerrada. Digite 'exit' ou 'logout' para iniciar nova sessão.";

/// Render `message` in bold red for the terminal.
pub fn error_banner(message: &str) -> String {
    format!("\r\n\x1b[1;31m{}\x1b[0m\r\n", message)
}

#[derive(Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    cols: u16,
    rows: u16,
}

/// Recognize a `{"type":"resize","cols":C,"rows":R}` control message.
pub fn parse_resize(payload: &[u8]) -> Option<TerminalSize> {
    let first = payload.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first != b'{' {
        return None;
    }
    let control: ControlMessage = serde_json::from_slice(payload).ok()?;
    (control.kind == "resize").then_some(TerminalSize {
        width: control.cols,
        height: control.rows,
    })
}

fn classify(payload: Vec<u8>) -> TerminalInput {
    match parse_resize(&payload) {
        Some(size) => TerminalInput::Resize(size),
        None => TerminalInput::Data(Bytes::from(payload)),
    }
}

/// Holds back the incomplete UTF-8 sequence at the end of a chunk.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }
}

/// [`TerminalIo`] over the two halves of a websocket.
pub struct WsTerminal<S, K> {
    inbound: S,
    outbound: K,
    queued: VecDeque<TerminalInput>,
    carry: Utf8Carry,
}

impl<S, K, E> WsTerminal<S, K>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send,
    K: Sink<Message> + Unpin + Send,
    K::Error: Display,
    E: Display + Send,
{
    /// The first input reported is the default 80x24 size.
    pub fn new(inbound: S, outbound: K) -> Self {
        Self {
            inbound,
            outbound,
            queued: VecDeque::from([TerminalInput::Resize(TerminalSize::DEFAULT)]),
            carry: Utf8Carry::default(),
        }
    }

    pub async fn send_text(&mut self, text: String) -> Result<(), K::Error> {
        self.outbound.send(Message::Text(text)).await
    }

    pub async fn close(&mut self) {
        let _ = self.outbound.send(Message::Close(None)).await;
    }

    /// Ping every `period` until the client disconnects. Client input is discarded.
    pub async fn keep_alive(&mut self, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.outbound.send(Message::Ping(Vec::new())).await {
                        debug!("Keepalive ping failed: {}", e);
                        return;
                    }
                }
                msg = self.inbound.next() => match msg {
                    None | Some(Ok(Message::Close(_))) => return,
                    Some(Err(e)) => {
                        debug!("Terminal connection error: {}", e);
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[async_trait]
impl<S, K, E> TerminalIo for WsTerminal<S, K>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send,
    K: Sink<Message> + Unpin + Send,
    K::Error: Display,
    E: Display + Send,
{
    async fn read(&mut self) -> Option<TerminalInput> {
        if let Some(input) = self.queued.pop_front() {
            return Some(input);
        }
        loop {
            match self.inbound.next().await? {
                Ok(Message::Text(text)) => return Some(classify(text.into_bytes())),
                Ok(Message::Binary(data)) => return Some(classify(data)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Terminal connection error: {}", e);
                    return None;
                }
            }
        }
    }

    async fn write(&mut self, data: Bytes) -> io::Result<()> {
        let text = self.carry.push(&data);
        if text.is_empty() {
            return Ok(());
        }
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }
}

/// How a terminal session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The sandbox was not usable; the socket was closed after an error.
    Rejected,
    /// The client disconnected while the shell was running.
    ClientClosed,
    /// The shell ended and the client later disconnected.
    Drained,
}

pub struct TerminalBridge {
    executor: Arc<Executor>,
    keepalive: Duration,
}

impl TerminalBridge {
    pub fn new(executor: Arc<Executor>, keepalive: Duration) -> Self {
        Self {
            executor,
            keepalive,
        }
    }

    pub async fn serve(&self, target: SandboxRef, socket: WebSocket) -> SessionOutcome {
        let (outbound, inbound) = socket.split();
        self.run(target, inbound, outbound).await
    }

    /// Drive one session over an already-upgraded connection.
    pub async fn run<S, K, E>(&self, target: SandboxRef, inbound: S, outbound: K) -> SessionOutcome
    where
        S: Stream<Item = Result<Message, E>> + Unpin + Send,
        K: Sink<Message> + Unpin + Send,
        K::Error: Display,
        E: Display + Send,
    {
        let mut terminal = WsTerminal::new(inbound, outbound);

        if let Err(e) = self.executor.ensure_ready(&target).await {
            warn!(sandbox = %target, "Rejecting terminal session: {}", e);
            let _ = terminal.send_text(error_banner(&e.to_string())).await;
            terminal.close().await;
            return SessionOutcome::Rejected;
        }

        let closing = match self.executor.exec_interactive(&target, &mut terminal).await {
            Ok(SessionEnd::ClientClosed) => {
                info!(sandbox = %target, "Terminal client disconnected");
                return SessionOutcome::ClientClosed;
            }
            Ok(SessionEnd::Exited(status)) if status.is_success() => SESSION_ENDED_NOTICE.to_string(),
            Ok(SessionEnd::Exited(status)) => {
                let reason = status.message.unwrap_or_else(|| "sessão encerrada com erro".to_string());
                error_banner(&format!("Erro no stream: {}", reason))
            }
            Err(e) => {
                warn!(sandbox = %target, "Terminal stream failed: {}", e);
                error_banner(&format!("Erro no stream: {}", e))
            }
        };

        if terminal.send_text(closing).await.is_err() {
            return SessionOutcome::ClientClosed;
        }
        debug!(sandbox = %target, "Shell ended, keeping connection alive");
        terminal.keep_alive(self.keepalive).await;
        info!(sandbox = %target, "Terminal connection closed");
        SessionOutcome::Drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_messages_are_recognized() {
        assert_eq!(
            parse_resize(br#"{"type":"resize","cols":100,"rows":40}"#),
            Some(TerminalSize {
                width: 100,
                height: 40
            })
        );
        assert_eq!(
            parse_resize(br#"  {"rows": 5, "cols": 7, "type": "resize"}"#),
            Some(TerminalSize {
                width: 7,
                height: 5
            })
        );
    }

    #[test]
    fn everything_else_is_data() {
        assert_eq!(parse_resize(b"ls -la\r"), None);
        assert_eq!(parse_resize(br#"{"type":"input","cols":1,"rows":1}"#), None);
        assert_eq!(parse_resize(br#"{"type":"resize"}"#), None);
        assert_eq!(parse_resize(b"{not json"), None);
        assert_eq!(
            classify(b"echo {}\n".to_vec()),
            TerminalInput::Data(Bytes::from_static(b"echo {}\n"))
        );
    }

    #[test]
    fn utf8_split_across_writes_is_reassembled() {
        let mut carry = Utf8Carry::default();
        let word = "sessão".as_bytes();
        let split = word.len() - 2;
        assert_eq!(carry.push(&word[..split]), "sess");
        assert_eq!(carry.push(&word[split..]), "ão");
        assert_eq!(carry.push(b"\xff ok"), "\u{fffd} ok");
    }

    #[test]
    fn error_banner_is_bold_red() {
        assert_eq!(error_banner("boom"), "\r\n\x1b[1;31mboom\x1b[0m\r\n");
    }
}
