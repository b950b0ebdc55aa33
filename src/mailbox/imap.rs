//! IMAP over TLS via rustls, speaking just enough of the protocol for the
//! relay: LOGIN, ID, SELECT, SEARCH, FETCH, STORE, LOGOUT.
//!
//! The socket work is blocking and runs inside `spawn_blocking`; every call
//! is bounded by the configured read/write timeout.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::{MailboxConnector, MailboxSession, MessageId, RawMessage};
use crate::config::MailboxConfig;
use crate::error::MailboxError;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Largest literal accepted from the server.
const MAX_LITERAL_BYTES: usize = 32 * 1024 * 1024;

// ── Connector ───────────────────────────────────────────────────────

/// Opens IMAP sessions: TLS, then LOGIN, then (optionally) ID, then SELECT.
pub struct ImapConnector {
    config: MailboxConfig,
}

impl ImapConnector {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn open(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let cfg = self.config.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<_, MailboxError> {
            let stream = connect_tls(&cfg)?;
            let mut conn = ImapConnection::handshake(stream, cfg.timeout)?;
            conn.login(&cfg.username, cfg.password.expose_secret())?;
            if cfg.send_id {
                conn.identify();
            }
            conn.select(&cfg.folder)?;
            Ok(conn)
        })
        .await
        .map_err(|e| MailboxError::Network(format!("IMAP connect task panicked: {e}")))??;

        info!(host = %self.config.host, folder = %self.config.folder, "Mailbox session opened");
        Ok(Box::new(ImapSession { conn: Some(conn) }))
    }
}

fn connect_tls(cfg: &MailboxConfig) -> Result<TlsStream, MailboxError> {
    let addrs = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .map_err(|e| MailboxError::Network(format!("resolve {}: {e}", cfg.host)))?;

    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, cfg.timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = match (tcp, last_err) {
        (Some(stream), _) => stream,
        (None, Some(e)) => return Err(MailboxError::from_io("connect", cfg.timeout, e)),
        (None, None) => {
            return Err(MailboxError::Network(format!(
                "no addresses for {}",
                cfg.host
            )));
        }
    };

    let io_err = |e| MailboxError::from_io("connect", cfg.timeout, e);
    tcp.set_read_timeout(Some(cfg.timeout)).map_err(io_err)?;
    tcp.set_write_timeout(Some(cfg.timeout)).map_err(io_err)?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| MailboxError::Network(format!("TLS setup: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    let server_name = ServerName::try_from(cfg.host.clone())
        .map_err(|e| MailboxError::Network(format!("invalid server name {}: {e}", cfg.host)))?;
    let conn = rustls::ClientConnection::new(Arc::new(tls_config), server_name)
        .map_err(|e| MailboxError::Network(format!("TLS setup: {e}")))?;

    Ok(rustls::StreamOwned::new(conn, tcp))
}

// ── Session ─────────────────────────────────────────────────────────

/// Async face of a blocking [`ImapConnection`].
///
/// Each call moves the connection onto the blocking pool and back.
struct ImapSession {
    conn: Option<ImapConnection<TlsStream>>,
}

impl ImapSession {
    async fn run<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        F: FnOnce(&mut ImapConnection<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| MailboxError::Network("session already closed".into()))?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| MailboxError::Network(format!("IMAP task panicked: {e}")))?;
        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn search_unseen(&mut self) -> Result<Vec<MessageId>, MailboxError> {
        self.run(|conn| conn.search_unseen()).await
    }

    async fn fetch_raw(&mut self, id: &str) -> Result<RawMessage, MailboxError> {
        let id = id.to_string();
        self.run(move |conn| conn.fetch(&id)).await
    }

    async fn mark_seen(&mut self, id: &str) -> Result<(), MailboxError> {
        let id = id.to_string();
        self.run(move |conn| conn.mark_seen(&id)).await
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        if self.conn.is_none() {
            return Ok(());
        }
        let result = self.run(|conn| conn.logout()).await;
        // Dropping the connection closes the socket.
        self.conn = None;
        result
    }
}

// ── Protocol ────────────────────────────────────────────────────────

/// Completion state of a tagged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Ok,
    No,
    Bad,
}

/// Everything the server sent in answer to one tagged command.
#[derive(Debug)]
struct Response {
    /// Untagged lines, literals removed.
    lines: Vec<String>,
    /// Literal payloads in the order they arrived.
    literals: Vec<Vec<u8>>,
    completion: Completion,
    /// The tagged status line.
    status: String,
}

/// A blocking IMAP connection over any byte stream.
pub(crate) struct ImapConnection<S: Read + Write> {
    stream: S,
    next_tag: u32,
    timeout: Duration,
    logged_out: bool,
}

impl<S: Read + Write> ImapConnection<S> {
    /// Wrap a freshly connected stream and consume the server greeting.
    pub(crate) fn handshake(stream: S, timeout: Duration) -> Result<Self, MailboxError> {
        let mut conn = Self {
            stream,
            next_tag: 1,
            timeout,
            logged_out: false,
        };
        let greeting = conn.read_line("greeting")?;
        let text = String::from_utf8_lossy(&greeting);
        if !(text.starts_with("* OK") || text.starts_with("* PREAUTH")) {
            conn.logged_out = true;
            return Err(MailboxError::Protocol {
                command: "greeting".into(),
                response: text.trim_end().to_string(),
            });
        }
        Ok(conn)
    }

    pub(crate) fn login(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        let resp = self.command("LOGIN", &cmd)?;
        match resp.completion {
            Completion::Ok => Ok(()),
            Completion::No => Err(MailboxError::Auth {
                reason: resp.status,
            }),
            Completion::Bad => Err(MailboxError::Protocol {
                command: "LOGIN".into(),
                response: resp.status,
            }),
        }
    }

    /// Best-effort RFC 2971 client identification. Servers without ID
    /// support answer BAD, which is ignored.
    pub(crate) fn identify(&mut self) {
        let cmd = format!(
            "ID (\"name\" \"{}\" \"version\" \"{}\")",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
        match self.command("ID", &cmd) {
            Ok(resp) if resp.completion == Completion::Ok => {}
            Ok(resp) => debug!(status = %resp.status, "Server declined IMAP ID"),
            Err(e) => debug!(error = %e, "IMAP ID failed"),
        }
    }

    pub(crate) fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        let resp = self.command("SELECT", &format!("SELECT {}", quote(folder)))?;
        expect_ok("SELECT", resp).map(|_| ())
    }

    pub(crate) fn search_unseen(&mut self) -> Result<Vec<MessageId>, MailboxError> {
        let resp = expect_ok("SEARCH", self.command("SEARCH", "SEARCH UNSEEN")?)?;
        Ok(parse_search(&resp.lines))
    }

    /// Fetch the full message without touching its flags.
    ///
    /// `BODY.PEEK[]` is used instead of `RFC822` because the latter sets
    /// `\Seen` as a side effect.
    pub(crate) fn fetch(&mut self, id: &str) -> Result<RawMessage, MailboxError> {
        check_id(id)?;
        let resp = expect_ok("FETCH", self.command("FETCH", &format!("FETCH {id} BODY.PEEK[]"))?)?;
        let bytes = resp
            .literals
            .into_iter()
            .max_by_key(Vec::len)
            .ok_or_else(|| MailboxError::Protocol {
                command: "FETCH".into(),
                response: format!("no message body returned for {id}"),
            })?;
        Ok(RawMessage {
            id: id.to_string(),
            bytes,
        })
    }

    pub(crate) fn mark_seen(&mut self, id: &str) -> Result<(), MailboxError> {
        check_id(id)?;
        let resp = self.command("STORE", &format!("STORE {id} +FLAGS.SILENT (\\Seen)"))?;
        expect_ok("STORE", resp).map(|_| ())
    }

    pub(crate) fn logout(&mut self) -> Result<(), MailboxError> {
        self.logged_out = true;
        let resp = self.command("LOGOUT", "LOGOUT")?;
        expect_ok("LOGOUT", resp).map(|_| ())
    }

    /// Send one tagged command and collect the response up to its tagged
    /// completion line. `name` is what gets logged; the command text itself
    /// may carry credentials.
    fn command(&mut self, name: &str, cmd: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{:03}", self.next_tag);
        self.next_tag += 1;
        debug!(tag = %tag, command = name, "IMAP command");

        let wire = format!("{tag} {cmd}\r\n");
        self.stream
            .write_all(wire.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|e| MailboxError::from_io(name, self.timeout, e))?;

        let prefix = format!("{tag} ");
        let mut lines = Vec::new();
        let mut literals = Vec::new();
        loop {
            let mut line = self.read_line(name)?;
            // A line ending in {N} is followed by N raw bytes and then the
            // rest of the logical line.
            while let Some(len) = literal_len(&line) {
                literals.push(self.read_literal(name, len)?);
                line.truncate(line.len() - 2);
                line.extend_from_slice(&self.read_line(name)?);
            }

            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            if let Some(rest) = text.strip_prefix(&prefix) {
                let completion = parse_completion(rest).ok_or_else(|| MailboxError::Protocol {
                    command: name.to_string(),
                    response: text.clone(),
                })?;
                return Ok(Response {
                    lines,
                    literals,
                    completion,
                    status: text,
                });
            }
            lines.push(text);
        }
    }

    /// Read a `len`-byte literal. Storage grows with the bytes that actually
    /// arrive, never with the announced size alone.
    fn read_literal(&mut self, op: &str, len: usize) -> Result<Vec<u8>, MailboxError> {
        if len > MAX_LITERAL_BYTES {
            // The stream cannot be resynchronized past an unread literal.
            return Err(MailboxError::Network(format!(
                "{op}: server announced a {len}-byte literal, limit is {MAX_LITERAL_BYTES}"
            )));
        }
        let mut literal = Vec::new();
        (&mut self.stream)
            .take(len as u64)
            .read_to_end(&mut literal)
            .map_err(|e| MailboxError::from_io(op, self.timeout, e))?;
        if literal.len() < len {
            return Err(MailboxError::Network(format!(
                "{op}: connection closed inside a literal"
            )));
        }
        Ok(literal)
    }

    /// Read one CRLF-terminated line, terminator included.
    fn read_line(&mut self, op: &str) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(MailboxError::Network(format!(
                        "{op}: connection closed by server"
                    )));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(MailboxError::from_io(op, self.timeout, e)),
            }
        }
    }
}

impl<S: Read + Write> Drop for ImapConnection<S> {
    fn drop(&mut self) {
        if self.logged_out {
            return;
        }
        // Fire-and-forget; the reply is not awaited.
        let wire = format!("A{:03} LOGOUT\r\n", self.next_tag);
        if let Err(e) = self
            .stream
            .write_all(wire.as_bytes())
            .and_then(|()| self.stream.flush())
        {
            warn!(error = %e, "IMAP logout on drop failed");
        }
    }
}

fn expect_ok(command: &str, resp: Response) -> Result<Response, MailboxError> {
    if resp.completion == Completion::Ok {
        Ok(resp)
    } else {
        Err(MailboxError::Protocol {
            command: command.to_string(),
            response: resp.status,
        })
    }
}

fn parse_completion(rest: &str) -> Option<Completion> {
    let word = rest.split_whitespace().next()?;
    match word.to_ascii_uppercase().as_str() {
        "OK" => Some(Completion::Ok),
        "NO" => Some(Completion::No),
        "BAD" => Some(Completion::Bad),
        _ => None,
    }
}

/// Length of the literal announced at the end of `line`, if any.
fn literal_len(line: &[u8]) -> Option<usize> {
    let body = line.strip_suffix(b"\r\n")?.strip_suffix(b"}")?;
    let open = body.iter().rposition(|&b| b == b'{')?;
    let digits = &body[open + 1..];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Collect ids from `* SEARCH` lines.
fn parse_search(lines: &[String]) -> Vec<MessageId> {
    lines
        .iter()
        .filter_map(|l| {
            let mut words = l.split_whitespace();
            match (words.next(), words.next()) {
                (Some("*"), Some(kw)) if kw.eq_ignore_ascii_case("SEARCH") => Some(words),
                _ => None,
            }
        })
        .flatten()
        .filter(|w| w.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn check_id(id: &str) -> Result<(), MailboxError> {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(MailboxError::Protocol {
            command: "FETCH".into(),
            response: format!("invalid message id {id:?}"),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
