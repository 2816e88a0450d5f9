//! IMAP wire transport and TLS helpers
//!
//! Provides the tagged command writer / response reader used by the
//! shared connection, behind an object-safe trait so tests can inject
//! an in-memory transport through the same factory seam that produces
//! real TCP and TLS connections.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Error, Result};

/// A raw command reply: the tagged status word, the untagged data lines
/// collected for the command, and any counted-literal payloads in
/// arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub status: String,
    pub lines: Vec<String>,
    pub literals: Vec<Vec<u8>>,
}

impl Reply {
    #[must_use]
    pub fn new(status: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            status: status.into(),
            lines,
            literals: Vec::new(),
        }
    }

    /// True exactly when the status word uppercases to `OK`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK")
    }
}

/// One authenticated-capable protocol connection.
///
/// Every method maps to one wire command and returns the raw reply;
/// non-OK statuses are data, not errors. Errors are reserved for
/// transport failures and malformed exchanges.
#[async_trait]
pub trait ImapTransport: Send {
    async fn login(&mut self, username: &str, password: &str) -> Result<Reply>;
    async fn capability(&mut self) -> Result<Reply>;
    async fn list(&mut self) -> Result<Reply>;
    /// SELECT, or EXAMINE when `read_only` is set.
    async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<Reply>;
    async fn noop(&mut self) -> Result<Reply>;
    async fn append(&mut self, mailbox: &str, message: &[u8]) -> Result<Reply>;
    async fn uid_search(&mut self, query: &str) -> Result<Reply>;
    async fn uid_fetch(&mut self, uid_set: &str, items: &str) -> Result<Reply>;
    async fn uid_store(&mut self, uid_set: &str, item: &str, value: &str) -> Result<Reply>;
    async fn close(&mut self) -> Result<Reply>;
    async fn logout(&mut self) -> Result<Reply>;

    /// The most recent untagged datum recorded under `key` (`EXISTS`,
    /// `UIDVALIDITY`, `FLAGS`, ...).
    fn untagged(&self, key: &str) -> Option<String>;

    /// Best-effort teardown of the underlying stream, used to boot a
    /// hung operation out of its wedged state.
    async fn shutdown(&mut self);
}

/// Produces connected transports; the injection point for test mocks.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ImapTransport>>;
}

/// Tagged-protocol client over any byte stream.
pub struct StreamTransport<S> {
    stream: BufStream<S>,
    tag_seq: u32,
    untagged: BTreeMap<String, String>,
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> StreamTransport<S> {
    /// Wrap a connected stream and consume the server greeting.
    pub async fn new(stream: S) -> Result<Self> {
        let mut transport = Self {
            stream: BufStream::new(stream),
            tag_seq: 0,
            untagged: BTreeMap::new(),
        };
        let greeting = transport.read_line().await?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(Error::Protocol(format!("unexpected greeting: {greeting}")));
        }
        Ok(transport)
    }

    fn next_tag(&mut self) -> String {
        self.tag_seq += 1;
        format!("a{:04}", self.tag_seq)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send `command` and collect its response. Untagged lines whose
    /// response name matches `expect` become the reply's data lines;
    /// everything else is recorded in the untagged map.
    async fn command(&mut self, expect: Option<&str>, command: &str) -> Result<Reply> {
        let tag = self.next_tag();
        let verb = command.split_whitespace().next().unwrap_or(command);
        debug!("C: {tag} {verb}");
        self.send_line(&format!("{tag} {command}")).await?;
        self.read_response(&tag, expect).await
    }

    async fn read_response(&mut self, tag: &str, expect: Option<&str>) -> Result<Reply> {
        let mut lines = Vec::new();
        let mut literals = Vec::new();
        loop {
            let line = self.read_line().await?;
            if let Some(rest) = line.strip_prefix("* ") {
                let mut text = rest.to_string();
                // A line ending in {n} announces n raw bytes, then the
                // remainder of the response line.
                while let Some((marker, len)) = literal_marker(&text) {
                    let mut payload = vec![0u8; len];
                    self.stream.read_exact(&mut payload).await?;
                    literals.push(payload);
                    let continuation = self.read_line().await?;
                    text.truncate(marker);
                    text.push_str(&continuation);
                }
                self.dispatch(&text, expect, &mut lines);
            } else if let Some(rest) = line.strip_prefix(&format!("{tag} ")) {
                let (status, text) = split_word(rest);
                debug!("S: {tag} {status}");
                if lines.is_empty() {
                    lines.push(text.to_string());
                }
                return Ok(Reply {
                    status: status.to_string(),
                    lines,
                    literals,
                });
            }
            // Anything else (stray continuations, other tags) is dropped.
        }
    }

    /// Record an untagged line, imaplib-style: numbered responses index
    /// by their name (`* 3 EXISTS`), response codes by their code
    /// (`* OK [UIDVALIDITY 13] ...`), and named data lines by name.
    fn dispatch(&mut self, text: &str, expect: Option<&str>, lines: &mut Vec<String>) {
        let (first, rest) = split_word(text);
        if !first.is_empty() && first.bytes().all(|b| b.is_ascii_digit()) {
            let (name, data) = split_word(rest);
            let name = name.to_ascii_uppercase();
            if expect == Some(name.as_str()) {
                lines.push(format!("{first} {data}"));
            } else {
                self.untagged.insert(name, first.to_string());
            }
            return;
        }
        let name = first.to_ascii_uppercase();
        if matches!(name.as_str(), "OK" | "NO" | "BAD") {
            if let Some(code) = rest.strip_prefix('[').and_then(|c| c.split(']').next()) {
                let (code_name, code_value) = split_word(code);
                self.untagged
                    .insert(code_name.to_ascii_uppercase(), code_value.to_string());
            }
        } else if expect == Some(name.as_str()) {
            lines.push(rest.to_string());
            self.untagged.insert(name, rest.to_string());
        } else {
            self.untagged.insert(name, rest.to_string());
        }
    }
}

fn split_word(text: &str) -> (&str, &str) {
    text.split_once(' ').unwrap_or((text, ""))
}

/// `... {n}` at end of line: returns the marker position and the length.
fn literal_marker(text: &str) -> Option<(usize, usize)> {
    let body = text.strip_suffix('}')?;
    let open = body.rfind('{')?;
    let len = body[open + 1..].parse().ok()?;
    Some((open, len))
}

/// Quote an argument when the grammar requires it. Embedded quotes are
/// not escaped (the reply tokenizer does not model them either).
fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(' ') || arg.contains('"') {
        format!("\"{arg}\"")
    } else {
        arg.to_string()
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ImapTransport for StreamTransport<S> {
    async fn login(&mut self, username: &str, password: &str) -> Result<Reply> {
        let tag = self.next_tag();
        debug!("C: {tag} LOGIN");
        self.send_line(&format!(
            "{tag} LOGIN {} {}",
            quote_arg(username),
            quote_arg(password)
        ))
        .await?;
        self.read_response(&tag, None).await
    }

    async fn capability(&mut self) -> Result<Reply> {
        self.command(Some("CAPABILITY"), "CAPABILITY").await
    }

    async fn list(&mut self) -> Result<Reply> {
        self.command(Some("LIST"), "LIST \"\" \"*\"").await
    }

    async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<Reply> {
        let verb = if read_only { "EXAMINE" } else { "SELECT" };
        self.command(None, &format!("{verb} {}", quote_arg(mailbox)))
            .await
    }

    async fn noop(&mut self) -> Result<Reply> {
        self.command(None, "NOOP").await
    }

    async fn append(&mut self, mailbox: &str, message: &[u8]) -> Result<Reply> {
        let tag = self.next_tag();
        debug!("C: {tag} APPEND");
        self.send_line(&format!(
            "{tag} APPEND {} {{{}}}",
            quote_arg(mailbox),
            message.len()
        ))
        .await?;
        // The literal may only follow the server's continuation line.
        loop {
            let line = self.read_line().await?;
            if line.starts_with('+') {
                break;
            }
            if let Some(rest) = line.strip_prefix(&format!("{tag} ")) {
                // Refused before the literal was sent.
                let (status, text) = split_word(rest);
                return Ok(Reply::new(status, vec![text.to_string()]));
            }
        }
        self.stream.write_all(message).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_response(&tag, None).await
    }

    async fn uid_search(&mut self, query: &str) -> Result<Reply> {
        self.command(Some("SEARCH"), &format!("UID SEARCH {query}"))
            .await
    }

    async fn uid_fetch(&mut self, uid_set: &str, items: &str) -> Result<Reply> {
        self.command(Some("FETCH"), &format!("UID FETCH {uid_set} {items}"))
            .await
    }

    async fn uid_store(&mut self, uid_set: &str, item: &str, value: &str) -> Result<Reply> {
        self.command(Some("FETCH"), &format!("UID STORE {uid_set} {item} {value}"))
            .await
    }

    async fn close(&mut self) -> Result<Reply> {
        self.command(None, "CLOSE").await
    }

    async fn logout(&mut self) -> Result<Reply> {
        self.command(Some("BYE"), "LOGOUT").await
    }

    fn untagged(&self, key: &str) -> Option<String> {
        self.untagged.get(&key.to_ascii_uppercase()).cloned()
    }

    async fn shutdown(&mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}

/// Plain-TCP transport factory.
pub struct PlainFactory;

#[async_trait]
impl TransportFactory for PlainFactory {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ImapTransport>> {
        debug!("Connecting to IMAP server at {host}:{port}");
        let tcp = TcpStream::connect((host, port)).await?;
        Ok(Box::new(StreamTransport::new(tcp).await?))
    }
}

/// TLS-from-start transport factory using the bundled webpki roots.
pub struct TlsFactory;

#[async_trait]
impl TransportFactory for TlsFactory {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn ImapTransport>> {
        debug!("Connecting to IMAP server at {host}:{port} (TLS)");
        let tcp = TcpStream::connect((host, port)).await?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(Box::new(StreamTransport::new(tls_stream).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    /// Pre-load the server side of a duplex pipe with a scripted
    /// response stream (greeting included) and hand back the transport.
    async fn scripted(script: &str) -> (StreamTransport<DuplexStream>, DuplexStream) {
        let (client, mut server) = duplex(64 * 1024);
        server.write_all(script.as_bytes()).await.unwrap();
        let transport = StreamTransport::new(client).await.unwrap();
        (transport, server)
    }

    #[tokio::test]
    async fn tagged_completion_carries_status_and_text() {
        let (mut t, _server) = scripted("* OK ready\r\na0001 OK LOGIN completed\r\n").await;
        let reply = t.login("user", "pass").await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.lines, vec!["LOGIN completed".to_string()]);
    }

    #[tokio::test]
    async fn rejects_garbage_greeting() {
        let (client, mut server) = duplex(4096);
        server.write_all(b"220 smtp.example.com\r\n").await.unwrap();
        assert!(StreamTransport::new(client).await.is_err());
    }

    #[tokio::test]
    async fn collects_expected_untagged_data() {
        let (mut t, _server) =
            scripted("* OK ready\r\n* SEARCH 100 101\r\na0001 OK SEARCH completed\r\n").await;
        let reply = t.uid_search("ALL").await.unwrap();
        assert_eq!(reply.lines, vec!["100 101".to_string()]);
    }

    #[tokio::test]
    async fn select_records_counts_and_response_codes() {
        let script = "* OK ready\r\n\
                      * FLAGS (\\Answered \\Seen)\r\n\
                      * 3 EXISTS\r\n\
                      * 0 RECENT\r\n\
                      * OK [UIDVALIDITY 13] UIDs valid\r\n\
                      * OK [UIDNEXT 4392] Predicted next UID\r\n\
                      a0001 OK [READ-WRITE] SELECT completed\r\n";
        let (mut t, _server) = scripted(script).await;
        let reply = t.select("INBOX", false).await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(t.untagged("EXISTS").as_deref(), Some("3"));
        assert_eq!(t.untagged("RECENT").as_deref(), Some("0"));
        assert_eq!(t.untagged("UIDVALIDITY").as_deref(), Some("13"));
        assert_eq!(t.untagged("UIDNEXT").as_deref(), Some("4392"));
        assert_eq!(
            t.untagged("FLAGS").as_deref(),
            Some("(\\Answered \\Seen)")
        );
    }

    #[tokio::test]
    async fn reads_counted_literals() {
        let script = "* OK ready\r\n\
                      * 1 FETCH (UID 42 BODY[]<0> {5}\r\nhello)\r\n\
                      a0001 OK FETCH completed\r\n";
        let (mut t, _server) = scripted(script).await;
        let reply = t.uid_fetch("42", "(BODY[]<0.5>)").await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.literals, vec![b"hello".to_vec()]);
        assert_eq!(reply.lines, vec!["1 (UID 42 BODY[]<0> )".to_string()]);
    }

    #[tokio::test]
    async fn append_sends_literal_after_continuation() {
        let script = "* OK ready\r\n+ go ahead\r\na0001 OK APPEND completed\r\n";
        let (mut t, mut server) = scripted(script).await;
        let reply = t.append("INBOX", b"From: a@b\r\n\r\nhi").await.unwrap();
        assert!(reply.is_ok());

        let mut sent = vec![0u8; 256];
        let n = server.read(&mut sent).await.unwrap();
        let sent = String::from_utf8_lossy(&sent[..n]).into_owned();
        assert!(sent.starts_with("a0001 APPEND INBOX {15}\r\n"));
        assert!(sent.contains("From: a@b"));
    }

    #[tokio::test]
    async fn append_refusal_skips_the_literal() {
        let script = "* OK ready\r\na0001 NO [TOOBIG] message too large\r\n";
        let (mut t, _server) = scripted(script).await;
        let reply = t.append("INBOX", b"x").await.unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.status, "NO");
    }

    #[tokio::test]
    async fn closed_stream_is_an_io_error() {
        let (client, server) = duplex(4096);
        drop(server);
        assert!(matches!(
            StreamTransport::new(client).await.unwrap_err(),
            Error::Io(_)
        ));
    }
}
