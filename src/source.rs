//! IMAP mail source
//!
//! Owns the single shared connection for a configured remote endpoint:
//! opens and validates it, recycles it on failure, negotiates
//! capabilities, enumerates remote folders, and hands out mailbox
//! facades.

use std::collections::{BTreeSet, btree_set};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{EndpointConfig, TransportMode};
use crate::conn::{IdleConfig, SharedConn};
use crate::error::{Error, Result};
use crate::event::ConnectionEvent;
use crate::mailbox::{ImapMailbox, format_mbx_id};
use crate::parse::{Token, parse_imap};
use crate::timed::run_timed;
use crate::transport::{ImapTransport, PlainFactory, Reply, TlsFactory, TransportFactory};

/// Default per-command wall-clock limit.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Uppercased capability tokens advertised by the server after login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    fn from_tokens(data: &[Token]) -> Self {
        let mut set = BTreeSet::new();
        for token in data {
            if let Some(atom) = token.as_atom() {
                for word in atom.split_whitespace() {
                    set.insert(word.to_ascii_uppercase());
                }
            }
        }
        Self(set)
    }

    #[must_use]
    pub fn has(&self, token: &str) -> bool {
        self.0.contains(&token.to_ascii_uppercase())
    }

    /// Whether the server supports long-poll idle notifications.
    #[must_use]
    pub fn idle(&self) -> bool {
        self.has("IDLE")
    }

    pub fn iter(&self) -> btree_set::Iter<'_, String> {
        self.0.iter()
    }
}

/// Adoption policy the host assigned to a newly discovered folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxPolicy {
    Unknown,
    Ignore,
    Watch,
    Read,
}

/// Host-side mailbox bookkeeping consumed by folder discovery.
pub trait MailboxRegistry {
    /// Record a newly-seen remote folder in the host's mailbox table and
    /// return the adoption policy it was given.
    fn adopt(&mut self, path: &str, flags: &[String]) -> MailboxPolicy;
}

/// A mail source backed by one shared IMAP connection.
pub struct ImapMailSource {
    config: EndpointConfig,
    timeout: Duration,
    chunk_size: Option<usize>,
    event: Arc<ConnectionEvent>,
    capabilities: std::sync::Mutex<Capabilities>,
    conn: Mutex<Option<SharedConn>>,
}

impl ImapMailSource {
    #[must_use]
    pub fn new(config: EndpointConfig) -> Self {
        Self::with_event(config, Arc::new(ConnectionEvent::new()))
    }

    /// Construct against an event record the host already owns.
    #[must_use]
    pub fn with_event(config: EndpointConfig, event: Arc<ConnectionEvent>) -> Self {
        Self {
            config,
            timeout: DEFAULT_TIMEOUT,
            chunk_size: None,
            event,
            capabilities: std::sync::Mutex::new(Capabilities::default()),
            conn: Mutex::new(None),
        }
    }

    /// Override the body-fetch chunk size (bytes).
    #[must_use]
    pub const fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &EndpointConfig {
        &self.config
    }

    #[must_use]
    pub fn event(&self) -> Arc<ConnectionEvent> {
        Arc::clone(&self.event)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Bytes fetched per body chunk. The default assumes the connection
    /// sustains at least one chunk per timeout period.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or_else(|| {
            usize::try_from(self.timeout.as_secs().saturating_mul(1024)).unwrap_or(usize::MAX)
        })
    }

    /// Run `op` under the per-command deadline.
    pub async fn timed<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        run_timed(self.timeout, op).await
    }

    /// Run `op` under the deadline and tokenize the reply.
    pub async fn timed_imap<F>(&self, op: F) -> Result<(bool, Vec<Token>)>
    where
        F: Future<Output = Result<Reply>>,
    {
        let reply = run_timed(self.timeout, op).await?;
        Ok(parse_imap(&reply))
    }

    /// Return the live shared connection, opening or recycling as needed.
    ///
    /// An existing connection is liveness-checked with a NOOP first; a
    /// connection-class failure quits it and a fresh one is built. Any
    /// open failure is classified onto the event's `conn_error` slot
    /// before it is returned.
    pub async fn open(&self, factory: Option<&dyn TransportFactory>) -> Result<SharedConn> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            match Self::check_liveness(conn).await {
                Ok(()) => return Ok(conn.clone()),
                Err(err) if err.is_conn_error() => {
                    debug!("existing connection failed liveness check: {err}");
                    conn.quit();
                    *slot = None;
                }
                Err(err) => return Err(err),
            }
        }
        let conn = self.connect(factory).await?;
        *slot = Some(conn.clone());
        info!("Connected to IMAP server {}", self.config.host);
        Ok(conn)
    }

    async fn check_liveness(conn: &SharedConn) -> Result<()> {
        let mut imap = conn.acquire().await?;
        let reply = imap.noop(None).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "liveness NOOP returned {}",
                reply.status
            )))
        }
    }

    async fn connect(&self, factory: Option<&dyn TransportFactory>) -> Result<SharedConn> {
        let default_factory: &dyn TransportFactory = match self.config.protocol {
            TransportMode::Plain => &PlainFactory,
            TransportMode::Tls => &TlsFactory,
        };
        let factory = factory.unwrap_or(default_factory);

        self.event.clear_conn_error();

        let mut transport = match self
            .timed(factory.connect(&self.config.host, self.config.port))
            .await
        {
            Ok(transport) => transport,
            Err(err) => {
                self.event.set_conn_error(conn_error_message(&err));
                return Err(err);
            }
        };

        match self.authenticate(transport.as_mut()).await {
            Ok(capabilities) => {
                let idle = capabilities.idle().then(|| self.idle_config());
                *self
                    .capabilities
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = capabilities;
                Ok(SharedConn::new(transport, self.timeout, idle))
            }
            Err(err) => {
                self.event.set_conn_error(conn_error_message(&err));
                // Shut the socket down directly, in the hopes this will
                // boot any timed-out operation out of a hung state.
                transport.shutdown().await;
                Err(err)
            }
        }
    }

    async fn authenticate(&self, transport: &mut dyn ImapTransport) -> Result<Capabilities> {
        let (ok, _data) = self
            .timed_imap(transport.login(&self.config.username, &self.config.password))
            .await?;
        if !ok {
            return Err(Error::Auth("Bad username or password".into()));
        }

        let capabilities = match self.timed_imap(transport.capability()).await {
            Ok((true, data)) => Capabilities::from_tokens(&data),
            Ok((false, _)) | Err(_) => Capabilities::default(),
        };
        Ok(capabilities)
    }

    fn idle_config(&self) -> IdleConfig {
        IdleConfig {
            mailbox: "INBOX".to_string(),
            callback: Arc::new(|mailbox| debug!("idle notification for {mailbox}")),
        }
    }

    /// Enumerate remote folders and hand the unadopted ones to the
    /// host's registry. Candidates left with an unknown policy set the
    /// event's `have_unknown` flag.
    pub async fn discover_mailboxes(&self, registry: &mut dyn MailboxRegistry) -> Result<()> {
        let existing: BTreeSet<&String> = self.config.mailboxes.values().collect();
        let conn = self.open(None).await?;
        let mut discovered = Vec::new();
        {
            let mut imap = conn.acquire().await?;
            match imap.list().await {
                Ok(reply) => {
                    let (ok, data) = parse_imap(&reply);
                    if ok {
                        for triple in data.chunks(3) {
                            let [flags, _separator, path] = triple else {
                                break;
                            };
                            let Some(path) = path.as_atom() else { continue };
                            let flags: Vec<String> = flags
                                .as_list()
                                .map(|items| {
                                    items
                                        .iter()
                                        .filter_map(Token::as_atom)
                                        .map(str::to_string)
                                        .collect()
                                })
                                .unwrap_or_default();
                            let path = self.config.src_path(path);
                            if !existing.contains(&path) {
                                discovered.push((path, flags));
                            }
                        }
                    }
                }
                Err(err) if err.is_conn_error() => {}
                Err(err) => return Err(err),
            }
        }
        for (path, flags) in discovered {
            debug!("discovered remote folder {path}");
            if registry.adopt(&path, &flags) == MailboxPolicy::Unknown {
                self.event.set_have_unknown();
            }
        }
        Ok(())
    }

    /// Facade for an adopted mailbox, or `None` when `mbx_id` is not in
    /// this source's mailbox map.
    #[must_use]
    pub fn open_mailbox(self: &Arc<Self>, mbx_id: &str, formatted_path: &str) -> Option<ImapMailbox> {
        if !self.config.mailboxes.contains_key(&format_mbx_id(mbx_id)) {
            return None;
        }
        let (_, path) = formatted_path.split_once('/')?;
        Some(ImapMailbox::new(Arc::clone(self), path))
    }

    /// Whether the folder's generation numbers moved since the last
    /// recorded rescan.
    pub async fn has_mailbox_changed(&self, path: &str) -> Result<bool> {
        let (uidvalidity, uidnext) = self.generation(path).await?;
        let snapshot = self.event.snapshot();
        Ok(snapshot.uidvalidity.get(path) != Some(&uidvalidity)
            || snapshot.uidnext.get(path) != uidnext.as_ref())
    }

    /// Record the folder's current generation numbers as scanned.
    pub async fn mark_mailbox_rescanned(&self, path: &str) -> Result<()> {
        let (uidvalidity, uidnext) = self.generation(path).await?;
        self.event.update(|data| {
            data.uidvalidity.insert(path.to_string(), uidvalidity);
            match uidnext {
                Some(next) => {
                    data.uidnext.insert(path.to_string(), next);
                }
                None => {
                    data.uidnext.remove(path);
                }
            }
        });
        Ok(())
    }

    async fn generation(&self, path: &str) -> Result<(u32, Option<u32>)> {
        let conn = self.open(None).await?;
        let mut imap = conn.acquire().await?;
        let reply = imap.noop(Some(path)).await?;
        if !reply.is_ok() {
            return Err(Error::Protocol(format!(
                "cannot select {path}: {}",
                reply.status
            )));
        }
        let info = imap
            .select_info()
            .ok_or_else(|| Error::Protocol(format!("no selection info for {path}")))?;
        Ok((info.uidvalidity, info.uidnext))
    }

    /// Shut the source down: best-effort LOGOUT, quit the shared
    /// connection, clear the running flag.
    pub async fn quit(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Ok(mut imap) = conn.acquire().await {
                if let Err(err) = imap.logout().await {
                    debug!("LOGOUT on quit failed: {err}");
                }
            }
            conn.quit();
        }
        self.event.set_running(false);
    }
}

/// The `conn_error` classification recorded on the event during open.
fn conn_error_message(err: &Error) -> &'static str {
    match err {
        Error::TimedOut => "Connection timed out",
        Error::Auth(_) => "Bad username or password",
        Error::Protocol(_) => "An IMAP protocol error occurred",
        _ => "A network error occurred",
    }
}
