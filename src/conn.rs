//! Shared IMAP connection
//!
//! Wraps one authenticated transport and multiplexes it across every
//! mailbox view plus the background keepalive. All protocol interaction
//! is serialized behind a single lock; commands exist only on the guard
//! returned by [`SharedConn::acquire`], so issuing one without holding
//! the lock cannot compile. Folder selection is cached so that callers
//! can address any folder without paying for a SELECT on every command.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::timed::run_timed;
use crate::transport::{ImapTransport, Reply};

/// Period between keepalive NOOPs. Doubles as liveness detection: a
/// severed connection surfaces at the next tick rather than the next
/// user action.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Callback invoked with the folder path when an idle notification
/// arrives.
pub type IdleCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Idle-notification parameters, wired only when the server advertises
/// the capability.
#[derive(Clone)]
pub struct IdleConfig {
    pub mailbox: String,
    pub callback: IdleCallback,
}

/// Folder metadata captured from the untagged data of a successful
/// selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectInfo {
    pub flags: Vec<String>,
    pub exists: u32,
    pub recent: u32,
    pub uidvalidity: u32,
    pub uidnext: Option<u32>,
}

struct Selected {
    mailbox: String,
    read_only: bool,
    reply: Reply,
    info: SelectInfo,
}

struct ConnState {
    transport: Box<dyn ImapTransport>,
    selected: Option<Selected>,
}

struct ConnInner {
    state: Mutex<ConnState>,
    alive: AtomicBool,
    cancel: CancellationToken,
    idle: Option<IdleConfig>,
    idling: AtomicBool,
    timeout: Duration,
}

/// Handle to one shared, authenticated connection. Cheap to clone; all
/// clones address the same transport and lock.
#[derive(Clone)]
pub struct SharedConn {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for SharedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConn").finish_non_exhaustive()
    }
}

impl SharedConn {
    /// Wrap an authenticated transport and start the keepalive task.
    #[must_use]
    pub fn new(
        transport: Box<dyn ImapTransport>,
        timeout: Duration,
        idle: Option<IdleConfig>,
    ) -> Self {
        let conn = Self {
            inner: Arc::new(ConnInner {
                state: Mutex::new(ConnState {
                    transport,
                    selected: None,
                }),
                alive: AtomicBool::new(true),
                cancel: CancellationToken::new(),
                idle,
                idling: AtomicBool::new(false),
                timeout,
            }),
        };
        conn.spawn_keepalive();
        conn.start_idling();
        conn
    }

    /// Exclusive access to the connection for the duration of the guard.
    /// Pre-empts the idle subscription before taking the lock.
    pub async fn acquire(&self) -> Result<ConnGuard<'_>> {
        if !self.is_alive() {
            return Err(Error::Dead);
        }
        self.stop_idling();
        let state = self.inner.state.lock().await;
        if !self.is_alive() {
            return Err(Error::Dead);
        }
        Ok(ConnGuard { conn: self, state })
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Mark the connection dead; subsequent acquisitions fail immediately.
    pub fn quit(&self) {
        self.mark_dead();
    }

    fn mark_dead(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();
    }

    fn spawn_keepalive(&self) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let Some(strong) = inner.upgrade() else { return };
                let cancel = strong.cancel.clone();
                drop(strong);
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = sleep(KEEPALIVE_INTERVAL) => {}
                }
                let Some(strong) = inner.upgrade() else { return };
                let conn = Self { inner: strong };
                let rv = match conn.acquire().await {
                    Ok(mut imap) => imap.noop(None).await,
                    Err(err) => Err(err),
                };
                match rv {
                    Ok(reply) if reply.is_ok() => {}
                    Ok(reply) => {
                        warn!("keepalive NOOP returned {}", reply.status);
                        conn.mark_dead();
                        return;
                    }
                    Err(err) => {
                        warn!("keepalive failed: {err}");
                        conn.mark_dead();
                        return;
                    }
                }
            }
        });
    }

    // Idle seams. Acquisition must pre-empt the subscription before any
    // command goes out; release resumes it. Subscription management
    // itself is an extension point.

    fn stop_idling(&self) {
        if self.inner.idling.swap(false, Ordering::SeqCst) {
            debug!("idle subscription paused");
        }
    }

    fn start_idling(&self) {
        let Some(idle) = &self.inner.idle else { return };
        if self.is_alive() && !self.inner.idling.swap(true, Ordering::SeqCst) {
            debug!("idle subscription resumed on {}", idle.mailbox);
        }
    }
}

/// Exclusive use of the shared connection for one scope.
///
/// Every protocol command runs under the per-command deadline; a timeout
/// shuts the transport down and marks the connection dead before the
/// error is returned. Transport-level protocol failures are wrapped into
/// [`Error::Protocol`] naming the command. Non-OK statuses are returned
/// as data for the caller to interpret.
pub struct ConnGuard<'a> {
    conn: &'a SharedConn,
    state: MutexGuard<'a, ConnState>,
}

impl std::fmt::Debug for ConnGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnGuard").finish_non_exhaustive()
    }
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        self.conn.start_idling();
    }
}

impl ConnGuard<'_> {
    fn limit(&self) -> Duration {
        self.conn.inner.timeout
    }

    /// Shared post-command pipeline: timeout teardown, protocol-error
    /// wrapping, reply logging.
    async fn finish(&mut self, command: &str, rv: Result<Reply>) -> Result<Reply> {
        match rv {
            Ok(reply) => {
                debug!("{command} => {} ({} lines)", reply.status, reply.lines.len());
                Ok(reply)
            }
            Err(Error::TimedOut) => {
                // A hung transport would wedge every later command.
                self.state.transport.shutdown().await;
                self.conn.mark_dead();
                Err(Error::TimedOut)
            }
            Err(Error::Protocol(msg)) => Err(Error::Protocol(format!("{command} failed: {msg}"))),
            Err(err) => Err(err),
        }
    }

    /// Cached-select step for commands carrying a mailbox option. A
    /// not-OK selection short-circuits with the select's reply.
    async fn reselect(&mut self, mailbox: Option<&str>) -> Result<Option<Reply>> {
        if let Some(mailbox) = mailbox {
            let reply = self.select(mailbox, false).await?;
            if !reply.is_ok() {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    /// SELECT (or EXAMINE) with caching: an exact `(mailbox, read_only)`
    /// match returns the previous reply without contacting the server.
    pub async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<Reply> {
        if let Some(selected) = &self.state.selected
            && selected.mailbox == mailbox
            && selected.read_only == read_only
        {
            return Ok(selected.reply.clone());
        }
        // The server-side selection is about to change; the cache is
        // stale whether or not the new selection succeeds.
        self.state.selected = None;
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.select(mailbox, read_only)).await;
        let reply = self.finish("SELECT", rv).await?;
        if reply.is_ok() {
            let info = self.read_select_info()?;
            debug!("select({mailbox}, {read_only}) = {} {info:?}", reply.status);
            self.state.selected = Some(Selected {
                mailbox: mailbox.to_string(),
                read_only,
                reply: reply.clone(),
                info,
            });
        }
        Ok(reply)
    }

    fn read_select_info(&self) -> Result<SelectInfo> {
        let transport = &self.state.transport;
        let uidvalidity = transport
            .untagged("UIDVALIDITY")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| Error::Protocol("SELECT reply carried no usable UIDVALIDITY".into()))?;
        let exists = transport
            .untagged("EXISTS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let recent = transport
            .untagged("RECENT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let uidnext = transport
            .untagged("UIDNEXT")
            .and_then(|v| v.trim().parse().ok());
        let flags = transport
            .untagged("FLAGS")
            .map(|v| {
                v.trim()
                    .trim_start_matches('(')
                    .trim_end_matches(')')
                    .split_whitespace()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(SelectInfo {
            flags,
            exists,
            recent,
            uidvalidity,
            uidnext,
        })
    }

    /// CLOSE the selected folder and clear the selection cache.
    pub async fn close(&mut self) -> Result<Reply> {
        self.state.selected = None;
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.close()).await;
        self.finish("CLOSE", rv).await
    }

    pub async fn capability(&mut self) -> Result<Reply> {
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.capability()).await;
        self.finish("CAPABILITY", rv).await
    }

    pub async fn noop(&mut self, mailbox: Option<&str>) -> Result<Reply> {
        if let Some(aborted) = self.reselect(mailbox).await? {
            return Ok(aborted);
        }
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.noop()).await;
        self.finish("NOOP", rv).await
    }

    pub async fn list(&mut self) -> Result<Reply> {
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.list()).await;
        self.finish("LIST", rv).await
    }

    /// APPEND addresses its mailbox directly; no selection is required.
    pub async fn append(&mut self, mailbox: &str, message: &[u8]) -> Result<Reply> {
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.append(mailbox, message)).await;
        self.finish("APPEND", rv).await
    }

    pub async fn uid_search(&mut self, query: &str, mailbox: Option<&str>) -> Result<Reply> {
        if let Some(aborted) = self.reselect(mailbox).await? {
            return Ok(aborted);
        }
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.uid_search(query)).await;
        self.finish("UID SEARCH", rv).await
    }

    pub async fn uid_fetch(
        &mut self,
        uid_set: &str,
        items: &str,
        mailbox: Option<&str>,
    ) -> Result<Reply> {
        if let Some(aborted) = self.reselect(mailbox).await? {
            return Ok(aborted);
        }
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.uid_fetch(uid_set, items)).await;
        self.finish("UID FETCH", rv).await
    }

    pub async fn uid_store(
        &mut self,
        uid_set: &str,
        item: &str,
        value: &str,
        mailbox: Option<&str>,
    ) -> Result<Reply> {
        if let Some(aborted) = self.reselect(mailbox).await? {
            return Ok(aborted);
        }
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.uid_store(uid_set, item, value)).await;
        self.finish("UID STORE", rv).await
    }

    pub async fn logout(&mut self) -> Result<Reply> {
        let limit = self.limit();
        let rv = run_timed(limit, self.state.transport.logout()).await;
        self.finish("LOGOUT", rv).await
    }

    /// Metadata of the current selection, if any.
    #[must_use]
    pub fn select_info(&self) -> Option<&SelectInfo> {
        self.state.selected.as_ref().map(|s| &s.info)
    }

    /// Value from the current selection's info map, or `default` when no
    /// folder is selected or the key is unknown.
    #[must_use]
    pub fn mailbox_info(&self, key: &str, default: &str) -> String {
        let Some(info) = self.select_info() else {
            return default.to_string();
        };
        match key.to_ascii_uppercase().as_str() {
            "FLAGS" => info.flags.join(" "),
            "EXISTS" => info.exists.to_string(),
            "RECENT" => info.recent.to_string(),
            "UIDVALIDITY" => info.uidvalidity.to_string(),
            "UIDNEXT" => info
                .uidnext
                .map_or_else(|| default.to_string(), |v| v.to_string()),
            _ => default.to_string(),
        }
    }

    #[must_use]
    pub fn uidvalidity(&self) -> Option<u32> {
        self.select_info().map(|info| info.uidvalidity)
    }

    #[must_use]
    pub fn uidnext(&self) -> Option<u32> {
        self.select_info().and_then(|info| info.uidnext)
    }

    #[must_use]
    pub fn exists(&self) -> u32 {
        self.select_info().map_or(0, |info| info.exists)
    }
}
