//! Connection status record surfaced to external observers

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutable data carried by a [`ConnectionEvent`].
///
/// `uidvalidity` and `uidnext` track the last-scanned generation numbers
/// per formatted folder path; `conn_error` holds the most recent open
/// failure, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventData {
    pub conn_error: Option<String>,
    pub uidvalidity: BTreeMap<String, u32>,
    pub uidnext: BTreeMap<String, u32>,
    pub have_unknown: bool,
}

/// Status record for one mail source, shared with the host application.
#[derive(Debug)]
pub struct ConnectionEvent {
    running: AtomicBool,
    data: Mutex<EventData>,
}

impl ConnectionEvent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            data: Mutex::new(EventData::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn set_conn_error(&self, message: &str) {
        self.lock().conn_error = Some(message.to_string());
    }

    pub fn clear_conn_error(&self) {
        self.lock().conn_error = None;
    }

    #[must_use]
    pub fn conn_error(&self) -> Option<String> {
        self.lock().conn_error.clone()
    }

    pub fn set_have_unknown(&self) {
        self.lock().have_unknown = true;
    }

    /// Mutate the data record under its lock.
    pub fn update(&self, f: impl FnOnce(&mut EventData)) {
        f(&mut self.lock());
    }

    #[must_use]
    pub fn snapshot(&self) -> EventData {
        self.lock().clone()
    }

    /// Serialized form for the host's event log.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "running": self.is_running(),
            "data": self.snapshot(),
        })
    }
}

impl Default for ConnectionEvent {
    fn default() -> Self {
        Self::new()
    }
}
