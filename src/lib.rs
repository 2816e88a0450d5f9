#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Shared-connection IMAP mail source
//!
//! Presents remote IMAP folders as local, key-addressable mailboxes over
//! a single authenticated connection. One [`SharedConn`] is multiplexed
//! across every [`ImapMailbox`] view and a background keepalive; folder
//! selection is cached, every command runs under a wall-clock deadline,
//! and message keys stay stable for as long as the folder's UIDVALIDITY
//! does.

mod config;
mod conn;
mod error;
mod event;
mod mailbox;
mod parse;
mod source;
mod timed;
mod transport;

pub use config::{EndpointConfig, TransportMode};
pub use conn::{ConnGuard, IdleCallback, IdleConfig, SelectInfo, SharedConn};
pub use error::{Error, Result};
pub use event::{ConnectionEvent, EventData};
pub use mailbox::{
    ImapMailbox, MBX_ID_LEN, MailMessage, MessageInfo, MessageKey, format_mbx_id,
};
pub use parse::{Token, parse_imap};
pub use source::{
    Capabilities, DEFAULT_TIMEOUT, ImapMailSource, MailboxPolicy, MailboxRegistry,
};
pub use transport::{
    ImapTransport, PlainFactory, Reply, StreamTransport, TlsFactory, TransportFactory,
};
