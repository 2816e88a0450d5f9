//! Keyed mailbox view of one remote folder
//!
//! `ImapMailbox` presents a remote folder as an enumerable, indexable
//! collection of messages. Instances are cheap, hold no connection
//! state, and survive reconnects: every operation acquires the shared
//! connection through the owning mail source.
//!
//! Message keys are `"<uidvalidity>.<uid>"` with both halves base-36
//! encoded. A key stays valid only while the folder's UIDVALIDITY is
//! unchanged; when it moves, every previously emitted key is stale and
//! lookups fail out-of-sync.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::parse::{Token, parse_imap};
use crate::source::ImapMailSource;
use crate::transport::TransportFactory;

/// Width of the zero-padded mailbox id prefixed onto message pointers.
pub const MBX_ID_LEN: usize = 4;

/// Zero-pad a mailbox id to the fixed pointer-prefix width.
#[must_use]
pub fn format_mbx_id(mbx_id: &str) -> String {
    format!("{mbx_id:0>width$}", width = MBX_ID_LEN)
}

fn to_base36(mut value: u32) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        if let Some(digit) = char::from_digit(value % 36, 36) {
            digits.push(digit);
        }
        value /= 36;
    }
    digits.iter().rev().collect()
}

/// A validity-qualified message address within one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageKey {
    pub uidvalidity: u32,
    pub uid: u32,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            to_base36(self.uidvalidity),
            to_base36(self.uid)
        )
    }
}

impl FromStr for MessageKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::NotFound(format!("malformed message key: {s}"));
        let (validity, uid) = s.split_once('.').ok_or_else(&malformed)?;
        Ok(Self {
            uidvalidity: u32::from_str_radix(validity, 36).map_err(|_| malformed())?,
            uid: u32::from_str_radix(uid, 36).map_err(|_| malformed())?,
        })
    }
}

/// Attributes of one fetched message.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub uidvalidity: u32,
    pub uid: u32,
    attrs: BTreeMap<String, Token>,
}

impl MessageInfo {
    /// Build from tokenized UID FETCH data: `seq (NAME value NAME value ...)`.
    fn from_tokens(key: MessageKey, data: &[Token]) -> Self {
        let mut attrs = BTreeMap::new();
        if let Some(Token::List(pairs)) = data.get(1) {
            let mut pairs = pairs.iter();
            while let (Some(name), Some(value)) = (pairs.next(), pairs.next()) {
                if let Some(name) = name.as_atom() {
                    attrs.insert(name.to_ascii_uppercase(), value.clone());
                }
            }
        }
        Self {
            uidvalidity: key.uidvalidity,
            uid: key.uid,
            attrs,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Token> {
        self.attrs.get(&name.to_ascii_uppercase())
    }

    /// Message size in bytes, per RFC822.SIZE.
    pub fn size(&self) -> Result<usize> {
        self.get("RFC822.SIZE")
            .and_then(Token::as_atom)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol("fetch reply carried no RFC822.SIZE".into()))
    }

    #[must_use]
    pub fn flags(&self) -> Vec<String> {
        self.get("FLAGS")
            .and_then(Token::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Token::as_atom)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn envelope(&self) -> Option<&[Token]> {
        self.get("ENVELOPE").and_then(Token::as_list)
    }
}

/// A fetched message: its attribute map plus the raw RFC 2822 payload.
#[derive(Debug, Clone)]
pub struct MailMessage {
    info: MessageInfo,
    raw: Vec<u8>,
}

impl MailMessage {
    #[must_use]
    pub const fn info(&self) -> &MessageInfo {
        &self.info
    }

    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }

    /// Headers of the top-level entity, in order.
    pub fn headers(&self) -> Result<Vec<(String, String)>> {
        let parsed = mailparse::parse_mail(&self.raw).map_err(|e| Error::Parse(e.to_string()))?;
        Ok(parsed
            .headers
            .iter()
            .map(|h| (h.get_key(), h.get_value()))
            .collect())
    }

    pub fn subject(&self) -> Result<Option<String>> {
        use mailparse::MailHeaderMap;
        let parsed = mailparse::parse_mail(&self.raw).map_err(|e| Error::Parse(e.to_string()))?;
        Ok(parsed.headers.get_first_value("Subject"))
    }
}

/// One remote folder as a keyed collection.
#[derive(Clone)]
pub struct ImapMailbox {
    source: Arc<ImapMailSource>,
    path: String,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl ImapMailbox {
    #[must_use]
    pub fn new(source: Arc<ImapMailSource>, path: impl Into<String>) -> Self {
        Self {
            source,
            path: path.into(),
            factory: None,
        }
    }

    /// Route connection opens through an explicit factory (test seam).
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn open_imap(&self) -> Result<crate::conn::SharedConn> {
        self.source.open(self.factory.as_deref()).await
    }

    fn ensure(ok: bool, message: &str) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(Error::Protocol(message.to_string()))
        }
    }

    /// True when a NOOP against the folder succeeds.
    pub async fn is_live(&self) -> bool {
        let Ok(conn) = self.open_imap().await else {
            return false;
        };
        let Ok(mut imap) = conn.acquire().await else {
            return false;
        };
        matches!(imap.noop(Some(&self.path)).await, Ok(reply) if reply.is_ok())
    }

    /// Append a raw message to the folder.
    pub async fn add(&self, message: &[u8]) -> Result<()> {
        let conn = self.open_imap().await?;
        let mut imap = conn.acquire().await?;
        let reply = imap.append(&self.path, message).await?;
        Self::ensure(reply.is_ok(), "Failed to add message")
    }

    /// Set the deletion flag on the addressed message. Expunge is left
    /// to the server's lifecycle.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let key: MessageKey = key.parse()?;
        let conn = self.open_imap().await?;
        let mut imap = conn.acquire().await?;
        let reply = imap
            .uid_store(
                &key.uid.to_string(),
                "+FLAGS",
                "\\Deleted",
                Some(&self.path),
            )
            .await?;
        Self::ensure(reply.is_ok(), "Failed to remove message")
    }

    /// All message keys in the folder, ascending by raw UID.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let conn = self.open_imap().await?;
        let mut imap = conn.acquire().await?;
        let reply = imap.uid_search("ALL", Some(&self.path)).await?;
        let (ok, data) = parse_imap(&reply);
        Self::ensure(ok, "Failed to list mailbox contents")?;
        let uidvalidity = imap.uidvalidity().unwrap_or(0);
        let mut uids: Vec<u32> = data
            .iter()
            .filter_map(Token::as_atom)
            .filter_map(|atom| atom.parse().ok())
            .collect();
        uids.sort_unstable();
        Ok(uids
            .into_iter()
            .map(|uid| MessageKey { uidvalidity, uid }.to_string())
            .collect())
    }

    /// Fetch the message's metadata and check the key against the
    /// folder's current generation.
    pub async fn get_info(&self, key: &str) -> Result<MessageInfo> {
        let key: MessageKey = key.parse()?;
        let conn = self.open_imap().await?;
        let mut imap = conn.acquire().await?;
        let reply = imap
            .uid_fetch(
                &key.uid.to_string(),
                "(RFC822.SIZE FLAGS ENVELOPE)",
                Some(&self.path),
            )
            .await?;
        let (ok, data) = parse_imap(&reply);
        if !ok || data.is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }
        let current = imap.uidvalidity().unwrap_or(0);
        if current != key.uidvalidity {
            return Err(Error::OutOfSync(format!(
                "{key} was emitted under UIDVALIDITY {}, server now reports {current}",
                key.uidvalidity
            )));
        }
        Ok(MessageInfo::from_tokens(key, &data))
    }

    /// Fetch the message body in sequential byte ranges.
    ///
    /// Chunks use the partial-body syntax `BODY[]<offset.length>`; the
    /// terminal read past the end may come back empty and is harmless.
    pub async fn get(&self, key: &str) -> Result<(MessageInfo, Vec<u8>)> {
        let info = self.get_info(key).await?;
        let size = info.size()?;
        let chunk_size = self.source.chunk_size().max(1);
        let conn = self.open_imap().await?;
        let mut imap = conn.acquire().await?;
        let mut body = Vec::with_capacity(size);
        for chunk in 0..=(size / chunk_size) {
            let items = format!("(BODY[]<{}.{chunk_size}>)", chunk * chunk_size);
            // Raw reply here: the payload must not round-trip the tokenizer.
            let reply = imap
                .uid_fetch(&info.uid.to_string(), &items, Some(&self.path))
                .await?;
            if !reply.is_ok() {
                return Err(Error::Protocol(format!("Fetching chunk {chunk} failed")));
            }
            if let Some(payload) = reply.literals.first() {
                body.extend_from_slice(payload);
            }
        }
        Ok((info, body))
    }

    pub async fn get_message(&self, key: &str) -> Result<MailMessage> {
        let (info, raw) = self.get(key).await?;
        Ok(MailMessage { info, raw })
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.get(key).await?.1)
    }

    /// Read-only byte stream over the message body.
    pub async fn get_file(&self, key: &str) -> Result<Cursor<Vec<u8>>> {
        Ok(Cursor::new(self.get(key).await?.1))
    }

    pub async fn get_msg_size(&self, key: &str) -> Result<usize> {
        self.get_info(key).await?.size()
    }

    /// `<fixed-width mbx_id><percent-encoded key>`.
    #[must_use]
    pub fn get_msg_ptr(&self, mbx_id: &str, key: &str) -> String {
        format!("{}{}", format_mbx_id(mbx_id), urlencoding::encode(key))
    }

    /// Inverse of [`Self::get_msg_ptr`]: strip the fixed-width prefix,
    /// decode, and fetch.
    pub async fn get_file_by_ptr(&self, msg_ptr: &str) -> Result<Cursor<Vec<u8>>> {
        let malformed = || Error::NotFound(format!("malformed message pointer: {msg_ptr}"));
        let encoded = msg_ptr.get(MBX_ID_LEN..).ok_or_else(&malformed)?;
        let key = urlencoding::decode(encoded).map_err(|_| malformed())?;
        self.get_file(&key).await
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get_info(key).await.is_ok()
    }

    /// Message count from the folder's EXISTS value.
    pub async fn len(&self) -> Result<u32> {
        let conn = self.open_imap().await?;
        let mut imap = conn.acquire().await?;
        imap.noop(Some(&self.path)).await?;
        Ok(imap.exists())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    // Mailbox-contract no-ops: locking and durability are provided
    // entirely by the shared connection, and these views are never
    // persisted.

    pub fn update_toc(&self) {}

    pub fn flush(&self) {}

    pub fn close(&self) {}

    pub fn lock(&self) {}

    pub fn unlock(&self) {}

    pub fn save(&self) {}
}
