//! In-memory IMAP transport for integration testing
//!
//! Implements the crate's transport trait against a scripted in-process
//! folder model and injects it through the same factory seam that
//! produces real connections:
//!
//! ```ignore
//! let server = MockServerBuilder::new()
//!     .folder("INBOX", 10)
//!     .message(100, raw_rfc2822_bytes)
//!     .build();
//! let factory = Arc::new(MockFactory::new(server));
//! let conn = source.open(Some(factory.as_ref())).await?;
//! ```
//!
//! The server state is shared behind a mutex so tests can inspect
//! mutations (APPEND, STORE) and flip failure modes mid-test. Every
//! wire command is appended to a shared log for asserting on traffic.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use imap_source::{ImapTransport, Reply, Result, TransportFactory};

/// Shared command log recording every wire command a scenario produced.
pub type CommandLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MockFolder {
    pub name: String,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub messages: Vec<MockMessage>,
}

/// Scripted server state shared by every transport the factory hands out.
#[derive(Debug, Clone)]
pub struct MockServer {
    pub folders: Vec<MockFolder>,
    pub capabilities: Vec<String>,
    pub accept_login: bool,
    pub fail_noop: bool,
    pub hang_noop: bool,
}

/// Builder for scripted server state.
///
/// Call `.folder(name, uidvalidity)` to start a folder, then chain
/// `.message(uid, raw)` calls to fill it.
pub struct MockServerBuilder {
    server: MockServer,
}

impl MockServerBuilder {
    pub fn new() -> Self {
        Self {
            server: MockServer {
                folders: Vec::new(),
                capabilities: vec!["IMAP4rev1".to_string()],
                accept_login: true,
                fail_noop: false,
                hang_noop: false,
            },
        }
    }

    pub fn folder(mut self, name: &str, uidvalidity: u32) -> Self {
        self.server.folders.push(MockFolder {
            name: name.to_string(),
            uidvalidity,
            uidnext: 1,
            messages: Vec::new(),
        });
        self
    }

    /// Add a message to the most recently added folder.
    ///
    /// # Panics
    ///
    /// Panics if called before any `.folder()` call.
    pub fn message(mut self, uid: u32, raw: &[u8]) -> Self {
        self.server
            .folders
            .last_mut()
            .expect("call .folder() before .message()")
            .messages
            .push(MockMessage {
                uid,
                flags: Vec::new(),
                raw: raw.to_vec(),
            });
        self
    }

    pub fn capabilities(mut self, capabilities: &[&str]) -> Self {
        self.server.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    pub fn reject_login(mut self) -> Self {
        self.server.accept_login = false;
        self
    }

    pub fn build(mut self) -> Arc<Mutex<MockServer>> {
        for folder in &mut self.server.folders {
            folder.uidnext = folder.messages.iter().map(|m| m.uid).max().map_or(1, |m| m + 1);
        }
        Arc::new(Mutex::new(self.server))
    }
}

/// One scripted connection.
pub struct MockImap {
    server: Arc<Mutex<MockServer>>,
    log: CommandLog,
    selected: Option<String>,
    untagged: BTreeMap<String, String>,
}

impl MockImap {
    fn log(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn ok(lines: Vec<String>) -> Reply {
        Reply::new("OK", lines)
    }

    fn no(message: &str) -> Reply {
        Reply::new("NO", vec![message.to_string()])
    }

    fn current_folder(&self) -> Option<MockFolder> {
        let name = self.selected.as_ref()?;
        self.server
            .lock()
            .unwrap()
            .folders
            .iter()
            .find(|f| &f.name == name)
            .cloned()
    }
}

#[async_trait]
impl ImapTransport for MockImap {
    async fn login(&mut self, username: &str, _password: &str) -> Result<Reply> {
        self.log(format!("LOGIN {username}"));
        if self.server.lock().unwrap().accept_login {
            Ok(Self::ok(vec!["\"Welcome, human\"".to_string()]))
        } else {
            Ok(Reply::new("BAD", vec!["\"Sorry dude\"".to_string()]))
        }
    }

    async fn capability(&mut self) -> Result<Reply> {
        self.log("CAPABILITY".to_string());
        let capabilities = self.server.lock().unwrap().capabilities.join(" ");
        Ok(Self::ok(vec![capabilities]))
    }

    async fn list(&mut self) -> Result<Reply> {
        self.log("LIST".to_string());
        let server = self.server.lock().unwrap();
        Ok(Self::ok(
            server
                .folders
                .iter()
                .map(|f| format!("(\\HasNoChildren) \"/\" \"{}\"", f.name))
                .collect(),
        ))
    }

    async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<Reply> {
        let verb = if read_only { "EXAMINE" } else { "SELECT" };
        self.log(format!("{verb} {mailbox}"));
        let folder = {
            let server = self.server.lock().unwrap();
            server.folders.iter().find(|f| f.name == mailbox).cloned()
        };
        let Some(folder) = folder else {
            return Ok(Self::no("Folder not found"));
        };
        self.untagged.insert(
            "FLAGS".to_string(),
            "(\\Answered \\Flagged \\Deleted \\Seen \\Draft)".to_string(),
        );
        self.untagged
            .insert("EXISTS".to_string(), folder.messages.len().to_string());
        self.untagged.insert("RECENT".to_string(), "0".to_string());
        self.untagged
            .insert("UIDVALIDITY".to_string(), folder.uidvalidity.to_string());
        self.untagged
            .insert("UIDNEXT".to_string(), folder.uidnext.to_string());
        self.selected = Some(mailbox.to_string());
        Ok(Self::ok(vec!["[READ-WRITE] SELECT completed".to_string()]))
    }

    async fn noop(&mut self) -> Result<Reply> {
        self.log("NOOP".to_string());
        let (fail, hang) = {
            let server = self.server.lock().unwrap();
            (server.fail_noop, server.hang_noop)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Ok(Reply::new("BAD", Vec::new()));
        }
        Ok(Self::ok(vec![String::new()]))
    }

    async fn append(&mut self, mailbox: &str, message: &[u8]) -> Result<Reply> {
        self.log(format!("APPEND {mailbox} {}", message.len()));
        let mut server = self.server.lock().unwrap();
        let Some(folder) = server.folders.iter_mut().find(|f| f.name == mailbox) else {
            return Ok(Self::no("Folder not found"));
        };
        let uid = folder.uidnext;
        folder.uidnext += 1;
        folder.messages.push(MockMessage {
            uid,
            flags: Vec::new(),
            raw: message.to_vec(),
        });
        Ok(Self::ok(vec![format!(
            "[APPENDUID {} {uid}] done",
            folder.uidvalidity
        )]))
    }

    async fn uid_search(&mut self, query: &str) -> Result<Reply> {
        self.log(format!("UID SEARCH {query}"));
        let Some(folder) = self.current_folder() else {
            return Ok(Self::no("No folder selected"));
        };
        let uids: Vec<String> = folder.messages.iter().map(|m| m.uid.to_string()).collect();
        Ok(Self::ok(vec![uids.join(" ")]))
    }

    async fn uid_fetch(&mut self, uid_set: &str, items: &str) -> Result<Reply> {
        self.log(format!("UID FETCH {uid_set} {items}"));
        let Some(folder) = self.current_folder() else {
            return Ok(Self::no("No folder selected"));
        };
        let Ok(uid) = uid_set.parse::<u32>() else {
            return Ok(Self::no("Bad UID set"));
        };
        let Some((index, message)) = folder
            .messages
            .iter()
            .enumerate()
            .find(|(_, m)| m.uid == uid)
        else {
            // A real server completes OK with no FETCH data.
            return Ok(Self::ok(Vec::new()));
        };
        let seq = index + 1;

        if let Some(range) = items
            .strip_prefix("(BODY[]<")
            .and_then(|rest| rest.strip_suffix(">)"))
        {
            let Some((offset, length)) = range.split_once('.') else {
                return Ok(Self::no("Bad body range"));
            };
            let offset: usize = offset.parse().unwrap_or(0);
            let length: usize = length.parse().unwrap_or(0);
            let start = offset.min(message.raw.len());
            let end = offset.saturating_add(length).min(message.raw.len());
            let mut reply = Self::ok(vec![format!("{seq} (UID {uid} BODY[]<{offset}> )")]);
            reply.literals.push(message.raw[start..end].to_vec());
            return Ok(reply);
        }

        let flags = message.flags.join(" ");
        Ok(Self::ok(vec![format!(
            "{seq} (UID {uid} RFC822.SIZE {} FLAGS ({flags}) ENVELOPE \
             (\"Mon, 01 Jan 2024 12:00:00 +0000\" \"Test\" NIL NIL NIL NIL NIL NIL NIL NIL))",
            message.raw.len()
        )]))
    }

    async fn uid_store(&mut self, uid_set: &str, item: &str, value: &str) -> Result<Reply> {
        self.log(format!("UID STORE {uid_set} {item} {value}"));
        let Some(name) = self.selected.clone() else {
            return Ok(Self::no("No folder selected"));
        };
        let Ok(uid) = uid_set.parse::<u32>() else {
            return Ok(Self::no("Bad UID set"));
        };
        let mut server = self.server.lock().unwrap();
        let Some(folder) = server.folders.iter_mut().find(|f| f.name == name) else {
            return Ok(Self::no("Folder not found"));
        };
        let Some(message) = folder.messages.iter_mut().find(|m| m.uid == uid) else {
            return Ok(Self::no("No such message"));
        };
        if item.eq_ignore_ascii_case("+FLAGS") {
            for flag in value.split_whitespace() {
                let flag = flag.trim_matches(|c| c == '(' || c == ')').to_string();
                if !message.flags.contains(&flag) {
                    message.flags.push(flag);
                }
            }
        }
        Ok(Self::ok(vec![format!(
            "1 (UID {uid} FLAGS ({}))",
            message.flags.join(" ")
        )]))
    }

    async fn close(&mut self) -> Result<Reply> {
        self.log("CLOSE".to_string());
        self.selected = None;
        Ok(Self::ok(Vec::new()))
    }

    async fn logout(&mut self) -> Result<Reply> {
        self.log("LOGOUT".to_string());
        self.selected = None;
        Ok(Self::ok(vec!["BYE".to_string()]))
    }

    fn untagged(&self, key: &str) -> Option<String> {
        self.untagged.get(&key.to_ascii_uppercase()).cloned()
    }

    async fn shutdown(&mut self) {
        self.log("SHUTDOWN".to_string());
    }
}

/// Factory handing out connections against the shared scripted server.
pub struct MockFactory {
    server: Arc<Mutex<MockServer>>,
    log: CommandLog,
    fail_connect: bool,
}

impl MockFactory {
    pub fn new(server: Arc<Mutex<MockServer>>) -> Self {
        Self {
            server,
            log: Arc::new(Mutex::new(Vec::new())),
            fail_connect: false,
        }
    }

    /// A factory whose connection attempts fail like a dead DNS lookup.
    pub fn unreachable() -> Self {
        Self {
            server: MockServerBuilder::new().build(),
            log: Arc::new(Mutex::new(Vec::new())),
            fail_connect: true,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn ImapTransport>> {
        if self.fail_connect {
            return Err(io::Error::new(io::ErrorKind::NotFound, "Oops").into());
        }
        Ok(Box::new(MockImap {
            server: Arc::clone(&self.server),
            log: Arc::clone(&self.log),
            selected: None,
            untagged: BTreeMap::new(),
        }))
    }
}
