//! Remote endpoint configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

/// Transport mode for the initial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Plain TCP.
    Plain,
    /// TLS from the first byte.
    Tls,
}

impl FromStr for TransportMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(Self::Plain),
            "tls" => Ok(Self::Tls),
            other => Err(Error::Config(format!("unknown protocol: {other}"))),
        }
    }
}

/// Immutable configuration for one remote mail source.
///
/// `mailboxes` maps locally-assigned mailbox ids to the formatted paths
/// (`src:<id>/<folder>`) of remote folders already adopted into the host's
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: TransportMode,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub mailboxes: BTreeMap<String, String>,
}

impl EndpointConfig {
    /// Load endpoint configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `IMAP_USERNAME`
    /// - `IMAP_PASSWORD`
    ///
    /// Optional (with defaults):
    /// - `IMAP_SOURCE_ID` (default: `imap`)
    /// - `IMAP_HOST` (default: `127.0.0.1`)
    /// - `IMAP_PORT` (default: `993`)
    /// - `IMAP_PROTOCOL` (`plain` or `tls`, default: `tls`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            id: env::var("IMAP_SOURCE_ID").unwrap_or_else(|_| "imap".to_string()),
            host: env::var("IMAP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("IMAP_PORT")
                .unwrap_or_else(|_| "993".to_string())
                .parse()
                .map_err(|e| Error::Config(format!("Invalid IMAP_PORT: {e}")))?,
            protocol: env::var("IMAP_PROTOCOL")
                .unwrap_or_else(|_| "tls".to_string())
                .parse()?,
            username: env::var("IMAP_USERNAME")
                .map_err(|_| Error::Config("IMAP_USERNAME not set".into()))?,
            password: env::var("IMAP_PASSWORD")
                .map_err(|_| Error::Config("IMAP_PASSWORD not set".into()))?,
            mailboxes: BTreeMap::new(),
        })
    }

    /// Format a remote folder path the way the host's mailbox table
    /// records it.
    #[must_use]
    pub fn src_path(&self, path: &str) -> String {
        format!("src:{}/{path}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn src_path_is_prefixed_with_source_id() {
        let config = EndpointConfig {
            id: "work".to_string(),
            host: "imap.example.com".to_string(),
            port: 993,
            protocol: TransportMode::Tls,
            username: "u".to_string(),
            password: "p".to_string(),
            mailboxes: BTreeMap::new(),
        };
        assert_eq!(config.src_path("INBOX"), "src:work/INBOX");
    }

    #[test]
    fn transport_mode_parses() {
        assert_eq!("plain".parse::<TransportMode>().unwrap(), TransportMode::Plain);
        assert_eq!("tls".parse::<TransportMode>().unwrap(), TransportMode::Tls);
        assert!("imap_ssl".parse::<TransportMode>().is_err());
    }
}
