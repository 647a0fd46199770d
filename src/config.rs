//! Runtime configuration for the daemon and its components
//!
//! The daemon binary populates this from command line flags and environment
//! variables; tests build it directly. `validate` is the single place a bad
//! combination becomes a fatal startup error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which storage back-end to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    File,
    Memory,
}

impl FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StoreKind::File),
            "memory" => Ok(StoreKind::Memory),
            other => Err(Error::Config(format!("Unknown store kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SMTP listen address.
    pub smtp_addr: SocketAddr,
    /// POP3 listen address.
    pub pop3_addr: SocketAddr,
    /// Domains mail is accepted for; empty means any.
    pub accept_domains: Vec<String>,
    /// Domains accepted on the wire but never stored.
    pub discard_domains: Vec<String>,
    pub store_kind: StoreKind,
    /// Root directory for the file store.
    pub store_path: Option<PathBuf>,
    /// Per-mailbox message cap; 0 means unlimited for the memory store.
    pub max_messages: usize,
    /// Retention sweep interval; zero disables the scanner.
    pub retention_period: Duration,
    /// Messages older than this are removed by the scanner.
    pub retention_age: Duration,
    /// Number of delivery events kept for the monitor history.
    pub monitor_history: usize,
    /// Per-session idle timeout.
    pub idle_timeout: Duration,
}

impl Config {
    /// Check cross-field constraints. Fatal at startup if this fails.
    pub fn validate(&self) -> Result<()> {
        if self.store_kind == StoreKind::File {
            if self.store_path.is_none() {
                return Err(Error::Config(
                    "File store requires a storage path".to_string(),
                ));
            }
            if self.max_messages == 0 {
                return Err(Error::Config(
                    "File store requires a positive per-mailbox message cap".to_string(),
                ));
            }
        }
        for domain in self.accept_domains.iter().chain(&self.discard_domains) {
            if domain.is_empty() || domain.contains('@') {
                return Err(Error::Config(format!("Invalid domain: {:?}", domain)));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smtp_addr: SocketAddr::from(([127, 0, 0, 1], 2500)),
            pop3_addr: SocketAddr::from(([127, 0, 0, 1], 1100)),
            accept_domains: Vec::new(),
            discard_domains: Vec::new(),
            store_kind: StoreKind::Memory,
            store_path: None,
            max_messages: 500,
            retention_period: Duration::from_secs(600),
            retention_age: Duration::from_secs(24 * 60 * 60),
            monitor_history: 30,
            idle_timeout: Duration::from_secs(60),
        }
    }
}
