//! Message metadata and delivery parsing

use chrono::{DateTime, Utc};
use log::debug;
use mailparse::MailHeaderMap;
use serde::{Deserialize, Serialize};

/// Everything known about a stored message except its content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub mailbox: String,
    /// Assigned by the store; sortable, unique within the mailbox.
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    /// Ingest time, not the sender's `Date:` header.
    pub date: DateTime<Utc>,
    pub subject: String,
    pub size: u64,
    pub seen: bool,
}

/// A message on its way into the store.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub meta: Metadata,
    pub source: Vec<u8>,
}

/// Build a [`Delivery`] for a raw message destined for `mailbox`.
///
/// Header parsing is best effort: a message that arrived on the wire is
/// stored no matter how mangled its headers are, with empty metadata
/// standing in for whatever could not be parsed.
pub fn parse_delivery(raw: Vec<u8>, mailbox: &str) -> Delivery {
    let mut from = String::new();
    let mut to = Vec::new();
    let mut subject = String::new();
    match mailparse::parse_mail(&raw) {
        Ok(parsed) => {
            from = parsed.headers.get_first_value("From").unwrap_or_default();
            to = parsed.headers.get_all_values("To");
            subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
        }
        Err(err) => {
            debug!("Unparseable headers for {}: {}", mailbox, err);
        }
    }
    let size = raw.len() as u64;
    Delivery {
        meta: Metadata {
            mailbox: mailbox.to_string(),
            id: String::new(),
            from,
            to,
            date: Utc::now(),
            subject,
            size,
            seen: false,
        },
        source: raw,
    }
}
