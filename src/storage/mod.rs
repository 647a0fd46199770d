//! Store trait and back-end selection
//!
//! Mailboxes materialize on first delivery and disappear with their last
//! message; callers never create or destroy them directly. Both back-ends
//! satisfy the same contract: listings are date-ordered (id as tiebreak),
//! the per-mailbox cap is re-established at the end of every add, and "no
//! mailbox" reads exactly like "no messages".

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncRead;

use crate::config::{Config, StoreKind};
use crate::error::{Error, Result};
use crate::message::{Delivery, Metadata};

pub mod r#impl;
pub mod lock;
pub mod retention;

pub use r#impl::{FileStore, MemoryStore};

/// Streaming accessor for a stored message's raw bytes.
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

/// Visitor callback for [`Store::visit_mailboxes`]; return `false` to stop.
pub type MailboxVisitor<'a> = dyn FnMut(&str, Vec<Metadata>) -> bool + Send + 'a;

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a delivery, assigning and returning its message id.
    async fn add_message(&self, delivery: Delivery) -> Result<String>;

    /// Fetch one message's metadata.
    async fn get_message(&self, mailbox: &str, id: &str) -> Result<Metadata>;

    /// Open the raw bytes of a stored message for streaming.
    async fn source(&self, mailbox: &str, id: &str) -> Result<Source>;

    /// List a mailbox, oldest first. Unknown mailboxes list as empty.
    async fn get_messages(&self, mailbox: &str) -> Result<Vec<Metadata>>;

    /// Flag a message as seen. Idempotent.
    async fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()>;

    /// Delete one message.
    async fn remove_message(&self, mailbox: &str, id: &str) -> Result<()>;

    /// Delete every message in a mailbox.
    async fn purge_messages(&self, mailbox: &str) -> Result<()>;

    /// Walk all mailboxes, yielding each name with a snapshot of its
    /// listing. The snapshot is taken under the mailbox lock but yielded
    /// after release, so the visitor may delete what it was handed.
    async fn visit_mailboxes(&self, visitor: &mut MailboxVisitor<'_>) -> Result<()>;

    /// Number of messages currently in a mailbox.
    async fn message_count(&self, mailbox: &str) -> Result<usize>;
}

/// Construct the configured storage back-end.
pub async fn from_config(config: &Config) -> Result<Arc<dyn Store>> {
    match config.store_kind {
        StoreKind::File => {
            let path = config
                .store_path
                .as_ref()
                .ok_or_else(|| Error::Config("File store requires a storage path".to_string()))?;
            Ok(Arc::new(
                FileStore::new(path, config.max_messages).await?,
            ))
        }
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new(config.max_messages))),
    }
}

/// Assign the next message id for a mailbox: zero-padded ingest nanos plus a
/// random suffix, so ids sort lexicographically in creation order. `last` is
/// the newest existing id; the timestamp component never moves backwards
/// past it even if the clock does.
pub(crate) fn next_message_id(last: Option<&str>) -> String {
    let mut nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u128;
    if let Some(last) = last {
        if let Some(prev) = last.split('-').next().and_then(|s| s.parse::<u128>().ok()) {
            if nanos <= prev {
                nanos = prev + 1;
            }
        }
    }
    format!("{:020}-{:016x}", nanos, rand::random::<u64>())
}

/// Order metadata the way listings are served: date ascending, id tiebreak.
pub(crate) fn sort_listing(entries: &mut [Metadata]) {
    entries.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
}
