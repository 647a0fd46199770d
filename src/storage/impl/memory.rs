//! In-process mailbox storage
//!
//! Bounded ring of messages per mailbox, nothing survives a restart. The
//! lock table serializes access per mailbox exactly like the file store;
//! the map behind it is only ever touched for constant-time bookkeeping.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::message::{Delivery, Metadata};
use crate::storage::lock::LockTable;
use crate::storage::{next_message_id, sort_listing, MailboxVisitor, Source, Store};

struct Entry {
    meta: Metadata,
    source: Vec<u8>,
}

pub struct MemoryStore {
    /// Per-mailbox cap; 0 means unlimited.
    max_messages: usize,
    locks: LockTable,
    mailboxes: RwLock<HashMap<String, VecDeque<Entry>>>,
}

impl MemoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            locks: LockTable::new(),
            mailboxes: RwLock::new(HashMap::new()),
        }
    }

    fn listing(&self, mailbox: &str) -> Vec<Metadata> {
        let mut entries: Vec<Metadata> = self
            .mailboxes
            .read()
            .get(mailbox)
            .map(|ring| ring.iter().map(|e| e.meta.clone()).collect())
            .unwrap_or_default();
        sort_listing(&mut entries);
        entries
    }

    fn not_found(mailbox: &str, id: &str) -> Error {
        Error::NotFound(format!("Message {} in {:?}", id, mailbox))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_message(&self, mut delivery: Delivery) -> Result<String> {
        let mailbox = delivery.meta.mailbox.clone();
        let _guard = self.locks.exclusive(&mailbox).await;

        let mut mailboxes = self.mailboxes.write();
        let ring = mailboxes.entry(mailbox.clone()).or_default();
        let id = next_message_id(ring.back().map(|e| e.meta.id.as_str()));
        delivery.meta.id = id.clone();
        delivery.meta.size = delivery.source.len() as u64;
        ring.push_back(Entry {
            meta: delivery.meta,
            source: delivery.source,
        });
        if self.max_messages > 0 {
            while ring.len() > self.max_messages {
                if let Some(evicted) = ring.pop_front() {
                    debug!(
                        "Evicting {} from {:?}: mailbox over cap",
                        evicted.meta.id, mailbox
                    );
                }
            }
        }
        Ok(id)
    }

    async fn get_message(&self, mailbox: &str, id: &str) -> Result<Metadata> {
        let _guard = self.locks.shared(mailbox).await;
        self.mailboxes
            .read()
            .get(mailbox)
            .and_then(|ring| ring.iter().find(|e| e.meta.id == id))
            .map(|e| e.meta.clone())
            .ok_or_else(|| Self::not_found(mailbox, id))
    }

    async fn source(&self, mailbox: &str, id: &str) -> Result<Source> {
        let _guard = self.locks.shared(mailbox).await;
        self.mailboxes
            .read()
            .get(mailbox)
            .and_then(|ring| ring.iter().find(|e| e.meta.id == id))
            .map(|e| Box::new(std::io::Cursor::new(e.source.clone())) as Source)
            .ok_or_else(|| Self::not_found(mailbox, id))
    }

    async fn get_messages(&self, mailbox: &str) -> Result<Vec<Metadata>> {
        let _guard = self.locks.shared(mailbox).await;
        Ok(self.listing(mailbox))
    }

    async fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        let _guard = self.locks.exclusive(mailbox).await;
        self.mailboxes
            .write()
            .get_mut(mailbox)
            .and_then(|ring| ring.iter_mut().find(|e| e.meta.id == id))
            .map(|e| e.meta.seen = true)
            .ok_or_else(|| Self::not_found(mailbox, id))
    }

    async fn remove_message(&self, mailbox: &str, id: &str) -> Result<()> {
        let _guard = self.locks.exclusive(mailbox).await;
        let mut mailboxes = self.mailboxes.write();
        let ring = mailboxes
            .get_mut(mailbox)
            .ok_or_else(|| Self::not_found(mailbox, id))?;
        let pos = ring
            .iter()
            .position(|e| e.meta.id == id)
            .ok_or_else(|| Self::not_found(mailbox, id))?;
        ring.remove(pos);
        // The mailbox dies with its last message.
        if ring.is_empty() {
            mailboxes.remove(mailbox);
        }
        Ok(())
    }

    async fn purge_messages(&self, mailbox: &str) -> Result<()> {
        let _guard = self.locks.exclusive(mailbox).await;
        self.mailboxes.write().remove(mailbox);
        Ok(())
    }

    async fn visit_mailboxes(&self, visitor: &mut MailboxVisitor<'_>) -> Result<()> {
        let names: Vec<String> = self.mailboxes.read().keys().cloned().collect();
        for name in names {
            let listing = {
                let _guard = self.locks.shared(&name).await;
                self.listing(&name)
            };
            // A mailbox emptied since the name snapshot lists as empty,
            // which reads the same as never having existed.
            if !visitor(&name, listing) {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn message_count(&self, mailbox: &str) -> Result<usize> {
        let _guard = self.locks.shared(mailbox).await;
        Ok(self
            .mailboxes
            .read()
            .get(mailbox)
            .map(|ring| ring.len())
            .unwrap_or(0))
    }
}
