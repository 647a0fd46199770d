//! Reference-counted per-mailbox lock table
//!
//! Every mailbox gets its own reader/writer lock, created on demand and
//! dropped again once the last guard goes away, so the table stays bounded
//! no matter how many one-shot addresses a spam run invents. Only the table
//! itself sits behind a global mutex, held for map lookups only.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

pub struct LockTable {
    entries: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, name: &str) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire the shared (reader) lock for a mailbox.
    pub async fn shared(&self, name: &str) -> SharedGuard<'_> {
        let guard = self.entry(name).read_owned().await;
        SharedGuard {
            table: self,
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    /// Acquire the exclusive (writer) lock for a mailbox.
    pub async fn exclusive(&self, name: &str) -> ExclusiveGuard<'_> {
        let guard = self.entry(name).write_owned().await;
        ExclusiveGuard {
            table: self,
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    /// Drop the table entry once nothing but the table references it.
    fn release(&self, name: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(name) {
            if Arc::strong_count(entry) == 1 {
                entries.remove(name);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedGuard<'a> {
    table: &'a LockTable,
    name: String,
    guard: Option<OwnedRwLockReadGuard<()>>,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.table.release(&self.name);
    }
}

pub struct ExclusiveGuard<'a> {
    table: &'a LockTable,
    name: String,
    guard: Option<OwnedRwLockWriteGuard<()>>,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.table.release(&self.name);
    }
}
