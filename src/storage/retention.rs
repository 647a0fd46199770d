//! Background retention scanner
//!
//! Periodically sweeps every mailbox and removes messages past the
//! configured age. The sweep works on snapshots: messages delivered while
//! it runs may or may not be observed, but are never double-counted. A
//! sweep error on one message never stops the rest of the sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;
use crate::server::Shutdown;
use crate::storage::Store;

pub struct RetentionScanner {
    period: Duration,
    age: Duration,
    store: Arc<dyn Store>,
    shutdown: Shutdown,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionScanner {
    pub fn new(config: &Config, store: Arc<dyn Store>, shutdown: Shutdown) -> Self {
        Self {
            period: config.retention_period,
            age: config.retention_age,
            store,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the sweep loop. A zero period disables retention entirely.
    pub fn start(&self) {
        if self.period.is_zero() {
            info!("Retention scanner disabled");
            return;
        }
        info!(
            "Retention scanner sweeping every {:?}, removing mail older than {:?}",
            self.period, self.age
        );
        let period = self.period;
        let age = self.age;
        let store = Arc::clone(&self.store);
        let shutdown = self.shutdown.clone();
        *self.handle.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.wait() => break,
                }
                if let Err(err) = sweep(store.as_ref(), age, &shutdown).await {
                    error!("Retention sweep failed: {}", err);
                }
            }
            debug!("Retention scanner stopped");
        }));
    }

    /// Wait for the sweep loop to exit after shutdown.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// One pass over every mailbox. Expired messages are collected from the
/// store's snapshots first, then removed mailbox by mailbox; shutdown is
/// honored between mailboxes, never in the middle of one.
pub async fn sweep(store: &dyn Store, age: Duration, shutdown: &Shutdown) -> Result<usize> {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now() - age;

    let mut expired: Vec<(String, Vec<String>)> = Vec::new();
    store
        .visit_mailboxes(&mut |mailbox, messages| {
            let old: Vec<String> = messages
                .into_iter()
                .filter(|m| m.date < cutoff)
                .map(|m| m.id)
                .collect();
            if !old.is_empty() {
                expired.push((mailbox.to_string(), old));
            }
            !shutdown.is_signaled()
        })
        .await?;

    let mut removed = 0;
    for (mailbox, ids) in expired {
        for id in ids {
            match store.remove_message(&mailbox, &id).await {
                Ok(()) => removed += 1,
                // Already gone; a reader or cap eviction beat us to it.
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!("Failed to expire {} in {:?}: {}", id, mailbox, err);
                }
            }
        }
        if shutdown.is_signaled() {
            break;
        }
    }
    if removed > 0 {
        debug!("Retention sweep removed {} messages", removed);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::parse_delivery;
    use crate::storage::MemoryStore;

    async fn add_aged(store: &MemoryStore, mailbox: &str, age: Duration) -> String {
        let mut delivery = parse_delivery(b"Subject: old\r\n\r\nx".to_vec(), mailbox);
        delivery.meta.date = Utc::now() - chrono::Duration::from_std(age).unwrap();
        store.add_message(delivery).await.unwrap()
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let store = MemoryStore::new(0);
        let shutdown = Shutdown::new();

        add_aged(&store, "alice", Duration::from_secs(600)).await;
        let fresh = add_aged(&store, "alice", Duration::from_secs(0)).await;

        let removed = sweep(&store, Duration::from_secs(300), &shutdown)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining = store.get_messages("alice").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh);
    }

    #[tokio::test]
    async fn test_sweep_with_zero_age_empties_everything() {
        let store = MemoryStore::new(0);
        let shutdown = Shutdown::new();

        add_aged(&store, "alice", Duration::from_secs(1)).await;
        add_aged(&store, "bob", Duration::from_secs(1)).await;

        sweep(&store, Duration::ZERO, &shutdown).await.unwrap();
        assert_eq!(store.message_count("alice").await.unwrap(), 0);
        assert_eq!(store.message_count("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_spans_mailboxes() {
        let store = MemoryStore::new(0);
        let shutdown = Shutdown::new();

        for mailbox in ["a", "b", "c"] {
            add_aged(&store, mailbox, Duration::from_secs(600)).await;
        }
        let removed = sweep(&store, Duration::from_secs(300), &shutdown)
            .await
            .unwrap();
        assert_eq!(removed, 3);
    }

    #[tokio::test]
    async fn test_disabled_scanner_terminates_immediately() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(0));
        let config = Config {
            retention_period: Duration::ZERO,
            ..Config::default()
        };
        let scanner = RetentionScanner::new(&config, store, Shutdown::new());
        scanner.start();
        // No task was spawned; join returns at once.
        scanner.join().await;
    }

    #[tokio::test]
    async fn test_scanner_loop_stops_on_shutdown() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(0));
        let shutdown = Shutdown::new();
        let config = Config {
            retention_period: Duration::from_millis(10),
            retention_age: Duration::from_secs(0),
            ..Config::default()
        };
        let scanner = RetentionScanner::new(&config, store, shutdown.clone());
        scanner.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.signal();
        scanner.join().await;
    }
}
