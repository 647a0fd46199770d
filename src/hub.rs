//! Delivery notification hub
//!
//! In-process pub/sub feeding the live monitor. A single dispatcher task
//! owns the listener table and a bounded ring of recent events; publishers
//! never block, and a slow subscriber only ever loses its own events.

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::message::Metadata;
use crate::server::Shutdown;

/// Metadata-only notification of a stored message. Never carries the body.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEvent {
    pub mailbox: String,
    pub id: String,
    pub from: String,
    pub subject: String,
    pub date: chrono::DateTime<chrono::Utc>,
    pub size: u64,
}

impl From<&Metadata> for MessageEvent {
    fn from(meta: &Metadata) -> Self {
        Self {
            mailbox: meta.mailbox.clone(),
            id: meta.id.clone(),
            from: meta.from.clone(),
            subject: meta.subject.clone(),
            date: meta.date,
            size: meta.size,
        }
    }
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

enum HubCommand {
    Dispatch(MessageEvent),
    Subscribe {
        buffer: usize,
        reply: oneshot::Sender<(SubscriptionId, mpsc::Receiver<MessageEvent>)>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<()>,
    },
    History {
        reply: oneshot::Sender<Vec<MessageEvent>>,
    },
}

const COMMAND_BUFFER: usize = 1024;

pub struct MessageHub {
    command_tx: mpsc::Sender<HubCommand>,
}

impl MessageHub {
    /// Spawn the dispatcher. `history` is the number of recent events kept
    /// for the monitor; zero keeps none. The dispatcher exits when the
    /// shutdown broadcast fires, closing every listener buffer.
    pub fn new(history: usize, shutdown: Shutdown) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(hub_loop(command_rx, history, shutdown));
        Self { command_tx }
    }

    /// Publish a delivery event. Never blocks: if the dispatcher cannot keep
    /// up the event is dropped and logged, not queued against the producer.
    pub fn dispatch(&self, event: MessageEvent) {
        if let Err(err) = self.command_tx.try_send(HubCommand::Dispatch(event)) {
            warn!("Hub dispatch dropped: {}", err);
        }
    }

    /// Register a listener with a buffer of `buffer` pending events.
    ///
    /// After shutdown the returned receiver is already closed; callers
    /// observe the same end-of-stream they would on a live unsubscribe.
    pub async fn subscribe(&self, buffer: usize) -> (SubscriptionId, mpsc::Receiver<MessageEvent>) {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(HubCommand::Subscribe {
                buffer: buffer.max(1),
                reply,
            })
            .await;
        if sent.is_ok() {
            if let Ok(subscription) = rx.await {
                return subscription;
            }
        }
        // Hub already stopped: hand back a terminal subscription.
        let (_, closed) = mpsc::channel(1);
        (SubscriptionId::new(), closed)
    }

    /// Remove a listener. Unknown ids are ignored.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(HubCommand::Unsubscribe { id, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Snapshot of the most recent events, oldest first.
    pub async fn history(&self) -> Vec<MessageEvent> {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(HubCommand::History { reply })
            .await
            .is_ok()
        {
            if let Ok(events) = rx.await {
                return events;
            }
        }
        Vec::new()
    }
}

async fn hub_loop(
    mut command_rx: mpsc::Receiver<HubCommand>,
    history_cap: usize,
    shutdown: Shutdown,
) {
    let mut listeners: HashMap<SubscriptionId, mpsc::Sender<MessageEvent>> = HashMap::new();
    let mut history: VecDeque<MessageEvent> = VecDeque::new();

    loop {
        let command = tokio::select! {
            command = command_rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = shutdown.wait() => break,
        };
        match command {
            HubCommand::Dispatch(event) => {
                if history_cap > 0 {
                    if history.len() == history_cap {
                        history.pop_front();
                    }
                    history.push_back(event.clone());
                }
                listeners.retain(|id, tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // This listener loses the event; nobody else does.
                        debug!("Listener {:?} buffer full, dropping event", id);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            HubCommand::Subscribe { buffer, reply } => {
                let id = SubscriptionId::new();
                let (tx, rx) = mpsc::channel(buffer);
                listeners.insert(id, tx);
                debug!("Hub subscription added: {:?}", id);
                let _ = reply.send((id, rx));
            }
            HubCommand::Unsubscribe { id, reply } => {
                listeners.remove(&id);
                debug!("Hub subscription removed: {:?}", id);
                let _ = reply.send(());
            }
            HubCommand::History { reply } => {
                let _ = reply.send(history.iter().cloned().collect());
            }
        }
    }
    // Dropping the listener table closes every subscriber's receiver.
    debug!("Hub dispatcher stopped");
}
