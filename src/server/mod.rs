//! Listener supervision and shutdown primitives
//!
//! Every front-end is a [`Listener`] wrapping a [`SessionHandler`]: the
//! listener owns the socket and the accept loop, sessions run as spawned
//! tasks tracked by a wait group, and a fatal listener error pulls the
//! whole daemon down through the shared [`Shutdown`] broadcast.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::error::Result;

pub mod pop3;
pub mod smtp;

const ACCEPT_RETRY_MIN: Duration = Duration::from_millis(5);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

/// One-shot shutdown broadcast shared by every component.
///
/// Signaling is idempotent; waiters that subscribe after the signal resolve
/// immediately.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Broadcast shutdown. Safe to call any number of times.
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once shutdown has been signaled.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks in-flight sessions so a listener can drain before exiting.
///
/// Guards hold a channel sender; `wait` drops the prototype sender and
/// blocks until every clone is gone.
pub struct WaitGroup {
    tx: Mutex<Option<mpsc::Sender<()>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

pub struct SessionGuard {
    _tx: Option<mpsc::Sender<()>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn add(&self) -> SessionGuard {
        SessionGuard {
            _tx: self.tx.lock().clone(),
        }
    }

    /// Block until every outstanding guard has been dropped.
    pub async fn wait(&self) {
        self.tx.lock().take();
        let mut rx = self.rx.lock().await;
        while rx.recv().await.is_some() {}
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection entrypoint implemented by each front-end.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, remote: SocketAddr) -> Result<()>;
}

/// Supervises one listening socket and its sessions.
pub struct Listener<H: SessionHandler> {
    name: &'static str,
    addr: SocketAddr,
    handler: Arc<H>,
    shutdown: Shutdown,
    sessions: WaitGroup,
}

impl<H: SessionHandler> Listener<H> {
    pub fn new(name: &'static str, addr: SocketAddr, handler: H, shutdown: Shutdown) -> Self {
        Self {
            name,
            addr,
            handler: Arc::new(handler),
            shutdown,
            sessions: WaitGroup::new(),
        }
    }

    /// Bind and run the accept loop until shutdown.
    ///
    /// A bind failure, or a permanent accept failure while the daemon is
    /// not already shutting down, triggers emergency shutdown rather than
    /// leaving the process half-alive.
    pub async fn start(&self) {
        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("{}: failed to bind {}: {}", self.name, self.addr, err);
                self.emergency_shutdown();
                return;
            }
        };
        info!("{}: listening on {}", self.name, self.addr);

        let mut retry_delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    debug!("{}: shutdown requested, connections will be drained", self.name);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        retry_delay = Duration::ZERO;
                        let guard = self.sessions.add();
                        let handler = Arc::clone(&self.handler);
                        let name = self.name;
                        tokio::spawn(async move {
                            if let Err(err) = handler.handle(stream, remote).await {
                                error!("{}: session {} failed: {}", name, remote, err);
                            }
                            drop(guard);
                        });
                    }
                    Err(err) if is_transient(&err) => {
                        retry_delay = if retry_delay.is_zero() {
                            ACCEPT_RETRY_MIN
                        } else {
                            (retry_delay * 2).min(ACCEPT_RETRY_MAX)
                        };
                        error!(
                            "{}: accept error: {}; retrying in {:?}",
                            self.name, err, retry_delay
                        );
                        tokio::time::sleep(retry_delay).await;
                    }
                    Err(err) => {
                        if self.shutdown.is_signaled() {
                            break;
                        }
                        error!("{}: permanent accept error: {}", self.name, err);
                        self.emergency_shutdown();
                        break;
                    }
                }
            }
        }
        // Dropping the listener closes the accept socket.
    }

    /// Block until all active sessions have finished.
    pub async fn drain(&self) {
        self.sessions.wait().await;
        debug!("{}: connections have drained", self.name);
    }

    fn emergency_shutdown(&self) {
        self.shutdown.signal();
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct EchoHandler;

    #[async_trait]
    impl SessionHandler for EchoHandler {
        async fn handle(&self, mut stream: TcpStream, _remote: SocketAddr) -> Result<()> {
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buf[..n]).await?;
            }
        }
    }

    async fn bound_listener(
        handler: EchoHandler,
        shutdown: Shutdown,
    ) -> (Arc<Listener<EchoHandler>>, SocketAddr) {
        // Reserve an ephemeral port, then let the listener re-bind it.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        let listener = Arc::new(Listener::new("test", addr, handler, shutdown));
        let task = Arc::clone(&listener);
        tokio::spawn(async move { task.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        (listener, addr)
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_broadcast() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_signaled());
        shutdown.signal();
        shutdown.signal();
        assert!(shutdown.is_signaled());
        // A late waiter resolves immediately.
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn test_waitgroup_waits_for_guards() {
        let wg = Arc::new(WaitGroup::new());
        let guard = wg.add();

        let waiter = {
            let wg = Arc::clone(&wg);
            tokio::spawn(async move { wg.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_survive_shutdown_until_done() {
        let shutdown = Shutdown::new();
        let (listener, addr) = bound_listener(EchoHandler, shutdown.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Stop accepting; the open session keeps the drain blocked.
        shutdown.signal();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let drained = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drained.is_finished());

        drop(client);
        drained.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_triggers_emergency_shutdown() {
        let shutdown = Shutdown::new();
        // Hold the port so the listener cannot bind it.
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let listener = Listener::new("test", addr, EchoHandler, shutdown.clone());
        listener.start().await;
        assert!(shutdown.is_signaled());
    }
}
