//! End-to-end tests driving the SMTP and POP3 front-ends over real sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use mailsink::config::Config;
use mailsink::hub::MessageHub;
use mailsink::manager::StoreManager;
use mailsink::policy::AddrPolicy;
use mailsink::server::pop3::Pop3Handler;
use mailsink::server::smtp::SmtpHandler;
use mailsink::server::{Listener, Shutdown};
use mailsink::storage::MemoryStore;
use mailsink::Store;

struct TestServer {
    smtp_addr: SocketAddr,
    pop3_addr: SocketAddr,
    store: Arc<dyn Store>,
    hub: Arc<MessageHub>,
    shutdown: Shutdown,
    smtp: Arc<Listener<SmtpHandler>>,
    pop3: Arc<Listener<Pop3Handler>>,
}

async fn free_addr() -> SocketAddr {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    addr
}

async fn setup(config: Config) -> TestServer {
    let shutdown = Shutdown::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(config.max_messages));
    let hub = Arc::new(MessageHub::new(config.monitor_history, shutdown.clone()));
    let policy = Arc::new(AddrPolicy::new(&config));
    let manager = Arc::new(StoreManager::new(
        Arc::clone(&policy),
        Arc::clone(&store),
        Arc::clone(&hub),
    ));

    let smtp_addr = free_addr().await;
    let pop3_addr = free_addr().await;
    let smtp = Arc::new(Listener::new(
        "smtp",
        smtp_addr,
        SmtpHandler::new(
            manager,
            Arc::clone(&policy),
            Duration::from_secs(5),
            shutdown.clone(),
            false,
        ),
        shutdown.clone(),
    ));
    let pop3 = Arc::new(Listener::new(
        "pop3",
        pop3_addr,
        Pop3Handler::new(
            Arc::clone(&store),
            policy,
            Duration::from_secs(5),
            shutdown.clone(),
            false,
        ),
        shutdown.clone(),
    ));
    {
        let smtp = Arc::clone(&smtp);
        tokio::spawn(async move { smtp.start().await });
    }
    {
        let pop3 = Arc::clone(&pop3);
        tokio::spawn(async move { pop3.start().await });
    }
    // Give the listeners time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        smtp_addr,
        pop3_addr,
        store,
        hub,
        shutdown,
        smtp,
        pop3,
    }
}

/// Line-oriented client for talking to either front-end.
struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    async fn expect(&mut self, prefix: &str) -> String {
        let line = self.line().await;
        assert!(
            line.starts_with(prefix),
            "expected {:?}, got {:?}",
            prefix,
            line
        );
        line
    }

    /// Read a POP3 multiline body up to the lone-dot terminator.
    async fn multiline(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            if line == "." {
                return lines;
            }
            lines.push(line.strip_prefix('.').unwrap_or(&line).to_string());
        }
    }
}

async fn smtp_deliver(addr: SocketAddr, from: &str, rcpt: &str, body: &[&str]) {
    let mut client = LineClient::connect(addr).await;
    client.expect("220").await;
    client.send("HELO tester").await;
    client.expect("250").await;
    client.send(&format!("MAIL FROM:<{}>", from)).await;
    client.expect("250").await;
    client.send(&format!("RCPT TO:<{}>", rcpt)).await;
    client.expect("250").await;
    client.send("DATA").await;
    client.expect("354").await;
    for line in body {
        client.send(line).await;
    }
    client.send(".").await;
    client.expect("250").await;
    client.send("QUIT").await;
    client.expect("221").await;
}

#[tokio::test]
async fn test_deliver_and_fetch() {
    let server = setup(Config::default()).await;

    smtp_deliver(
        server.smtp_addr,
        "sender@example.org",
        "Alice@Example.COM",
        &["To: Alice@Example.COM", "Subject: hi", "", "x"],
    )
    .await;

    // Mixed-case recipient landed in the canonical mailbox.
    let messages = server.store.get_messages("alice").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].subject, "hi");
    assert!(!messages[0].seen);

    let mut pop3 = LineClient::connect(server.pop3_addr).await;
    pop3.expect("+OK").await;
    pop3.send("USER alice").await;
    pop3.expect("+OK").await;
    pop3.send("PASS anything").await;
    pop3.expect("+OK").await;
    pop3.send("STAT").await;
    let stat = pop3.expect("+OK").await;
    assert!(stat.starts_with("+OK 1 "), "unexpected STAT: {:?}", stat);

    pop3.send("RETR 1").await;
    pop3.expect("+OK").await;
    let body = pop3.multiline().await;
    assert!(body.contains(&"Subject: hi".to_string()));
    assert_eq!(body.last().unwrap(), "x");

    pop3.send("QUIT").await;
    pop3.expect("+OK").await;

    // RETR marked the message seen.
    let messages = server.store.get_messages("alice").await.unwrap();
    assert!(messages[0].seen);
}

#[tokio::test]
async fn test_plus_tag_lands_in_base_mailbox() {
    let server = setup(Config::default()).await;
    smtp_deliver(
        server.smtp_addr,
        "sender@example.org",
        "bob+sale@example.com",
        &["Subject: deal", "", "buy now"],
    )
    .await;

    assert_eq!(server.store.message_count("bob").await.unwrap(), 1);
    assert_eq!(server.store.message_count("bob+sale").await.unwrap(), 0);
}

#[tokio::test]
async fn test_foreign_domain_is_refused_at_rcpt() {
    let server = setup(Config {
        accept_domains: vec!["example.com".to_string()],
        ..Config::default()
    })
    .await;

    let mut client = LineClient::connect(server.smtp_addr).await;
    client.expect("220").await;
    client.send("HELO tester").await;
    client.expect("250").await;
    client.send("MAIL FROM:<x@anywhere.org>").await;
    client.expect("250").await;
    client.send("RCPT TO:<alice@other.org>").await;
    client.expect("550").await;
    client.send("QUIT").await;
    client.expect("221").await;
}

#[tokio::test]
async fn test_dot_stuffing_round_trips() {
    let server = setup(Config::default()).await;
    smtp_deliver(
        server.smtp_addr,
        "sender@example.org",
        "alice@example.com",
        &["Subject: dots", "", "..leading dot", "trailer"],
    )
    .await;

    let mut pop3 = LineClient::connect(server.pop3_addr).await;
    pop3.expect("+OK").await;
    pop3.send("USER alice").await;
    pop3.expect("+OK").await;
    pop3.send("PASS x").await;
    pop3.expect("+OK").await;
    pop3.send("RETR 1").await;
    pop3.expect("+OK").await;
    let body = pop3.multiline().await;
    assert!(body.contains(&".leading dot".to_string()));
    pop3.send("QUIT").await;
    pop3.expect("+OK").await;
}

#[tokio::test]
async fn test_pop3_dele_applies_at_quit() {
    let server = setup(Config::default()).await;
    smtp_deliver(
        server.smtp_addr,
        "s@example.org",
        "carol@example.com",
        &["Subject: one", "", "1"],
    )
    .await;
    smtp_deliver(
        server.smtp_addr,
        "s@example.org",
        "carol@example.com",
        &["Subject: two", "", "2"],
    )
    .await;

    let mut pop3 = LineClient::connect(server.pop3_addr).await;
    pop3.expect("+OK").await;
    pop3.send("USER carol").await;
    pop3.expect("+OK").await;
    pop3.send("PASS x").await;
    pop3.expect("+OK").await;
    pop3.send("DELE 1").await;
    pop3.expect("+OK").await;

    // Not applied until QUIT.
    assert_eq!(server.store.message_count("carol").await.unwrap(), 2);
    pop3.send("QUIT").await;
    pop3.expect("+OK").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let remaining = server.store.get_messages("carol").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].subject, "two");
}

#[tokio::test]
async fn test_delivery_publishes_hub_event() {
    let server = setup(Config::default()).await;
    let (_id, mut events) = server.hub.subscribe(10).await;

    smtp_deliver(
        server.smtp_addr,
        "s@example.org",
        "dave@example.com",
        &["Subject: ping", "", "x"],
    )
    .await;

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.mailbox, "dave");
    assert_eq!(event.subject, "ping");
}

#[tokio::test]
async fn test_graceful_drain_finishes_in_flight_session() {
    let server = setup(Config::default()).await;

    // A session is mid-dialogue when shutdown arrives.
    let mut client = LineClient::connect(server.smtp_addr).await;
    client.expect("220").await;
    client.send("HELO tester").await;
    client.expect("250").await;

    server.shutdown.signal();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The current command still completes; the server then says goodbye.
    client.send("NOOP").await;
    client.expect("250").await;
    client.expect("421").await;

    // Drain completes once the session is gone.
    tokio::time::timeout(Duration::from_secs(5), async {
        server.smtp.drain().await;
        server.pop3.drain().await;
    })
    .await
    .unwrap();
}
