//! mailsink daemon launcher

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::stream::StreamExt;
use log::{error, info};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;

use mailsink::config::{Config, StoreKind};
use mailsink::hub::MessageHub;
use mailsink::manager::StoreManager;
use mailsink::policy::AddrPolicy;
use mailsink::server::pop3::Pop3Handler;
use mailsink::server::smtp::SmtpHandler;
use mailsink::server::{Listener, Shutdown};
use mailsink::storage::retention::RetentionScanner;

/// How long a graceful shutdown may take before the watchdog pulls the plug.
const DRAIN_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "mailsink", about = "Disposable email capture daemon", version)]
struct Args {
    /// SMTP listen address
    #[arg(long, default_value = "0.0.0.0:2500", env = "MAILSINK_SMTP_ADDR")]
    smtp_addr: SocketAddr,

    /// POP3 listen address
    #[arg(long, default_value = "0.0.0.0:1100", env = "MAILSINK_POP3_ADDR")]
    pop3_addr: SocketAddr,

    /// Storage back-end: file or memory
    #[arg(long, default_value = "memory", env = "MAILSINK_STORE")]
    store: String,

    /// Root directory for the file store
    #[arg(long, env = "MAILSINK_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Per-mailbox message cap (0 = unlimited, memory store only)
    #[arg(long, default_value_t = 500, env = "MAILSINK_MAX_MESSAGES")]
    max_messages: usize,

    /// Seconds between retention sweeps (0 disables the scanner)
    #[arg(long, default_value_t = 600, env = "MAILSINK_RETENTION_PERIOD")]
    retention_period: u64,

    /// Seconds a message may age before the scanner removes it
    #[arg(long, default_value_t = 86400, env = "MAILSINK_RETENTION_AGE")]
    retention_age: u64,

    /// Domain to accept mail for (repeatable; none accepts any)
    #[arg(long = "domain", env = "MAILSINK_DOMAINS", value_delimiter = ',')]
    domains: Vec<String>,

    /// Domain to accept but never store (repeatable)
    #[arg(
        long = "discard-domain",
        env = "MAILSINK_DISCARD_DOMAINS",
        value_delimiter = ','
    )]
    discard_domains: Vec<String>,

    /// Delivery events kept for the monitor history
    #[arg(long, default_value_t = 30, env = "MAILSINK_MONITOR_HISTORY")]
    monitor_history: usize,

    /// Session idle timeout in seconds
    #[arg(long, default_value_t = 60, env = "MAILSINK_IDLE_TIMEOUT")]
    idle_timeout: u64,

    /// Write our PID into the specified file
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Write the log into the specified file instead of stderr
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Write logs as JSON lines
    #[arg(long)]
    logjson: bool,

    /// Dump SMTP & POP3 network traffic to the log
    #[arg(long)]
    netdebug: bool,
}

impl Args {
    fn to_config(&self) -> Result<Config, mailsink::Error> {
        Ok(Config {
            smtp_addr: self.smtp_addr,
            pop3_addr: self.pop3_addr,
            accept_domains: self.domains.clone(),
            discard_domains: self.discard_domains.clone(),
            store_kind: self.store.parse::<StoreKind>()?,
            store_path: self.store_path.clone(),
            max_messages: self.max_messages,
            retention_period: Duration::from_secs(self.retention_period),
            retention_age: Duration::from_secs(self.retention_age),
            monitor_history: self.monitor_history,
            idle_timeout: Duration::from_secs(self.idle_timeout),
        })
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match args.to_config().and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = init_logging(&args) {
        eprintln!("Log error: {}", err);
        std::process::exit(1);
    }
    info!("mailsink {} starting", env!("CARGO_PKG_VERSION"));

    if let Some(path) = &args.pidfile {
        if let Err(err) = std::fs::write(path, format!("{}\n", std::process::id())) {
            error!("Failed to create pidfile {:?}: {}", path, err);
            std::process::exit(1);
        }
    }

    let shutdown = Shutdown::new();
    let store = match mailsink::storage::from_config(&config).await {
        Ok(store) => store,
        Err(err) => {
            error!("Fatal storage error: {}", err);
            remove_pidfile(&args.pidfile);
            std::process::exit(1);
        }
    };
    let hub = Arc::new(MessageHub::new(config.monitor_history, shutdown.clone()));
    let policy = Arc::new(AddrPolicy::new(&config));
    let manager = Arc::new(StoreManager::new(
        Arc::clone(&policy),
        Arc::clone(&store),
        Arc::clone(&hub),
    ));

    let scanner = RetentionScanner::new(&config, Arc::clone(&store), shutdown.clone());
    scanner.start();

    let smtp = Arc::new(Listener::new(
        "smtp",
        config.smtp_addr,
        SmtpHandler::new(
            Arc::clone(&manager),
            Arc::clone(&policy),
            config.idle_timeout,
            shutdown.clone(),
            args.netdebug,
        ),
        shutdown.clone(),
    ));
    let pop3 = Arc::new(Listener::new(
        "pop3",
        config.pop3_addr,
        Pop3Handler::new(
            Arc::clone(&store),
            Arc::clone(&policy),
            config.idle_timeout,
            shutdown.clone(),
            args.netdebug,
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

    // Wait for a signal or an emergency shutdown from a listener.
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            error!("Failed to install signal handler: {}", err);
            remove_pidfile(&args.pidfile);
            std::process::exit(1);
        }
    };
    let signals_handle = signals.handle();
    tokio::select! {
        signal = signals.next() => {
            let name = match signal {
                Some(SIGINT) => "SIGINT",
                Some(SIGTERM) => "SIGTERM",
                _ => "signal stream closed",
            };
            info!("Received {}, shutting down", name);
            shutdown.signal();
        }
        _ = shutdown.wait() => {
            info!("Emergency shutdown requested");
        }
    }
    signals_handle.close();

    // Watchdog: a hung session must not keep the process alive forever.
    let watchdog_pidfile = args.pidfile.clone();
    tokio::spawn(async move {
        tokio::time::sleep(DRAIN_DEADLINE).await;
        remove_pidfile(&watchdog_pidfile);
        error!("Clean shutdown took too long, forcing exit");
        std::process::exit(0);
    });

    smtp.drain().await;
    pop3.drain().await;
    scanner.join().await;
    remove_pidfile(&args.pidfile);
    info!("Shutdown complete");
}

fn remove_pidfile(pidfile: &Option<PathBuf>) {
    if let Some(path) = pidfile {
        if let Err(err) = std::fs::remove_file(path) {
            error!("Failed to remove pidfile {:?}: {}", path, err);
        }
    }
}

/// Configure env_logger: level from RUST_LOG (default info), optionally
/// redirected to a file and rendered as JSON lines.
fn init_logging(args: &Args) -> std::io::Result<()> {
    let default_filter = if args.netdebug {
        "info,mailsink::server=trace"
    } else {
        "info"
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    if args.logjson {
        builder.format(|buf, record| {
            use std::io::Write;
            let line = serde_json::json!({
                "time": chrono::Utc::now().to_rfc3339(),
                "level": record.level().to_string(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    }
    if let Some(path) = &args.logfile {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
