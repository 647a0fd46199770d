//! Minimal POP3 reader
//!
//! RFC 1939 transaction basics over a mailbox name as the username: USER,
//! PASS (any password unlocks any mailbox), STAT, LIST, RETR, DELE, RSET,
//! UIDL, NOOP, QUIT. Deletions are marked during the session and applied
//! at QUIT; RETR marks the message seen.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::message::Metadata;
use crate::policy::{parse_email_address, AddrPolicy};
use crate::server::{SessionHandler, Shutdown};
use crate::storage::Store;

pub struct Pop3Handler {
    store: Arc<dyn Store>,
    policy: Arc<AddrPolicy>,
    idle_timeout: Duration,
    shutdown: Shutdown,
    netdebug: bool,
}

impl Pop3Handler {
    pub fn new(
        store: Arc<dyn Store>,
        policy: Arc<AddrPolicy>,
        idle_timeout: Duration,
        shutdown: Shutdown,
        netdebug: bool,
    ) -> Self {
        Self {
            store,
            policy,
            idle_timeout,
            shutdown,
            netdebug,
        }
    }
}

/// Per-session transaction state: the listing snapshot taken at login plus
/// deletion marks applied at QUIT.
struct Transaction {
    mailbox: String,
    messages: Vec<Metadata>,
    deleted: Vec<bool>,
}

impl Transaction {
    fn message(&self, number: &str) -> Option<(usize, &Metadata)> {
        let n: usize = number.parse().ok()?;
        let index = n.checked_sub(1)?;
        if *self.deleted.get(index)? {
            return None;
        }
        Some((index, &self.messages[index]))
    }

    fn live(&self) -> impl Iterator<Item = (usize, &Metadata)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.deleted[*i])
    }
}

type Writer = BufWriter<OwnedWriteHalf>;

#[async_trait]
impl SessionHandler for Pop3Handler {
    async fn handle(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        debug!("pop3: session opened from {}", remote);
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        self.reply(&mut writer, "+OK mailsink POP3 server ready").await?;

        let mut user: Option<String> = None;
        let mut txn: Option<Transaction> = None;
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::time::timeout(self.idle_timeout, reader.read_line(&mut line)).await;
            let n = match read {
                Ok(n) => n?,
                Err(_) => {
                    self.reply(&mut writer, "-ERR Idle timeout, closing").await?;
                    break;
                }
            };
            if n == 0 {
                debug!("pop3: {} disconnected", remote);
                break;
            }
            if self.netdebug {
                trace!("pop3 <- {}: {}", remote, line.trim_end());
            }

            let input = line.trim_end_matches(['\r', '\n']);
            let (verb, arg) = match input.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a.trim()),
                None => (input.to_ascii_uppercase(), ""),
            };

            match verb.as_str() {
                "USER" if txn.is_none() => match self.mailbox_for(arg) {
                    Ok(mailbox) => {
                        user = Some(mailbox);
                        self.reply(&mut writer, "+OK Send PASS").await?;
                    }
                    Err(err) => self.reply(&mut writer, &format!("-ERR {}", err)).await?,
                },
                "PASS" if txn.is_none() => match user.take() {
                    Some(mailbox) => {
                        // Any password unlocks a mailbox; nothing here is private.
                        let messages = self.store.get_messages(&mailbox).await?;
                        let deleted = vec![false; messages.len()];
                        txn = Some(Transaction {
                            mailbox,
                            messages,
                            deleted,
                        });
                        self.reply(&mut writer, "+OK Mailbox open").await?;
                    }
                    None => self.reply(&mut writer, "-ERR USER first").await?,
                },
                "NOOP" => self.reply(&mut writer, "+OK").await?,
                "QUIT" => {
                    if let Some(txn) = txn.take() {
                        self.apply_deletions(&txn).await;
                    }
                    self.reply(&mut writer, "+OK Bye").await?;
                    break;
                }
                _ => match txn.as_mut() {
                    Some(txn) => {
                        self.transaction_command(&verb, arg, txn, &mut writer).await?
                    }
                    None => self.reply(&mut writer, "-ERR Bad command").await?,
                },
            }

            // Finish the command in flight, then bow out.
            if self.shutdown.is_signaled() {
                self.reply(&mut writer, "-ERR Server shutting down").await?;
                break;
            }
        }
        debug!("pop3: session closed for {}", remote);
        Ok(())
    }
}

impl Pop3Handler {
    async fn transaction_command(
        &self,
        verb: &str,
        arg: &str,
        txn: &mut Transaction,
        writer: &mut Writer,
    ) -> Result<()> {
        match verb {
            "STAT" => {
                let count = txn.live().count();
                let size: u64 = txn.live().map(|(_, m)| m.size).sum();
                self.reply(writer, &format!("+OK {} {}", count, size)).await
            }
            "LIST" if arg.is_empty() => {
                let lines: Vec<String> = txn
                    .live()
                    .map(|(i, m)| format!("{} {}", i + 1, m.size))
                    .collect();
                self.reply(writer, &format!("+OK {} messages", lines.len()))
                    .await?;
                for l in &lines {
                    self.reply(writer, l).await?;
                }
                self.reply(writer, ".").await
            }
            "LIST" => match txn.message(arg) {
                Some((i, m)) => {
                    self.reply(writer, &format!("+OK {} {}", i + 1, m.size)).await
                }
                None => self.reply(writer, "-ERR No such message").await,
            },
            "UIDL" if arg.is_empty() => {
                self.reply(writer, "+OK").await?;
                let lines: Vec<String> = txn
                    .live()
                    .map(|(i, m)| format!("{} {}", i + 1, m.id))
                    .collect();
                for l in &lines {
                    self.reply(writer, l).await?;
                }
                self.reply(writer, ".").await
            }
            "UIDL" => match txn.message(arg) {
                Some((i, m)) => {
                    self.reply(writer, &format!("+OK {} {}", i + 1, m.id)).await
                }
                None => self.reply(writer, "-ERR No such message").await,
            },
            "RETR" => match txn.message(arg) {
                Some((_, meta)) => {
                    let id = meta.id.clone();
                    let size = meta.size;
                    match self.store.source(&txn.mailbox, &id).await {
                        Ok(mut source) => {
                            self.reply(writer, &format!("+OK {} octets", size)).await?;
                            let mut raw = Vec::new();
                            source.read_to_end(&mut raw).await?;
                            self.write_multiline(writer, &raw).await?;
                            if let Err(err) = self.store.mark_seen(&txn.mailbox, &id).await {
                                warn!("pop3: failed to mark {} seen: {}", id, err);
                            }
                            Ok(())
                        }
                        Err(err) => self.reply(writer, &format!("-ERR {}", err)).await,
                    }
                }
                None => self.reply(writer, "-ERR No such message").await,
            },
            "DELE" => match txn.message(arg) {
                Some((index, _)) => {
                    txn.deleted[index] = true;
                    self.reply(writer, "+OK Marked for deletion").await
                }
                None => self.reply(writer, "-ERR No such message").await,
            },
            "RSET" => {
                txn.deleted.fill(false);
                self.reply(writer, "+OK").await
            }
            _ => self.reply(writer, "-ERR Bad command").await,
        }
    }

    /// The POP3 username is a mailbox name, optionally a full address.
    fn mailbox_for(&self, user: &str) -> Result<String> {
        if user.contains('@') {
            let addr = parse_email_address(user)?;
            self.policy.extract_mailbox(&addr)
        } else {
            Ok(user.to_lowercase())
        }
    }

    async fn reply(&self, writer: &mut Writer, text: &str) -> Result<()> {
        if self.netdebug {
            trace!("pop3 -> {}", text);
        }
        writer.write_all(text.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send message content with dot stuffing and the lone-dot terminator.
    async fn write_multiline(&self, writer: &mut Writer, raw: &[u8]) -> Result<()> {
        let mut lines = raw.split(|&b| b == b'\n').peekable();
        while let Some(line) = lines.next() {
            // A trailing newline produces one empty tail chunk, not a line.
            if line.is_empty() && lines.peek().is_none() {
                break;
            }
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                writer.write_all(b".").await?;
            }
            writer.write_all(line).await?;
            writer.write_all(b"\r\n").await?;
        }
        writer.write_all(b".\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn apply_deletions(&self, txn: &Transaction) {
        for (index, meta) in txn.messages.iter().enumerate() {
            if !txn.deleted[index] {
                continue;
            }
            match self.store.remove_message(&txn.mailbox, &meta.id).await {
                Ok(()) => debug!("pop3: deleted {} from {:?}", meta.id, txn.mailbox),
                // Someone else got there first; that is fine.
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!("pop3: failed to delete {}: {}", meta.id, err),
            }
        }
    }
}
