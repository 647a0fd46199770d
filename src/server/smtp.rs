//! Minimal SMTP receiver
//!
//! Speaks just enough RFC 5321 to take mail in: HELO/EHLO, MAIL, RCPT,
//! DATA, RSET, NOOP, QUIT. No extensions, no AUTH, no TLS; anything a
//! sender offers beyond that gets a polite 500. Recipients are screened
//! with the accept gate here and the store gate at delivery time, so sink
//! domains swallow mail without a bounce.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use crate::error::Result;
use crate::manager::StoreManager;
use crate::policy::{parse_email_address, AddrPolicy};
use crate::server::{SessionHandler, Shutdown};

/// Cap on message size; DATA beyond this is rejected, not truncated.
const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

pub struct SmtpHandler {
    manager: Arc<StoreManager>,
    policy: Arc<AddrPolicy>,
    idle_timeout: Duration,
    shutdown: Shutdown,
    netdebug: bool,
}

impl SmtpHandler {
    pub fn new(
        manager: Arc<StoreManager>,
        policy: Arc<AddrPolicy>,
        idle_timeout: Duration,
        shutdown: Shutdown,
        netdebug: bool,
    ) -> Self {
        Self {
            manager,
            policy,
            idle_timeout,
            shutdown,
            netdebug,
        }
    }
}

#[derive(Default)]
struct Envelope {
    from: String,
    rcpts: Vec<String>,
}

#[async_trait]
impl SessionHandler for SmtpHandler {
    async fn handle(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        debug!("smtp: session opened from {}", remote);
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        self.reply(&mut writer, "220 mailsink ESMTP service ready")
            .await?;

        let mut envelope = Envelope::default();
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::time::timeout(self.idle_timeout, reader.read_line(&mut line)).await;
            let n = match read {
                Ok(n) => n?,
                Err(_) => {
                    self.reply(&mut writer, "421 Idle timeout, closing").await?;
                    break;
                }
            };
            if n == 0 {
                debug!("smtp: {} disconnected", remote);
                break;
            }
            if self.netdebug {
                trace!("smtp <- {}: {}", remote, line.trim_end());
            }

            let input = line.trim_end_matches(['\r', '\n']);
            let (verb, arg) = split_verb(input);
            match verb.as_str() {
                "HELO" | "EHLO" => {
                    envelope = Envelope::default();
                    self.reply(&mut writer, "250 mailsink at your service").await?;
                }
                "MAIL" => match mail_path(arg, "FROM") {
                    Some(from) => {
                        envelope = Envelope {
                            from,
                            rcpts: Vec::new(),
                        };
                        self.reply(&mut writer, "250 OK").await?;
                    }
                    None => {
                        self.reply(&mut writer, "501 Syntax: MAIL FROM:<address>")
                            .await?
                    }
                },
                "RCPT" => match mail_path(arg, "TO") {
                    Some(rcpt) => {
                        let accepted = parse_email_address(&rcpt)
                            .map(|addr| self.policy.should_accept_domain(&addr.domain));
                        match accepted {
                            Ok(true) => {
                                envelope.rcpts.push(rcpt);
                                self.reply(&mut writer, "250 OK").await?;
                            }
                            Ok(false) => {
                                self.reply(&mut writer, "550 Relay not permitted").await?
                            }
                            Err(_) => {
                                self.reply(&mut writer, "501 Bad recipient address").await?
                            }
                        }
                    }
                    None => self.reply(&mut writer, "501 Syntax: RCPT TO:<address>").await?,
                },
                "DATA" => {
                    if envelope.rcpts.is_empty() {
                        self.reply(&mut writer, "503 RCPT required before DATA").await?;
                        continue;
                    }
                    self.reply(&mut writer, "354 End data with <CR><LF>.<CR><LF>")
                        .await?;
                    match self.read_data(&mut reader).await? {
                        Some(raw) => {
                            self.accept_message(&envelope, raw, &mut writer).await?;
                            envelope = Envelope::default();
                        }
                        None => {
                            self.reply(&mut writer, "552 Message too large").await?;
                            envelope = Envelope::default();
                        }
                    }
                }
                "RSET" => {
                    envelope = Envelope::default();
                    self.reply(&mut writer, "250 OK").await?;
                }
                "NOOP" => self.reply(&mut writer, "250 OK").await?,
                "QUIT" => {
                    self.reply(&mut writer, "221 Bye").await?;
                    break;
                }
                _ => self.reply(&mut writer, "500 Command not recognized").await?,
            }

            // Finish the command in flight, then bow out.
            if self.shutdown.is_signaled() {
                self.reply(&mut writer, "421 Server shutting down").await?;
                break;
            }
        }
        debug!("smtp: session closed for {}", remote);
        Ok(())
    }
}

impl SmtpHandler {
    async fn reply<W: AsyncWriteExt + Unpin + Send>(&self, writer: &mut W, text: &str) -> Result<()> {
        if self.netdebug {
            trace!("smtp -> {}", text);
        }
        writer.write_all(text.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the DATA body up to the lone-dot terminator, undoing dot
    /// stuffing. `None` means the sender blew through the size cap.
    async fn read_data<R: AsyncBufReadExt + Unpin + Send>(
        &self,
        reader: &mut R,
    ) -> Result<Option<Vec<u8>>> {
        let mut raw: Vec<u8> = Vec::new();
        let mut line = String::new();
        let mut oversize = false;
        loop {
            line.clear();
            let n = tokio::time::timeout(self.idle_timeout, reader.read_line(&mut line))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "DATA timeout"))??;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Connection closed during DATA",
                )
                .into());
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "." {
                return Ok(if oversize { None } else { Some(raw) });
            }
            let content = trimmed.strip_prefix('.').unwrap_or(trimmed);
            if raw.len() + content.len() + 2 > MAX_MESSAGE_BYTES {
                // Keep consuming so the dialogue stays in sync.
                oversize = true;
                continue;
            }
            raw.extend_from_slice(content.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
    }

    async fn accept_message<W: AsyncWriteExt + Unpin + Send>(
        &self,
        envelope: &Envelope,
        raw: Vec<u8>,
        writer: &mut W,
    ) -> Result<()> {
        let mut stored = 0;
        for rcpt in &envelope.rcpts {
            match self
                .manager
                .deliver(rcpt, &envelope.from, raw.clone())
                .await
            {
                Ok(id) => {
                    info!("smtp: stored {} for {}", id, rcpt);
                    stored += 1;
                }
                Err(err) if matches!(err, crate::error::Error::Rejected(_)) => {
                    // Accepted on the wire, dropped on the floor.
                    debug!("smtp: discarded mail for {}: {}", rcpt, err);
                }
                Err(err) => {
                    warn!("smtp: delivery failed for {}: {}", rcpt, err);
                    self.reply(writer, "451 Failed to store message").await?;
                    return Ok(());
                }
            }
        }
        debug!(
            "smtp: message stored for {}/{} recipients",
            stored,
            envelope.rcpts.len()
        );
        self.reply(writer, "250 Message accepted").await?;
        Ok(())
    }
}

fn split_verb(input: &str) -> (String, &str) {
    match input.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (input.to_ascii_uppercase(), ""),
    }
}

/// Extract the address from a `MAIL FROM:<a@b>` / `RCPT TO:<a@b>` argument.
fn mail_path(arg: &str, keyword: &str) -> Option<String> {
    let arg = arg.trim();
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start().strip_prefix(':')?.trim();
    let rest = rest.strip_prefix('<').unwrap_or(rest);
    let rest = rest.strip_suffix('>').unwrap_or(rest);
    Some(rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_verb() {
        assert_eq!(split_verb("mail FROM:<a@b>").0, "MAIL");
        assert_eq!(split_verb("QUIT"), ("QUIT".to_string(), ""));
    }

    #[test]
    fn test_mail_path() {
        assert_eq!(
            mail_path("FROM:<alice@example.com>", "FROM"),
            Some("alice@example.com".to_string())
        );
        assert_eq!(
            mail_path("from: bob@example.com", "FROM"),
            Some("bob@example.com".to_string())
        );
        assert_eq!(mail_path("FROM <x@y>", "FROM"), None);
        assert_eq!(mail_path("TO:<>", "TO"), Some(String::new()));
    }
}
