//! On-disk mailbox storage
//!
//! Each mailbox lives in its own directory under a two-level hash fan-out:
//! `root/<hex2>/<sha256>/<name>/`, holding one `<id>.raw` file per message
//! plus an `index.bin` listing. All writes go through temp-and-rename so a
//! crash can only ever leave an orphaned raw file or a stale index, both of
//! which are reconciled on the next write to that mailbox.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::error::{Error, Result};
use crate::message::{Delivery, Metadata};
use crate::storage::lock::LockTable;
use crate::storage::{next_message_id, sort_listing, MailboxVisitor, Source, Store};

const INDEX_FILE: &str = "index.bin";
const INDEX_MAGIC: [u8; 4] = *b"MBIX";
const INDEX_VERSION: u16 = 1;
const RAW_EXT: &str = "raw";

pub struct FileStore {
    root: PathBuf,
    max_messages: usize,
    locks: LockTable,
}

impl FileStore {
    pub async fn new<P: AsRef<Path>>(root: P, max_messages: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            max_messages,
            locks: LockTable::new(),
        })
    }

    fn mailbox_dir(&self, mailbox: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(mailbox.as_bytes()));
        self.root
            .join(&digest[..2])
            .join(&digest)
            .join(dir_name(mailbox))
    }

    /// Read a mailbox listing. Caller holds at least the shared lock.
    /// A corrupt index is rebuilt from the directory but not rewritten here;
    /// persisting the repair needs the exclusive lock.
    async fn listing(&self, dir: &Path, mailbox: &str) -> Result<Vec<Metadata>> {
        let mut entries = match read_index(dir).await? {
            IndexState::Loaded(entries) => entries,
            IndexState::Missing => rebuild_from_dir(dir, mailbox).await?,
            IndexState::Corrupt => {
                warn!("Corrupt index for {:?}; rebuilding from directory", mailbox);
                rebuild_from_dir(dir, mailbox).await?
            }
        };
        sort_listing(&mut entries);
        Ok(entries)
    }

    /// Read a listing for mutation. Caller holds the exclusive lock.
    /// Reconciles the index against the directory: raw files the index does
    /// not know are adopted, entries whose raw file is gone are dropped, and
    /// stale temp files are cleaned up.
    async fn load_for_write(&self, dir: &Path, mailbox: &str) -> Result<Vec<Metadata>> {
        let mut entries = match read_index(dir).await? {
            IndexState::Loaded(entries) => entries,
            IndexState::Missing => Vec::new(),
            IndexState::Corrupt => {
                warn!("Corrupt index for {:?}; rebuilding from directory", mailbox);
                Vec::new()
            }
        };

        let mut dirents = match fs::read_dir(dir).await {
            Ok(d) => d,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(entries);
            }
            Err(err) => return Err(err.into()),
        };
        let mut on_disk = Vec::new();
        while let Some(dirent) = dirents.next_entry().await? {
            let path = dirent.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(RAW_EXT) => {
                    if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                        on_disk.push(id.to_string());
                    }
                }
                Some("tmp") => {
                    debug!("Removing stale temp file {:?}", path);
                    let _ = fs::remove_file(&path).await;
                }
                _ => {}
            }
        }

        entries.retain(|m| {
            let present = on_disk.contains(&m.id);
            if !present {
                warn!("Dropping index entry {} for {:?}: raw file missing", m.id, mailbox);
            }
            present
        });
        for id in on_disk {
            if !entries.iter().any(|m| m.id == id) {
                match adopt_orphan(dir, mailbox, &id).await {
                    Ok(meta) => {
                        warn!("Adopting orphaned message {} in {:?}", id, mailbox);
                        entries.push(meta);
                    }
                    Err(err) => {
                        warn!("Unlinking unreadable orphan {} in {:?}: {}", id, mailbox, err);
                        let _ = fs::remove_file(raw_path(dir, &id)).await;
                    }
                }
            }
        }

        sort_listing(&mut entries);
        Ok(entries)
    }

    async fn write_index(&self, dir: &Path, mailbox: &str, entries: &[Metadata]) -> Result<()> {
        let bytes = encode_index(mailbox, entries)?;
        write_atomic(&dir.join(INDEX_FILE), &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn add_message(&self, mut delivery: Delivery) -> Result<String> {
        let mailbox = delivery.meta.mailbox.clone();
        let dir = self.mailbox_dir(&mailbox);
        let _guard = self.locks.exclusive(&mailbox).await;

        fs::create_dir_all(&dir).await?;
        let mut entries = self.load_for_write(&dir, &mailbox).await?;

        let id = next_message_id(entries.last().map(|m| m.id.as_str()));
        delivery.meta.id = id.clone();
        delivery.meta.size = delivery.source.len() as u64;
        write_atomic(&raw_path(&dir, &id), &delivery.source).await?;
        entries.push(delivery.meta);
        sort_listing(&mut entries);

        if self.max_messages > 0 {
            while entries.len() > self.max_messages {
                let evicted = entries.remove(0);
                debug!("Evicting {} from {:?}: mailbox over cap", evicted.id, mailbox);
                if let Err(err) = fs::remove_file(raw_path(&dir, &evicted.id)).await {
                    warn!("Failed to remove evicted message {}: {}", evicted.id, err);
                }
            }
        }

        self.write_index(&dir, &mailbox, &entries).await?;
        Ok(id)
    }

    async fn get_message(&self, mailbox: &str, id: &str) -> Result<Metadata> {
        let dir = self.mailbox_dir(mailbox);
        let _guard = self.locks.shared(mailbox).await;
        self.listing(&dir, mailbox)
            .await?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("Message {} in {:?}", id, mailbox)))
    }

    async fn source(&self, mailbox: &str, id: &str) -> Result<Source> {
        if !valid_id(id) {
            return Err(Error::NotFound(format!("Message {} in {:?}", id, mailbox)));
        }
        let dir = self.mailbox_dir(mailbox);
        let _guard = self.locks.shared(mailbox).await;
        match fs::File::open(raw_path(&dir, id)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Message {} in {:?}", id, mailbox)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_messages(&self, mailbox: &str) -> Result<Vec<Metadata>> {
        let dir = self.mailbox_dir(mailbox);
        let _guard = self.locks.shared(mailbox).await;
        self.listing(&dir, mailbox).await
    }

    async fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        let dir = self.mailbox_dir(mailbox);
        let _guard = self.locks.exclusive(mailbox).await;
        let mut entries = self.load_for_write(&dir, mailbox).await?;
        let entry = entries
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("Message {} in {:?}", id, mailbox)))?;
        if !entry.seen {
            entry.seen = true;
            self.write_index(&dir, mailbox, &entries).await?;
        }
        Ok(())
    }

    async fn remove_message(&self, mailbox: &str, id: &str) -> Result<()> {
        let dir = self.mailbox_dir(mailbox);
        let _guard = self.locks.exclusive(mailbox).await;
        let mut entries = self.load_for_write(&dir, mailbox).await?;
        let pos = entries
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(format!("Message {} in {:?}", id, mailbox)))?;
        entries.remove(pos);
        // Index first, raw second: a crash here leaves an orphan raw file,
        // not an index entry pointing at nothing.
        self.write_index(&dir, mailbox, &entries).await?;
        if let Err(err) = fs::remove_file(raw_path(&dir, id)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove raw file for {}: {}", id, err);
            }
        }
        Ok(())
    }

    async fn purge_messages(&self, mailbox: &str) -> Result<()> {
        let dir = self.mailbox_dir(mailbox);
        let _guard = self.locks.exclusive(mailbox).await;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn visit_mailboxes(&self, visitor: &mut MailboxVisitor<'_>) -> Result<()> {
        for dir in mailbox_dirs(&self.root).await? {
            let name = match peek_mailbox_name(&dir).await {
                Some(name) => name,
                None => match dir.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                },
            };
            let listing = {
                let _guard = self.locks.shared(&name).await;
                self.listing(&dir, &name).await?
            };
            if !visitor(&name, listing) {
                return Ok(());
            }
            // Give writers a chance between mailboxes.
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn message_count(&self, mailbox: &str) -> Result<usize> {
        let dir = self.mailbox_dir(mailbox);
        let _guard = self.locks.shared(mailbox).await;
        Ok(self.listing(&dir, mailbox).await?.len())
    }
}

/// Ids are timestamp-dash-hex; anything else never names a raw file. This
/// also keeps caller-supplied ids from escaping the mailbox directory.
fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Filesystem-safe rendition of a mailbox name. Identity lives in the hash
/// directories above it; this component is for humans browsing the tree.
fn dir_name(mailbox: &str) -> String {
    let cleaned: String = mailbox
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._+-".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

fn raw_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.{}", id, RAW_EXT))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

enum IndexState {
    Loaded(Vec<Metadata>),
    Missing,
    Corrupt,
}

async fn read_index(dir: &Path) -> Result<IndexState> {
    match fs::read(dir.join(INDEX_FILE)).await {
        Ok(bytes) => Ok(match decode_index(&bytes) {
            Some((_, entries)) => IndexState::Loaded(entries),
            None => IndexState::Corrupt,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(IndexState::Missing),
        Err(err) => Err(err.into()),
    }
}

fn encode_index(mailbox: &str, entries: &[Metadata]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&INDEX_MAGIC);
    buf.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    buf.extend_from_slice(&(mailbox.len() as u32).to_le_bytes());
    buf.extend_from_slice(mailbox.as_bytes());
    for meta in entries {
        let record = serde_json::to_vec(meta)?;
        buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
        buf.extend_from_slice(&record);
    }
    Ok(buf)
}

/// Decode an index file into (mailbox name, entries). `None` means the file
/// is from another version or damaged, and the caller should rebuild.
fn decode_index(bytes: &[u8]) -> Option<(String, Vec<Metadata>)> {
    let rest = bytes.strip_prefix(&INDEX_MAGIC[..])?;
    let (version, rest) = split_u16(rest)?;
    if version != INDEX_VERSION {
        return None;
    }
    let (name, mut rest) = split_block(rest)?;
    let name = String::from_utf8(name.to_vec()).ok()?;
    let mut entries = Vec::new();
    while !rest.is_empty() {
        let (record, tail) = split_block(rest)?;
        entries.push(serde_json::from_slice(record).ok()?);
        rest = tail;
    }
    Some((name, entries))
}

fn split_u16(bytes: &[u8]) -> Option<(u16, &[u8])> {
    let (head, tail) = bytes.split_at_checked(2)?;
    Some((u16::from_le_bytes([head[0], head[1]]), tail))
}

fn split_block(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let (head, tail) = bytes.split_at_checked(4)?;
    let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
    tail.split_at_checked(len)
}

/// Reconstruct a listing from the raw files alone.
async fn rebuild_from_dir(dir: &Path, mailbox: &str) -> Result<Vec<Metadata>> {
    let mut entries = Vec::new();
    let mut dirents = match fs::read_dir(dir).await {
        Ok(d) => d,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(err) => return Err(err.into()),
    };
    while let Some(dirent) = dirents.next_entry().await? {
        let path = dirent.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RAW_EXT) {
            continue;
        }
        if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(meta) = adopt_orphan(dir, mailbox, id).await {
                entries.push(meta);
            }
        }
    }
    Ok(entries)
}

/// Derive metadata for a raw file the index does not know about.
async fn adopt_orphan(dir: &Path, mailbox: &str, id: &str) -> Result<Metadata> {
    let raw = fs::read(raw_path(dir, id)).await?;
    let mut meta = crate::message::parse_delivery(raw, mailbox).meta;
    meta.id = id.to_string();
    meta.date = id_timestamp(id).unwrap_or(meta.date);
    Ok(meta)
}

/// Recover the ingest time embedded in a message id.
fn id_timestamp(id: &str) -> Option<chrono::DateTime<Utc>> {
    let nanos: i64 = id.split('-').next()?.parse().ok()?;
    Some(Utc.timestamp_nanos(nanos))
}

/// Enumerate every mailbox directory under the fan-out tree.
async fn mailbox_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut fans = fs::read_dir(root).await?;
    while let Some(fan) = fans.next_entry().await? {
        if !fan.file_type().await?.is_dir() {
            continue;
        }
        let mut hashes = fs::read_dir(fan.path()).await?;
        while let Some(hash) = hashes.next_entry().await? {
            if !hash.file_type().await?.is_dir() {
                continue;
            }
            let mut boxes = fs::read_dir(hash.path()).await?;
            while let Some(mbox) = boxes.next_entry().await? {
                if mbox.file_type().await?.is_dir() {
                    found.push(mbox.path());
                }
            }
        }
    }
    Ok(found)
}

/// Canonical mailbox name from the index header, if readable.
async fn peek_mailbox_name(dir: &Path) -> Option<String> {
    let bytes = fs::read(dir.join(INDEX_FILE)).await.ok()?;
    decode_index(&bytes).map(|(name, _)| name)
}
