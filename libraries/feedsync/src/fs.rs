//! A [`StoreProvider`] backed by a directory. Every store is one append-only file of framed records:
//!
//! ```text
//! header:  b"FEEDSLOG" | version: u32 le
//! record:  len: u32 le | seq: u64 le | key_len: u32 le | key | payload_len: u32 le | payload (json)
//! ```
//!
//! Keyed stores replay their records with last-write-wins per key, counters take the largest value
//! ever written, and event logs are the records themselves. A record is only visible once its full
//! length has been written, so a crash mid-append leaves a torn tail that is ignored on load and cut
//! off before the next append. Appends take a `<file>.lock` sibling first, so writers in any number
//! of handles or processes land one after another.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::data_model::{EntryHash, Link, LogEntry, StoreKind};
use crate::store::{
    Counter, EventLog, Handle, KeyedStore, Predicate, Replica, StoreError, StoreProvider,
};

const STORE_LOG_MAGIC: &[u8] = b"FEEDSLOG";
const STORE_LOG_VERSION: u32 = 1;
const STORE_LOG_HEADER_LEN: usize = STORE_LOG_MAGIC.len() + 4;
const RECORD_MIN_LEN: usize = std::mem::size_of::<u64>() + 2 * std::mem::size_of::<u32>();
const COUNTER_KEY: &str = "inc";

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub seq: u64,
    pub key: String,
    pub payload: serde_json::Value,
}

/// The readable part of a store file.
#[derive(Debug, Default)]
pub struct ParsedLog {
    pub records: Vec<LogRecord>,
    /// Bytes up to the end of the last fully written record. Anything after is a torn append.
    pub valid_len: usize,
    /// Records that were fully framed but could not be decoded.
    pub skipped: usize,
}

#[derive(Clone, Debug)]
pub struct FsProvider {
    root: PathBuf,
}

impl FsProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the store behind `link` lives, if `link` is well formed.
    pub fn path_for(&self, link: &Link) -> Option<PathBuf> {
        let (kind, name) = link.parts()?;
        Some(
            self.root
                .join(kind.as_str())
                .join(format!("{}.log", encode_name(name))),
        )
    }

    async fn existing_file(&self, link: &Link, kind: StoreKind) -> Result<StoreFile, StoreError> {
        let path = match link.parts() {
            Some((link_kind, _)) if link_kind == kind => self.path_for(link),
            _ => None,
        }
        .ok_or_else(|| StoreError::NotFound(link.clone()))?;

        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(link.clone()));
        }
        Ok(StoreFile {
            link: link.clone(),
            path,
        })
    }

    async fn create(&self, link: Link) -> Result<Link, StoreError> {
        let path = self
            .path_for(&link)
            .ok_or_else(|| StoreError::NotFound(link.clone()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        if file.metadata().await?.len() == 0 {
            file.write_all(&store_log_header_bytes()).await?;
            file.sync_data().await?;
        }
        Ok(link)
    }
}

#[async_trait]
impl StoreProvider for FsProvider {
    type EventLog = FsEventLog;
    type KeyedStore = FsKeyedStore;
    type Counter = FsCounter;

    async fn open_event_log(&self, name: &str) -> Result<FsEventLog, StoreError> {
        let link = self.create_event_log(name).await?;
        Ok(FsEventLog {
            file: self.existing_file(&link, StoreKind::EventLog).await?,
            replica: Replica::Unloaded,
        })
    }

    async fn open_keyed_store(&self, link: &Link) -> Result<FsKeyedStore, StoreError> {
        Ok(FsKeyedStore {
            file: self.existing_file(link, StoreKind::Keyed).await?,
            replica: Replica::Unloaded,
        })
    }

    async fn open_counter(&self, link: &Link) -> Result<FsCounter, StoreError> {
        Ok(FsCounter {
            file: self.existing_file(link, StoreKind::Counter).await?,
            replica: Replica::Unloaded,
        })
    }

    async fn create_keyed_store(&self, name: &str) -> Result<Link, StoreError> {
        self.create(Link::keyed(name)).await
    }

    async fn create_counter(&self, name: &str) -> Result<Link, StoreError> {
        self.create(Link::counter(name)).await
    }

    async fn create_event_log(&self, name: &str) -> Result<Link, StoreError> {
        self.create(Link::event_log(name)).await
    }
}

/// File names keep ascii alphanumerics and `-`; every other byte becomes `_xx`.
fn encode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{byte:02x}"));
        }
    }
    encoded
}

#[derive(Debug)]
struct StoreFile {
    link: Link,
    path: PathBuf,
}

impl StoreFile {
    async fn read(&self) -> Result<ParsedLog, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.link.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let parsed = self.parse(&bytes)?;
        if parsed.valid_len < bytes.len() {
            log::warn!(
                "Store {} has {} trailing bytes from an interrupted append",
                self.link,
                bytes.len() - parsed.valid_len
            );
        }
        Ok(parsed)
    }

    fn parse(&self, bytes: &[u8]) -> Result<ParsedLog, StoreError> {
        parse_log_records(bytes).map_err(|reason| StoreError::Corrupt {
            link: self.link.clone(),
            reason,
        })
    }

    /// Append whatever `build` makes of the file as it stands, with the store locked against every
    /// other writer in between. Returns the file as it was before the append, and `build`'s value.
    ///
    /// Only bytes past the last complete record are cut off; records other writers appended since
    /// this handle loaded are kept.
    async fn append_with<T, F>(&self, build: F) -> Result<(ParsedLog, T), StoreError>
    where
        F: FnOnce(&ParsedLog) -> Result<(Vec<LogRecord>, T), StoreError> + Send,
        T: Send,
    {
        let _lock = AppendLock::acquire(&self.path, &self.link).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        let mut existing = Vec::new();
        file.read_to_end(&mut existing).await?;

        let parsed = if existing.len() < STORE_LOG_HEADER_LEN {
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(&store_log_header_bytes()).await?;
            ParsedLog {
                valid_len: STORE_LOG_HEADER_LEN,
                ..ParsedLog::default()
            }
        } else {
            self.parse(&existing)?
        };
        if parsed.valid_len < existing.len() {
            log::warn!(
                "Cutting {} torn bytes off the end of {}",
                existing.len() - parsed.valid_len,
                self.link
            );
            file.set_len(parsed.valid_len as u64).await?;
        }

        let (records, value) = build(&parsed)?;
        let mut bytes = Vec::new();
        for record in &records {
            let encoded = encode_log_record(record).map_err(|reason| StoreError::Corrupt {
                link: self.link.clone(),
                reason,
            })?;
            bytes.extend_from_slice(&encoded);
        }

        file.seek(SeekFrom::Start(parsed.valid_len as u64)).await?;
        file.write_all(&bytes).await?;
        file.sync_data().await?;
        Ok((parsed, value))
    }
}

/// Exclusive right to append to one store file, held as a `<file>.lock` sibling that only one
/// writer at a time can create. Removed again on drop.
struct AppendLock {
    path: PathBuf,
}

impl AppendLock {
    const RETRY_EVERY: Duration = Duration::from_millis(5);
    /// A lock this old was left behind by a writer that died holding it.
    const STALE_AFTER: Duration = Duration::from_secs(30);

    async fn acquire(store_path: &Path, link: &Link) -> Result<Self, StoreError> {
        let mut path = store_path.as_os_str().to_owned();
        path.push(".lock");
        let path = PathBuf::from(path);

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path).await {
                        log::warn!("Breaking stale append lock on {link}");
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    tokio::time::sleep(Self::RETRY_EVERY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn is_stale(path: &Path) -> bool {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return false;
        };
        metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > Self::STALE_AFTER)
    }
}

impl Drop for AppendLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn store_log_header_bytes() -> Vec<u8> {
    let mut header = Vec::with_capacity(STORE_LOG_HEADER_LEN);
    header.extend_from_slice(STORE_LOG_MAGIC);
    header.extend_from_slice(&STORE_LOG_VERSION.to_le_bytes());
    header
}

pub fn encode_log_record(record: &LogRecord) -> Result<Vec<u8>, String> {
    let payload = serde_json::to_vec(&record.payload)
        .map_err(|e| format!("failed to serialize record {}: {e}", record.key))?;
    let key_bytes = record.key.as_bytes();

    let key_len = u32::try_from(key_bytes.len())
        .map_err(|_| format!("key too long to encode ({} bytes)", key_bytes.len()))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| format!("payload too large to encode ({} bytes)", payload.len()))?;

    let body_len = RECORD_MIN_LEN + key_bytes.len() + payload.len();
    let record_len = u32::try_from(body_len)
        .map_err(|_| format!("record too large to encode ({body_len} bytes)"))?;

    let mut buffer = Vec::with_capacity(std::mem::size_of::<u32>() + body_len);
    buffer.extend_from_slice(&record_len.to_le_bytes());
    buffer.extend_from_slice(&record.seq.to_le_bytes());
    buffer.extend_from_slice(&key_len.to_le_bytes());
    buffer.extend_from_slice(key_bytes);
    buffer.extend_from_slice(&payload_len.to_le_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let slice = bytes.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes(slice.try_into().ok()?))
}

/// Parse a whole store file. Fails only if the header is wrong; unreadable records are skipped.
pub fn parse_log_records(bytes: &[u8]) -> Result<ParsedLog, String> {
    if bytes.is_empty() {
        return Ok(ParsedLog::default());
    }
    if bytes.len() < STORE_LOG_HEADER_LEN {
        return Err(format!("header too small ({} bytes)", bytes.len()));
    }
    if !bytes.starts_with(STORE_LOG_MAGIC) {
        return Err("magic bytes did not match".to_string());
    }
    let version = read_u32(bytes, STORE_LOG_MAGIC.len()).unwrap_or_default();
    if version != STORE_LOG_VERSION {
        return Err(format!("unsupported store log version {version}"));
    }

    let mut parsed = ParsedLog {
        valid_len: STORE_LOG_HEADER_LEN,
        ..ParsedLog::default()
    };
    let mut offset = STORE_LOG_HEADER_LEN;

    while offset < bytes.len() {
        let Some(record_len) = read_u32(bytes, offset) else {
            break;
        };
        let body_start = offset + std::mem::size_of::<u32>();
        let record_end = body_start + record_len as usize;
        if record_end > bytes.len() {
            break;
        }
        offset = record_end;
        parsed.valid_len = record_end;

        match decode_record_body(&bytes[body_start..record_end]) {
            Ok(record) => parsed.records.push(record),
            Err(reason) => {
                log::warn!("Skipping unreadable store record: {reason}");
                parsed.skipped += 1;
            }
        }
    }

    Ok(parsed)
}

fn decode_record_body(body: &[u8]) -> Result<LogRecord, String> {
    if body.len() < RECORD_MIN_LEN {
        return Err(format!("record too small ({} bytes)", body.len()));
    }
    let mut offset = 0;

    let seq = read_u64(body, offset).ok_or("missing sequence number")?;
    offset += std::mem::size_of::<u64>();

    let key_len = read_u32(body, offset).ok_or("missing key length")? as usize;
    offset += std::mem::size_of::<u32>();
    let key_bytes = body
        .get(offset..offset + key_len)
        .ok_or_else(|| format!("key length {key_len} exceeds record bounds"))?;
    offset += key_len;

    let payload_len = read_u32(body, offset).ok_or("missing payload length")? as usize;
    offset += std::mem::size_of::<u32>();
    let payload_bytes = body
        .get(offset..offset + payload_len)
        .ok_or_else(|| format!("payload length {payload_len} exceeds record bounds"))?;
    // Bytes after the payload are reserved for later versions and ignored.

    let key = String::from_utf8(key_bytes.to_vec())
        .map_err(|e| format!("key was not valid UTF-8: {e}"))?;
    let payload = serde_json::from_slice(payload_bytes)
        .map_err(|e| format!("failed to deserialize payload of {key}: {e}"))?;

    Ok(LogRecord { seq, key, payload })
}

pub struct FsKeyedStore {
    file: StoreFile,
    replica: Replica<im::OrdMap<String, serde_json::Value>>,
}

fn keyed_records<'a>(
    records: impl IntoIterator<Item = &'a LogRecord>,
) -> im::OrdMap<String, serde_json::Value> {
    let mut latest = im::OrdMap::new();
    for record in records {
        latest.insert(record.key.clone(), record.payload.clone());
    }
    latest
}

#[async_trait]
impl Handle for FsKeyedStore {
    fn link(&self) -> &Link {
        &self.file.link
    }

    async fn load(&mut self) -> Result<(), StoreError> {
        if self.replica.is_closed() {
            return Err(StoreError::Closed(self.file.link.clone()));
        }
        let parsed = self.file.read().await?;
        self.replica = Replica::Loaded(keyed_records(&parsed.records));
        Ok(())
    }

    fn close(&mut self) {
        self.replica = Replica::Closed;
    }
}

#[async_trait]
impl KeyedStore for FsKeyedStore {
    async fn put(&mut self, key: &str, record: serde_json::Value) -> Result<(), StoreError> {
        self.replica.ensure_open(&self.file.link)?;
        let (parsed, written) = self
            .file
            .append_with(|parsed| {
                let written = LogRecord {
                    seq: parsed.records.last().map(|r| r.seq + 1).unwrap_or(0),
                    key: key.to_string(),
                    payload: record,
                };
                Ok((vec![written.clone()], written))
            })
            .await?;
        // Pick up whatever other handles wrote since our load.
        self.replica = Replica::Loaded(keyed_records(
            parsed.records.iter().chain(std::iter::once(&written)),
        ));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        Ok(self
            .replica
            .get(&self.file.link)?
            .get(key)
            .cloned()
            .into_iter()
            .collect())
    }

    async fn query(&self, predicate: &Predicate) -> Result<Vec<serde_json::Value>, StoreError> {
        Ok(self
            .replica
            .get(&self.file.link)?
            .iter()
            .filter(|(key, value)| predicate(key.as_str(), value))
            .map(|(_, value)| value.clone())
            .collect())
    }
}

pub struct FsCounter {
    file: StoreFile,
    replica: Replica<u64>,
}

fn counter_value(parsed: &ParsedLog) -> u64 {
    parsed
        .records
        .iter()
        .filter(|record| record.key == COUNTER_KEY)
        .filter_map(|record| record.payload.as_u64())
        .max()
        .unwrap_or(0)
}

#[async_trait]
impl Handle for FsCounter {
    fn link(&self) -> &Link {
        &self.file.link
    }

    async fn load(&mut self) -> Result<(), StoreError> {
        if self.replica.is_closed() {
            return Err(StoreError::Closed(self.file.link.clone()));
        }
        let parsed = self.file.read().await?;
        self.replica = Replica::Loaded(counter_value(&parsed));
        Ok(())
    }

    fn close(&mut self) {
        self.replica = Replica::Closed;
    }
}

#[async_trait]
impl Counter for FsCounter {
    fn value(&self) -> Result<u64, StoreError> {
        self.replica.get(&self.file.link).copied()
    }

    async fn inc(&mut self) -> Result<u64, StoreError> {
        self.replica.ensure_open(&self.file.link)?;
        let (_, value) = self
            .file
            .append_with(|parsed| {
                let value = counter_value(parsed) + 1;
                let record = LogRecord {
                    seq: parsed.records.last().map(|r| r.seq + 1).unwrap_or(0),
                    key: COUNTER_KEY.to_string(),
                    payload: serde_json::Value::from(value),
                };
                Ok((vec![record], value))
            })
            .await?;
        self.replica = Replica::Loaded(value);
        Ok(value)
    }
}

pub struct FsEventLog {
    file: StoreFile,
    replica: Replica<im::Vector<LogEntry>>,
}

fn log_entries(
    link: &Link,
    records: impl IntoIterator<Item = LogRecord>,
) -> Result<im::Vector<LogEntry>, StoreError> {
    let mut entries = im::Vector::new();
    for record in records {
        let expected = entries.len() as u64;
        if record.seq != expected {
            log::warn!(
                "Event log {link} out of sequence: expected {expected}, found {}",
                record.seq
            );
        }
        entries.push_back(LogEntry {
            seq: expected,
            hash: serde_json::from_value(serde_json::Value::String(record.key))?,
            payload: record.payload,
        });
    }
    Ok(entries)
}

#[async_trait]
impl Handle for FsEventLog {
    fn link(&self) -> &Link {
        &self.file.link
    }

    async fn load(&mut self) -> Result<(), StoreError> {
        if self.replica.is_closed() {
            return Err(StoreError::Closed(self.file.link.clone()));
        }
        let parsed = self.file.read().await?;
        self.replica = Replica::Loaded(log_entries(&self.file.link, parsed.records)?);
        Ok(())
    }

    fn close(&mut self) {
        self.replica = Replica::Closed;
    }
}

#[async_trait]
impl EventLog for FsEventLog {
    async fn append(&mut self, payload: serde_json::Value) -> Result<EntryHash, StoreError> {
        self.replica.ensure_open(&self.file.link)?;
        let payload_bytes = serde_json::to_vec(&payload)?;
        let link = self.file.link.clone();
        // Chain onto the file's last entry, which may be newer than our replica's.
        let (_, (entries, hash)) = self
            .file
            .append_with(|parsed| {
                let mut entries = log_entries(&link, parsed.records.iter().cloned())?;
                let hash = EntryHash::chain(entries.last().map(|e| &e.hash), &payload_bytes);
                let record = LogRecord {
                    seq: entries.len() as u64,
                    key: hash.as_str().to_string(),
                    payload: payload.clone(),
                };
                entries.push_back(LogEntry {
                    seq: record.seq,
                    hash: hash.clone(),
                    payload,
                });
                Ok((vec![record], (entries, hash)))
            })
            .await?;
        self.replica = Replica::Loaded(entries);
        Ok(hash)
    }

    fn entries(&self) -> Result<im::Vector<LogEntry>, StoreError> {
        self.replica.get(&self.file.link).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{open_counter, open_event_log, open_keyed_store};

    #[test]
    fn names_are_encoded_into_flat_file_names() {
        assert_eq!(encode_name("alice/spaces-1"), "alice_2fspaces-1");
        assert_eq!(encode_name("../x"), "_2e_2e_2fx");
    }

    #[tokio::test]
    async fn keyed_store_survives_reopen_with_last_write_winning() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path());
        let link = provider.create_keyed_store("alice/spaces").await.unwrap();

        {
            let mut store = open_keyed_store(&provider, &link).await.unwrap();
            store.put("1", serde_json::json!({ "v": 1 })).await.unwrap();
            store.put("2", serde_json::json!({ "v": 2 })).await.unwrap();
            store.put("1", serde_json::json!({ "v": 3 })).await.unwrap();
        }

        let store = open_keyed_store(&provider, &link).await.unwrap();
        assert_eq!(
            store.get("1").await.unwrap(),
            vec![serde_json::json!({ "v": 3 })]
        );
        let all = store
            .query(&|_: &str, _: &serde_json::Value| true)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn counters_persist_and_never_go_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path());
        let link = provider.create_counter("alice/next-id").await.unwrap();

        let mut first = open_counter(&provider, &link).await.unwrap();
        let mut second = open_counter(&provider, &link).await.unwrap();
        assert_eq!(first.inc().await.unwrap(), 1);
        assert_eq!(second.inc().await.unwrap(), 2);
        assert_eq!(first.inc().await.unwrap(), 3);

        let reopened = open_counter(&provider, &link).await.unwrap();
        assert_eq!(reopened.value().unwrap(), 3);
    }

    #[tokio::test]
    async fn puts_from_two_loaded_handles_both_survive() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path());
        let link = provider.create_keyed_store("alice/x").await.unwrap();

        let mut a = open_keyed_store(&provider, &link).await.unwrap();
        let mut b = open_keyed_store(&provider, &link).await.unwrap();
        a.put("key1", serde_json::json!(1)).await.unwrap();
        b.put("key2", serde_json::json!(2)).await.unwrap();

        // b saw a's write when it appended.
        assert_eq!(b.get("key1").await.unwrap(), vec![serde_json::json!(1)]);

        let reopened = open_keyed_store(&provider, &link).await.unwrap();
        assert_eq!(reopened.get("key1").await.unwrap(), vec![serde_json::json!(1)]);
        assert_eq!(reopened.get("key2").await.unwrap(), vec![serde_json::json!(2)]);

        let bytes = std::fs::read(provider.path_for(&link).unwrap()).unwrap();
        let seqs: Vec<_> = parse_log_records(&bytes)
            .unwrap()
            .records
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn appends_from_two_loaded_logs_keep_one_chain() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path());

        let mut a = open_event_log(&provider, "alice/feed").await.unwrap();
        let mut b = open_event_log(&provider, "alice/feed").await.unwrap();
        let first = a.append(serde_json::json!("a")).await.unwrap();
        let second = b.append(serde_json::json!("b")).await.unwrap();
        assert_eq!(
            second,
            EntryHash::chain(Some(&first), &serde_json::to_vec(&serde_json::json!("b")).unwrap())
        );

        let reopened = open_event_log(&provider, "alice/feed").await.unwrap();
        let entries = reopened.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].hash, first);
        assert_eq!(entries[1].hash, second);
        assert_eq!(entries[1].seq, 1);
        assert_eq!(b.entries().unwrap(), entries);
    }

    #[tokio::test]
    async fn concurrent_puts_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path());
        let link = provider.create_keyed_store("alice/x").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let provider = provider.clone();
            let link = link.clone();
            tasks.push(tokio::spawn(async move {
                let mut store = open_keyed_store(&provider, &link).await.unwrap();
                store.put(&format!("k{i}"), serde_json::json!(i)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let store = open_keyed_store(&provider, &link).await.unwrap();
        let all = store
            .query(&|_: &str, _: &serde_json::Value| true)
            .await
            .unwrap();
        assert_eq!(all.len(), 8);

        let mut lock = provider.path_for(&link).unwrap().into_os_string();
        lock.push(".lock");
        assert!(!std::path::Path::new(&lock).exists());
    }

    #[tokio::test]
    async fn missing_and_mistyped_links_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path());
        let counter = provider.create_counter("c").await.unwrap();

        assert!(matches!(
            provider.open_keyed_store(&counter).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            provider.open_counter(&Link::counter("other")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn torn_appends_are_ignored_then_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path());

        {
            let mut log = open_event_log(&provider, "feed").await.unwrap();
            log.append(serde_json::json!("first")).await.unwrap();
        }

        // Simulate a crash halfway through writing a second record.
        let path = provider.path_for(&Link::event_log("feed")).unwrap();
        let partial = encode_log_record(&LogRecord {
            seq: 1,
            key: "0000000000000000".to_string(),
            payload: serde_json::json!("second"),
        })
        .unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&partial[..partial.len() / 2]);
        std::fs::write(&path, &bytes).unwrap();

        let mut log = open_event_log(&provider, "feed").await.unwrap();
        assert_eq!(log.entries().unwrap().len(), 1);
        log.append(serde_json::json!("third")).await.unwrap();

        let log = open_event_log(&provider, "feed").await.unwrap();
        let payloads: Vec<_> = log
            .entries()
            .unwrap()
            .into_iter()
            .map(|entry| entry.payload)
            .collect();
        assert_eq!(
            payloads,
            vec![serde_json::json!("first"), serde_json::json!("third")]
        );
    }

    #[test]
    fn bad_headers_are_corrupt_rather_than_empty() {
        assert!(parse_log_records(b"").unwrap().records.is_empty());
        assert!(parse_log_records(b"NOTALOG!\x01\x00\x00\x00").is_err());
        assert!(parse_log_records(b"FEED").is_err());
    }

    #[test]
    fn undecodable_records_are_skipped() {
        let mut bytes = store_log_header_bytes();
        // A well-framed record whose body is too small to hold anything.
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(
            &encode_log_record(&LogRecord {
                seq: 0,
                key: "k".to_string(),
                payload: serde_json::json!(true),
            })
            .unwrap(),
        );

        let parsed = parse_log_records(&bytes).unwrap();
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.valid_len, bytes.len());
    }
}
