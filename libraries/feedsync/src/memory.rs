//! An in-process [`StoreProvider`]. Every handle is a replica of state shared through the provider,
//! so handles opened from clones of the same provider see each other's writes after `load`.
//!
//! The provider also counts the operations issued against it and can be told to fail or stall
//! specific ones, which is how the engine's failure handling is exercised.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::data_model::{EntryHash, Link, LogEntry};
use crate::store::{
    Counter, EventLog, Handle, KeyedStore, Predicate, Replica, StoreError, StoreProvider,
};

/// Operations to fail on purpose.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    pub fail_open: HashSet<Link>,
    pub fail_load: HashSet<Link>,
    /// Loads of these links never complete.
    pub stall_load: HashSet<Link>,
    pub fail_query: HashSet<Link>,
    pub fail_put: HashSet<Link>,
    /// Number of appends that still succeed before every further append fails.
    pub append_budget: Option<usize>,
}

/// Counts of operations issued so far.
#[derive(Clone, Debug, Default)]
pub struct OpStats {
    pub opened: usize,
    pub closed: usize,
    pub queries: HashMap<Link, usize>,
    pub puts: HashMap<Link, usize>,
    pub appends: usize,
}

impl OpStats {
    /// Handles that were opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.opened.saturating_sub(self.closed)
    }

    pub fn queries_against(&self, link: &Link) -> usize {
        self.queries.get(link).copied().unwrap_or(0)
    }

    pub fn puts_against(&self, link: &Link) -> usize {
        self.puts.get(link).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct Shared {
    keyed: HashMap<Link, im::OrdMap<String, serde_json::Value>>,
    counters: HashMap<Link, u64>,
    logs: HashMap<Link, im::Vector<LogEntry>>,
    faults: Faults,
    stats: OpStats,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Default)]
pub struct MemoryProvider {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> OpStats {
        lock(&self.shared).stats.clone()
    }

    pub fn inject_faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut lock(&self.shared).faults);
    }

    pub fn clear_faults(&self) {
        lock(&self.shared).faults = Faults::default();
    }

    fn opened(&self, link: &Link) -> Result<(), StoreError> {
        let mut shared = lock(&self.shared);
        if shared.faults.fail_open.contains(link) {
            return Err(StoreError::Unavailable(format!("could not reach {link}")));
        }
        shared.stats.opened += 1;
        Ok(())
    }
}

#[async_trait]
impl StoreProvider for MemoryProvider {
    type EventLog = MemoryEventLog;
    type KeyedStore = MemoryKeyedStore;
    type Counter = MemoryCounter;

    async fn open_event_log(&self, name: &str) -> Result<MemoryEventLog, StoreError> {
        let link = self.create_event_log(name).await?;
        self.opened(&link)?;
        Ok(MemoryEventLog {
            link,
            shared: self.shared.clone(),
            replica: Replica::Unloaded,
        })
    }

    async fn open_keyed_store(&self, link: &Link) -> Result<MemoryKeyedStore, StoreError> {
        if !lock(&self.shared).keyed.contains_key(link) {
            return Err(StoreError::NotFound(link.clone()));
        }
        self.opened(link)?;
        Ok(MemoryKeyedStore {
            link: link.clone(),
            shared: self.shared.clone(),
            replica: Replica::Unloaded,
        })
    }

    async fn open_counter(&self, link: &Link) -> Result<MemoryCounter, StoreError> {
        if !lock(&self.shared).counters.contains_key(link) {
            return Err(StoreError::NotFound(link.clone()));
        }
        self.opened(link)?;
        Ok(MemoryCounter {
            link: link.clone(),
            shared: self.shared.clone(),
            replica: Replica::Unloaded,
        })
    }

    async fn create_keyed_store(&self, name: &str) -> Result<Link, StoreError> {
        let link = Link::keyed(name);
        lock(&self.shared).keyed.entry(link.clone()).or_default();
        Ok(link)
    }

    async fn create_counter(&self, name: &str) -> Result<Link, StoreError> {
        let link = Link::counter(name);
        lock(&self.shared).counters.entry(link.clone()).or_default();
        Ok(link)
    }

    async fn create_event_log(&self, name: &str) -> Result<Link, StoreError> {
        let link = Link::event_log(name);
        lock(&self.shared).logs.entry(link.clone()).or_default();
        Ok(link)
    }
}

/// Shared by every handle kind: apply load faults, then pull a fresh copy out of the shared state.
async fn load_replica<T>(
    shared: &Mutex<Shared>,
    link: &Link,
    replica: &mut Replica<T>,
    copy: impl FnOnce(&Shared) -> Option<T>,
) -> Result<(), StoreError> {
    if replica.is_closed() {
        return Err(StoreError::Closed(link.clone()));
    }
    let stall = {
        let shared = lock(shared);
        if shared.faults.fail_load.contains(link) {
            return Err(StoreError::Unavailable(format!("could not load {link}")));
        }
        shared.faults.stall_load.contains(link)
    };
    if stall {
        std::future::pending::<()>().await;
    }
    let copied = copy(&*lock(shared)).ok_or_else(|| StoreError::NotFound(link.clone()))?;
    *replica = Replica::Loaded(copied);
    Ok(())
}

fn close_replica<T>(shared: &Mutex<Shared>, replica: &mut Replica<T>) {
    if replica.is_closed() {
        return;
    }
    *replica = Replica::Closed;
    lock(shared).stats.closed += 1;
}

pub struct MemoryKeyedStore {
    link: Link,
    shared: Arc<Mutex<Shared>>,
    replica: Replica<im::OrdMap<String, serde_json::Value>>,
}

#[async_trait]
impl Handle for MemoryKeyedStore {
    fn link(&self) -> &Link {
        &self.link
    }

    async fn load(&mut self) -> Result<(), StoreError> {
        let link = self.link.clone();
        load_replica(&self.shared, &link, &mut self.replica, |shared| {
            shared.keyed.get(&link).cloned()
        })
        .await
    }

    fn close(&mut self) {
        close_replica(&self.shared, &mut self.replica);
    }
}

#[async_trait]
impl KeyedStore for MemoryKeyedStore {
    async fn put(&mut self, key: &str, record: serde_json::Value) -> Result<(), StoreError> {
        self.replica.ensure_open(&self.link)?;
        let updated = {
            let mut shared = lock(&self.shared);
            *shared.stats.puts.entry(self.link.clone()).or_default() += 1;
            if shared.faults.fail_put.contains(&self.link) {
                return Err(StoreError::Unavailable(format!("could not write to {}", self.link)));
            }
            let store = shared.keyed.entry(self.link.clone()).or_default();
            store.insert(key.to_string(), record);
            store.clone()
        };
        self.replica = Replica::Loaded(updated);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        Ok(self
            .replica
            .get(&self.link)?
            .get(key)
            .cloned()
            .into_iter()
            .collect())
    }

    async fn query(&self, predicate: &Predicate) -> Result<Vec<serde_json::Value>, StoreError> {
        let records = self.replica.get(&self.link)?;
        {
            let mut shared = lock(&self.shared);
            *shared.stats.queries.entry(self.link.clone()).or_default() += 1;
            if shared.faults.fail_query.contains(&self.link) {
                return Err(StoreError::Unavailable(format!("query against {} failed", self.link)));
            }
        }
        Ok(records
            .iter()
            .filter(|(key, value)| predicate(key.as_str(), value))
            .map(|(_, value)| value.clone())
            .collect())
    }
}

impl Drop for MemoryKeyedStore {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct MemoryCounter {
    link: Link,
    shared: Arc<Mutex<Shared>>,
    replica: Replica<u64>,
}

#[async_trait]
impl Handle for MemoryCounter {
    fn link(&self) -> &Link {
        &self.link
    }

    async fn load(&mut self) -> Result<(), StoreError> {
        let link = self.link.clone();
        load_replica(&self.shared, &link, &mut self.replica, |shared| {
            shared.counters.get(&link).copied()
        })
        .await
    }

    fn close(&mut self) {
        close_replica(&self.shared, &mut self.replica);
    }
}

#[async_trait]
impl Counter for MemoryCounter {
    fn value(&self) -> Result<u64, StoreError> {
        self.replica.get(&self.link).copied()
    }

    async fn inc(&mut self) -> Result<u64, StoreError> {
        self.replica.ensure_open(&self.link)?;
        let value = {
            let mut shared = lock(&self.shared);
            let value = shared.counters.entry(self.link.clone()).or_default();
            *value += 1;
            *value
        };
        self.replica = Replica::Loaded(value);
        Ok(value)
    }
}

impl Drop for MemoryCounter {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct MemoryEventLog {
    link: Link,
    shared: Arc<Mutex<Shared>>,
    replica: Replica<im::Vector<LogEntry>>,
}

#[async_trait]
impl Handle for MemoryEventLog {
    fn link(&self) -> &Link {
        &self.link
    }

    async fn load(&mut self) -> Result<(), StoreError> {
        let link = self.link.clone();
        load_replica(&self.shared, &link, &mut self.replica, |shared| {
            shared.logs.get(&link).cloned()
        })
        .await
    }

    fn close(&mut self) {
        close_replica(&self.shared, &mut self.replica);
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&mut self, payload: serde_json::Value) -> Result<EntryHash, StoreError> {
        self.replica.ensure_open(&self.link)?;
        let bytes = serde_json::to_vec(&payload)?;
        let (hash, log) = {
            let mut shared = lock(&self.shared);
            if let Some(budget) = shared.faults.append_budget.as_mut() {
                if *budget == 0 {
                    return Err(StoreError::Unavailable(format!(
                        "append to {} failed",
                        self.link
                    )));
                }
                *budget -= 1;
            }
            shared.stats.appends += 1;
            let log = shared.logs.entry(self.link.clone()).or_default();
            let hash = EntryHash::chain(log.last().map(|entry| &entry.hash), &bytes);
            log.push_back(LogEntry {
                seq: log.len() as u64,
                hash: hash.clone(),
                payload,
            });
            (hash, log.clone())
        };
        self.replica = Replica::Loaded(log);
        Ok(hash)
    }

    fn entries(&self) -> Result<im::Vector<LogEntry>, StoreError> {
        self.replica.get(&self.link).cloned()
    }
}

impl Drop for MemoryEventLog {
    fn drop(&mut self) {
        self.close();
    }
}
