//! The capabilities the feed needs from whatever actually stores logs, keyed records and counters.
//!
//! Every handle has to be loaded before it can be read: `load` catches the local replica up with the
//! store. Handles are released with `close`. [`Opened`] ties the two together so a loaded handle is
//! always closed, whichever way the scope that opened it is left.

use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::data_model::{EntryHash, Link, LogEntry, Owner};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No store exists at {0}")]
    NotFound(Link),

    #[error("Store {0} was read before it finished loading")]
    NotLoaded(Link),

    #[error("Store {0} is closed")]
    Closed(Link),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store {link} is corrupt: {reason}")]
    Corrupt { link: Link, reason: String },
}

/// Matches records by key (full path) and value.
pub type Predicate = dyn Fn(&str, &serde_json::Value) -> bool + Send + Sync;

#[async_trait]
pub trait Handle: Send + Sync {
    fn link(&self) -> &Link;

    /// Bring the local replica up to date. Must finish before anything is read.
    async fn load(&mut self) -> Result<(), StoreError>;

    /// Release the local replica. Idempotent.
    fn close(&mut self);
}

/// Records addressed by stable keys, with upsert semantics.
#[async_trait]
pub trait KeyedStore: Handle {
    async fn put(&mut self, key: &str, record: serde_json::Value) -> Result<(), StoreError>;

    /// Every record stored under `key`. Empty if there is none.
    async fn get(&self, key: &str) -> Result<Vec<serde_json::Value>, StoreError>;

    /// Every record matching `predicate`, in key order.
    async fn query(&self, predicate: &Predicate) -> Result<Vec<serde_json::Value>, StoreError>;
}

/// A monotonically increasing integer register.
#[async_trait]
pub trait Counter: Handle {
    fn value(&self) -> Result<u64, StoreError>;

    /// Increment by one and return the new value.
    async fn inc(&mut self) -> Result<u64, StoreError>;
}

/// An append-only sequence of entries, in append order.
#[async_trait]
pub trait EventLog: Handle {
    async fn append(&mut self, payload: serde_json::Value) -> Result<EntryHash, StoreError>;

    /// A snapshot of every entry appended so far.
    fn entries(&self) -> Result<im::Vector<LogEntry>, StoreError>;
}

/// Opens handles onto stores. Implementations are cheap to clone and share their backing state.
#[async_trait]
pub trait StoreProvider: Clone + Send + Sync + 'static {
    type EventLog: EventLog + 'static;
    type KeyedStore: KeyedStore + 'static;
    type Counter: Counter + 'static;

    /// Open the locally-owned event log called `name`, creating it if needed.
    async fn open_event_log(&self, name: &str) -> Result<Self::EventLog, StoreError>;

    /// Open an existing keyed store. Fails with [`StoreError::NotFound`] if it was never created.
    async fn open_keyed_store(&self, link: &Link) -> Result<Self::KeyedStore, StoreError>;

    /// Open an existing counter. Fails with [`StoreError::NotFound`] if it was never created.
    async fn open_counter(&self, link: &Link) -> Result<Self::Counter, StoreError>;

    /// Create the keyed store called `name`, or return the link of the one that already exists.
    async fn create_keyed_store(&self, name: &str) -> Result<Link, StoreError>;

    /// Create the counter called `name` at zero, or return the link of the one that already exists.
    async fn create_counter(&self, name: &str) -> Result<Link, StoreError>;

    /// Create the event log called `name`, or return the link of the one that already exists.
    async fn create_event_log(&self, name: &str) -> Result<Link, StoreError>;
}

/// Supplies the stable identity of whoever is running the feed.
pub trait Identity: Send + Sync {
    fn owner(&self) -> Owner;
}

impl Identity for Owner {
    fn owner(&self) -> Owner {
        self.clone()
    }
}

/// Lifecycle of a handle's local replica.
pub(crate) enum Replica<T> {
    Unloaded,
    Loaded(T),
    Closed,
}

impl<T> Replica<T> {
    pub(crate) fn get(&self, link: &Link) -> Result<&T, StoreError> {
        match self {
            Replica::Loaded(value) => Ok(value),
            Replica::Unloaded => Err(StoreError::NotLoaded(link.clone())),
            Replica::Closed => Err(StoreError::Closed(link.clone())),
        }
    }

    pub(crate) fn ensure_open(&self, link: &Link) -> Result<(), StoreError> {
        self.get(link).map(|_| ())
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, Replica::Closed)
    }
}

/// A loaded handle that is closed when dropped.
pub struct Opened<H: Handle> {
    handle: H,
}

impl<H: Handle> Opened<H> {
    /// Load `handle`, closing it again if loading fails.
    pub async fn load(mut handle: H) -> Result<Self, StoreError> {
        match handle.load().await {
            Ok(()) => Ok(Self { handle }),
            Err(e) => {
                handle.close();
                Err(e)
            }
        }
    }
}

impl<H: Handle> Deref for Opened<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H: Handle> DerefMut for Opened<H> {
    fn deref_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

impl<H: Handle> Drop for Opened<H> {
    fn drop(&mut self) {
        self.handle.close();
    }
}

pub async fn open_keyed_store<P: StoreProvider>(
    provider: &P,
    link: &Link,
) -> Result<Opened<P::KeyedStore>, StoreError> {
    Opened::load(provider.open_keyed_store(link).await?).await
}

pub async fn open_counter<P: StoreProvider>(
    provider: &P,
    link: &Link,
) -> Result<Opened<P::Counter>, StoreError> {
    Opened::load(provider.open_counter(link).await?).await
}

pub async fn open_event_log<P: StoreProvider>(
    provider: &P,
    name: &str,
) -> Result<Opened<P::EventLog>, StoreError> {
    Opened::load(provider.open_event_log(name).await?).await
}

/// Store a typed record under `key`.
pub async fn put_record<S: KeyedStore + ?Sized, R: Serialize + Sync>(
    store: &mut S,
    key: &str,
    record: &R,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(record)?;
    store.put(key, value).await
}

/// The latest typed record under `key`, if any.
pub async fn get_record<S: KeyedStore + ?Sized, R: DeserializeOwned>(
    store: &S,
    key: &str,
) -> Result<Option<R>, StoreError> {
    match store.get(key).await?.pop() {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}
