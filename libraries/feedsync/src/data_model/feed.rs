use std::fmt;

use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use crate::data_model::Post;

/// Identity of an entry in an event log. Each hash covers the entry's payload and the hash of the
/// entry before it, so two logs with the same hash at the same position hold the same history.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EntryHash(String);

impl EntryHash {
    pub fn chain(previous: Option<&EntryHash>, payload: &[u8]) -> Self {
        let seed = previous.map(|hash| xxh3_64(hash.0.as_bytes())).unwrap_or(0);
        Self(format!("{:016x}", xxh3_64_with_seed(payload, seed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw entry of an event log, as stored.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 0.
    pub seq: u64,
    pub hash: EntryHash,
    pub payload: serde_json::Value,
}

/// A post, as materialized into the personal feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedEntry {
    pub seq: u64,
    pub hash: EntryHash,
    pub post: Post,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_depend_on_history() {
        let first = EntryHash::chain(None, b"a");
        let second = EntryHash::chain(Some(&first), b"b");
        let orphan = EntryHash::chain(None, b"b");

        assert_eq!(first, EntryHash::chain(None, b"a"));
        assert_ne!(second, orphan);
        assert_eq!(second.as_str().len(), 16);
    }
}
