//! Records shared between spaces, the follow registry and the personal feed.

mod comment;
mod feed;
mod follow;
mod post;
mod space;

pub use comment::{Comment, CommentValue};
pub use feed::{EntryHash, FeedEntry, LogEntry};
pub use follow::FollowEntry;
pub use post::{Post, PostContent, PostLinks};
pub(crate) use space::posts_path;
pub use space::{Space, SpaceContent, SpaceLinks};

use std::fmt;

/// The kinds of store a [`Link`] can point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKind {
    Keyed,
    Counter,
    EventLog,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Keyed => "keyed",
            StoreKind::Counter => "counter",
            StoreKind::EventLog => "eventlog",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "keyed" => Some(StoreKind::Keyed),
            "counter" => Some(StoreKind::Counter),
            "eventlog" => Some(StoreKind::EventLog),
            _ => None,
        }
    }
}

/// Address of a store, as handed out by a [`crate::StoreProvider`] when the store is created.
///
/// Links look like `/<kind>/<name>`, where `name` is the logical path the store was created under.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Link(String);

impl Link {
    pub fn new(kind: StoreKind, name: &str) -> Self {
        Self(format!("/{}/{}", kind.as_str(), name.trim_start_matches('/')))
    }

    pub fn keyed(name: &str) -> Self {
        Self::new(StoreKind::Keyed, name)
    }

    pub fn counter(name: &str) -> Self {
        Self::new(StoreKind::Counter, name)
    }

    pub fn event_log(name: &str) -> Self {
        Self::new(StoreKind::EventLog, name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the link back into the kind of store and the name it was created under.
    pub fn parts(&self) -> Option<(StoreKind, &str)> {
        let rest = self.0.strip_prefix('/')?;
        let (kind, name) = rest.split_once('/')?;
        if name.is_empty() {
            return None;
        }
        Some((StoreKind::from_str(kind)?, name))
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identity of whoever owns a space, a post or a feed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Owner(String);

impl Owner {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who created a record, and when (milliseconds since the unix epoch).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Created {
    pub account: Owner,
    #[serde(rename = "time")]
    pub timestamp_millis: i64,
}

impl Created {
    pub fn now(account: Owner) -> Self {
        Self {
            account,
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.timestamp_millis)
    }
}

/// The last `/`-separated segment of a path. Positional ids live there.
pub fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Everything before the last `/` of a path, or `""` if there is none.
pub fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Parse the positional id at the end of a path. Non-numeric ids are not positional.
pub fn positional_id(path: &str) -> Option<u64> {
    last_segment(path).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_parts_round_trip() {
        let link = Link::counter("alice/spaces/1/posts/next-id");
        assert_eq!(link.as_str(), "/counter/alice/spaces/1/posts/next-id");
        assert_eq!(
            link.parts(),
            Some((StoreKind::Counter, "alice/spaces/1/posts/next-id"))
        );
    }

    #[test]
    fn malformed_links_have_no_parts() {
        let link: Link = serde_json::from_str("\"/nonsense/x\"").unwrap();
        assert_eq!(link.parts(), None);
        let link: Link = serde_json::from_str("\"/keyed/\"").unwrap();
        assert_eq!(link.parts(), None);
    }

    #[test]
    fn positional_ids_come_from_the_last_segment() {
        assert_eq!(positional_id("alice/spaces/1/posts/12"), Some(12));
        assert_eq!(positional_id("12"), Some(12));
        assert_eq!(positional_id("alice/spaces/1/posts/draft"), None);
        assert_eq!(parent_path("alice/spaces/1"), "alice/spaces");
        assert_eq!(parent_path("alice"), "");
    }
}
