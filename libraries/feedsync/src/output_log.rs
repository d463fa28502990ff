//! The personal feed: an append-only event log of posts, in the order they were appended.

use std::collections::HashSet;

use crate::data_model::{EntryHash, FeedEntry, LogEntry, Owner, Post};
use crate::store::{EventLog, Opened, StoreError, StoreProvider};

pub struct OutputLog<L: EventLog> {
    log: Opened<L>,
    /// Paths of every post already in the log.
    sources: HashSet<String>,
}

impl<L: EventLog> OutputLog<L> {
    /// Open and load `owner`'s feed.
    pub async fn open<P>(provider: &P, owner: &Owner) -> Result<Self, StoreError>
    where
        P: StoreProvider<EventLog = L>,
    {
        let log = Opened::load(provider.open_event_log(&format!("{owner}/feed")).await?).await?;
        let sources = log
            .entries()?
            .iter()
            .filter_map(|entry| decode(entry).map(|feed_entry| feed_entry.post.path))
            .collect();
        Ok(Self { log, sources })
    }

    pub async fn append(&mut self, post: &Post) -> Result<EntryHash, StoreError> {
        let hash = self.log.append(serde_json::to_value(post)?).await?;
        self.sources.insert(post.path.clone());
        Ok(hash)
    }

    /// Whether the post at `post_path` has been appended before.
    pub fn contains(&self, post_path: &str) -> bool {
        self.sources.contains(post_path)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.log.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// The most recent `limit` entries (all of them for `None`), oldest first.
    ///
    /// The iterator works on a snapshot taken at call time, so appends made while iterating are not
    /// seen. Call again to start over.
    pub fn iterate(
        &self,
        limit: Option<usize>,
    ) -> Result<impl Iterator<Item = FeedEntry> + use<L>, StoreError> {
        let entries = self.log.entries()?;
        let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));
        Ok(entries
            .into_iter()
            .skip(skip)
            .filter_map(|entry| decode(&entry)))
    }
}

fn decode(entry: &LogEntry) -> Option<FeedEntry> {
    match serde_json::from_value::<Post>(entry.payload.clone()) {
        Ok(post) => Some(FeedEntry {
            seq: entry.seq,
            hash: entry.hash.clone(),
            post,
        }),
        Err(e) => {
            log::warn!("Skipping unreadable feed entry {}: {e}", entry.hash);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{Created, Link, PostContent, PostLinks};
    use crate::memory::MemoryProvider;

    fn post(id: u64) -> Post {
        let owner = Owner::new("bob");
        let path = format!("bob/spaces/1/posts/{id}");
        Post {
            links: PostLinks {
                comment_store: Link::event_log(&format!("{path}/comments")),
                add_counter: Link::counter(&format!("{path}/comments/add")),
                del_counter: Link::counter(&format!("{path}/comments/del")),
            },
            path,
            space_path: "bob/spaces/1".to_string(),
            owner: owner.clone(),
            created: Created {
                account: owner,
                timestamp_millis: id as i64,
            },
            content: PostContent {
                body: format!("post {id}"),
                ..PostContent::default()
            },
        }
    }

    fn ids(entries: impl Iterator<Item = FeedEntry>) -> Vec<u64> {
        entries.filter_map(|entry| entry.post.id()).collect()
    }

    #[tokio::test]
    async fn bounded_iteration_returns_the_newest_entries_in_order() {
        let provider = MemoryProvider::new();
        let mut feed = OutputLog::open(&provider, &Owner::new("alice")).await.unwrap();
        for id in 1..=4 {
            feed.append(&post(id)).await.unwrap();
        }

        assert_eq!(ids(feed.iterate(None).unwrap()), vec![1, 2, 3, 4]);
        assert_eq!(ids(feed.iterate(Some(2)).unwrap()), vec![3, 4]);
        assert_eq!(ids(feed.iterate(Some(10)).unwrap()), vec![1, 2, 3, 4]);
        assert_eq!(ids(feed.iterate(Some(0)).unwrap()), Vec::<u64>::new());
    }

    #[tokio::test]
    async fn iteration_is_a_snapshot() {
        let provider = MemoryProvider::new();
        let mut feed = OutputLog::open(&provider, &Owner::new("alice")).await.unwrap();
        feed.append(&post(1)).await.unwrap();

        let snapshot = feed.iterate(None).unwrap();
        feed.append(&post(2)).await.unwrap();

        assert_eq!(ids(snapshot), vec![1]);
        assert_eq!(feed.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn source_index_is_rebuilt_on_open() {
        let provider = MemoryProvider::new();
        {
            let mut feed = OutputLog::open(&provider, &Owner::new("alice")).await.unwrap();
            feed.append(&post(7)).await.unwrap();
        }

        let feed = OutputLog::open(&provider, &Owner::new("alice")).await.unwrap();
        assert!(feed.contains("bob/spaces/1/posts/7"));
        assert!(!feed.contains("bob/spaces/1/posts/8"));
    }
}
