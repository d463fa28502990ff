//! The follow registry: one [`FollowEntry`] per followed space, keyed by the space's path.
//!
//! `put` is the only way entries change. Cursor updates go through [`FollowRegistry::advance`], which
//! reads the stored entry back first and never moves a cursor backwards.

use crate::data_model::{FollowEntry, Owner, Space};
use crate::store::{KeyedStore, Opened, StoreError, StoreProvider, get_record, put_record};

pub struct FollowRegistry<S: KeyedStore> {
    store: Opened<S>,
}

impl<S: KeyedStore> FollowRegistry<S> {
    /// Open `owner`'s registry, creating it on first use.
    pub async fn open<P>(provider: &P, owner: &Owner) -> Result<Self, StoreError>
    where
        P: StoreProvider<KeyedStore = S>,
    {
        let link = provider
            .create_keyed_store(&format!("{owner}/follow-space"))
            .await?;
        let store = Opened::load(provider.open_keyed_store(&link).await?).await?;
        Ok(Self { store })
    }

    pub fn link(&self) -> &crate::data_model::Link {
        self.store.link()
    }

    pub async fn get(&self, space_path: &str) -> Result<Option<FollowEntry>, StoreError> {
        get_record(&*self.store, space_path).await
    }

    /// Insert or replace the entry for `entry.space_path`.
    pub async fn put(&mut self, entry: &FollowEntry) -> Result<(), StoreError> {
        put_record(&mut *self.store, &entry.space_path, entry).await
    }

    pub async fn list_all(&self) -> Result<Vec<FollowEntry>, StoreError> {
        let values = self
            .store
            .query(&|_: &str, _: &serde_json::Value| true)
            .await?;
        let mut entries = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<FollowEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(e) => log::warn!("Skipping unreadable follow entry: {e}"),
            }
        }
        Ok(entries)
    }

    /// Follow `space`. Following a space twice keeps the existing entry and its cursor.
    pub async fn follow(&mut self, space: &Space) -> Result<FollowEntry, StoreError> {
        if let Some(existing) = self.get(&space.path).await? {
            log::info!("Already following {}", space.path);
            return Ok(existing);
        }
        let entry = FollowEntry::new(space);
        self.put(&entry).await?;
        log::info!("Now following {}", space.path);
        Ok(entry)
    }

    /// Move the cursor for `entry.space_path` forward to `cursor`.
    ///
    /// Returns the entry as stored afterwards. Nothing is written if the stored cursor is already
    /// at or past `cursor`.
    pub async fn advance(
        &mut self,
        entry: &FollowEntry,
        cursor: u64,
    ) -> Result<FollowEntry, StoreError> {
        let current = self
            .get(&entry.space_path)
            .await?
            .unwrap_or_else(|| entry.clone());
        if cursor <= current.last_known_post_id {
            return Ok(current);
        }
        let advanced = FollowEntry {
            last_known_post_id: cursor,
            ..current
        };
        self.put(&advanced).await?;
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{Created, Link, SpaceContent, SpaceLinks};
    use crate::memory::MemoryProvider;

    fn space(path: &str) -> Space {
        let owner = Owner::new("bob");
        Space {
            id: "1".to_string(),
            path: path.to_string(),
            owner: owner.clone(),
            created: Created {
                account: owner,
                timestamp_millis: 0,
            },
            content: SpaceContent {
                title: "t".to_string(),
                desc: "d".to_string(),
                avatar: None,
            },
            links: SpaceLinks {
                post_store: Link::keyed(&format!("{path}/posts")),
                post_id_counter: Link::counter(&format!("{path}/posts/next-id")),
            },
        }
    }

    #[tokio::test]
    async fn follow_is_unique_per_space() {
        let provider = MemoryProvider::new();
        let mut registry = FollowRegistry::open(&provider, &Owner::new("alice"))
            .await
            .unwrap();

        let first = registry.follow(&space("bob/spaces/1")).await.unwrap();
        registry.advance(&first, 4).await.unwrap();
        let again = registry.follow(&space("bob/spaces/1")).await.unwrap();
        registry.follow(&space("bob/spaces/2")).await.unwrap();

        assert_eq!(again.last_known_post_id, 4);
        assert_eq!(registry.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn advance_never_moves_backwards() {
        let provider = MemoryProvider::new();
        let mut registry = FollowRegistry::open(&provider, &Owner::new("alice"))
            .await
            .unwrap();
        let entry = registry.follow(&space("bob/spaces/1")).await.unwrap();

        assert_eq!(registry.advance(&entry, 5).await.unwrap().last_known_post_id, 5);
        let puts = provider.stats().puts_against(registry.link());

        // A stale copy of the entry asking for a lower cursor changes nothing.
        assert_eq!(registry.advance(&entry, 3).await.unwrap().last_known_post_id, 5);
        assert_eq!(provider.stats().puts_against(registry.link()), puts);
        assert_eq!(
            registry
                .get("bob/spaces/1")
                .await
                .unwrap()
                .unwrap()
                .last_known_post_id,
            5
        );
    }

    #[tokio::test]
    async fn registries_are_per_owner_and_durable() {
        let provider = MemoryProvider::new();
        {
            let mut registry = FollowRegistry::open(&provider, &Owner::new("alice"))
                .await
                .unwrap();
            registry.follow(&space("bob/spaces/1")).await.unwrap();
        }

        let alice = FollowRegistry::open(&provider, &Owner::new("alice"))
            .await
            .unwrap();
        let carol = FollowRegistry::open(&provider, &Owner::new("carol"))
            .await
            .unwrap();
        assert!(alice.get("bob/spaces/1").await.unwrap().is_some());
        assert!(carol.list_all().await.unwrap().is_empty());
    }
}
