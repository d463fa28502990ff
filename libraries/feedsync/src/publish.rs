//! The owner's side of a space: creating spaces and publishing posts into them. Comments are the
//! exception: anyone who can read a post can comment on it.
//!
//! Ids are handed out by incrementing a counter before the record is written. A crash between the
//! two leaves a gap in the id sequence, which readers already have to cope with.

use crate::data_model::{
    Comment, CommentValue, Created, EntryHash, Link, Owner, Post, PostContent, PostLinks, Space,
    SpaceContent, SpaceLinks, StoreKind, parent_path, posts_path,
};
use crate::store::{
    Counter, EventLog, Identity, Opened, StoreError, StoreProvider, get_record, open_counter,
    open_event_log, open_keyed_store, put_record,
};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{owner} cannot publish into {space}, which belongs to someone else")]
    NotOwner { space: String, owner: Owner },

    #[error("Comment on {post} has no text")]
    EmptyComment { post: String },

    #[error("Comment on {post} replies to {parent}, which is not one of its comments")]
    UnknownParent { post: String, parent: EntryHash },
}

pub struct Publisher<P: StoreProvider> {
    provider: P,
    owner: Owner,
}

impl<P: StoreProvider> Publisher<P> {
    pub fn new(provider: P, identity: &dyn Identity) -> Self {
        Self {
            provider,
            owner: identity.owner(),
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Create a new space owned by us, along with its post store and post-id counter.
    pub async fn create_space(&self, content: SpaceContent) -> Result<Space, PublishError> {
        let spaces_name = format!("{}/spaces", self.owner);
        let spaces_link = self.provider.create_keyed_store(&spaces_name).await?;
        let id_counter_link = self
            .provider
            .create_counter(&format!("{spaces_name}/next-id"))
            .await?;

        let id = open_counter(&self.provider, &id_counter_link)
            .await?
            .inc()
            .await?;
        let path = format!("{spaces_name}/{id}");
        let posts_name = posts_path(&path);
        let links = SpaceLinks {
            post_store: self.provider.create_keyed_store(&posts_name).await?,
            post_id_counter: self
                .provider
                .create_counter(&format!("{posts_name}/next-id"))
                .await?,
        };

        let space = Space {
            id: id.to_string(),
            path,
            owner: self.owner.clone(),
            created: Created::now(self.owner.clone()),
            content,
            links,
        };
        let mut spaces = open_keyed_store(&self.provider, &spaces_link).await?;
        put_record(&mut *spaces, &space.path, &space).await?;
        log::info!("Created space {} ({})", space.path, space.content.title);
        Ok(space)
    }

    /// Look a space up by its path. Spaces of any owner can be read.
    pub async fn get_space(&self, space_path: &str) -> Result<Option<Space>, StoreError> {
        let store = match open_keyed_store(&self.provider, &Link::keyed(parent_path(space_path)))
            .await
        {
            Ok(store) => store,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        get_record(&*store, space_path).await
    }

    /// Publish a post into one of our own spaces.
    pub async fn publish_post(
        &self,
        space: &Space,
        content: PostContent,
    ) -> Result<Post, PublishError> {
        if space.owner != self.owner {
            return Err(PublishError::NotOwner {
                space: space.path.clone(),
                owner: self.owner.clone(),
            });
        }

        let id = open_counter(&self.provider, &space.links.post_id_counter)
            .await?
            .inc()
            .await?;
        let path = format!("{}/{id}", space.posts_path());
        let comments = format!("{path}/comments");
        let links = PostLinks {
            comment_store: self.provider.create_event_log(&comments).await?,
            add_counter: self
                .provider
                .create_counter(&format!("{comments}/add"))
                .await?,
            del_counter: self
                .provider
                .create_counter(&format!("{comments}/del"))
                .await?,
        };

        let post = Post {
            path,
            space_path: space.path.clone(),
            owner: self.owner.clone(),
            created: Created::now(self.owner.clone()),
            content,
            links,
        };
        let mut posts = open_keyed_store(&self.provider, &space.links.post_store).await?;
        put_record(&mut *posts, &post.path, &post).await?;
        log::info!("Published post {} into {}", id, space.path);
        Ok(post)
    }

    /// The post with positional id `id` in `space`, if it was ever written.
    pub async fn get_post(&self, space: &Space, id: u64) -> Result<Option<Post>, StoreError> {
        let posts = open_keyed_store(&self.provider, &space.links.post_store).await?;
        get_record(&*posts, &format!("{}/{id}", space.posts_path())).await
    }

    /// Comment on `post`, optionally as a reply to one of its existing comments. The comment's id is
    /// the hash of the log entry it lands in.
    pub async fn add_comment(
        &self,
        post: &Post,
        body: &str,
        parent: Option<&EntryHash>,
    ) -> Result<Comment, PublishError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(PublishError::EmptyComment {
                post: post.path.clone(),
            });
        }

        let mut comments = self.comment_log(post).await?;
        if let Some(parent) = parent {
            if !comments.entries()?.iter().any(|entry| &entry.hash == parent) {
                return Err(PublishError::UnknownParent {
                    post: post.path.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let value = CommentValue {
            owner: self.owner.clone(),
            body: body.to_string(),
            created: Created::now(self.owner.clone()),
            parent_id: parent.cloned(),
        };
        let payload = serde_json::to_value(&value).map_err(StoreError::from)?;
        let id = comments.append(payload).await?;
        open_counter(&self.provider, &post.links.add_counter)
            .await?
            .inc()
            .await?;
        log::info!("{} commented on {} ({id})", self.owner, post.path);
        Ok(Comment { id, value })
    }

    /// Every comment on `post`, oldest first. Entries that are not comments are skipped.
    pub async fn list_comments(&self, post: &Post) -> Result<Vec<Comment>, StoreError> {
        let comments = self
            .comment_log(post)
            .await?
            .entries()?
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry.payload) {
                Ok(value) => Some(Comment {
                    id: entry.hash,
                    value,
                }),
                Err(e) => {
                    log::warn!("Skipping unreadable comment {} on {}: {e}", entry.hash, post.path);
                    None
                }
            })
            .collect();
        Ok(comments)
    }

    /// Comments added to `post` minus comments deleted from it.
    pub async fn comment_count(&self, post: &Post) -> Result<u64, StoreError> {
        let added = open_counter(&self.provider, &post.links.add_counter)
            .await?
            .value()?;
        let deleted = open_counter(&self.provider, &post.links.del_counter)
            .await?
            .value()?;
        Ok(added.saturating_sub(deleted))
    }

    async fn comment_log(&self, post: &Post) -> Result<Opened<P::EventLog>, StoreError> {
        match post.links.comment_store.parts() {
            Some((StoreKind::EventLog, name)) => open_event_log(&self.provider, name).await,
            _ => Err(StoreError::NotFound(post.links.comment_store.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    fn content(title: &str) -> SpaceContent {
        SpaceContent {
            title: title.to_string(),
            desc: String::new(),
            avatar: None,
        }
    }

    fn body(text: &str) -> PostContent {
        PostContent {
            body: text.to_string(),
            ..PostContent::default()
        }
    }

    #[tokio::test]
    async fn spaces_get_sequential_ids_and_can_be_read_back() {
        let provider = MemoryProvider::new();
        let bob = Publisher::new(provider.clone(), &Owner::new("bob"));

        let first = bob.create_space(content("first")).await.unwrap();
        let second = bob.create_space(content("second")).await.unwrap();
        assert_eq!(first.path, "bob/spaces/1");
        assert_eq!(second.path, "bob/spaces/2");
        assert_eq!(second.links.post_store, Link::keyed("bob/spaces/2/posts"));

        let alice = Publisher::new(provider, &Owner::new("alice"));
        assert_eq!(alice.get_space("bob/spaces/2").await.unwrap(), Some(second));
        assert_eq!(alice.get_space("bob/spaces/9").await.unwrap(), None);
        assert_eq!(alice.get_space("carol/spaces/1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn posts_take_the_next_counter_value() {
        let provider = MemoryProvider::new();
        let bob = Publisher::new(provider.clone(), &Owner::new("bob"));
        let space = bob.create_space(content("news")).await.unwrap();

        let first = bob.publish_post(&space, body("one")).await.unwrap();
        let second = bob.publish_post(&space, body("two")).await.unwrap();
        assert_eq!(first.id(), Some(1));
        assert_eq!(second.id(), Some(2));
        assert_eq!(second.links.comment_store, Link::event_log("bob/spaces/1/posts/2/comments"));

        let counter = open_counter(&provider, &space.links.post_id_counter)
            .await
            .unwrap();
        assert_eq!(counter.value().unwrap(), 2);
        assert_eq!(bob.get_post(&space, 2).await.unwrap(), Some(second));
        assert_eq!(bob.get_post(&space, 3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn only_the_owner_can_publish() {
        let provider = MemoryProvider::new();
        let bob = Publisher::new(provider.clone(), &Owner::new("bob"));
        let space = bob.create_space(content("news")).await.unwrap();

        let alice = Publisher::new(provider, &Owner::new("alice"));
        let result = alice.publish_post(&space, body("hi")).await;
        assert!(matches!(result, Err(PublishError::NotOwner { .. })));
    }

    #[tokio::test]
    async fn comments_are_listed_in_order_and_counted() {
        let provider = MemoryProvider::new();
        let bob = Publisher::new(provider.clone(), &Owner::new("bob"));
        let space = bob.create_space(content("news")).await.unwrap();
        let post = bob.publish_post(&space, body("hello")).await.unwrap();

        let alice = Publisher::new(provider.clone(), &Owner::new("alice"));
        let first = alice.add_comment(&post, "  nice post \n", None).await.unwrap();
        assert_eq!(first.value.body, "nice post");
        assert_eq!(first.value.owner, Owner::new("alice"));
        let reply = bob
            .add_comment(&post, "thanks", Some(&first.id))
            .await
            .unwrap();
        assert_eq!(reply.value.parent_id, Some(first.id.clone()));

        let listed = bob.list_comments(&post).await.unwrap();
        assert_eq!(listed, vec![first, reply]);
        assert_eq!(alice.comment_count(&post).await.unwrap(), 2);

        let added = open_counter(&provider, &post.links.add_counter)
            .await
            .unwrap();
        assert_eq!(added.value().unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_comments_and_unknown_parents_are_rejected() {
        let provider = MemoryProvider::new();
        let bob = Publisher::new(provider.clone(), &Owner::new("bob"));
        let space = bob.create_space(content("news")).await.unwrap();
        let post = bob.publish_post(&space, body("hello")).await.unwrap();

        let result = bob.add_comment(&post, "   ", None).await;
        assert!(matches!(result, Err(PublishError::EmptyComment { .. })));

        let stray = EntryHash::chain(None, b"nothing");
        let result = bob.add_comment(&post, "hi", Some(&stray)).await;
        assert!(matches!(result, Err(PublishError::UnknownParent { .. })));

        assert!(bob.list_comments(&post).await.unwrap().is_empty());
        assert_eq!(bob.comment_count(&post).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn comments_on_a_post_without_a_comment_log_are_not_found() {
        let provider = MemoryProvider::new();
        let bob = Publisher::new(provider.clone(), &Owner::new("bob"));
        let space = bob.create_space(content("news")).await.unwrap();
        let mut post = bob.publish_post(&space, body("hello")).await.unwrap();
        post.links.comment_store = Link::keyed("bob/spaces/1/posts/1/comments");

        assert!(matches!(
            bob.list_comments(&post).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            bob.add_comment(&post, "hi", None).await,
            Err(PublishError::Store(StoreError::NotFound(_)))
        ));
    }
}
