#![allow(dead_code)]

use feedsync::memory::MemoryProvider;
use feedsync::store::{open_counter, open_keyed_store, put_record};
use feedsync::{
    Counter, Created, FeedEntry, Link, Owner, Post, PostContent, PostLinks, Space, SpaceContent,
    SpaceLinks, StoreProvider,
};

/// A space owned by `owner`, with its stores created but no posts.
pub async fn space(provider: &MemoryProvider, owner: &str, id: u64) -> Space {
    let owner = Owner::new(owner);
    let path = format!("{owner}/spaces/{id}");
    let links = SpaceLinks {
        post_store: provider
            .create_keyed_store(&format!("{path}/posts"))
            .await
            .unwrap(),
        post_id_counter: provider
            .create_counter(&format!("{path}/posts/next-id"))
            .await
            .unwrap(),
    };
    Space {
        id: id.to_string(),
        path,
        owner: owner.clone(),
        created: Created {
            account: owner,
            timestamp_millis: 0,
        },
        content: SpaceContent {
            title: format!("space {id}"),
            desc: String::new(),
            avatar: None,
        },
        links,
    }
}

/// Hand out the next post id without writing a post, as a crashed publish would.
pub async fn skip_id(provider: &MemoryProvider, space: &Space) -> u64 {
    open_counter(provider, &space.links.post_id_counter)
        .await
        .unwrap()
        .inc()
        .await
        .unwrap()
}

/// Write the post with id `id` created at `timestamp_millis`.
pub async fn write_post(provider: &MemoryProvider, space: &Space, id: u64, timestamp_millis: i64) {
    let path = format!("{}/{id}", space.posts_path());
    let post = Post {
        links: PostLinks {
            comment_store: Link::event_log(&format!("{path}/comments")),
            add_counter: Link::counter(&format!("{path}/comments/add")),
            del_counter: Link::counter(&format!("{path}/comments/del")),
        },
        path,
        space_path: space.path.clone(),
        owner: space.owner.clone(),
        created: Created {
            account: space.owner.clone(),
            timestamp_millis,
        },
        content: PostContent {
            body: format!("post {id}"),
            ..PostContent::default()
        },
    };
    let mut posts = open_keyed_store(provider, &space.links.post_store)
        .await
        .unwrap();
    put_record(&mut *posts, &post.path, &post).await.unwrap();
}

/// Publish a post created at `timestamp_millis` the way an owner does: id first, then the post.
pub async fn publish(provider: &MemoryProvider, space: &Space, timestamp_millis: i64) -> u64 {
    let id = skip_id(provider, space).await;
    write_post(provider, space, id, timestamp_millis).await;
    id
}

/// Post ids of the feed, oldest first.
pub fn ids(feed: &[FeedEntry]) -> Vec<u64> {
    feed.iter().filter_map(|entry| entry.post.id()).collect()
}

/// `(space path, post id)` of the feed, oldest first.
pub fn sources(feed: &[FeedEntry]) -> Vec<(String, u64)> {
    feed.iter()
        .filter_map(|entry| Some((entry.post.space_path.clone(), entry.post.id()?)))
        .collect()
}
