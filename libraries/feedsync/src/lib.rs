//! This is a library for aggregating many independently-owned, append-only "spaces" into one personal feed.
//!
//! Syncing strategy:
//! 1. Every space owns a post store (positional ids under the space's path) and a post-id counter.
//!    Publishing a post increments the counter first, then writes the post under the new id.
//! 2. The follow registry remembers, per followed space, the last post id that has already been
//!    copied into the personal feed.
//! 3. When syncing, for each followed space:
//!   1. Read the counter. If it has not moved past the remembered id, there is nothing to do.
//!   2. Otherwise fetch every post whose id falls in `(remembered, counter]`, newest first, and append
//!      them to the feed log.
//!   3. Only once every append has landed, move the remembered id forward to the counter value.
//!
//! A failure anywhere only affects that one space. Its cursor stays where it was, so the next pass
//! picks the same posts up again.

pub mod data_model;
pub mod fs;
pub mod memory;
pub mod output_log;
pub mod publish;
pub mod registry;
pub mod store;
pub mod sync;

pub use data_model::{
    Comment, CommentValue, Created, EntryHash, FeedEntry, FollowEntry, Link, Owner, Post,
    PostContent, PostLinks, Space, SpaceContent, SpaceLinks,
};
pub use output_log::OutputLog;
pub use publish::{PublishError, Publisher};
pub use registry::FollowRegistry;
pub use store::{Counter, EventLog, Handle, Identity, KeyedStore, Opened, StoreError, StoreProvider};
pub use sync::{
    FeedSynchronizer, SpaceOutcome, SpaceReport, SyncConfig, SyncError, SyncMode, SyncReport,
    SyncStep,
};
