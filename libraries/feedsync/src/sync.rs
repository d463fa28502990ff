//! The feed synchronizer. For each followed space it opens the space's post store and post-id
//! counter, works out which post ids are new since the follow cursor, appends those posts to the
//! personal feed newest first, and then moves the cursor up to the counter.
//!
//! Spaces are independent: a failure in one is reported for that space and the pass carries on.
//! The cursor only moves once every append for the space has landed, so an interrupted or failed
//! pass leaves the space to be picked up again next time.

use std::cmp::Reverse;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::data_model::{FeedEntry, FollowEntry, Owner, Post, Space, positional_id};
use crate::output_log::OutputLog;
use crate::registry::FollowRegistry;
use crate::store::{
    Counter, Identity, KeyedStore, StoreError, StoreProvider, open_counter, open_keyed_store,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// One space at a time, in registry order.
    Sequential,
    /// Up to `max_concurrency` spaces in flight at once. Appends to the feed are still serialized.
    Parallel { max_concurrency: usize },
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// Upper bound for each open, query, append and cursor write. `None` waits forever.
    pub step_timeout: Option<Duration>,
    /// Skip posts that are already in the feed, so a pass that crashed between appending and
    /// moving the cursor does not append them twice when it is repeated.
    pub dedupe: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Sequential,
            step_timeout: Some(Duration::from_secs(30)),
            dedupe: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStep {
    Open,
    Query,
    Append,
    CursorWrite,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStep::Open => "opening remote stores",
            SyncStep::Query => "querying posts",
            SyncStep::Append => "appending to the feed",
            SyncStep::CursorWrite => "writing the follow cursor",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to open remote stores for {space}")]
    RemoteOpen {
        space: String,
        #[source]
        source: StoreError,
    },

    #[error("Querying posts of {space} failed")]
    Query {
        space: String,
        #[source]
        source: StoreError,
    },

    #[error("Appending posts of {space} to the feed failed after {appended} appends")]
    Append {
        space: String,
        appended: usize,
        #[source]
        source: StoreError,
    },

    #[error("Writing the follow cursor for {space} failed; its posts will be fetched again")]
    CursorWrite {
        space: String,
        #[source]
        source: StoreError,
    },

    #[error("{step} for {space} timed out after {after:?}")]
    Timeout {
        space: String,
        step: SyncStep,
        after: Duration,
    },
}

impl SyncError {
    pub fn space(&self) -> &str {
        match self {
            SyncError::RemoteOpen { space, .. }
            | SyncError::Query { space, .. }
            | SyncError::Append { space, .. }
            | SyncError::CursorWrite { space, .. }
            | SyncError::Timeout { space, .. } => space,
        }
    }

    fn at(step: SyncStep, space: &str, source: StoreError) -> Self {
        let space = space.to_string();
        match step {
            SyncStep::Open => SyncError::RemoteOpen { space, source },
            SyncStep::Query => SyncError::Query { space, source },
            SyncStep::Append => SyncError::Append {
                space,
                appended: 0,
                source,
            },
            SyncStep::CursorWrite => SyncError::CursorWrite { space, source },
        }
    }
}

/// What a pass did for one space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpaceOutcome {
    /// The counter had not moved past the cursor. Nothing was queried or written.
    UpToDate { cursor: u64 },
    Synced {
        /// Posts found in the store for the new id range.
        fetched: usize,
        appended: usize,
        /// Posts skipped because they were already in the feed.
        duplicates: usize,
        cursor: u64,
    },
}

#[derive(Debug)]
pub struct SpaceReport {
    pub space_path: String,
    pub outcome: Result<SpaceOutcome, SyncError>,
}

#[derive(Debug)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub spaces: Vec<SpaceReport>,
    /// Everything in the feed once the pass finished, oldest first.
    pub feed: Vec<FeedEntry>,
}

impl SyncReport {
    pub fn appended(&self) -> usize {
        self.spaces
            .iter()
            .map(|space| match &space.outcome {
                Ok(SpaceOutcome::Synced { appended, .. }) => *appended,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SyncError> {
        self.spaces
            .iter()
            .filter_map(|space| space.outcome.as_ref().err())
    }
}

pub struct FeedSynchronizer<P: StoreProvider> {
    provider: P,
    owner: Owner,
    config: SyncConfig,
    feed: Mutex<OutputLog<P::EventLog>>,
    registry: Mutex<FollowRegistry<P::KeyedStore>>,
}

impl<P: StoreProvider> FeedSynchronizer<P> {
    /// Open the feed and follow registry of whoever `identity` names.
    pub async fn open(
        provider: P,
        identity: &dyn Identity,
        config: SyncConfig,
    ) -> Result<Self, StoreError> {
        let owner = identity.owner();
        let feed = OutputLog::open(&provider, &owner).await?;
        let registry = FollowRegistry::open(&provider, &owner).await?;
        Ok(Self {
            provider,
            owner,
            config,
            feed: Mutex::new(feed),
            registry: Mutex::new(registry),
        })
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Mutex<FollowRegistry<P::KeyedStore>> {
        &self.registry
    }

    /// Start following `space`. Its existing posts are picked up by the next sync.
    pub async fn follow(&self, space: &Space) -> Result<FollowEntry, StoreError> {
        self.registry.lock().await.follow(space).await
    }

    /// The most recent `limit` feed entries (all of them for `None`), oldest first.
    pub async fn feed(&self, limit: Option<usize>) -> Result<Vec<FeedEntry>, StoreError> {
        Ok(self.feed.lock().await.iterate(limit)?.collect())
    }

    /// Sync every space in the follow registry.
    pub async fn sync_all(&self) -> Result<SyncReport, StoreError> {
        let entries = self.registry.lock().await.list_all().await?;
        self.synchronize(entries).await
    }

    /// Sync the given follow entries and return the feed as it stands afterwards.
    ///
    /// Only reading the feed back at the end can fail the whole call; failures of individual
    /// spaces are in the report.
    pub async fn synchronize(&self, entries: Vec<FollowEntry>) -> Result<SyncReport, StoreError> {
        let started_at = Utc::now();
        log::info!(
            "Syncing {} followed space(s) into the feed of {}",
            entries.len(),
            self.owner
        );

        let spaces = match self.config.mode {
            SyncMode::Sequential => {
                let mut spaces = Vec::with_capacity(entries.len());
                for entry in &entries {
                    spaces.push(self.sync_reported(entry).await);
                }
                spaces
            }
            SyncMode::Parallel { max_concurrency } => {
                futures::stream::iter(&entries)
                    .map(|entry| self.sync_reported(entry))
                    .buffer_unordered(max_concurrency.max(1))
                    .collect::<Vec<_>>()
                    .await
            }
        };

        let feed = self.feed(None).await?;
        let report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            spaces,
            feed,
        };
        log::info!(
            "Sync complete: {} new post(s), {} failed space(s), {} post(s) in the feed",
            report.appended(),
            report.failures().count(),
            report.feed.len()
        );
        Ok(report)
    }

    async fn sync_reported(&self, entry: &FollowEntry) -> SpaceReport {
        let outcome = self.sync_space(entry).await;
        if let Err(e) = &outcome {
            log::warn!("Sync of {} failed: {}", entry.space_path, error_chain(e));
        }
        SpaceReport {
            space_path: entry.space_path.clone(),
            outcome,
        }
    }

    /// Sync one space. Both remote handles are dropped, and so closed, on every way out.
    pub async fn sync_space(&self, entry: &FollowEntry) -> Result<SpaceOutcome, SyncError> {
        let space = entry.space_path.as_str();
        let timeout = self.config.step_timeout;

        let posts = bounded(
            timeout,
            space,
            SyncStep::Open,
            open_keyed_store(&self.provider, &entry.links.post_store),
        )
        .await?;
        let counter = bounded(
            timeout,
            space,
            SyncStep::Open,
            open_counter(&self.provider, &entry.links.post_id_counter),
        )
        .await?;

        // Reading the counter is part of opening it: a just-loaded handle only fails here if it was
        // closed underneath us.
        let last_post_id = counter
            .value()
            .map_err(|source| SyncError::at(SyncStep::Open, space, source))?;
        let cursor = entry.last_known_post_id;
        if cursor >= last_post_id {
            log::debug!("{space} is up to date at post {cursor}");
            return Ok(SpaceOutcome::UpToDate { cursor });
        }

        let new_ids = cursor + 1..=last_post_id;
        log::debug!("{space}: fetching posts {}..={}", new_ids.start(), new_ids.end());
        let records = bounded(
            timeout,
            space,
            SyncStep::Query,
            posts.query(&move |key: &str, _: &serde_json::Value| {
                positional_id(key).is_some_and(|id| new_ids.contains(&id))
            }),
        )
        .await?;
        let batch = newest_first(space, records);
        let fetched = batch.len();

        let mut appended = 0;
        let mut duplicates = 0;
        {
            let mut feed = self.feed.lock().await;
            for post in &batch {
                if self.config.dedupe && feed.contains(&post.path) {
                    log::warn!("{} is already in the feed, not appending it again", post.path);
                    duplicates += 1;
                    continue;
                }
                bounded(timeout, space, SyncStep::Append, feed.append(post))
                    .await
                    .map_err(|e| match e {
                        SyncError::Append { space, source, .. } => SyncError::Append {
                            space,
                            appended,
                            source,
                        },
                        other => other,
                    })?;
                appended += 1;
            }
        }

        bounded(timeout, space, SyncStep::CursorWrite, async {
            self.registry.lock().await.advance(entry, last_post_id).await
        })
        .await
        .inspect_err(|e| log::error!("{}", error_chain(e)))?;

        log::info!("{space}: appended {appended} post(s), cursor {cursor} -> {last_post_id}");
        Ok(SpaceOutcome::Synced {
            fetched,
            appended,
            duplicates,
            cursor: last_post_id,
        })
    }
}

/// Run one step of a space's sync, mapping store failures and timeouts onto that step.
async fn bounded<T>(
    timeout: Option<Duration>,
    space: &str,
    step: SyncStep,
    step_future: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, SyncError> {
    let result = match timeout {
        Some(after) => match tokio::time::timeout(after, step_future).await {
            Ok(result) => result,
            Err(_) => {
                return Err(SyncError::Timeout {
                    space: space.to_string(),
                    step,
                    after,
                });
            }
        },
        None => step_future.await,
    };
    result.map_err(|source| SyncError::at(step, space, source))
}

/// Decode a fetched batch and order it newest first. Posts created at the same millisecond keep
/// ascending id order.
fn newest_first(space: &str, records: Vec<serde_json::Value>) -> Vec<Post> {
    let mut batch: Vec<Post> = records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<Post>(record) {
            Ok(post) => Some(post),
            Err(e) => {
                log::warn!("Skipping unreadable post in {space}: {e}");
                None
            }
        })
        .collect();
    batch.sort_by_key(|post| (Reverse(post.created.timestamp_millis), post.id()));
    batch
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
