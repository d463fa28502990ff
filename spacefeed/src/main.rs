use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use feedsync::data_model::{parent_path, positional_id};
use feedsync::fs::FsProvider;
use feedsync::{
    EntryHash, FeedSynchronizer, Owner, Post, PostContent, Publisher, SpaceContent, SpaceOutcome,
    StoreProvider, SyncConfig, SyncMode,
};

/// Follow spaces and sync their posts into a personal feed
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory the stores live in
    #[arg(long, env = "SPACEFEED_DATA_DIR", default_value = "./spacefeed-data")]
    data_dir: PathBuf,

    /// Account the feed, follows and spaces belong to
    #[arg(long, env = "SPACEFEED_OWNER")]
    owner: String,

    /// Give up on a space after this many seconds per step (0 waits forever)
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Sync up to this many spaces at once instead of one at a time
    #[arg(long)]
    parallel: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new space
    CreateSpace {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        desc: String,
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Publish a post into one of your spaces
    Publish {
        /// Path of the space, e.g. alice/spaces/1
        space: String,
        body: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        video: Option<String>,
    },
    /// Comment on a post
    Comment {
        /// Path of the post, e.g. bob/spaces/1/posts/3
        post: String,
        body: String,
        /// Id of the comment this one replies to
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Print the comments on a post
    Comments { post: String },
    /// Follow a space
    Follow { space: String },
    /// Pull new posts from every followed space into the feed
    Sync,
    /// Print the feed
    Feed {
        /// Only the most recent entries
        #[arg(short, long)]
        limit: Option<usize>,
        /// Print entries as JSON lines
        #[arg(long)]
        json: bool,
    },
}

impl Args {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            mode: match self.parallel {
                Some(max_concurrency) => SyncMode::Parallel { max_concurrency },
                None => SyncMode::Sequential,
            },
            step_timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            ..SyncConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let provider = FsProvider::new(&args.data_dir);
    let owner = Owner::new(args.owner.clone());
    let config = args.sync_config();

    match args.command {
        Command::CreateSpace {
            title,
            desc,
            avatar,
        } => {
            let space = Publisher::new(provider, &owner)
                .create_space(SpaceContent {
                    title,
                    desc,
                    avatar,
                })
                .await
                .context("Failed to create space")?;
            println!("{}", space.path);
        }
        Command::Publish {
            space,
            body,
            title,
            image,
            video,
        } => {
            let publisher = Publisher::new(provider, &owner);
            let space = publisher
                .get_space(&space)
                .await
                .with_context(|| format!("Failed to look up {space}"))?
                .ok_or_else(|| anyhow!("No space at {space}"))?;
            let post = publisher
                .publish_post(
                    &space,
                    PostContent {
                        title,
                        body,
                        image,
                        video,
                    },
                )
                .await
                .context("Failed to publish post")?;
            println!("{}", post.path);
        }
        Command::Comment {
            post,
            body,
            reply_to,
        } => {
            let publisher = Publisher::new(provider, &owner);
            let post = find_post(&publisher, &post).await?;
            let parent: Option<EntryHash> = reply_to
                .map(|id| serde_json::from_value(serde_json::Value::String(id)))
                .transpose()?;
            let comment = publisher
                .add_comment(&post, &body, parent.as_ref())
                .await
                .context("Failed to comment")?;
            println!("{}", comment.id);
        }
        Command::Comments { post } => {
            let publisher = Publisher::new(provider, &owner);
            let post = find_post(&publisher, &post).await?;
            for comment in publisher
                .list_comments(&post)
                .await
                .context("Failed to read comments")?
            {
                let when = comment
                    .value
                    .created
                    .timestamp()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                match &comment.value.parent_id {
                    Some(parent) => println!(
                        "{} {} [{}] in reply to {parent}",
                        comment.id, comment.value.owner, when
                    ),
                    None => println!("{} {} [{}]", comment.id, comment.value.owner, when),
                }
                println!("    {}", comment.value.body);
            }
        }
        Command::Follow { space } => {
            let found = Publisher::new(provider.clone(), &owner)
                .get_space(&space)
                .await
                .with_context(|| format!("Failed to look up {space}"))?
                .ok_or_else(|| anyhow!("No space at {space}"))?;
            let feed = FeedSynchronizer::open(provider, &owner, config)
                .await
                .context("Failed to open feed")?;
            let entry = feed.follow(&found).await.context("Failed to follow")?;
            println!(
                "Following {} (seen up to post {})",
                entry.space_path, entry.last_known_post_id
            );
        }
        Command::Sync => {
            let feed = FeedSynchronizer::open(provider, &owner, config)
                .await
                .context("Failed to open feed")?;
            let report = feed.sync_all().await.context("Sync failed")?;
            for space in &report.spaces {
                match &space.outcome {
                    Ok(SpaceOutcome::UpToDate { cursor }) => {
                        println!("  {}: up to date at post {cursor}", space.space_path);
                    }
                    Ok(SpaceOutcome::Synced {
                        appended,
                        duplicates,
                        cursor,
                        ..
                    }) => {
                        println!(
                            "  {}: {appended} new, {duplicates} already present, now at post {cursor}",
                            space.space_path
                        );
                    }
                    Err(e) => println!("  {}: FAILED ({e})", space.space_path),
                }
            }
            println!(
                "Synced {} space(s) in {} ms: {} new post(s), {} in the feed",
                report.spaces.len(),
                (report.finished_at - report.started_at).num_milliseconds(),
                report.appended(),
                report.feed.len()
            );
            if report.failures().next().is_some() {
                log::warn!("Some spaces failed to sync; they will be retried on the next run");
            }
        }
        Command::Feed { limit, json } => {
            let feed = FeedSynchronizer::open(provider, &owner, config)
                .await
                .context("Failed to open feed")?;
            for entry in feed.feed(limit).await.context("Failed to read feed")? {
                if json {
                    println!("{}", serde_json::to_string(&entry.post)?);
                    continue;
                }
                let when = entry
                    .post
                    .created
                    .timestamp()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                println!(
                    "#{} {} {} [{}]",
                    entry.seq, entry.hash, entry.post.path, when
                );
                if let Some(title) = &entry.post.content.title {
                    println!("    {title}");
                }
                println!("    {}", entry.post.content.body);
            }
        }
    }

    Ok(())
}

async fn find_post<P: StoreProvider>(publisher: &Publisher<P>, path: &str) -> Result<Post> {
    let id = positional_id(path).ok_or_else(|| anyhow!("{path} is not a post path"))?;
    let space_path = parent_path(parent_path(path));
    let space = publisher
        .get_space(space_path)
        .await
        .with_context(|| format!("Failed to look up {space_path}"))?
        .ok_or_else(|| anyhow!("No space at {space_path}"))?;
    publisher
        .get_post(&space, id)
        .await
        .with_context(|| format!("Failed to look up {path}"))?
        .ok_or_else(|| anyhow!("No post at {path}"))
}
