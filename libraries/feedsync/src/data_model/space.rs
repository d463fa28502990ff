use crate::data_model::{Created, Link, Owner};

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpaceContent {
    pub title: String,
    pub desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Where a space keeps its posts and the counter that hands out post ids.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceLinks {
    pub post_store: Link,
    pub post_id_counter: Link,
}

/// A followable container of posts. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Space {
    pub id: String,
    pub path: String,
    pub owner: Owner,
    pub created: Created,
    pub content: SpaceContent,
    pub links: SpaceLinks,
}

impl Space {
    /// The namespace posts of this space live under. A post with id `n` is at `<posts_path>/n`.
    pub fn posts_path(&self) -> String {
        posts_path(&self.path)
    }
}

pub(crate) fn posts_path(space_path: &str) -> String {
    format!("{space_path}/posts")
}
