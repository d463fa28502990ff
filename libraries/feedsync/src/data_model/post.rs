use crate::data_model::{Created, Link, Owner, positional_id};

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PostContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
}

/// Per-post resources. Opaque to the feed: they are carried along, never opened.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostLinks {
    pub comment_store: Link,
    pub add_counter: Link,
    pub del_counter: Link,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// `<space path>/posts/<id>`. Also the key the post is stored under.
    pub path: String,
    pub space_path: String,
    pub owner: Owner,
    pub created: Created,
    pub content: PostContent,
    pub links: PostLinks,
}

impl Post {
    pub fn id(&self) -> Option<u64> {
        positional_id(&self.path)
    }
}
