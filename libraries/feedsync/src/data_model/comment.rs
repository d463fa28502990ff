use crate::data_model::{Created, EntryHash, Owner};

/// A comment as appended to a post's comment log.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentValue {
    pub owner: Owner,
    pub body: String,
    pub created: Created,
    /// The comment this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntryHash>,
}

/// A comment read back from the log. Its id is the hash of the log entry holding it.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Comment {
    pub id: EntryHash,
    #[serde(flatten)]
    pub value: CommentValue,
}
