use crate::data_model::{Space, SpaceLinks};

/// Subscription state for one followed space. `last_known_post_id` is the sync cursor: every post
/// with an id at or below it has already been copied into the feed.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowEntry {
    pub space_path: String,
    pub last_known_post_id: u64,
    pub links: SpaceLinks,
}

impl FollowEntry {
    pub fn new(space: &Space) -> Self {
        Self {
            space_path: space.path.clone(),
            last_known_post_id: 0,
            links: space.links.clone(),
        }
    }
}
