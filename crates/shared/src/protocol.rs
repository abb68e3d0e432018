use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    dedupe_file_ids, Category, CategoryId, CategoryKind, Channel, ChannelId, ChannelKind, FileId,
    Page, Post, PostId, PostKey, Reaction, TeamId, TempId, UserId,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid timestamp {value} in field `{field}`")]
    InvalidTimestamp { field: &'static str, value: i64 },
}

/// Push event as delivered by the websocket connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub broadcast: Broadcast,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
}

/// Empty strings are how the server encodes "no id".
pub fn non_empty<T: From<String>>(value: &str) -> Option<T> {
    if value.is_empty() {
        None
    } else {
        Some(T::from(value.to_string()))
    }
}

/// Epoch milliseconds to a UTC timestamp; `0` means absent.
pub fn millis_to_datetime(
    field: &'static str,
    value: i64,
) -> Result<Option<DateTime<Utc>>, WireError> {
    if value == 0 {
        return Ok(None);
    }
    DateTime::<Utc>::from_timestamp_millis(value)
        .map(Some)
        .ok_or(WireError::InvalidTimestamp { field, value })
}

fn required_millis(field: &'static str, value: i64) -> Result<DateTime<Utc>, WireError> {
    millis_to_datetime(field, value)?.ok_or(WireError::MissingField(field))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub user_id: String,
    pub post_id: String,
    pub emoji_name: String,
    #[serde(default)]
    pub create_at: i64,
}

impl TryFrom<ReactionPayload> for Reaction {
    type Error = WireError;

    fn try_from(value: ReactionPayload) -> Result<Self, Self::Error> {
        let post_id: PostId = non_empty(&value.post_id).ok_or(WireError::MissingField("post_id"))?;
        let user_id: UserId = non_empty(&value.user_id).ok_or(WireError::MissingField("user_id"))?;
        if value.emoji_name.is_empty() {
            return Err(WireError::MissingField("emoji_name"));
        }
        Ok(Reaction {
            post_id,
            emoji_name: value.emoji_name,
            user_id,
        })
    }
}

impl From<&Reaction> for ReactionPayload {
    fn from(value: &Reaction) -> Self {
        Self {
            user_id: value.user_id.to_string(),
            post_id: value.post_id.to_string(),
            emoji_name: value.emoji_name.clone(),
            create_at: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMetadata {
    #[serde(default)]
    pub reactions: Vec<ReactionPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostPayload {
    pub id: String,
    pub create_at: i64,
    #[serde(default)]
    pub update_at: i64,
    #[serde(default)]
    pub delete_at: i64,
    pub user_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub root_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub post_type: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub pending_post_id: String,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PostMetadata>,
}

impl TryFrom<PostPayload> for Post {
    type Error = WireError;

    fn try_from(value: PostPayload) -> Result<Self, Self::Error> {
        let id: PostId = non_empty(&value.id).ok_or(WireError::MissingField("id"))?;
        let channel_id: ChannelId =
            non_empty(&value.channel_id).ok_or(WireError::MissingField("channel_id"))?;
        let user_id: UserId = non_empty(&value.user_id).ok_or(WireError::MissingField("user_id"))?;
        let created_at = required_millis("create_at", value.create_at)?;
        let updated_at = millis_to_datetime("update_at", value.update_at)?.unwrap_or(created_at);
        let deleted_at = millis_to_datetime("delete_at", value.delete_at)?;

        let reactions = value
            .metadata
            .map(|metadata| metadata.reactions)
            .unwrap_or_default()
            .into_iter()
            .map(Reaction::try_from)
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Post {
            id: PostKey::Confirmed(id),
            pending_post_id: non_empty(&value.pending_post_id),
            channel_id,
            root_id: non_empty(&value.root_id),
            user_id,
            created_at,
            updated_at,
            deleted_at,
            message: value.message,
            post_type: value.post_type,
            file_ids: dedupe_file_ids(value.file_ids.into_iter().map(FileId::from).collect()),
            reactions,
            reply_count: value.reply_count,
        })
    }
}

/// Ordered post listing returned by the channel-posts and thread endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostListResponse {
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub posts: HashMap<String, PostPayload>,
    #[serde(default)]
    pub next_post_id: String,
    #[serde(default)]
    pub prev_post_id: String,
    #[serde(default)]
    pub has_next: bool,
}

impl PostListResponse {
    /// Posts listed in `order` first, then any extra posts the server
    /// attached (thread roots, for example).
    pub fn into_page(mut self, has_more: bool) -> Result<Page, WireError> {
        let mut posts = Vec::with_capacity(self.posts.len());
        for id in &self.order {
            if let Some(payload) = self.posts.remove(id) {
                posts.push(Post::try_from(payload)?);
            }
        }
        let mut rest = self.posts.into_values().collect::<Vec<_>>();
        rest.sort_by(|a, b| a.id.cmp(&b.id));
        for payload in rest {
            posts.push(Post::try_from(payload)?);
        }
        Ok(Page { posts, has_more })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub total_msg_count: u64,
}

impl TryFrom<ChannelPayload> for Channel {
    type Error = WireError;

    fn try_from(value: ChannelPayload) -> Result<Self, Self::Error> {
        let id: ChannelId = non_empty(&value.id).ok_or(WireError::MissingField("id"))?;
        let display_name = if value.display_name.is_empty() {
            value.name
        } else {
            value.display_name
        };
        Ok(Channel::new(
            id,
            non_empty(&value.team_id),
            value.kind,
            display_name,
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyProps {
    #[serde(default)]
    pub mark_unread: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMemberPayload {
    pub channel_id: String,
    pub user_id: String,
    #[serde(default)]
    pub last_viewed_at: i64,
    #[serde(default)]
    pub msg_count: u64,
    #[serde(default)]
    pub mention_count: u32,
    #[serde(default)]
    pub notify_props: NotifyProps,
}

impl ChannelMemberPayload {
    pub fn is_muted(&self) -> bool {
        self.notify_props.mark_unread == "mention"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPayload {
    pub id: String,
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: CategoryKind,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub collapsed: bool,
}

impl TryFrom<CategoryPayload> for Category {
    type Error = WireError;

    fn try_from(value: CategoryPayload) -> Result<Self, Self::Error> {
        let id: CategoryId = non_empty(&value.id).ok_or(WireError::MissingField("id"))?;
        let team_id: TeamId = non_empty(&value.team_id).ok_or(WireError::MissingField("team_id"))?;
        let mut category = Category::new(
            id,
            team_id,
            value.kind,
            value.channel_ids.into_iter().map(ChannelId::from).collect(),
        );
        if !value.display_name.is_empty() {
            category.display_name = value.display_name;
        }
        category.collapsed = value.collapsed;
        Ok(category)
    }
}

impl CategoryPayload {
    pub fn from_category(category: &Category, user_id: &UserId) -> Self {
        Self {
            id: category.id.to_string(),
            team_id: category.team_id.to_string(),
            user_id: user_id.to_string(),
            kind: category.kind,
            display_name: category.display_name.clone(),
            channel_ids: category.channel_ids.iter().map(ToString::to_string).collect(),
            collapsed: category.collapsed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoriesResponse {
    #[serde(default)]
    pub categories: Vec<CategoryPayload>,
    #[serde(default)]
    pub order: Vec<String>,
}

impl CategoriesResponse {
    /// Categories in sidebar order; categories missing from `order` keep
    /// their listing position after the ordered ones.
    pub fn into_categories(self) -> Result<Vec<Category>, WireError> {
        let mut categories = self
            .categories
            .into_iter()
            .map(Category::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let rank = |category: &Category| {
            self.order
                .iter()
                .position(|id| id == category.id.as_str())
                .unwrap_or(usize::MAX)
        };
        categories.sort_by_key(rank);
        Ok(categories)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePostRequest {
    pub channel_id: String,
    #[serde(default)]
    pub root_id: String,
    pub message: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    pub pending_post_id: String,
}

impl CreatePostRequest {
    pub fn new(
        channel_id: &ChannelId,
        root_id: Option<&PostId>,
        message: &str,
        file_ids: &[FileId],
        pending_post_id: &TempId,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            root_id: root_id.map(ToString::to_string).unwrap_or_default(),
            message: message.to_string(),
            file_ids: file_ids.iter().map(ToString::to_string).collect(),
            pending_post_id: pending_post_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPostRequest {
    pub message: String,
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChannelRequest {
    pub channel_id: String,
    #[serde(default)]
    pub prev_channel_id: String,
}

/// Error body attached to non-2xx REST responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorBody {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status_code: u16,
}
