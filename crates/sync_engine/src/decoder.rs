//! Normalizes push events into [`DecodedEvent`]s.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{Category, CategoryId, Channel, ChannelId, ChannelKind, Post, PostId, Reaction, TeamId, UserId},
    protocol::{
        millis_to_datetime, non_empty, CategoryPayload, ChannelMemberPayload, ChannelPayload,
        PostPayload, RawEvent, ReactionPayload, WireError,
    },
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid event envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed `{field}` in event payload: {source}")]
    Json {
        field: &'static str,
        source: serde_json::Error,
    },
    #[error("missing `{0}` in event payload")]
    MissingField(&'static str),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Posted,
    PostEdited,
    PostDeleted,
    ReactionAdded,
    ReactionRemoved,
    ChannelViewed,
    MultipleChannelsViewed,
    Typing,
    UserAdded,
    UserRemoved,
    ChannelCreated,
    ChannelUpdated,
    ChannelDeleted,
    ChannelMemberUpdated,
    CategoryCreated,
    CategoryUpdated,
    CategoryDeleted,
    CategoryOrderUpdated,
    Hello,
    Unknown(String),
}

impl EventKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "posted" => Self::Posted,
            "post_edited" => Self::PostEdited,
            "post_deleted" => Self::PostDeleted,
            "reaction_added" => Self::ReactionAdded,
            "reaction_removed" => Self::ReactionRemoved,
            "channel_viewed" => Self::ChannelViewed,
            "multiple_channels_viewed" => Self::MultipleChannelsViewed,
            "typing" => Self::Typing,
            "user_added" => Self::UserAdded,
            "user_removed" => Self::UserRemoved,
            "channel_created" => Self::ChannelCreated,
            "channel_updated" => Self::ChannelUpdated,
            "channel_deleted" => Self::ChannelDeleted,
            "channel_member_updated" => Self::ChannelMemberUpdated,
            "sidebar_category_created" => Self::CategoryCreated,
            "sidebar_category_updated" => Self::CategoryUpdated,
            "sidebar_category_deleted" => Self::CategoryDeleted,
            "sidebar_category_order_updated" => Self::CategoryOrderUpdated,
            "hello" => Self::Hello,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Posted => "posted",
            Self::PostEdited => "post_edited",
            Self::PostDeleted => "post_deleted",
            Self::ReactionAdded => "reaction_added",
            Self::ReactionRemoved => "reaction_removed",
            Self::ChannelViewed => "channel_viewed",
            Self::MultipleChannelsViewed => "multiple_channels_viewed",
            Self::Typing => "typing",
            Self::UserAdded => "user_added",
            Self::UserRemoved => "user_removed",
            Self::ChannelCreated => "channel_created",
            Self::ChannelUpdated => "channel_updated",
            Self::ChannelDeleted => "channel_deleted",
            Self::ChannelMemberUpdated => "channel_member_updated",
            Self::CategoryCreated => "sidebar_category_created",
            Self::CategoryUpdated => "sidebar_category_updated",
            Self::CategoryDeleted => "sidebar_category_deleted",
            Self::CategoryOrderUpdated => "sidebar_category_order_updated",
            Self::Hello => "hello",
            Self::Unknown(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// `posted`, `post_edited` and `post_deleted` all carry the full post.
    Post {
        post: Post,
        channel_kind: Option<ChannelKind>,
    },
    Reaction(Reaction),
    /// One or more channels acknowledged as read. Without an explicit time the
    /// counter falls back to the newest post it has seen in the channel.
    ChannelsViewed(Vec<(ChannelId, Option<DateTime<Utc>>)>),
    Typing {
        user_id: UserId,
        parent_id: Option<PostId>,
    },
    Membership {
        channel_id: ChannelId,
        user_id: UserId,
    },
    Channel(Channel),
    ChannelRemoved {
        channel_id: ChannelId,
        deleted_at: Option<DateTime<Utc>>,
    },
    ChannelMember {
        channel_id: ChannelId,
        user_id: UserId,
        muted: bool,
        last_viewed_at: Option<DateTime<Utc>>,
    },
    Categories(Vec<Category>),
    CategoryRemoved {
        team_id: TeamId,
        category_id: CategoryId,
    },
    CategoryOrder {
        team_id: TeamId,
        order: Vec<CategoryId>,
    },
    Hello {
        connection_id: Option<String>,
    },
    Unknown(Value),
}

/// Tagged, typed form of a push event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub kind: EventKind,
    pub channel_id: Option<ChannelId>,
    pub team_id: Option<TeamId>,
    pub user_id: Option<UserId>,
    pub seq: Option<i64>,
    pub payload: EventPayload,
}

impl DecodedEvent {
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        let mut event = Self {
            kind,
            channel_id: None,
            team_id: None,
            user_id: None,
            seq: None,
            payload,
        };
        event.fill_scope_from_payload();
        event
    }

    fn fill_scope_from_payload(&mut self) {
        let (channel_id, team_id, user_id) = match &self.payload {
            EventPayload::Post { post, .. } => {
                (Some(post.channel_id.clone()), None, Some(post.user_id.clone()))
            }
            EventPayload::Reaction(reaction) => (None, None, Some(reaction.user_id.clone())),
            EventPayload::ChannelsViewed(viewed) if viewed.len() == 1 => {
                (Some(viewed[0].0.clone()), None, None)
            }
            EventPayload::Typing { user_id, .. } => (None, None, Some(user_id.clone())),
            EventPayload::Membership {
                channel_id,
                user_id,
            }
            | EventPayload::ChannelMember {
                channel_id,
                user_id,
                ..
            } => (Some(channel_id.clone()), None, Some(user_id.clone())),
            EventPayload::Channel(channel) => {
                (Some(channel.id.clone()), channel.team_id.clone(), None)
            }
            EventPayload::ChannelRemoved { channel_id, .. } => {
                (Some(channel_id.clone()), None, None)
            }
            EventPayload::Categories(categories) => {
                (None, categories.first().map(|c| c.team_id.clone()), None)
            }
            EventPayload::CategoryRemoved { team_id, .. }
            | EventPayload::CategoryOrder { team_id, .. } => (None, Some(team_id.clone()), None),
            _ => (None, None, None),
        };
        if self.channel_id.is_none() {
            self.channel_id = channel_id;
        }
        if self.team_id.is_none() {
            self.team_id = team_id;
        }
        if self.user_id.is_none() {
            self.user_id = user_id;
        }
    }
}

pub fn decode_str(text: &str) -> Result<DecodedEvent, DecodeError> {
    let raw: RawEvent = serde_json::from_str(text).map_err(DecodeError::Envelope)?;
    decode(raw)
}

pub fn decode(raw: RawEvent) -> Result<DecodedEvent, DecodeError> {
    let kind = EventKind::parse(&raw.event);
    let data = &raw.data;
    let broadcast_channel: Option<ChannelId> = non_empty(&raw.broadcast.channel_id);
    let broadcast_team: Option<TeamId> = non_empty(&raw.broadcast.team_id);
    let broadcast_user: Option<UserId> = non_empty(&raw.broadcast.user_id);

    let payload = match &kind {
        EventKind::Posted | EventKind::PostEdited | EventKind::PostDeleted => {
            let payload: PostPayload = nested(data, "post")?;
            let channel_kind = match string_field(data, "channel_type") {
                Some(code) => serde_json::from_value(Value::String(code)).ok(),
                None => None,
            };
            EventPayload::Post {
                post: Post::try_from(payload)?,
                channel_kind,
            }
        }
        EventKind::ReactionAdded | EventKind::ReactionRemoved => {
            let payload: ReactionPayload = nested(data, "reaction")?;
            EventPayload::Reaction(Reaction::try_from(payload)?)
        }
        EventKind::ChannelViewed => {
            let channel_id = string_field(data, "channel_id")
                .map(ChannelId::from)
                .or_else(|| broadcast_channel.clone())
                .ok_or(DecodeError::MissingField("channel_id"))?;
            EventPayload::ChannelsViewed(vec![(channel_id, None)])
        }
        EventKind::MultipleChannelsViewed => {
            let times: std::collections::BTreeMap<String, i64> = nested(data, "channel_times")?;
            let mut viewed = Vec::with_capacity(times.len());
            for (channel_id, millis) in times {
                viewed.push((
                    ChannelId::from(channel_id),
                    millis_to_datetime("channel_times", millis)?,
                ));
            }
            EventPayload::ChannelsViewed(viewed)
        }
        EventKind::Typing => {
            let user_id = string_field(data, "user_id")
                .map(UserId::from)
                .or_else(|| broadcast_user.clone())
                .ok_or(DecodeError::MissingField("user_id"))?;
            EventPayload::Typing {
                user_id,
                parent_id: string_field(data, "parent_id").map(PostId::from),
            }
        }
        EventKind::UserAdded | EventKind::UserRemoved => {
            let channel_id = string_field(data, "channel_id")
                .map(ChannelId::from)
                .or_else(|| broadcast_channel.clone())
                .ok_or(DecodeError::MissingField("channel_id"))?;
            let user_id = string_field(data, "user_id")
                .map(UserId::from)
                .or_else(|| broadcast_user.clone())
                .ok_or(DecodeError::MissingField("user_id"))?;
            EventPayload::Membership {
                channel_id,
                user_id,
            }
        }
        EventKind::ChannelCreated | EventKind::ChannelUpdated => {
            let payload: ChannelPayload = nested(data, "channel")?;
            let mut channel = Channel::try_from(payload)?;
            if channel.team_id.is_none() {
                channel.team_id = string_field(data, "team_id")
                    .map(TeamId::from)
                    .or_else(|| broadcast_team.clone());
            }
            EventPayload::Channel(channel)
        }
        EventKind::ChannelDeleted => {
            let channel_id = string_field(data, "channel_id")
                .map(ChannelId::from)
                .or_else(|| broadcast_channel.clone())
                .ok_or(DecodeError::MissingField("channel_id"))?;
            let deleted_at = match data.get("delete_at").and_then(Value::as_i64) {
                Some(millis) => millis_to_datetime("delete_at", millis)?,
                None => None,
            };
            EventPayload::ChannelRemoved {
                channel_id,
                deleted_at,
            }
        }
        EventKind::ChannelMemberUpdated => {
            let member: ChannelMemberPayload = nested(data, "channelMember")?;
            EventPayload::ChannelMember {
                channel_id: non_empty(&member.channel_id)
                    .ok_or(DecodeError::MissingField("channel_id"))?,
                user_id: non_empty(&member.user_id).ok_or(DecodeError::MissingField("user_id"))?,
                muted: member.is_muted(),
                last_viewed_at: millis_to_datetime("last_viewed_at", member.last_viewed_at)?,
            }
        }
        EventKind::CategoryCreated => {
            let payload: CategoryPayload = nested(data, "category")?;
            EventPayload::Categories(vec![Category::try_from(payload)?])
        }
        EventKind::CategoryUpdated => {
            let payloads: Vec<CategoryPayload> = nested(data, "updatedCategories")?;
            let categories = payloads
                .into_iter()
                .map(Category::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            EventPayload::Categories(categories)
        }
        EventKind::CategoryDeleted => EventPayload::CategoryRemoved {
            team_id: broadcast_team
                .clone()
                .ok_or(DecodeError::MissingField("team_id"))?,
            category_id: string_field(data, "category_id")
                .map(CategoryId::from)
                .ok_or(DecodeError::MissingField("category_id"))?,
        },
        EventKind::CategoryOrderUpdated => {
            let order: Vec<String> = nested(data, "order")?;
            EventPayload::CategoryOrder {
                team_id: broadcast_team
                    .clone()
                    .ok_or(DecodeError::MissingField("team_id"))?,
                order: order.into_iter().map(CategoryId::from).collect(),
            }
        }
        EventKind::Hello => EventPayload::Hello {
            connection_id: string_field(data, "connection_id"),
        },
        EventKind::Unknown(_) => EventPayload::Unknown(raw.data.clone()),
    };

    let team_id = broadcast_team.or_else(|| string_field(data, "team_id").map(TeamId::from));
    let mut event = DecodedEvent {
        kind,
        channel_id: broadcast_channel,
        team_id,
        user_id: broadcast_user,
        seq: raw.seq,
        payload,
    };
    event.fill_scope_from_payload();
    Ok(event)
}

/// Nested records arrive either inline or as JSON-encoded strings.
fn nested<T: DeserializeOwned>(data: &Value, field: &'static str) -> Result<T, DecodeError> {
    let value = data.get(field).ok_or(DecodeError::MissingField(field))?;
    let parsed = match value {
        Value::String(encoded) => serde_json::from_str(encoded),
        inline => serde_json::from_value(inline.clone()),
    };
    parsed.map_err(|source| DecodeError::Json { field, source })
}

fn string_field(data: &Value, field: &str) -> Option<String> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
#[path = "tests/decoder_tests.rs"]
mod tests;
