use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(TeamId);
id_newtype!(ChannelId);
id_newtype!(PostId);
id_newtype!(TempId);
id_newtype!(CategoryId);
id_newtype!(FileId);

impl TempId {
    /// Client-generated correlation key for a post that has not been
    /// confirmed by the server yet.
    pub fn generate(user_id: &UserId) -> Self {
        Self(format!("{}:{}", user_id, uuid::Uuid::new_v4().simple()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    #[serde(rename = "O", alias = "public")]
    Open,
    #[serde(rename = "P", alias = "private")]
    Private,
    #[serde(rename = "D", alias = "direct")]
    Direct,
    #[serde(rename = "G", alias = "group")]
    Group,
}

impl ChannelKind {
    /// Direct and group conversations have no @mention distinction.
    pub fn is_direct_or_group(self) -> bool {
        matches!(self, Self::Direct | Self::Group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    Favorites,
    Channels,
    DirectMessages,
    Custom,
}

/// Identity of a post inside the client: provisional until the server
/// assigns an id, authoritative afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum PostKey {
    Pending(TempId),
    Confirmed(PostId),
}

impl PostKey {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending(temp_id) => temp_id.as_str(),
            Self::Confirmed(post_id) => post_id.as_str(),
        }
    }

    pub fn confirmed(&self) -> Option<&PostId> {
        match self {
            Self::Confirmed(post_id) => Some(post_id),
            Self::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl From<PostId> for PostKey {
    fn from(value: PostId) -> Self {
        Self::Confirmed(value)
    }
}

impl From<TempId> for PostKey {
    fn from(value: TempId) -> Self {
        Self::Pending(value)
    }
}

impl fmt::Display for PostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(temp_id) => write!(f, "pending:{temp_id}"),
            Self::Confirmed(post_id) => write!(f, "{post_id}"),
        }
    }
}

/// At most one reaction exists per `(post_id, emoji_name, user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub post_id: PostId,
    pub emoji_name: String,
    pub user_id: UserId,
}

impl Reaction {
    pub fn new(
        post_id: impl Into<PostId>,
        emoji_name: impl Into<String>,
        user_id: impl Into<UserId>,
    ) -> Self {
        Self {
            post_id: post_id.into(),
            emoji_name: emoji_name.into(),
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_post_id: Option<TempId>,
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<PostId>,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_type: String,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    #[serde(default)]
    pub reactions: BTreeSet<Reaction>,
    #[serde(default)]
    pub reply_count: u32,
}

impl Post {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_pending()
    }

    pub fn is_reply(&self) -> bool {
        self.root_id.is_some()
    }

    pub fn is_system(&self) -> bool {
        self.post_type.starts_with("system_")
    }

    pub fn confirmed_id(&self) -> Option<&PostId> {
        self.id.confirmed()
    }
}

/// Keeps the first occurrence of every file id, preserving order.
pub fn dedupe_file_ids(file_ids: Vec<FileId>) -> Vec<FileId> {
    let mut seen = BTreeSet::new();
    file_ids
        .into_iter()
        .filter(|file_id| seen.insert(file_id.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    pub kind: ChannelKind,
    pub display_name: String,
    #[serde(default)]
    pub member_ids: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_viewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub muted: bool,
}

impl Channel {
    pub fn new(
        id: impl Into<ChannelId>,
        team_id: Option<TeamId>,
        kind: ChannelKind,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            team_id,
            kind,
            display_name: display_name.into(),
            member_ids: BTreeSet::new(),
            last_viewed_at: None,
            muted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub team_id: TeamId,
    pub kind: CategoryKind,
    pub display_name: String,
    pub channel_ids: Vec<ChannelId>,
    #[serde(default)]
    pub collapsed: bool,
}

impl Category {
    pub fn new(
        id: impl Into<CategoryId>,
        team_id: impl Into<TeamId>,
        kind: CategoryKind,
        channel_ids: Vec<ChannelId>,
    ) -> Self {
        let id = id.into();
        let display_name = match kind {
            CategoryKind::Favorites => "Favorites".to_string(),
            CategoryKind::Channels => "Channels".to_string(),
            CategoryKind::DirectMessages => "Direct Messages".to_string(),
            CategoryKind::Custom => id.to_string(),
        };
        Self {
            id,
            team_id: team_id.into(),
            kind,
            display_name,
            channel_ids,
            collapsed: false,
        }
    }

    pub fn contains(&self, channel_id: &ChannelId) -> bool {
        self.channel_ids.contains(channel_id)
    }
}

/// One page returned by a pagination or thread fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub posts: Vec<Post>,
    pub has_more: bool,
}
