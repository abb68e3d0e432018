//! Self-expiring "is typing" state, kept apart from the persistent stores.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use shared::domain::{ChannelId, PostId, UserId};
use tokio::time::Instant;
use tracing::trace;

use crate::{
    decoder::{DecodedEvent, EventKind, EventPayload},
    error::SyncError,
    router::{Concern, EventHandler},
    Mutation,
};

type TypingKey = (UserId, Option<PostId>);

#[derive(Debug)]
pub struct TypingIndicators {
    window: Duration,
    channels: HashMap<ChannelId, HashMap<TypingKey, Instant>>,
}

impl TypingIndicators {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            channels: HashMap::new(),
        }
    }

    /// Starts or extends the typing window of `user_id` in a channel or in
    /// the thread under `parent_id`.
    pub fn user_typing(
        &mut self,
        channel_id: &ChannelId,
        user_id: &UserId,
        parent_id: Option<&PostId>,
        now: Instant,
    ) -> Mutation {
        let expires_at = now + self.window;
        let previous = self
            .channels
            .entry(channel_id.clone())
            .or_default()
            .insert((user_id.clone(), parent_id.cloned()), expires_at);
        Mutation::from_changed(previous.map_or(true, |expiry| expiry <= now))
    }

    pub fn clear_user(&mut self, channel_id: &ChannelId, user_id: &UserId) -> Mutation {
        let Some(entries) = self.channels.get_mut(channel_id) else {
            return Mutation::Unchanged;
        };
        let before = entries.len();
        entries.retain(|(typing_user, _), _| typing_user != user_id);
        let changed = before != entries.len();
        if entries.is_empty() {
            self.channels.remove(channel_id);
        }
        Mutation::from_changed(changed)
    }

    pub fn clear_channel(&mut self, channel_id: &ChannelId) -> Mutation {
        Mutation::from_changed(self.channels.remove(channel_id).is_some())
    }

    /// Drops expired entries and returns the channels whose typing set
    /// changed.
    pub fn sweep(&mut self, now: Instant) -> Vec<ChannelId> {
        let mut changed = Vec::new();
        self.channels.retain(|channel_id, entries| {
            let before = entries.len();
            entries.retain(|_, expires_at| *expires_at > now);
            if entries.len() != before {
                changed.push(channel_id.clone());
            }
            !entries.is_empty()
        });
        if !changed.is_empty() {
            trace!(channels = changed.len(), "typing: swept expired entries");
        }
        changed
    }

    /// Users typing in the channel (`parent_id = None`) or in one thread,
    /// sorted and without expired entries.
    pub fn typing_users(&self, channel_id: &ChannelId, parent_id: Option<&PostId>, now: Instant) -> Vec<UserId> {
        let Some(entries) = self.channels.get(channel_id) else {
            return Vec::new();
        };
        let mut users = entries
            .iter()
            .filter(|((_, parent), expires_at)| parent.as_ref() == parent_id && **expires_at > now)
            .map(|((user_id, _), _)| user_id.clone())
            .collect::<Vec<_>>();
        users.sort();
        users.dedup();
        users
    }
}

pub struct TypingEvents {
    indicators: Arc<RwLock<TypingIndicators>>,
    local_user_id: UserId,
}

impl TypingEvents {
    pub fn new(indicators: Arc<RwLock<TypingIndicators>>, local_user_id: UserId) -> Self {
        Self {
            indicators,
            local_user_id,
        }
    }
}

impl EventHandler for TypingEvents {
    fn name(&self) -> &'static str {
        "typing"
    }

    fn concern(&self) -> Concern {
        Concern::Typing
    }

    fn accepts(&self, kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::Typing | EventKind::Posted | EventKind::ChannelDeleted
        )
    }

    fn handle(&self, event: &DecodedEvent) -> Result<Mutation, SyncError> {
        match &event.payload {
            EventPayload::Typing { user_id, parent_id } => {
                if *user_id == self.local_user_id {
                    return Ok(Mutation::Unchanged);
                }
                let channel_id = event
                    .channel_id
                    .as_ref()
                    .ok_or_else(|| SyncError::validation("typing event without channel"))?;
                Ok(self
                    .indicators
                    .write()
                    .user_typing(channel_id, user_id, parent_id.as_ref(), Instant::now()))
            }
            EventPayload::Post { post, .. } => Ok(self
                .indicators
                .write()
                .clear_user(&post.channel_id, &post.user_id)),
            EventPayload::ChannelRemoved { channel_id, .. } => {
                Ok(self.indicators.write().clear_channel(channel_id))
            }
            _ => Ok(Mutation::Unchanged),
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
