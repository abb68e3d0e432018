//! Per-channel and per-team unread and mention counters.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use shared::domain::{Channel, ChannelId, ChannelKind, Post, PostId, TeamId, UserId};
use tracing::{debug, info, warn};

use crate::{
    decoder::{DecodedEvent, EventKind, EventPayload},
    error::SyncError,
    router::{Concern, EventHandler},
    Mutation,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnreadCounts {
    pub msg_count: u32,
    pub mention_count: u32,
}

impl UnreadCounts {
    pub fn new(msg_count: u32, mention_count: u32) -> Self {
        Self {
            msg_count,
            mention_count,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.msg_count == 0 && self.mention_count == 0
    }

    fn add(&mut self, other: UnreadCounts) {
        self.msg_count = self.msg_count.saturating_add(other.msg_count);
        self.mention_count = self.mention_count.saturating_add(other.mention_count);
    }

    fn subtract(&mut self, other: UnreadCounts) {
        self.msg_count = self.msg_count.saturating_sub(other.msg_count);
        self.mention_count = self.mention_count.saturating_sub(other.mention_count);
    }
}

/// Case-insensitive whole-word matcher for the local user's mention tokens.
#[derive(Debug, Clone)]
pub struct MentionMatcher {
    pattern: Option<Regex>,
}

impl MentionMatcher {
    pub fn new<S: AsRef<str>>(tokens: &[S]) -> Result<Self, regex::Error> {
        let alternatives = tokens
            .iter()
            .map(AsRef::as_ref)
            .filter(|token| !token.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>();
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let pattern = Regex::new(&format!(
            r"(?i)(?:^|[^\w@])(?:{})(?:$|[^\w-])",
            alternatives.join("|")
        ))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn mentions(&self, text: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(text))
    }
}

#[derive(Debug, Default)]
struct ChannelUnread {
    team_id: Option<TeamId>,
    kind: Option<ChannelKind>,
    counts: UnreadCounts,
    last_viewed_at: Option<DateTime<Utc>>,
    newest_seen_at: Option<DateTime<Utc>>,
    counted: VecDeque<PostId>,
    counted_ids: HashSet<PostId>,
}

impl ChannelUnread {
    fn remember(&mut self, post_id: &PostId, window: usize) -> bool {
        if !self.counted_ids.insert(post_id.clone()) {
            return false;
        }
        self.counted.push_back(post_id.clone());
        while self.counted.len() > window.max(1) {
            if let Some(evicted) = self.counted.pop_front() {
                self.counted_ids.remove(&evicted);
            }
        }
        true
    }
}

/// Counts are only ever incremented by qualifying posts and reset by
/// viewed acknowledgements. Team totals are kept incrementally as the sum
/// of their channels.
#[derive(Debug)]
pub struct UnreadCounter {
    local_user_id: UserId,
    matcher: MentionMatcher,
    replay_window: usize,
    channels: HashMap<ChannelId, ChannelUnread>,
    teams: HashMap<TeamId, UnreadCounts>,
}

impl UnreadCounter {
    pub fn new(local_user_id: UserId, matcher: MentionMatcher, replay_window: usize) -> Self {
        Self {
            local_user_id,
            matcher,
            replay_window,
            channels: HashMap::new(),
            teams: HashMap::new(),
        }
    }

    /// Records the team and kind of a channel so later posts are attributed
    /// correctly. Moving a channel between teams moves its counts too.
    pub fn register_channel(&mut self, channel: &Channel) -> Mutation {
        let entry = self.channels.entry(channel.id.clone()).or_default();
        let mut changed = entry.kind != Some(channel.kind);
        entry.kind = Some(channel.kind);
        if let Some(viewed) = channel.last_viewed_at {
            if entry.last_viewed_at.map_or(true, |current| viewed > current) {
                entry.last_viewed_at = Some(viewed);
            }
        }
        if entry.team_id != channel.team_id {
            let counts = entry.counts;
            let previous = std::mem::replace(&mut entry.team_id, channel.team_id.clone());
            if let Some(previous) = previous {
                self.teams.entry(previous).or_default().subtract(counts);
            }
            if let Some(team_id) = &channel.team_id {
                self.teams.entry(team_id.clone()).or_default().add(counts);
            }
            changed = true;
        }
        Mutation::from_changed(changed)
    }

    pub fn remove_channel(&mut self, channel_id: &ChannelId) -> Mutation {
        let Some(entry) = self.channels.remove(channel_id) else {
            return Mutation::Unchanged;
        };
        if let Some(team_id) = &entry.team_id {
            if let Some(total) = self.teams.get_mut(team_id) {
                total.subtract(entry.counts);
            }
        }
        Mutation::from_changed(!entry.counts.is_zero())
    }

    /// Counts an incoming post. `team_hint` and `kind_hint` fill in channel
    /// metadata the counter has not been told about yet.
    pub fn on_posted(&mut self, post: &Post, kind_hint: Option<ChannelKind>, team_hint: Option<&TeamId>) -> Mutation {
        if post.is_pending() || post.is_deleted() || post.is_system() {
            return Mutation::Unchanged;
        }
        let Some(post_id) = post.confirmed_id() else {
            return Mutation::Unchanged;
        };

        let entry = self.channels.entry(post.channel_id.clone()).or_default();
        if entry.newest_seen_at.map_or(true, |seen| post.created_at > seen) {
            entry.newest_seen_at = Some(post.created_at);
        }
        if entry.kind.is_none() {
            entry.kind = kind_hint;
        }
        if entry.team_id.is_none() {
            if let Some(team_id) = team_hint {
                entry.team_id = Some(team_id.clone());
                self.teams.entry(team_id.clone()).or_default().add(entry.counts);
            }
        }

        if post.user_id == self.local_user_id {
            return Mutation::Unchanged;
        }
        if entry
            .last_viewed_at
            .is_some_and(|viewed| post.created_at <= viewed)
        {
            debug!(channel_id = %post.channel_id, %post_id, "unreads: post predates last view");
            return Mutation::Unchanged;
        }
        if !entry.remember(post_id, self.replay_window) {
            return Mutation::Unchanged;
        }

        let is_mention = entry.kind.is_some_and(ChannelKind::is_direct_or_group)
            || self.matcher.mentions(&post.message);
        let delta = UnreadCounts::new(1, u32::from(is_mention));
        entry.counts.add(delta);
        if let Some(team_id) = &entry.team_id {
            self.teams.entry(team_id.clone()).or_default().add(delta);
        }
        Mutation::Applied
    }

    /// Zeroes the channel and removes exactly its contribution from the team
    /// total. Returns the counts that were cleared.
    pub fn mark_viewed(&mut self, channel_id: &ChannelId, viewed_at: Option<DateTime<Utc>>) -> UnreadCounts {
        let entry = self.channels.entry(channel_id.clone()).or_default();
        let viewed_at = viewed_at.or(entry.newest_seen_at);
        if let Some(viewed_at) = viewed_at {
            if entry.last_viewed_at.map_or(true, |current| viewed_at > current) {
                entry.last_viewed_at = Some(viewed_at);
            }
        }
        let cleared = std::mem::take(&mut entry.counts);
        if let Some(team_id) = &entry.team_id {
            if let Some(total) = self.teams.get_mut(team_id) {
                total.subtract(cleared);
            }
        }
        cleared
    }

    /// Adds back counts cleared by an optimistic view that the server refused.
    pub fn restore(&mut self, channel_id: &ChannelId, counts: UnreadCounts) -> Mutation {
        if counts.is_zero() {
            return Mutation::Unchanged;
        }
        let entry = self.channels.entry(channel_id.clone()).or_default();
        entry.counts.add(counts);
        if let Some(team_id) = &entry.team_id {
            self.teams.entry(team_id.clone()).or_default().add(counts);
        }
        Mutation::Applied
    }

    /// Applies authoritative counts from the API, adjusting the team total by
    /// the difference.
    pub fn set_channel_counts(&mut self, channel_id: &ChannelId, counts: UnreadCounts) -> Mutation {
        let entry = self.channels.entry(channel_id.clone()).or_default();
        if entry.counts == counts {
            return Mutation::Unchanged;
        }
        let previous = std::mem::replace(&mut entry.counts, counts);
        if let Some(team_id) = &entry.team_id {
            let total = self.teams.entry(team_id.clone()).or_default();
            total.subtract(previous);
            total.add(counts);
        }
        Mutation::Applied
    }

    pub fn update_last_viewed(&mut self, channel_id: &ChannelId, viewed_at: DateTime<Utc>) {
        let entry = self.channels.entry(channel_id.clone()).or_default();
        if entry.last_viewed_at.map_or(true, |current| viewed_at > current) {
            entry.last_viewed_at = Some(viewed_at);
        }
    }

    /// Compares every team total with the sum of its channels and recounts
    /// the teams that drifted. Returns the repaired teams.
    pub fn verify_team_totals(&mut self) -> Vec<TeamId> {
        let mut sums: HashMap<TeamId, UnreadCounts> = HashMap::new();
        for entry in self.channels.values() {
            if let Some(team_id) = &entry.team_id {
                sums.entry(team_id.clone()).or_default().add(entry.counts);
            }
        }
        let mut team_ids = self.teams.keys().chain(sums.keys()).cloned().collect::<Vec<_>>();
        team_ids.sort();
        team_ids.dedup();

        let mut repaired = Vec::new();
        for team_id in team_ids {
            let expected = sums.get(&team_id).copied().unwrap_or_default();
            let actual = self.teams.get(&team_id).copied().unwrap_or_default();
            if expected != actual {
                warn!(
                    %team_id,
                    expected_msgs = expected.msg_count,
                    actual_msgs = actual.msg_count,
                    expected_mentions = expected.mention_count,
                    actual_mentions = actual.mention_count,
                    "unreads: team total out of sync, recounting"
                );
                self.teams.insert(team_id.clone(), expected);
                repaired.push(team_id);
            }
        }
        repaired
    }

    pub fn channel_counts(&self, channel_id: &ChannelId) -> UnreadCounts {
        self.channels
            .get(channel_id)
            .map(|entry| entry.counts)
            .unwrap_or_default()
    }

    pub fn team_counts(&self, team_id: &TeamId) -> UnreadCounts {
        self.teams.get(team_id).copied().unwrap_or_default()
    }

    pub fn last_viewed_at(&self, channel_id: &ChannelId) -> Option<DateTime<Utc>> {
        self.channels.get(channel_id)?.last_viewed_at
    }

    fn team_of(&self, channel_id: &ChannelId) -> Option<TeamId> {
        self.channels.get(channel_id)?.team_id.clone()
    }
}

/// Feeds message, view and channel lifecycle events into the counter.
pub struct UnreadEvents {
    counter: Arc<RwLock<UnreadCounter>>,
    local_user_id: UserId,
}

impl UnreadEvents {
    pub fn new(counter: Arc<RwLock<UnreadCounter>>, local_user_id: UserId) -> Self {
        Self {
            counter,
            local_user_id,
        }
    }
}

impl EventHandler for UnreadEvents {
    fn name(&self) -> &'static str {
        "unreads"
    }

    fn concern(&self) -> Concern {
        Concern::Unreads
    }

    fn accepts(&self, kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::Posted
                | EventKind::ChannelViewed
                | EventKind::MultipleChannelsViewed
                | EventKind::ChannelCreated
                | EventKind::ChannelUpdated
                | EventKind::ChannelDeleted
                | EventKind::UserRemoved
                | EventKind::ChannelMemberUpdated
                | EventKind::Hello
        )
    }

    fn handle(&self, event: &DecodedEvent) -> Result<Mutation, SyncError> {
        let mut counter = self.counter.write();
        let mutation = match (&event.kind, &event.payload) {
            (EventKind::Posted, EventPayload::Post { post, channel_kind }) => {
                counter.on_posted(post, *channel_kind, event.team_id.as_ref())
            }
            (
                EventKind::ChannelViewed | EventKind::MultipleChannelsViewed,
                EventPayload::ChannelsViewed(viewed),
            ) => {
                let mut mutation = Mutation::Unchanged;
                for (channel_id, viewed_at) in viewed {
                    let cleared = counter.mark_viewed(channel_id, *viewed_at);
                    mutation = mutation.merge(Mutation::from_changed(!cleared.is_zero()));
                }
                mutation
            }
            (EventKind::ChannelCreated | EventKind::ChannelUpdated, EventPayload::Channel(channel)) => {
                counter.register_channel(channel)
            }
            (EventKind::ChannelDeleted, EventPayload::ChannelRemoved { channel_id, .. }) => {
                counter.remove_channel(channel_id)
            }
            (EventKind::UserRemoved, EventPayload::Membership { channel_id, user_id })
                if *user_id == self.local_user_id =>
            {
                counter.remove_channel(channel_id)
            }
            (
                EventKind::ChannelMemberUpdated,
                EventPayload::ChannelMember {
                    channel_id,
                    user_id,
                    last_viewed_at: Some(viewed_at),
                    ..
                },
            ) if *user_id == self.local_user_id => {
                counter.update_last_viewed(channel_id, *viewed_at);
                Mutation::Unchanged
            }
            (EventKind::Hello, _) => {
                let repaired = counter.verify_team_totals();
                if !repaired.is_empty() {
                    info!(teams = repaired.len(), "unreads: recounted team totals after reconnect");
                }
                Mutation::from_changed(!repaired.is_empty())
            }
            _ => Mutation::Unchanged,
        };
        if let (Mutation::Applied, Some(channel_id)) = (mutation, &event.channel_id) {
            debug!(
                %channel_id,
                team_id = ?counter.team_of(channel_id),
                counts = ?counter.channel_counts(channel_id),
                "unreads: counters changed"
            );
        }
        Ok(mutation)
    }
}

#[cfg(test)]
#[path = "tests/unreads_tests.rs"]
mod tests;
