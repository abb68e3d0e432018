// A channel has exactly one home among a team's non-favorites categories.
// The favorites category is an overlay and may list a channel that also
// has a home elsewhere.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shared::domain::{Category, CategoryId, CategoryKind, Channel, ChannelId, ChannelKind, TeamId, UserId};
use tracing::{debug, trace};

use crate::{
    decoder::{DecodedEvent, EventKind, EventPayload},
    error::SyncError,
    router::{Concern, EventHandler},
    Mutation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Requested,
    OptimisticallyApplied,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMove {
    pub team_id: TeamId,
    pub channel_id: ChannelId,
    pub from: CategoryId,
    pub to: CategoryId,
    pub index: usize,
}

#[derive(Debug, Clone)]
enum Inverse {
    Move {
        channel_id: ChannelId,
        snapshot: Vec<Category>,
    },
    Reorder {
        prior: Vec<CategoryId>,
    },
}

#[derive(Debug, Clone)]
struct PendingMutation {
    team_id: TeamId,
    state: MutationState,
    inverse: Inverse,
}

#[derive(Debug)]
pub struct MembershipSync {
    local_user_id: UserId,
    channels: HashMap<ChannelId, Channel>,
    teams: HashMap<TeamId, Vec<Category>>,
    pending: HashMap<MutationId, PendingMutation>,
    next_mutation_id: u64,
}

fn home_kind(kind: ChannelKind) -> CategoryKind {
    if kind.is_direct_or_group() {
        CategoryKind::DirectMessages
    } else {
        CategoryKind::Channels
    }
}

fn is_homed(categories: &[Category], channel_id: &ChannelId) -> bool {
    categories
        .iter()
        .any(|category| category.kind != CategoryKind::Favorites && category.contains(channel_id))
}

fn dedupe(channel_ids: &mut Vec<ChannelId>) {
    let mut seen = std::collections::HashSet::new();
    channel_ids.retain(|channel_id| seen.insert(channel_id.clone()));
}

fn ids_of(categories: &[Category]) -> Vec<CategoryId> {
    categories.iter().map(|category| category.id.clone()).collect()
}

fn reorder(categories: &mut Vec<Category>, order: &[CategoryId]) -> bool {
    let before = ids_of(categories);
    let mut reordered = Vec::with_capacity(categories.len());
    for category_id in order {
        if let Some(position) = categories.iter().position(|category| category.id == *category_id) {
            reordered.push(categories.remove(position));
        }
    }
    reordered.append(categories);
    *categories = reordered;
    before != ids_of(categories)
}

impl MembershipSync {
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            channels: HashMap::new(),
            teams: HashMap::new(),
            pending: HashMap::new(),
            next_mutation_id: 0,
        }
    }

    /// Membership state (`muted`, `last_viewed_at`, members) of a known
    /// channel is kept.
    pub fn upsert_channel(&mut self, mut channel: Channel) -> Mutation {
        if let Some(existing) = self.channels.get_mut(&channel.id) {
            let before = existing.clone();
            existing.display_name = channel.display_name;
            existing.kind = channel.kind;
            if channel.team_id.is_some() {
                existing.team_id = channel.team_id;
            }
            return Mutation::from_changed(before != *existing);
        }

        channel.member_ids.insert(self.local_user_id.clone());
        let channel_id = channel.id.clone();
        let kind = channel.kind;
        let team_id = channel.team_id.clone();
        self.channels.insert(channel_id.clone(), channel);
        self.place_channel(&channel_id, kind, team_id.as_ref());
        debug!(%channel_id, ?kind, "membership: channel added");
        Mutation::Applied
    }

    pub fn set_team_channels(&mut self, team_id: &TeamId, channels: Vec<Channel>) -> Mutation {
        let listed = channels
            .iter()
            .map(|channel| channel.id.clone())
            .collect::<std::collections::HashSet<_>>();
        let stale = self
            .channels
            .values()
            .filter(|channel| channel.team_id.as_ref() == Some(team_id) && !listed.contains(&channel.id))
            .map(|channel| channel.id.clone())
            .collect::<Vec<_>>();

        let mut mutation = Mutation::Unchanged;
        for channel_id in stale {
            mutation = mutation.merge(self.remove_channel(&channel_id));
        }
        for channel in channels {
            let (channel_id, muted, viewed) = (channel.id.clone(), channel.muted, channel.last_viewed_at);
            mutation = mutation.merge(self.upsert_channel(channel));
            if let Some(existing) = self.channels.get_mut(&channel_id) {
                if existing.muted != muted {
                    existing.muted = muted;
                    mutation = Mutation::Applied;
                }
                if viewed > existing.last_viewed_at {
                    existing.last_viewed_at = viewed;
                }
            }
        }
        mutation
    }

    pub fn set_team_categories(&mut self, team_id: &TeamId, categories: Vec<Category>) -> Mutation {
        let mut replacement = Vec::with_capacity(categories.len());
        for mut category in categories {
            if category.team_id != *team_id {
                debug!(%team_id, category_id = %category.id, "membership: skipping category of another team");
                continue;
            }
            dedupe(&mut category.channel_ids);
            if category.kind != CategoryKind::Favorites {
                category
                    .channel_ids
                    .retain(|channel_id| !is_homed(&replacement, channel_id));
            }
            replacement.push(category);
        }

        let previous = self.teams.insert(team_id.clone(), replacement);
        let unhomed = self
            .channels
            .values()
            .filter(|channel| channel.team_id.is_none() || channel.team_id.as_ref() == Some(team_id))
            .map(|channel| (channel.id.clone(), channel.kind))
            .collect::<Vec<_>>();
        for (channel_id, kind) in unhomed {
            self.place_in_team(team_id, &channel_id, kind);
        }
        Mutation::from_changed(previous.as_ref() != self.teams.get(team_id))
    }

    pub fn upsert_categories(&mut self, categories: Vec<Category>) -> Mutation {
        let mut mutation = Mutation::Unchanged;
        for mut category in categories {
            dedupe(&mut category.channel_ids);
            let team = self.teams.entry(category.team_id.clone()).or_default();
            if category.kind != CategoryKind::Favorites {
                for other in team.iter_mut() {
                    if other.id != category.id && other.kind != CategoryKind::Favorites {
                        let before = other.channel_ids.len();
                        other
                            .channel_ids
                            .retain(|channel_id| !category.channel_ids.contains(channel_id));
                        if before != other.channel_ids.len() {
                            mutation = Mutation::Applied;
                        }
                    }
                }
            }
            match team.iter_mut().find(|existing| existing.id == category.id) {
                Some(existing) if *existing == category => {}
                Some(existing) => {
                    *existing = category;
                    mutation = Mutation::Applied;
                }
                None => {
                    team.push(category);
                    mutation = Mutation::Applied;
                }
            }
        }
        mutation
    }

    pub fn remove_category(&mut self, team_id: &TeamId, category_id: &CategoryId) -> Mutation {
        let Some(team) = self.teams.get_mut(team_id) else {
            return Mutation::Unchanged;
        };
        let Some(position) = team.iter().position(|category| category.id == *category_id) else {
            return Mutation::Unchanged;
        };
        let removed = team.remove(position);
        if removed.kind != CategoryKind::Favorites {
            for channel_id in &removed.channel_ids {
                let kind = self
                    .channels
                    .get(channel_id)
                    .map_or(ChannelKind::Open, |channel| channel.kind);
                self.place_in_team(team_id, channel_id, kind);
            }
        }
        debug!(%team_id, %category_id, "membership: category removed");
        Mutation::Applied
    }

    /// Reorders a team's categories. Unknown ids are ignored and categories
    /// missing from `order` keep their relative order at the end.
    pub fn apply_category_order(&mut self, team_id: &TeamId, order: &[CategoryId]) -> Mutation {
        match self.teams.get_mut(team_id) {
            Some(categories) => Mutation::from_changed(reorder(categories, order)),
            None => Mutation::Unchanged,
        }
    }

    pub fn add_member(&mut self, channel_id: &ChannelId, user_id: &UserId) -> Mutation {
        match self.channels.get_mut(channel_id) {
            Some(channel) => Mutation::from_changed(channel.member_ids.insert(user_id.clone())),
            None => {
                if *user_id == self.local_user_id {
                    debug!(%channel_id, "membership: joined channel is not loaded yet");
                }
                Mutation::Unchanged
            }
        }
    }

    pub fn remove_member(&mut self, channel_id: &ChannelId, user_id: &UserId) -> Mutation {
        if *user_id == self.local_user_id {
            return self.remove_channel(channel_id);
        }
        match self.channels.get_mut(channel_id) {
            Some(channel) => Mutation::from_changed(channel.member_ids.remove(user_id)),
            None => Mutation::Unchanged,
        }
    }

    pub fn remove_channel(&mut self, channel_id: &ChannelId) -> Mutation {
        let mut changed = self.channels.remove(channel_id).is_some();
        for categories in self.teams.values_mut() {
            for category in categories.iter_mut() {
                let before = category.channel_ids.len();
                category.channel_ids.retain(|id| id != channel_id);
                changed |= before != category.channel_ids.len();
            }
        }
        if changed {
            debug!(%channel_id, "membership: channel removed");
        }
        Mutation::from_changed(changed)
    }

    pub fn update_member(
        &mut self,
        channel_id: &ChannelId,
        user_id: &UserId,
        muted: bool,
        last_viewed_at: Option<DateTime<Utc>>,
    ) -> Mutation {
        if *user_id != self.local_user_id {
            return Mutation::Unchanged;
        }
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return Mutation::Unchanged;
        };
        let before = channel.clone();
        channel.muted = muted;
        if let Some(viewed) = last_viewed_at {
            if channel.last_viewed_at.map_or(true, |current| viewed > current) {
                channel.last_viewed_at = Some(viewed);
            }
        }
        Mutation::from_changed(before != *channel)
    }

    pub fn begin_move(&mut self, request: &CategoryMove) -> Result<(MutationId, Vec<Category>), SyncError> {
        let id = self.allocate_id();
        trace!(mutation = id.0, state = ?MutationState::Requested, "membership: move requested");

        let categories = self
            .teams
            .get(&request.team_id)
            .ok_or_else(|| SyncError::validation(format!("unknown team {}", request.team_id)))?;
        let from = categories
            .iter()
            .find(|category| category.id == request.from)
            .ok_or_else(|| SyncError::validation(format!("unknown category {}", request.from)))?;
        let to = categories
            .iter()
            .find(|category| category.id == request.to)
            .ok_or_else(|| SyncError::validation(format!("unknown category {}", request.to)))?;
        if !from.contains(&request.channel_id) {
            return Err(SyncError::validation(format!(
                "channel {} is not in category {}",
                request.channel_id, request.from
            )));
        }
        let is_direct = match self.channels.get(&request.channel_id) {
            Some(channel) => channel.kind.is_direct_or_group(),
            None => from.kind == CategoryKind::DirectMessages,
        };
        if to.kind == CategoryKind::DirectMessages && !is_direct {
            return Err(SyncError::validation(format!(
                "channel {} cannot move into direct messages category {}",
                request.channel_id, request.to
            )));
        }
        let (from_kind, to_kind) = (from.kind, to.kind);
        let snapshot = categories
            .iter()
            .filter(|category| category.contains(&request.channel_id) || category.id == request.to)
            .cloned()
            .collect::<Vec<_>>();

        let Some(categories) = self.teams.get_mut(&request.team_id) else {
            return Err(SyncError::validation(format!("unknown team {}", request.team_id)));
        };
        for category in categories.iter_mut() {
            let leaves = if to_kind == CategoryKind::Favorites {
                category.id == request.to
            } else {
                category.kind != CategoryKind::Favorites
                    || (from_kind == CategoryKind::Favorites && category.id == request.from)
            };
            if leaves {
                category.channel_ids.retain(|channel_id| *channel_id != request.channel_id);
            }
        }
        if let Some(target) = categories.iter_mut().find(|category| category.id == request.to) {
            let index = request.index.min(target.channel_ids.len());
            target.channel_ids.insert(index, request.channel_id.clone());
        }
        let touched = categories
            .iter()
            .filter(|category| snapshot.iter().any(|prior| prior.id == category.id))
            .cloned()
            .collect::<Vec<_>>();

        self.pending.insert(
            id,
            PendingMutation {
                team_id: request.team_id.clone(),
                state: MutationState::OptimisticallyApplied,
                inverse: Inverse::Move {
                    channel_id: request.channel_id.clone(),
                    snapshot,
                },
            },
        );
        debug!(
            mutation = id.0,
            team_id = %request.team_id,
            channel_id = %request.channel_id,
            from = %request.from,
            to = %request.to,
            "membership: move applied optimistically"
        );
        Ok((id, touched))
    }

    pub fn begin_reorder(&mut self, team_id: &TeamId, order: &[CategoryId]) -> Result<MutationId, SyncError> {
        let id = self.allocate_id();
        trace!(mutation = id.0, state = ?MutationState::Requested, "membership: reorder requested");

        let categories = self
            .teams
            .get_mut(team_id)
            .ok_or_else(|| SyncError::validation(format!("unknown team {team_id}")))?;
        let prior = ids_of(categories);
        let mut sorted_prior = prior.clone();
        sorted_prior.sort();
        let mut sorted_order = order.to_vec();
        sorted_order.sort();
        if sorted_prior != sorted_order {
            return Err(SyncError::validation(format!(
                "category order for team {team_id} is not a permutation of its categories"
            )));
        }
        reorder(categories, order);
        self.pending.insert(
            id,
            PendingMutation {
                team_id: team_id.clone(),
                state: MutationState::OptimisticallyApplied,
                inverse: Inverse::Reorder { prior },
            },
        );
        Ok(id)
    }

    pub fn confirm(&mut self, id: MutationId) -> Option<MutationState> {
        let mut pending = self.pending.remove(&id)?;
        pending.state = MutationState::Confirmed;
        trace!(mutation = id.0, "membership: mutation confirmed");
        Some(pending.state)
    }

    /// Applies the inverse of an optimistic mutation. Channels the server
    /// added to the touched categories in the meantime are kept.
    pub fn rollback(&mut self, id: MutationId) -> Option<MutationState> {
        let mut pending = self.pending.remove(&id)?;
        let categories = self.teams.entry(pending.team_id.clone()).or_default();
        match &pending.inverse {
            Inverse::Move {
                channel_id,
                snapshot,
            } => {
                for prior in snapshot {
                    let Some(current) = categories.iter_mut().find(|category| category.id == prior.id) else {
                        continue;
                    };
                    let mut restored = prior
                        .channel_ids
                        .iter()
                        .filter(|id| *id == channel_id || current.contains(id))
                        .cloned()
                        .collect::<Vec<_>>();
                    for extra in &current.channel_ids {
                        if extra != channel_id && !restored.contains(extra) {
                            restored.push(extra.clone());
                        }
                    }
                    current.channel_ids = restored;
                }
                let homed_in_snapshot = snapshot
                    .iter()
                    .any(|prior| prior.kind != CategoryKind::Favorites && prior.contains(channel_id));
                if homed_in_snapshot {
                    for category in categories.iter_mut() {
                        let in_snapshot = snapshot.iter().any(|prior| prior.id == category.id);
                        if !in_snapshot && category.kind != CategoryKind::Favorites {
                            category.channel_ids.retain(|id| id != channel_id);
                        }
                    }
                }
            }
            Inverse::Reorder { prior } => {
                reorder(categories, prior);
            }
        }
        pending.state = MutationState::RolledBack;
        debug!(mutation = id.0, team_id = %pending.team_id, "membership: mutation rolled back");
        Some(pending.state)
    }

    pub fn mutation_state(&self, id: MutationId) -> Option<MutationState> {
        self.pending.get(&id).map(|pending| pending.state)
    }

    pub fn categories(&self, team_id: &TeamId) -> Vec<Category> {
        self.teams.get(team_id).cloned().unwrap_or_default()
    }

    pub fn category(&self, team_id: &TeamId, category_id: &CategoryId) -> Option<&Category> {
        self.teams
            .get(team_id)?
            .iter()
            .find(|category| category.id == *category_id)
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub fn is_muted(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|channel| channel.muted)
    }

    fn allocate_id(&mut self) -> MutationId {
        self.next_mutation_id += 1;
        MutationId(self.next_mutation_id)
    }

    fn place_channel(&mut self, channel_id: &ChannelId, kind: ChannelKind, team_id: Option<&TeamId>) {
        let team_ids = match team_id {
            Some(team_id) => vec![team_id.clone()],
            None => self.teams.keys().cloned().collect(),
        };
        for team_id in team_ids {
            self.place_in_team(&team_id, channel_id, kind);
        }
    }

    fn place_in_team(&mut self, team_id: &TeamId, channel_id: &ChannelId, kind: ChannelKind) -> bool {
        let Some(categories) = self.teams.get_mut(team_id) else {
            return false;
        };
        if is_homed(categories, channel_id) {
            return false;
        }
        let wanted = home_kind(kind);
        let position = categories
            .iter()
            .position(|category| category.kind == wanted)
            .or_else(|| {
                categories
                    .iter()
                    .position(|category| category.kind == CategoryKind::Channels)
            });
        match position {
            Some(position) => {
                categories[position].channel_ids.push(channel_id.clone());
                true
            }
            None => false,
        }
    }
}

pub struct MembershipEvents {
    membership: Arc<RwLock<MembershipSync>>,
}

impl MembershipEvents {
    pub fn new(membership: Arc<RwLock<MembershipSync>>) -> Self {
        Self { membership }
    }
}

impl EventHandler for MembershipEvents {
    fn name(&self) -> &'static str {
        "membership"
    }

    fn concern(&self) -> Concern {
        Concern::Membership
    }

    fn accepts(&self, kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::ChannelCreated
                | EventKind::ChannelUpdated
                | EventKind::ChannelDeleted
                | EventKind::UserAdded
                | EventKind::UserRemoved
                | EventKind::ChannelMemberUpdated
                | EventKind::CategoryCreated
                | EventKind::CategoryUpdated
                | EventKind::CategoryDeleted
                | EventKind::CategoryOrderUpdated
        )
    }

    fn handle(&self, event: &DecodedEvent) -> Result<Mutation, SyncError> {
        let mut membership = self.membership.write();
        let mutation = match &event.payload {
            EventPayload::Channel(channel) => membership.upsert_channel(channel.clone()),
            EventPayload::ChannelRemoved { channel_id, .. } => membership.remove_channel(channel_id),
            EventPayload::Membership { channel_id, user_id } => match event.kind {
                EventKind::UserAdded => membership.add_member(channel_id, user_id),
                _ => membership.remove_member(channel_id, user_id),
            },
            EventPayload::ChannelMember {
                channel_id,
                user_id,
                muted,
                last_viewed_at,
            } => membership.update_member(channel_id, user_id, *muted, *last_viewed_at),
            EventPayload::Categories(categories) => membership.upsert_categories(categories.clone()),
            EventPayload::CategoryRemoved { team_id, category_id } => {
                membership.remove_category(team_id, category_id)
            }
            EventPayload::CategoryOrder { team_id, order } => membership.apply_category_order(team_id, order),
            _ => Mutation::Unchanged,
        };
        Ok(mutation)
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
