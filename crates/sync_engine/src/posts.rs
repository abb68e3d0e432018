use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use shared::{
    domain::{dedupe_file_ids, ChannelId, FileId, Page, Post, PostId, PostKey, Reaction, TempId, UserId},
    error::ApiError,
};
use tracing::{debug, trace};

use crate::{
    decoder::{DecodedEvent, EventKind, EventPayload},
    error::SyncError,
    router::{Concern, EventHandler},
    Mutation,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SequenceKey {
    created_at: DateTime<Utc>,
    id: String,
    pending: bool,
}

impl SequenceKey {
    fn of(post: &Post) -> Self {
        Self {
            created_at: post.created_at,
            id: post.id.as_str().to_string(),
            pending: post.is_pending(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PostSequence {
    entries: BTreeMap<SequenceKey, PostKey>,
}

impl PostSequence {
    fn insert(&mut self, post: &Post) -> bool {
        self.entries
            .insert(SequenceKey::of(post), post.id.clone())
            .is_none()
    }

    fn remove(&mut self, post: &Post) -> bool {
        self.entries.remove(&SequenceKey::of(post)).is_some()
    }

    fn contains(&self, post: &Post) -> bool {
        self.entries.contains_key(&SequenceKey::of(post))
    }

    fn keys(&self) -> impl Iterator<Item = &PostKey> {
        self.entries.values()
    }

    fn last_created_at(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next_back().map(|key| key.created_at)
    }
}

#[derive(Debug, Clone)]
struct ChannelHistory {
    sequence: PostSequence,
    has_more_older: bool,
    has_more_newer: bool,
    error: Option<ApiError>,
}

impl Default for ChannelHistory {
    fn default() -> Self {
        Self {
            sequence: PostSequence::default(),
            has_more_older: true,
            has_more_newer: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ThreadState {
    sequence: PostSequence,
    loading: bool,
    has_more: bool,
    error: Option<ApiError>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            sequence: PostSequence::default(),
            loading: false,
            has_more: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub root_post_id: PostId,
    pub post_ids: Vec<PostKey>,
    pub loading: bool,
    pub has_more: bool,
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub thread: Thread,
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    pub has_more_older: bool,
    pub has_more_newer: bool,
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDraft {
    pub temp_id: TempId,
    pub channel_id: ChannelId,
    pub root_id: Option<PostId>,
    pub user_id: UserId,
    pub message: String,
    pub file_ids: Vec<FileId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandle {
    pub temp_id: TempId,
    pub channel_id: ChannelId,
    pub root_id: Option<PostId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Older,
    Newer,
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    channel: bool,
    live: bool,
}

impl Placement {
    const PAGE: Self = Self {
        channel: true,
        live: false,
    };
    const THREAD: Self = Self {
        channel: false,
        live: false,
    };
    const LIVE: Self = Self {
        channel: true,
        live: true,
    };
}

#[derive(Debug, Default)]
pub struct PostStore {
    posts: HashMap<PostKey, Post>,
    confirmed_pending: HashMap<TempId, PostId>,
    channels: HashMap<ChannelId, ChannelHistory>,
    threads: HashMap<PostId, ThreadState>,
}

impl PostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_older(&mut self, channel_id: &ChannelId, posts: Vec<Post>, has_more: bool) -> Mutation {
        self.merge_page(channel_id, posts, has_more, Direction::Older)
    }

    pub fn append_newer(&mut self, channel_id: &ChannelId, posts: Vec<Post>, has_more: bool) -> Mutation {
        self.merge_page(channel_id, posts, has_more, Direction::Newer)
    }

    pub fn receive_post(&mut self, post: Post) -> Mutation {
        self.merge_post(post, Placement::LIVE)
    }

    fn merge_page(
        &mut self,
        channel_id: &ChannelId,
        posts: Vec<Post>,
        has_more: bool,
        direction: Direction,
    ) -> Mutation {
        let mut mutation = Mutation::Unchanged;
        for post in posts {
            if post.channel_id != *channel_id {
                debug!(
                    channel_id = %channel_id,
                    post_id = %post.id,
                    post_channel_id = %post.channel_id,
                    "posts: skipping page entry from another channel"
                );
                continue;
            }
            mutation = mutation.merge(self.merge_post(post, Placement::PAGE));
        }

        let history = self.channels.entry(channel_id.clone()).or_default();
        let previous = (history.has_more_older, history.has_more_newer, history.error.is_some());
        match direction {
            Direction::Older => history.has_more_older = has_more,
            Direction::Newer => history.has_more_newer = has_more,
        }
        history.error = None;
        if previous != (history.has_more_older, history.has_more_newer, false) {
            mutation = Mutation::Applied;
        }
        trace!(
            channel_id = %channel_id,
            ?direction,
            has_more,
            len = history.sequence.entries.len(),
            "posts: merged page"
        );
        mutation
    }

    /// The provisional timestamp is nudged past the current tail so the
    /// sequence stays sorted.
    pub fn create_optimistic(&mut self, draft: PostDraft) -> (PendingHandle, Mutation) {
        let handle = PendingHandle {
            temp_id: draft.temp_id.clone(),
            channel_id: draft.channel_id.clone(),
            root_id: draft.root_id.clone(),
        };
        let key = PostKey::Pending(draft.temp_id.clone());
        if self.posts.contains_key(&key) || self.confirmed_pending.contains_key(&draft.temp_id) {
            return (handle, Mutation::Unchanged);
        }

        let mut created_at = draft.created_at;
        if let Some(tail) = self.tail_created_at(&draft.channel_id, draft.root_id.as_ref()) {
            if tail >= created_at {
                created_at = tail + Duration::milliseconds(1);
            }
        }

        let post = Post {
            id: key.clone(),
            pending_post_id: Some(draft.temp_id),
            channel_id: draft.channel_id,
            root_id: draft.root_id,
            user_id: draft.user_id,
            created_at,
            updated_at: created_at,
            deleted_at: None,
            message: draft.message,
            post_type: String::new(),
            file_ids: dedupe_file_ids(draft.file_ids),
            reactions: Default::default(),
            reply_count: 0,
        };
        let root_id = post.root_id.clone();
        self.posts.insert(key.clone(), post);
        self.link(&key, true);
        if let Some(root_id) = root_id {
            self.adjust_reply_count(&root_id, 1);
        }
        (handle, Mutation::Applied)
    }

    fn tail_created_at(&self, channel_id: &ChannelId, root_id: Option<&PostId>) -> Option<DateTime<Utc>> {
        let channel_tail = self
            .channels
            .get(channel_id)
            .and_then(|history| history.sequence.last_created_at());
        let thread_tail = root_id
            .and_then(|root_id| self.threads.get(root_id))
            .and_then(|thread| thread.sequence.last_created_at());
        channel_tail.max(thread_tail)
    }

    pub fn confirm_create(&mut self, temp_id: &TempId, server_post: Post) -> Result<Mutation, SyncError> {
        if server_post.is_pending() {
            return Err(SyncError::validation(format!(
                "confirmation for {temp_id} carries no server id"
            )));
        }
        if self.posts.contains_key(&PostKey::Pending(temp_id.clone())) {
            return Ok(self.reconcile(temp_id, server_post));
        }
        if self.confirmed_pending.contains_key(temp_id) {
            return Ok(self.merge_post(server_post, Placement::PAGE));
        }
        debug!(%temp_id, "posts: confirmation without provisional entry");
        Ok(self.merge_post(server_post, Placement::LIVE))
    }

    pub fn fail_create(&mut self, temp_id: &TempId) -> Mutation {
        let key = PostKey::Pending(temp_id.clone());
        let Some(provisional) = self.posts.remove(&key) else {
            return Mutation::Unchanged;
        };
        self.unlink(&provisional);
        if let Some(root_id) = &provisional.root_id {
            self.adjust_reply_count(root_id, -1);
        }
        Mutation::Applied
    }

    fn reconcile(&mut self, temp_id: &TempId, mut confirmed: Post) -> Mutation {
        let Some(provisional) = self.posts.remove(&PostKey::Pending(temp_id.clone())) else {
            return Mutation::Unchanged;
        };
        let in_channel = self
            .channels
            .get(&provisional.channel_id)
            .is_some_and(|history| history.sequence.contains(&provisional));
        self.unlink(&provisional);

        let Some(post_id) = confirmed.confirmed_id().cloned() else {
            return Mutation::Applied;
        };
        self.confirmed_pending.insert(temp_id.clone(), post_id.clone());
        confirmed.pending_post_id = Some(temp_id.clone());

        let key = PostKey::Confirmed(post_id);
        if self.posts.contains_key(&key) {
            // A push without the correlation key already inserted the post
            // and counted it as a reply a second time.
            if let Some(root_id) = &provisional.root_id {
                self.adjust_reply_count(root_id, -1);
            }
            self.merge_post(
                confirmed,
                Placement {
                    channel: in_channel,
                    live: false,
                },
            );
        } else {
            self.posts.insert(key.clone(), confirmed);
            self.link(&key, in_channel);
        }
        debug!(%temp_id, post_id = %key, "posts: provisional post confirmed");
        Mutation::Applied
    }

    fn merge_post(&mut self, incoming: Post, placement: Placement) -> Mutation {
        if let (Some(temp_id), false) = (incoming.pending_post_id.clone(), incoming.is_pending()) {
            if self.posts.contains_key(&PostKey::Pending(temp_id.clone())) {
                return self.reconcile(&temp_id, incoming);
            }
        }

        let key = incoming.id.clone();
        if let Some(existing) = self.posts.get(&key) {
            if existing.is_deleted() {
                return Mutation::Unchanged;
            }
            if let Some(deleted_at) = incoming.deleted_at {
                return self.mark_deleted(&key, deleted_at);
            }

            let mut changed = false;
            if incoming.updated_at >= existing.updated_at {
                let newer = incoming.updated_at > existing.updated_at;
                let mut updated = existing.clone();
                updated.message = incoming.message;
                updated.file_ids = incoming.file_ids;
                updated.post_type = incoming.post_type;
                updated.updated_at = incoming.updated_at;
                // Reaction deltas do not move updated_at, so a copy with the
                // same stamp may predate them.
                if newer && (!incoming.reactions.is_empty() || !placement.live) {
                    updated.reactions = incoming.reactions;
                }
                if !placement.live {
                    updated.reply_count = incoming.reply_count;
                }
                if updated.pending_post_id.is_none() {
                    updated.pending_post_id = incoming.pending_post_id;
                }
                if updated != *existing {
                    self.posts.insert(key.clone(), updated);
                    changed = true;
                }
            }
            let linked = self.link(&key, placement.channel);
            return Mutation::from_changed(changed || linked);
        }

        let root_id = incoming.root_id.clone();
        let deleted = incoming.is_deleted();
        let visible = !deleted || (incoming.root_id.is_none() && incoming.reply_count > 0);
        self.posts.insert(key.clone(), incoming);
        if visible {
            self.link(&key, placement.channel);
        }
        if placement.live && !deleted {
            if let Some(root_id) = root_id {
                self.adjust_reply_count(&root_id, 1);
            }
        }
        Mutation::Applied
    }

    pub fn apply_edit(
        &mut self,
        post_id: &PostId,
        message: &str,
        file_ids: Vec<FileId>,
        edited_at: DateTime<Utc>,
    ) -> Result<Mutation, SyncError> {
        let key = PostKey::Confirmed(post_id.clone());
        let post = self
            .posts
            .get_mut(&key)
            .ok_or_else(|| SyncError::conflict(format!("edit of unknown post {post_id}")))?;
        if post.is_deleted() {
            return Err(SyncError::conflict(format!("edit of deleted post {post_id}")));
        }
        if edited_at < post.updated_at {
            trace!(%post_id, "posts: ignoring stale edit");
            return Ok(Mutation::Unchanged);
        }
        let file_ids = dedupe_file_ids(file_ids);
        if post.message == message && post.file_ids == file_ids {
            post.updated_at = edited_at;
            return Ok(Mutation::Unchanged);
        }
        post.message = message.to_string();
        post.file_ids = file_ids;
        post.updated_at = edited_at;
        Ok(Mutation::Applied)
    }

    /// Marks a post deleted. Thread roots that still have replies stay in
    /// their sequences as tombstones; everything else leaves the sequences
    /// but remains in the store so a redelivered event cannot resurrect it.
    pub fn apply_delete(&mut self, post_id: &PostId, deleted_at: DateTime<Utc>) -> Result<Mutation, SyncError> {
        let key = PostKey::Confirmed(post_id.clone());
        match self.posts.get(&key) {
            None => Err(SyncError::conflict(format!("delete of unknown post {post_id}"))),
            Some(post) if post.is_deleted() => Ok(Mutation::Unchanged),
            Some(_) => Ok(self.mark_deleted(&key, deleted_at)),
        }
    }

    fn mark_deleted(&mut self, key: &PostKey, deleted_at: DateTime<Utc>) -> Mutation {
        let Some(post) = self.posts.get_mut(key) else {
            return Mutation::Unchanged;
        };
        post.deleted_at = Some(deleted_at);
        post.updated_at = post.updated_at.max(deleted_at);
        post.message.clear();
        post.file_ids.clear();
        post.reactions.clear();
        let snapshot = post.clone();

        match (&snapshot.root_id, snapshot.confirmed_id()) {
            (None, Some(post_id)) => {
                if !self.has_replies(post_id) {
                    self.unlink(&snapshot);
                    self.threads.remove(post_id);
                }
            }
            (Some(root_id), _) => {
                self.unlink(&snapshot);
                self.adjust_reply_count(root_id, -1);
                self.prune_root_tombstone(root_id);
            }
            (None, None) => self.unlink(&snapshot),
        }
        debug!(post_id = %key, "posts: post deleted");
        Mutation::Applied
    }

    fn has_replies(&self, root_id: &PostId) -> bool {
        let counted = self
            .posts
            .get(&PostKey::Confirmed(root_id.clone()))
            .is_some_and(|root| root.reply_count > 0);
        let listed = self.threads.get(root_id).is_some_and(|thread| {
            thread
                .sequence
                .keys()
                .any(|key| key.confirmed() != Some(root_id))
        });
        counted || listed
    }

    fn prune_root_tombstone(&mut self, root_id: &PostId) {
        let key = PostKey::Confirmed(root_id.clone());
        let Some(root) = self.posts.get(&key) else {
            return;
        };
        if !root.is_deleted() || self.has_replies(root_id) {
            return;
        }
        let root = root.clone();
        self.unlink(&root);
        self.threads.remove(root_id);
        debug!(%root_id, "posts: removed tombstone root without replies");
    }

    pub fn apply_reaction_delta(&mut self, reaction: &Reaction, add: bool) -> Result<Mutation, SyncError> {
        let key = PostKey::Confirmed(reaction.post_id.clone());
        let post = self.posts.get_mut(&key).ok_or_else(|| {
            SyncError::conflict(format!("reaction on unknown post {}", reaction.post_id))
        })?;
        if post.is_deleted() {
            return Err(SyncError::conflict(format!(
                "reaction on deleted post {}",
                reaction.post_id
            )));
        }
        let changed = if add {
            post.reactions.insert(reaction.clone())
        } else {
            post.reactions.remove(reaction)
        };
        Ok(Mutation::from_changed(changed))
    }

    pub fn remove_channel(&mut self, channel_id: &ChannelId) -> Mutation {
        let existed = self.channels.remove(channel_id).is_some();
        let before = self.posts.len();
        self.posts.retain(|_, post| post.channel_id != *channel_id);
        let posts = &self.posts;
        self.threads
            .retain(|root_id, _| posts.contains_key(&PostKey::Confirmed(root_id.clone())));
        self.confirmed_pending
            .retain(|_, post_id| posts.contains_key(&PostKey::Confirmed(post_id.clone())));
        Mutation::from_changed(existed || before != self.posts.len())
    }

    pub fn begin_thread_load(&mut self, root_id: &PostId) -> Mutation {
        self.ensure_thread(root_id);
        let Some(thread) = self.threads.get_mut(root_id) else {
            return Mutation::Unchanged;
        };
        let was_loading = thread.loading;
        thread.loading = true;
        thread.error = None;
        Mutation::from_changed(!was_loading)
    }

    /// New thread sequences start with every reply already in the store,
    /// pending ones included.
    fn ensure_thread(&mut self, root_id: &PostId) {
        if self.threads.contains_key(root_id) {
            return;
        }
        self.threads.insert(root_id.clone(), ThreadState::new());
        let members = self
            .posts
            .values()
            .filter(|post| post.root_id.as_ref() == Some(root_id) && !post.is_deleted())
            .map(|post| post.id.clone())
            .collect::<Vec<_>>();
        self.link(&PostKey::Confirmed(root_id.clone()), false);
        for key in members {
            self.link(&key, false);
        }
    }

    pub fn complete_thread_load(&mut self, root_id: &PostId, page: Page) -> Mutation {
        self.ensure_thread(root_id);
        let mut mutation = Mutation::Unchanged;
        for post in page.posts {
            let belongs = post.confirmed_id() == Some(root_id) || post.root_id.as_ref() == Some(root_id);
            if !belongs {
                debug!(%root_id, post_id = %post.id, "posts: skipping thread entry from another thread");
                continue;
            }
            mutation = mutation.merge(self.merge_post(post, Placement::THREAD));
        }
        if let Some(thread) = self.threads.get_mut(root_id) {
            if thread.loading || thread.has_more != page.has_more || thread.error.is_some() {
                mutation = Mutation::Applied;
            }
            thread.loading = false;
            thread.has_more = page.has_more;
            thread.error = None;
        }
        mutation
    }

    pub fn fail_thread_load(&mut self, root_id: &PostId, error: ApiError) -> Mutation {
        self.ensure_thread(root_id);
        if let Some(thread) = self.threads.get_mut(root_id) {
            thread.loading = false;
            thread.error = Some(error);
        }
        Mutation::Applied
    }

    pub fn set_pagination_error(&mut self, channel_id: &ChannelId, error: ApiError) {
        self.channels.entry(channel_id.clone()).or_default().error = Some(error);
    }

    pub fn pagination(&self, channel_id: &ChannelId) -> PaginationState {
        let history = self.channels.get(channel_id).cloned().unwrap_or_default();
        PaginationState {
            has_more_older: history.has_more_older,
            has_more_newer: history.has_more_newer,
            error: history.error,
        }
    }

    pub fn oldest_post_id(&self, channel_id: &ChannelId) -> Option<PostId> {
        self.channels
            .get(channel_id)?
            .sequence
            .keys()
            .find_map(|key| key.confirmed().cloned())
    }

    pub fn newest_post_id(&self, channel_id: &ChannelId) -> Option<PostId> {
        self.channels
            .get(channel_id)?
            .sequence
            .entries
            .values()
            .rev()
            .find_map(|key| key.confirmed().cloned())
    }

    pub fn channel_posts(&self, channel_id: &ChannelId) -> Vec<Post> {
        self.channels
            .get(channel_id)
            .map(|history| self.resolve(history.sequence.keys()))
            .unwrap_or_default()
    }

    pub fn thread(&self, root_id: &PostId) -> Option<ThreadView> {
        let state = self.threads.get(root_id)?;
        let post_ids = state.sequence.keys().cloned().collect::<Vec<_>>();
        Some(ThreadView {
            posts: self.resolve(post_ids.iter()),
            thread: Thread {
                root_post_id: root_id.clone(),
                post_ids,
                loading: state.loading,
                has_more: state.has_more,
                error: state.error.clone(),
            },
        })
    }

    pub fn post(&self, key: &PostKey) -> Option<&Post> {
        self.posts.get(key)
    }

    pub fn find_post(&self, temp_id: &TempId) -> Option<&Post> {
        match self.confirmed_pending.get(temp_id) {
            Some(post_id) => self.posts.get(&PostKey::Confirmed(post_id.clone())),
            None => self.posts.get(&PostKey::Pending(temp_id.clone())),
        }
    }

    fn resolve<'a>(&self, keys: impl Iterator<Item = &'a PostKey>) -> Vec<Post> {
        keys.filter_map(|key| self.posts.get(key).cloned()).collect()
    }

    fn link(&mut self, key: &PostKey, into_channel: bool) -> bool {
        let Some(post) = self.posts.get(key) else {
            return false;
        };
        let mut linked = false;
        if into_channel {
            linked |= self
                .channels
                .entry(post.channel_id.clone())
                .or_default()
                .sequence
                .insert(post);
        }
        let thread_root = post.root_id.as_ref().or(post.confirmed_id());
        if let Some(thread) = thread_root.and_then(|root_id| self.threads.get_mut(root_id)) {
            linked |= thread.sequence.insert(post);
        }
        linked
    }

    fn unlink(&mut self, post: &Post) {
        if let Some(history) = self.channels.get_mut(&post.channel_id) {
            history.sequence.remove(post);
        }
        let thread_root = post.root_id.as_ref().or(post.confirmed_id());
        if let Some(thread) = thread_root.and_then(|root_id| self.threads.get_mut(root_id)) {
            thread.sequence.remove(post);
        }
    }

    fn adjust_reply_count(&mut self, root_id: &PostId, delta: i32) {
        if let Some(root) = self.posts.get_mut(&PostKey::Confirmed(root_id.clone())) {
            root.reply_count = if delta >= 0 {
                root.reply_count.saturating_add(delta.unsigned_abs())
            } else {
                root.reply_count.saturating_sub(delta.unsigned_abs())
            };
        }
    }
}

pub struct PostEvents {
    store: Arc<RwLock<PostStore>>,
    local_user_id: UserId,
}

impl PostEvents {
    pub fn new(store: Arc<RwLock<PostStore>>, local_user_id: UserId) -> Self {
        Self {
            store,
            local_user_id,
        }
    }
}

impl EventHandler for PostEvents {
    fn name(&self) -> &'static str {
        "posts"
    }

    fn concern(&self) -> Concern {
        Concern::Posts
    }

    fn accepts(&self, kind: &EventKind) -> bool {
        matches!(
            kind,
            EventKind::Posted
                | EventKind::PostEdited
                | EventKind::PostDeleted
                | EventKind::ReactionAdded
                | EventKind::ReactionRemoved
                | EventKind::ChannelDeleted
                | EventKind::UserRemoved
        )
    }

    fn handle(&self, event: &DecodedEvent) -> Result<Mutation, SyncError> {
        let mut store = self.store.write();
        match (&event.kind, &event.payload) {
            (EventKind::Posted, EventPayload::Post { post, .. }) => Ok(store.receive_post(post.clone())),
            (EventKind::PostEdited, EventPayload::Post { post, .. }) => {
                let post_id = confirmed_id(post)?;
                store.apply_edit(post_id, &post.message, post.file_ids.clone(), post.updated_at)
            }
            (EventKind::PostDeleted, EventPayload::Post { post, .. }) => {
                let post_id = confirmed_id(post)?;
                store.apply_delete(post_id, post.deleted_at.unwrap_or(post.updated_at))
            }
            (EventKind::ReactionAdded, EventPayload::Reaction(reaction)) => {
                store.apply_reaction_delta(reaction, true)
            }
            (EventKind::ReactionRemoved, EventPayload::Reaction(reaction)) => {
                store.apply_reaction_delta(reaction, false)
            }
            (EventKind::ChannelDeleted, EventPayload::ChannelRemoved { channel_id, .. }) => {
                Ok(store.remove_channel(channel_id))
            }
            (EventKind::UserRemoved, EventPayload::Membership { channel_id, user_id }) => {
                if *user_id == self.local_user_id {
                    Ok(store.remove_channel(channel_id))
                } else {
                    Ok(Mutation::Unchanged)
                }
            }
            _ => Ok(Mutation::Unchanged),
        }
    }
}

fn confirmed_id(post: &Post) -> Result<&PostId, SyncError> {
    post.confirmed_id()
        .ok_or_else(|| SyncError::validation(format!("event post {} has no server id", post.id)))
}

#[cfg(test)]
#[path = "tests/posts_tests.rs"]
mod tests;
