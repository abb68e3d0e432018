use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use shared::{
    domain::{
        Category, CategoryId, Channel, ChannelId, FileId, Page, Post, PostId, PostKey, Reaction,
        TeamId, TempId, UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::RawEvent,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tracing::{debug, info, warn};

pub mod config;
pub mod decoder;
pub mod display;
pub mod error;
pub mod fetch;
pub mod http_api;
pub mod membership;
pub mod posts;
pub mod router;
pub mod transport;
pub mod typing;
pub mod unreads;

use config::EngineSettings;
use decoder::{DecodeError, DecodedEvent, EventKind, EventPayload};
use display::DisplayState;
use error::SyncError;
use fetch::{FetchCoordinator, Fetched, ResourceKey};
use membership::{CategoryMove, MembershipEvents, MembershipSync};
use posts::{PaginationState, PostDraft, PostEvents, PostStore, ThreadView};
use router::{Concern, EventRouter, RouteReport};
use typing::{TypingEvents, TypingIndicators};
use unreads::{MentionMatcher, UnreadCounter, UnreadCounts, UnreadEvents};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Applied,
    Unchanged,
}

impl Mutation {
    pub fn from_changed(changed: bool) -> Self {
        if changed {
            Self::Applied
        } else {
            Self::Unchanged
        }
    }

    pub fn applied(self) -> bool {
        self == Self::Applied
    }

    pub fn merge(self, other: Mutation) -> Self {
        Self::from_changed(self.applied() || other.applied())
    }
}

pub trait IdentityProvider: Send + Sync {
    fn user_id(&self) -> UserId;
    fn mention_tokens(&self) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub username: String,
    /// Extra words that count as a mention, such as a first name.
    pub mention_keys: Vec<String>,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            mention_keys: Vec::new(),
        }
    }
}

impl IdentityProvider for LocalIdentity {
    fn user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn mention_tokens(&self) -> Vec<String> {
        let mut tokens = vec![
            format!("@{}", self.username),
            "@channel".to_string(),
            "@all".to_string(),
            "@here".to_string(),
        ];
        tokens.extend(self.mention_keys.iter().cloned());
        tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel: Channel,
    pub counts: UnreadCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamSnapshot {
    pub channels: Vec<ChannelSnapshot>,
    pub categories: Vec<Category>,
}

#[async_trait]
pub trait PaginationClient: Send + Sync {
    async fn fetch_older_posts(
        &self,
        channel_id: &ChannelId,
        before: Option<&PostId>,
        per_page: u32,
    ) -> Result<Page, ApiError>;
    async fn fetch_newer_posts(
        &self,
        channel_id: &ChannelId,
        after: Option<&PostId>,
        per_page: u32,
    ) -> Result<Page, ApiError>;
    async fn fetch_thread(&self, root_id: &PostId) -> Result<Page, ApiError>;
    async fn fetch_team_channels(&self, team_id: &TeamId) -> Result<Vec<ChannelSnapshot>, ApiError>;
    async fn fetch_channel(&self, channel_id: &ChannelId) -> Result<Channel, ApiError>;
    async fn fetch_team_categories(&self, team_id: &TeamId) -> Result<Vec<Category>, ApiError>;
}

pub struct MissingPaginationClient;

#[async_trait]
impl PaginationClient for MissingPaginationClient {
    async fn fetch_older_posts(
        &self,
        channel_id: &ChannelId,
        _before: Option<&PostId>,
        _per_page: u32,
    ) -> Result<Page, ApiError> {
        Err(ApiError::unavailable(format!(
            "pagination client unavailable for channel {channel_id}"
        )))
    }

    async fn fetch_newer_posts(
        &self,
        channel_id: &ChannelId,
        _after: Option<&PostId>,
        _per_page: u32,
    ) -> Result<Page, ApiError> {
        Err(ApiError::unavailable(format!(
            "pagination client unavailable for channel {channel_id}"
        )))
    }

    async fn fetch_thread(&self, root_id: &PostId) -> Result<Page, ApiError> {
        Err(ApiError::unavailable(format!(
            "pagination client unavailable for thread {root_id}"
        )))
    }

    async fn fetch_team_channels(&self, team_id: &TeamId) -> Result<Vec<ChannelSnapshot>, ApiError> {
        Err(ApiError::unavailable(format!(
            "pagination client unavailable for team {team_id}"
        )))
    }

    async fn fetch_channel(&self, channel_id: &ChannelId) -> Result<Channel, ApiError> {
        Err(ApiError::unavailable(format!(
            "pagination client unavailable for channel {channel_id}"
        )))
    }

    async fn fetch_team_categories(&self, team_id: &TeamId) -> Result<Vec<Category>, ApiError> {
        Err(ApiError::unavailable(format!(
            "pagination client unavailable for team {team_id}"
        )))
    }
}

#[async_trait]
pub trait MutationClient: Send + Sync {
    async fn create_post(&self, draft: &PostDraft) -> Result<Post, ApiError>;
    async fn edit_post(&self, post_id: &PostId, message: &str, file_ids: &[FileId]) -> Result<Post, ApiError>;
    async fn delete_post(&self, post_id: &PostId) -> Result<(), ApiError>;
    async fn add_reaction(&self, reaction: &Reaction) -> Result<(), ApiError>;
    async fn remove_reaction(&self, reaction: &Reaction) -> Result<(), ApiError>;
    async fn move_channel_category(&self, team_id: &TeamId, categories: &[Category]) -> Result<(), ApiError>;
    async fn update_category_order(&self, team_id: &TeamId, order: &[CategoryId]) -> Result<(), ApiError>;
    async fn mark_channel_viewed(&self, channel_id: &ChannelId) -> Result<(), ApiError>;
}

pub struct MissingMutationClient;

fn mutation_unavailable(operation: &str) -> ApiError {
    ApiError::unavailable(format!("mutation client unavailable for {operation}"))
}

#[async_trait]
impl MutationClient for MissingMutationClient {
    async fn create_post(&self, _draft: &PostDraft) -> Result<Post, ApiError> {
        Err(mutation_unavailable("create_post"))
    }

    async fn edit_post(&self, _post_id: &PostId, _message: &str, _file_ids: &[FileId]) -> Result<Post, ApiError> {
        Err(mutation_unavailable("edit_post"))
    }

    async fn delete_post(&self, _post_id: &PostId) -> Result<(), ApiError> {
        Err(mutation_unavailable("delete_post"))
    }

    async fn add_reaction(&self, _reaction: &Reaction) -> Result<(), ApiError> {
        Err(mutation_unavailable("add_reaction"))
    }

    async fn remove_reaction(&self, _reaction: &Reaction) -> Result<(), ApiError> {
        Err(mutation_unavailable("remove_reaction"))
    }

    async fn move_channel_category(&self, _team_id: &TeamId, _categories: &[Category]) -> Result<(), ApiError> {
        Err(mutation_unavailable("move_channel_category"))
    }

    async fn update_category_order(&self, _team_id: &TeamId, _order: &[CategoryId]) -> Result<(), ApiError> {
        Err(mutation_unavailable("update_category_order"))
    }

    async fn mark_channel_viewed(&self, _channel_id: &ChannelId) -> Result<(), ApiError> {
        Err(mutation_unavailable("mark_channel_viewed"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Changed {
        concern: Concern,
        channel_id: Option<ChannelId>,
        team_id: Option<TeamId>,
    },
    Error(String),
}

pub struct SyncEngine {
    settings: EngineSettings,
    local_user_id: UserId,
    posts: Arc<RwLock<PostStore>>,
    unreads: Arc<RwLock<UnreadCounter>>,
    membership: Arc<RwLock<MembershipSync>>,
    typing: Arc<RwLock<TypingIndicators>>,
    router: EventRouter,
    pages: FetchCoordinator<Page>,
    teams: FetchCoordinator<TeamSnapshot>,
    channels: FetchCoordinator<Channel>,
    pagination: Arc<dyn PaginationClient>,
    mutations: Arc<dyn MutationClient>,
    selected_channel: Mutex<Option<ChannelId>>,
    events: broadcast::Sender<EngineEvent>,
}

impl SyncEngine {
    pub fn offline(settings: EngineSettings, identity: &dyn IdentityProvider) -> anyhow::Result<Arc<Self>> {
        Self::new(
            settings,
            identity,
            Arc::new(MissingPaginationClient),
            Arc::new(MissingMutationClient),
        )
    }

    pub fn new(
        settings: EngineSettings,
        identity: &dyn IdentityProvider,
        pagination: Arc<dyn PaginationClient>,
        mutations: Arc<dyn MutationClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let local_user_id = identity.user_id();
        let matcher = MentionMatcher::new(&identity.mention_tokens())?;
        let posts = Arc::new(RwLock::new(PostStore::new()));
        let unreads = Arc::new(RwLock::new(UnreadCounter::new(
            local_user_id.clone(),
            matcher,
            settings.replay_window,
        )));
        let membership = Arc::new(RwLock::new(MembershipSync::new(local_user_id.clone())));
        let typing = Arc::new(RwLock::new(TypingIndicators::new(settings.typing_window())));

        let router = EventRouter::new()
            .with_handler(Arc::new(PostEvents::new(Arc::clone(&posts), local_user_id.clone())))
            .with_handler(Arc::new(UnreadEvents::new(Arc::clone(&unreads), local_user_id.clone())))
            .with_handler(Arc::new(MembershipEvents::new(Arc::clone(&membership))))
            .with_handler(Arc::new(TypingEvents::new(Arc::clone(&typing), local_user_id.clone())));

        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Ok(Arc::new(Self {
            settings,
            local_user_id,
            posts,
            unreads,
            membership,
            typing,
            router,
            pages: FetchCoordinator::new(),
            teams: FetchCoordinator::new(),
            channels: FetchCoordinator::new(),
            pagination,
            mutations,
            selected_channel: Mutex::new(None),
            events,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn local_user_id(&self) -> &UserId {
        &self.local_user_id
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn handle_raw_event(&self, raw: RawEvent) -> Result<RouteReport, DecodeError> {
        let event = decoder::decode(raw)?;
        Ok(self.handle_event(&event))
    }

    pub fn handle_event(&self, event: &DecodedEvent) -> RouteReport {
        let report = self.router.route(event);
        for concern in report.changed() {
            self.notify(concern, event.channel_id.as_ref(), event.team_id.as_ref());
        }
        for (handler, failure) in report.failures() {
            if matches!(failure, router::HandlerFailure::Sync(err) if err.is_conflict()) {
                continue;
            }
            let _ = self.events.send(EngineEvent::Error(format!(
                "{handler} failed on {}: {failure}",
                event.kind
            )));
        }
        report
    }

    pub async fn run<S>(self: Arc<Self>, mut events: S)
    where
        S: Stream<Item = RawEvent> + Unpin,
    {
        let mut handled = 0_u64;
        while let Some(raw) = events.next().await {
            let name = raw.event.clone();
            let event = match decoder::decode(raw) {
                Ok(event) => event,
                Err(err) => {
                    warn!(event = %name, error = %err, "engine: dropping undecodable event");
                    let _ = self
                        .events
                        .send(EngineEvent::Error(format!("invalid {name} event: {err}")));
                    continue;
                }
            };
            self.handle_event(&event);
            handled += 1;
            if let Some(channel_id) = self.unloaded_join(&event) {
                if let Err(err) = self.load_channel(&channel_id).await {
                    warn!(%channel_id, error = %err, "engine: joined channel could not be loaded");
                    let _ = self
                        .events
                        .send(EngineEvent::Error(format!("joined channel {channel_id}: {err}")));
                }
            }
        }
        info!(handled, "engine: event stream ended");
    }

    pub async fn connect(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let (sender, receiver) = mpsc::channel(self.settings.event_buffer.max(1));
        let url = self.settings.resolved_websocket_url()?;
        transport::spawn_event_source(&url, self.settings.auth_token.as_deref(), sender).await?;
        self.spawn_typing_sweeper();
        Ok(tokio::spawn(Arc::clone(self).run(ReceiverStream::new(receiver))))
    }

    pub fn spawn_typing_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.typing_sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                let expired = engine.typing.write().sweep(Instant::now());
                for channel_id in expired {
                    engine.notify(Concern::Typing, Some(&channel_id), None);
                }
            }
        })
    }

    pub async fn load_older_posts(&self, channel_id: &ChannelId) -> Result<Mutation, SyncError> {
        let key = ResourceKey::OlderPosts(channel_id.clone());
        let before = self.posts.read().oldest_post_id(channel_id);
        let client = Arc::clone(&self.pagination);
        let per_page = self.settings.page_size;
        let owned_channel = channel_id.clone();
        let result = self
            .pages
            .fetch(key.clone(), move || async move {
                client
                    .fetch_older_posts(&owned_channel, before.as_ref(), per_page)
                    .await
            })
            .await;
        self.apply_page(&key, channel_id, result, |store, page| {
            store.append_older(channel_id, page.posts, page.has_more)
        })
    }

    pub async fn load_newer_posts(&self, channel_id: &ChannelId) -> Result<Mutation, SyncError> {
        let key = ResourceKey::NewerPosts(channel_id.clone());
        let after = self.posts.read().newest_post_id(channel_id);
        let client = Arc::clone(&self.pagination);
        let per_page = self.settings.page_size;
        let owned_channel = channel_id.clone();
        let result = self
            .pages
            .fetch(key.clone(), move || async move {
                client
                    .fetch_newer_posts(&owned_channel, after.as_ref(), per_page)
                    .await
            })
            .await;
        self.apply_page(&key, channel_id, result, |store, page| {
            store.append_newer(channel_id, page.posts, page.has_more)
        })
    }

    fn apply_page(
        &self,
        key: &ResourceKey,
        channel_id: &ChannelId,
        result: Result<Fetched<Page>, ApiError>,
        merge: impl FnOnce(&mut PostStore, Page) -> Mutation,
    ) -> Result<Mutation, SyncError> {
        match result {
            Ok(fetched) if fetched.stale => {
                debug!(%key, generation = fetched.generation, "engine: discarded stale page");
                Ok(Mutation::Unchanged)
            }
            Ok(fetched) => {
                let mutation = {
                    let mut store = self.posts.write();
                    merge(&mut store, fetched.value)
                };
                if mutation.applied() {
                    self.notify(Concern::Posts, Some(channel_id), None);
                }
                Ok(mutation)
            }
            Err(err) => {
                self.posts.write().set_pagination_error(channel_id, err.clone());
                self.notify(Concern::Posts, Some(channel_id), None);
                Err(SyncError::from_fetch(key.to_string(), err))
            }
        }
    }

    pub async fn load_thread(&self, root_id: &PostId) -> Result<ThreadView, SyncError> {
        let key = ResourceKey::Thread(root_id.clone());
        if self.posts.write().begin_thread_load(root_id).applied() {
            self.notify(Concern::Posts, None, None);
        }
        let client = Arc::clone(&self.pagination);
        let owned_root = root_id.clone();
        let result = self
            .pages
            .fetch(key.clone(), move || async move { client.fetch_thread(&owned_root).await })
            .await;

        let outcome = match result {
            Ok(fetched) if fetched.stale => {
                debug!(%key, generation = fetched.generation, "engine: discarded stale thread");
                Ok(())
            }
            Ok(fetched) => {
                self.posts.write().complete_thread_load(root_id, fetched.value);
                Ok(())
            }
            Err(err) => {
                self.posts.write().fail_thread_load(root_id, err.clone());
                Err(SyncError::from_fetch(key.to_string(), err))
            }
        };
        self.notify(Concern::Posts, None, None);
        outcome?;
        self.posts
            .read()
            .thread(root_id)
            .ok_or_else(|| SyncError::conflict(format!("thread {root_id} was removed while loading")))
    }

    /// Starts a fresh thread load even if one is in flight; the older
    /// request's result is discarded if it lands after this one.
    pub async fn refresh_thread(&self, root_id: &PostId) -> Result<ThreadView, SyncError> {
        self.pages.supersede(&ResourceKey::Thread(root_id.clone()));
        self.load_thread(root_id).await
    }

    pub async fn load_team(&self, team_id: &TeamId) -> Result<Mutation, SyncError> {
        let key = ResourceKey::Team(team_id.clone());
        let client = Arc::clone(&self.pagination);
        let owned_team = team_id.clone();
        let fetched = self
            .teams
            .fetch(key.clone(), move || async move {
                let channels = client.fetch_team_channels(&owned_team).await?;
                let categories = client.fetch_team_categories(&owned_team).await?;
                Ok(TeamSnapshot {
                    channels,
                    categories,
                })
            })
            .await
            .map_err(|err| SyncError::from_fetch(key.to_string(), err))?;
        if fetched.stale {
            return Ok(Mutation::Unchanged);
        }

        let TeamSnapshot {
            channels,
            categories,
        } = fetched.value;
        let mut unread_mutation = Mutation::Unchanged;
        {
            let mut unreads = self.unreads.write();
            for snapshot in &channels {
                unread_mutation = unread_mutation
                    .merge(unreads.register_channel(&snapshot.channel))
                    .merge(unreads.set_channel_counts(&snapshot.channel.id, snapshot.counts));
            }
        }
        let membership_mutation = {
            let mut membership = self.membership.write();
            let channels = channels.into_iter().map(|snapshot| snapshot.channel).collect();
            membership
                .set_team_channels(team_id, channels)
                .merge(membership.set_team_categories(team_id, categories))
        };
        if unread_mutation.applied() {
            self.notify(Concern::Unreads, None, Some(team_id));
        }
        if membership_mutation.applied() {
            self.notify(Concern::Membership, None, Some(team_id));
        }
        info!(%team_id, "engine: team loaded");
        Ok(unread_mutation.merge(membership_mutation))
    }

    /// A `user_added` for the local user names a channel this client has
    /// never seen; the event itself carries no channel record.
    fn unloaded_join(&self, event: &DecodedEvent) -> Option<ChannelId> {
        match (&event.kind, &event.payload) {
            (EventKind::UserAdded, EventPayload::Membership { channel_id, user_id })
                if *user_id == self.local_user_id && self.membership.read().channel(channel_id).is_none() =>
            {
                Some(channel_id.clone())
            }
            _ => None,
        }
    }

    pub async fn load_channel(&self, channel_id: &ChannelId) -> Result<Mutation, SyncError> {
        let key = ResourceKey::Channel(channel_id.clone());
        let client = Arc::clone(&self.pagination);
        let owned_channel = channel_id.clone();
        let fetched = self
            .channels
            .fetch(key.clone(), move || async move { client.fetch_channel(&owned_channel).await })
            .await
            .map_err(|err| SyncError::from_fetch(key.to_string(), err))?;
        if fetched.stale {
            return Ok(Mutation::Unchanged);
        }

        let channel = fetched.value;
        let team_id = channel.team_id.clone();
        let unread_mutation = self.unreads.write().register_channel(&channel);
        let membership_mutation = self.membership.write().upsert_channel(channel);
        if unread_mutation.applied() {
            self.notify(Concern::Unreads, Some(channel_id), team_id.as_ref());
        }
        if membership_mutation.applied() {
            self.notify(Concern::Membership, Some(channel_id), team_id.as_ref());
        }
        debug!(%channel_id, "engine: channel loaded");
        Ok(unread_mutation.merge(membership_mutation))
    }

    pub async fn send_post(
        &self,
        channel_id: &ChannelId,
        root_id: Option<PostId>,
        message: &str,
        file_ids: Vec<FileId>,
    ) -> Result<Post, SyncError> {
        if message.trim().is_empty() && file_ids.is_empty() {
            return Err(SyncError::validation("post has neither message nor files"));
        }
        let temp_id = TempId::generate(&self.local_user_id);
        let draft = PostDraft {
            temp_id: temp_id.clone(),
            channel_id: channel_id.clone(),
            root_id,
            user_id: self.local_user_id.clone(),
            message: message.to_string(),
            file_ids,
            created_at: Utc::now(),
        };
        self.posts.write().create_optimistic(draft.clone());
        self.notify(Concern::Posts, Some(channel_id), None);

        match self.mutations.create_post(&draft).await {
            Ok(server_post) => {
                let fallback = server_post.clone();
                self.posts.write().confirm_create(&temp_id, server_post)?;
                self.notify(Concern::Posts, Some(channel_id), None);
                Ok(self.posts.read().find_post(&temp_id).cloned().unwrap_or(fallback))
            }
            Err(err) => {
                warn!(%channel_id, %temp_id, error = %err, "engine: create post failed");
                self.posts.write().fail_create(&temp_id);
                self.notify(Concern::Posts, Some(channel_id), None);
                Err(SyncError::OptimisticRollback {
                    operation: "create_post",
                    source: err,
                })
            }
        }
    }

    /// Applies the edit locally first; on failure the prior message and
    /// files come back unless a newer edit arrived meanwhile.
    pub async fn edit_post(&self, post_id: &PostId, message: &str, file_ids: Vec<FileId>) -> Result<Mutation, SyncError> {
        let prior = self
            .posts
            .read()
            .post(&PostKey::Confirmed(post_id.clone()))
            .cloned()
            .ok_or_else(|| SyncError::conflict(format!("edit of unknown post {post_id}")))?;
        let optimistic = self
            .posts
            .write()
            .apply_edit(post_id, message, file_ids.clone(), prior.updated_at)?;
        self.notify(Concern::Posts, Some(&prior.channel_id), None);

        match self.mutations.edit_post(post_id, message, &file_ids).await {
            Ok(server_post) => {
                let confirmed = self.posts.write().apply_edit(
                    post_id,
                    &server_post.message,
                    server_post.file_ids,
                    server_post.updated_at,
                );
                self.notify(Concern::Posts, Some(&prior.channel_id), None);
                Ok(optimistic.merge(confirmed.unwrap_or(Mutation::Unchanged)))
            }
            Err(err) => {
                if let Err(restore_err) =
                    self.posts
                        .write()
                        .apply_edit(post_id, &prior.message, prior.file_ids.clone(), prior.updated_at)
                {
                    debug!(%post_id, error = %restore_err, "engine: nothing to restore after failed edit");
                }
                self.notify(Concern::Posts, Some(&prior.channel_id), None);
                Err(SyncError::OptimisticRollback {
                    operation: "edit_post",
                    source: err,
                })
            }
        }
    }

    pub async fn delete_post(&self, post_id: &PostId) -> Result<Mutation, SyncError> {
        self.mutations
            .delete_post(post_id)
            .await
            .map_err(|source| SyncError::Request {
                operation: "delete_post".to_string(),
                source,
            })?;
        let channel_id = self
            .posts
            .read()
            .post(&PostKey::Confirmed(post_id.clone()))
            .map(|post| post.channel_id.clone());
        let mutation = self.posts.write().apply_delete(post_id, Utc::now())?;
        if mutation.applied() {
            self.notify(Concern::Posts, channel_id.as_ref(), None);
        }
        Ok(mutation)
    }

    pub async fn add_reaction(&self, post_id: &PostId, emoji_name: &str) -> Result<Mutation, SyncError> {
        self.react(post_id, emoji_name, true).await
    }

    pub async fn remove_reaction(&self, post_id: &PostId, emoji_name: &str) -> Result<Mutation, SyncError> {
        self.react(post_id, emoji_name, false).await
    }

    async fn react(&self, post_id: &PostId, emoji_name: &str, add: bool) -> Result<Mutation, SyncError> {
        let reaction = Reaction::new(post_id.clone(), emoji_name, self.local_user_id.clone());
        let optimistic = self.posts.write().apply_reaction_delta(&reaction, add)?;
        let channel_id = self
            .posts
            .read()
            .post(&PostKey::Confirmed(post_id.clone()))
            .map(|post| post.channel_id.clone());
        if optimistic.applied() {
            self.notify(Concern::Posts, channel_id.as_ref(), None);
        }

        let result = if add {
            self.mutations.add_reaction(&reaction).await
        } else {
            self.mutations.remove_reaction(&reaction).await
        };
        match result {
            Ok(()) => Ok(optimistic),
            Err(err) => {
                if optimistic.applied() {
                    if let Err(inverse_err) = self.posts.write().apply_reaction_delta(&reaction, !add) {
                        debug!(%post_id, error = %inverse_err, "engine: reaction target gone before rollback");
                    }
                    self.notify(Concern::Posts, channel_id.as_ref(), None);
                }
                Err(SyncError::OptimisticRollback {
                    operation: if add { "add_reaction" } else { "remove_reaction" },
                    source: err,
                })
            }
        }
    }

    pub async fn move_channel(&self, request: CategoryMove) -> Result<(), SyncError> {
        let (mutation_id, categories) = self.membership.write().begin_move(&request)?;
        self.notify(Concern::Membership, Some(&request.channel_id), Some(&request.team_id));

        match self
            .mutations
            .move_channel_category(&request.team_id, &categories)
            .await
        {
            Ok(()) => {
                self.membership.write().confirm(mutation_id);
                Ok(())
            }
            Err(err) => {
                warn!(
                    team_id = %request.team_id,
                    channel_id = %request.channel_id,
                    error = %err,
                    "engine: category move rejected, rolling back"
                );
                self.membership.write().rollback(mutation_id);
                self.notify(Concern::Membership, Some(&request.channel_id), Some(&request.team_id));
                Err(SyncError::OptimisticRollback {
                    operation: "move_channel",
                    source: err,
                })
            }
        }
    }

    pub async fn reorder_categories(&self, team_id: &TeamId, order: Vec<CategoryId>) -> Result<(), SyncError> {
        let mutation_id = self.membership.write().begin_reorder(team_id, &order)?;
        self.notify(Concern::Membership, None, Some(team_id));

        match self.mutations.update_category_order(team_id, &order).await {
            Ok(()) => {
                self.membership.write().confirm(mutation_id);
                Ok(())
            }
            Err(err) => {
                self.membership.write().rollback(mutation_id);
                self.notify(Concern::Membership, None, Some(team_id));
                Err(SyncError::OptimisticRollback {
                    operation: "reorder_categories",
                    source: err,
                })
            }
        }
    }

    pub async fn mark_channel_viewed(&self, channel_id: &ChannelId) -> Result<UnreadCounts, SyncError> {
        let cleared = self.unreads.write().mark_viewed(channel_id, None);
        if !cleared.is_zero() {
            self.notify(Concern::Unreads, Some(channel_id), None);
        }
        match self.mutations.mark_channel_viewed(channel_id).await {
            Ok(()) => Ok(cleared),
            Err(err) => {
                if self.unreads.write().restore(channel_id, cleared).applied() {
                    self.notify(Concern::Unreads, Some(channel_id), None);
                }
                Err(SyncError::OptimisticRollback {
                    operation: "mark_channel_viewed",
                    source: err,
                })
            }
        }
    }

    pub async fn select_channel(&self, channel_id: &ChannelId) -> Result<UnreadCounts, SyncError> {
        let previous = self.selected_channel.lock().replace(channel_id.clone());
        if let Some(previous) = previous.filter(|previous| previous != channel_id) {
            if self.typing.write().clear_channel(&previous).applied() {
                self.notify(Concern::Typing, Some(&previous), None);
            }
        }
        self.mark_channel_viewed(channel_id).await
    }

    pub fn selected_channel(&self) -> Option<ChannelId> {
        self.selected_channel.lock().clone()
    }

    pub fn channel_posts(&self, channel_id: &ChannelId) -> Vec<Post> {
        self.posts.read().channel_posts(channel_id)
    }

    pub fn thread(&self, root_id: &PostId) -> Option<ThreadView> {
        self.posts.read().thread(root_id)
    }

    pub fn pagination(&self, channel_id: &ChannelId) -> PaginationState {
        self.posts.read().pagination(channel_id)
    }

    pub fn channel_unreads(&self, channel_id: &ChannelId) -> UnreadCounts {
        self.unreads.read().channel_counts(channel_id)
    }

    pub fn team_unreads(&self, team_id: &TeamId) -> UnreadCounts {
        self.unreads.read().team_counts(team_id)
    }

    pub fn categories(&self, team_id: &TeamId) -> Vec<Category> {
        self.membership.read().categories(team_id)
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Option<Channel> {
        self.membership.read().channel(channel_id).cloned()
    }

    pub fn typing_users(&self, channel_id: &ChannelId) -> Vec<UserId> {
        self.typing.read().typing_users(channel_id, None, Instant::now())
    }

    pub fn thread_typing_users(&self, channel_id: &ChannelId, root_id: &PostId) -> Vec<UserId> {
        self.typing
            .read()
            .typing_users(channel_id, Some(root_id), Instant::now())
    }

    pub fn display_state(&self, channel_id: &ChannelId) -> DisplayState {
        display::display_state(
            &self.typing_users(channel_id),
            self.channel_unreads(channel_id),
            self.membership.read().is_muted(channel_id),
        )
    }

    fn notify(&self, concern: Concern, channel_id: Option<&ChannelId>, team_id: Option<&TeamId>) {
        let _ = self.events.send(EngineEvent::Changed {
            concern,
            channel_id: channel_id.cloned(),
            team_id: team_id.cloned(),
        });
    }
}

pub(crate) fn transport_failure(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::Unavailable, message)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
