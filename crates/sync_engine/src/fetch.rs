//! At-most-one-in-flight fetch sharing per resource key.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use shared::{
    domain::{ChannelId, PostId, TeamId},
    error::{ApiError, ErrorCode},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    OlderPosts(ChannelId),
    NewerPosts(ChannelId),
    Thread(PostId),
    Team(TeamId),
    Channel(ChannelId),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OlderPosts(channel_id) => write!(f, "olderPosts:{channel_id}"),
            Self::NewerPosts(channel_id) => write!(f, "newerPosts:{channel_id}"),
            Self::Thread(root_id) => write!(f, "thread:{root_id}"),
            Self::Team(team_id) => write!(f, "team:{team_id}"),
            Self::Channel(channel_id) => write!(f, "channel:{channel_id}"),
        }
    }
}

/// Result of a coalesced fetch. `stale` is set when a newer generation for
/// the same key completed first; such a value must not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    pub generation: u64,
    pub stale: bool,
    pub value: T,
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<Fetched<T>, ApiError>>>;

struct InFlight<T> {
    generation: u64,
    request: SharedFetch<T>,
}

struct KeyState<T> {
    in_flight: Option<InFlight<T>>,
    started: u64,
    completed: u64,
}

impl<T> Default for KeyState<T> {
    fn default() -> Self {
        Self {
            in_flight: None,
            started: 0,
            completed: 0,
        }
    }
}

type KeyTable<T> = Arc<Mutex<HashMap<ResourceKey, KeyState<T>>>>;

pub struct FetchCoordinator<T> {
    keys: KeyTable<T>,
}

impl<T> Default for FetchCoordinator<T> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> FetchCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight request for `key`, or starts `loader` as a new
    /// generation when none is running. The request runs as its own task so
    /// the in-flight marker is cleared even if every caller goes away.
    pub async fn fetch<F, Fut>(&self, key: ResourceKey, loader: F) -> Result<Fetched<T>, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let request = {
            let mut keys = self.keys.lock();
            let state = keys.entry(key.clone()).or_default();
            let joined = state
                .in_flight
                .as_ref()
                .map(|in_flight| (in_flight.generation, in_flight.request.clone()));
            match joined {
                Some((generation, request)) => {
                    debug!(%key, generation, "fetch: joining in-flight request");
                    request
                }
                None => {
                    state.started += 1;
                    let generation = state.started;
                    debug!(%key, generation, "fetch: starting request");
                    let task = tokio::spawn(run_request(
                        Arc::clone(&self.keys),
                        key.clone(),
                        generation,
                        loader(),
                    ));
                    let keys = Arc::clone(&self.keys);
                    let join_key = key.clone();
                    let request = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(join_error) => {
                                release(&keys, &join_key, generation, false);
                                Err(ApiError::new(
                                    ErrorCode::Internal,
                                    format!("fetch task for {join_key} failed: {join_error}"),
                                ))
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some(InFlight {
                        generation,
                        request: request.clone(),
                    });
                    request
                }
            }
        };
        request.await
    }

    /// Detaches the current request for `key` so the next `fetch` starts a
    /// newer generation. Returns whether a request was detached.
    pub fn supersede(&self, key: &ResourceKey) -> bool {
        let mut keys = self.keys.lock();
        let detached = keys
            .get_mut(key)
            .and_then(|state| state.in_flight.take())
            .is_some();
        if detached {
            debug!(%key, "fetch: superseded in-flight request");
        }
        detached
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.keys
            .lock()
            .get(key)
            .is_some_and(|state| state.in_flight.is_some())
    }

    pub fn completed_generation(&self, key: &ResourceKey) -> u64 {
        self.keys.lock().get(key).map_or(0, |state| state.completed)
    }
}

async fn run_request<T, Fut>(
    keys: KeyTable<T>,
    key: ResourceKey,
    generation: u64,
    request: Fut,
) -> Result<Fetched<T>, ApiError>
where
    Fut: Future<Output = Result<T, ApiError>>,
{
    let result = request.await;
    let stale = release(&keys, &key, generation, result.is_ok());
    if stale {
        debug!(%key, generation, "fetch: discarding result superseded by newer generation");
    }
    result.map(|value| Fetched {
        generation,
        stale,
        value,
    })
}

/// Clears the in-flight marker owned by `generation` and reports whether a
/// newer generation has already completed.
fn release<T>(
    keys: &Mutex<HashMap<ResourceKey, KeyState<T>>>,
    key: &ResourceKey,
    generation: u64,
    succeeded: bool,
) -> bool {
    let mut keys = keys.lock();
    let Some(state) = keys.get_mut(key) else {
        return false;
    };
    if state
        .in_flight
        .as_ref()
        .is_some_and(|in_flight| in_flight.generation == generation)
    {
        state.in_flight = None;
    }
    let stale = state.completed > generation;
    if succeeded && !stale {
        state.completed = generation;
    }
    stale
}

#[cfg(test)]
#[path = "tests/fetch_tests.rs"]
mod tests;
