//! Dispatches decoded events to every consumer that accepts their kind.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    decoder::{DecodedEvent, EventKind},
    error::SyncError,
    Mutation,
};

/// State partition a handler writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concern {
    Posts,
    Unreads,
    Membership,
    Typing,
}

pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn concern(&self) -> Concern;
    fn accepts(&self, kind: &EventKind) -> bool;
    fn handle(&self, event: &DecodedEvent) -> Result<Mutation, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerFailure {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub handler: &'static str,
    pub concern: Concern,
    pub result: Result<Mutation, HandlerFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReport {
    pub kind: EventKind,
    pub outcomes: Vec<HandlerOutcome>,
}

impl RouteReport {
    /// No registered handler accepted the event kind.
    pub fn is_ignored(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn changed(&self) -> Vec<Concern> {
        let mut concerns = Vec::new();
        for outcome in &self.outcomes {
            if matches!(outcome.result, Ok(Mutation::Applied)) && !concerns.contains(&outcome.concern)
            {
                concerns.push(outcome.concern);
            }
        }
        concerns
    }

    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &HandlerFailure)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().err().map(|err| (outcome.handler, err)))
    }
}

#[derive(Default, Clone)]
pub struct EventRouter {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Runs every accepting handler in registration order. A failing or
    /// panicking handler is reported and the remaining handlers still run.
    pub fn route(&self, event: &DecodedEvent) -> RouteReport {
        let mut outcomes = Vec::new();
        for handler in &self.handlers {
            if !handler.accepts(&event.kind) {
                continue;
            }
            let result = match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                Ok(Ok(mutation)) => Ok(mutation),
                Ok(Err(err)) => {
                    if err.is_conflict() {
                        debug!(
                            handler = handler.name(),
                            kind = %event.kind,
                            error = %err,
                            "router: handler skipped conflicting event"
                        );
                    } else {
                        warn!(
                            handler = handler.name(),
                            kind = %event.kind,
                            error = %err,
                            "router: handler failed"
                        );
                    }
                    Err(HandlerFailure::Sync(err))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(
                        handler = handler.name(),
                        kind = %event.kind,
                        %message,
                        "router: handler panicked"
                    );
                    Err(HandlerFailure::Panicked(message))
                }
            };
            outcomes.push(HandlerOutcome {
                handler: handler.name(),
                concern: handler.concern(),
                result,
            });
        }

        if outcomes.is_empty() {
            trace!(kind = %event.kind, "router: no handler for event kind");
        }

        RouteReport {
            kind: event.kind.clone(),
            outcomes,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
