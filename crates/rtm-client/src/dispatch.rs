//! Event handler registry and concurrent fan-out.
//!
//! Every handler whose filter matches an event runs as its own task. A
//! handler that returns an error or panics is logged and forgotten; the
//! read pump and sibling handlers are unaffected.

use std::{
    any::Any,
    collections::HashSet,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::event::Event;

/// Event type that matches every event.
pub const WILDCARD: &str = "*";

/// Error a handler may return. Logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Identifies one registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Which events a handler wants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerFilter {
    event_type: String,
    subtypes: Option<HashSet<String>>,
}

impl HandlerFilter {
    /// Match every event.
    pub fn any() -> Self {
        Self {
            event_type: WILDCARD.to_string(),
            subtypes: None,
        }
    }

    /// Match events with this `type`. Passing [`WILDCARD`] is the same as [`any`](Self::any).
    pub fn event(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            subtypes: None,
        }
    }

    /// Additionally require one of these subtypes. Ignored for the wildcard.
    #[must_use]
    pub fn subtypes<I, S>(mut self, subtypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = subtypes.into_iter().map(Into::into).collect();
        self.subtypes = (!set.is_empty()).then_some(set);
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.event_type == WILDCARD {
            return true;
        }
        if !event.is(&self.event_type) {
            return false;
        }
        match &self.subtypes {
            None => true,
            Some(allowed) => event.subtype().is_some_and(|s| allowed.contains(s)),
        }
    }
}

/// Receives dispatched events.
///
/// Implemented for any `Fn(Arc<Event>) -> impl Future<Output = HandlerResult>`.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<Event>) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> HandlerResult {
        (self)(event).await
    }
}

struct HandlerEntry {
    id: HandlerId,
    owner: Arc<str>,
    filter: HandlerFilter,
    handler: Arc<dyn EventHandler>,
}

/// Registry of handlers.
pub struct Dispatcher {
    handlers: RwLock<Vec<HandlerEntry>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a handler tagged with `owner`.
    pub fn register<H>(&self, owner: &str, filter: HandlerFilter, handler: H) -> HandlerId
    where
        H: EventHandler,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%id, owner, event_type = filter.event_type(), "Registering handler");
        self.handlers.write().push(HandlerEntry {
            id,
            owner: Arc::from(owner),
            filter,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove one registration. Returns `false` if it was already gone.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|entry| entry.id != id);
        handlers.len() != before
    }

    /// Remove every registration tagged with `owner`. Returns how many were removed.
    pub fn unregister_all(&self, owner: &str) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|entry| &*entry.owner != owner);
        let removed = before - handlers.len();
        debug!(owner, removed, "Unregistered handlers");
        removed
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Spawn one guarded invocation per matching handler.
    ///
    /// Returns immediately; the handles are only useful to callers that want
    /// to wait for this round of handlers.
    pub fn dispatch(&self, event: Arc<Event>) -> Vec<JoinHandle<()>> {
        // Matching entries are collected first so no handler runs under the lock.
        let matched: Vec<(HandlerId, Arc<str>, Arc<dyn EventHandler>)> = self
            .handlers
            .read()
            .iter()
            .filter(|entry| entry.filter.matches(&event))
            .map(|entry| {
                (
                    entry.id,
                    Arc::clone(&entry.owner),
                    Arc::clone(&entry.handler),
                )
            })
            .collect();

        matched
            .into_iter()
            .map(|(id, owner, handler)| {
                tokio::spawn(invoke_guarded(id, owner, handler, Arc::clone(&event)))
            })
            .collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn invoke_guarded(
    id: HandlerId,
    owner: Arc<str>,
    handler: Arc<dyn EventHandler>,
    event: Arc<Event>,
) {
    let event_type = event.kind().to_string();
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(%id, owner = %owner, event_type = %event_type, error = %err, "Handler failed");
        }
        Err(panic) => {
            error!(
                %id,
                owner = %owner,
                event_type = %event_type,
                panic = %panic_message(&panic),
                "Handler panicked"
            );
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
