//! Queryables: handlers answering queries on a key.
//!
//! A queryable is declared on a session with a key (possibly carrying
//! wildcards), a kind and a completeness flag. Every query whose selector
//! intersects the key, and whose target policy selects it, is handed to the
//! queryable's [`QueryHandler`] as a [`Query`]. The handler replies through
//! [`Query::reply`]; dropping the `Query` tells the querier that this
//! queryable has nothing more to send.
//!
//! # Example
//!
//! ```rust,ignore
//! session.declare_queryable(
//!     "/demo/example/**",
//!     QueryableKind::EVAL,
//!     true,
//!     queryable::from_fn(|query: Query| async move {
//!         let _ = query.reply(Sample::new("/demo/example/item", b"42".to_vec()));
//!     }),
//! )?;
//! ```

use crate::error::{SessionError, TransportError};
use crate::id::{CorrelationId, PeerId, QueryableId};
use crate::key::{self, ResourceBindings, ResourceKey};
use crate::messaging::{Codec, Message, Reply, Sample};
use crate::query::correlation::Replier;
use crate::query::{QueryTarget, QueryableKind};
use crate::selector::Selector;
use crate::session::worker::LocalEvent;
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Answers queries routed to a queryable.
///
/// Each query runs in its own task. Panics are contained in that task; the
/// querier still receives the end-of-replies signal.
#[async_trait]
pub trait QueryHandler: Send + Sync + 'static {
    async fn handle(&self, query: Query);
}

/// Adapter turning an async closure into a [`QueryHandler`].
pub struct FnQueryHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> QueryHandler for FnQueryHandler<F>
where
    F: Fn(Query) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, query: Query) {
        (self.f)(query).await
    }
}

/// Build a queryable handler from an async closure.
pub fn from_fn<F, Fut>(f: F) -> FnQueryHandler<F>
where
    F: Fn(Query) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnQueryHandler { f }
}

/// A declared queryable.
pub struct QueryableEntry {
    pub id: QueryableId,
    pub key: ResourceKey,
    pub kind: QueryableKind,
    /// Whether this queryable holds every value under its key.
    pub complete: bool,
    pub handler: Arc<dyn QueryHandler>,
}

/// A queryable picked by a target policy for one query.
#[derive(Clone)]
pub struct SelectedQueryable {
    pub id: QueryableId,
    pub kind: QueryableKind,
    pub handler: Arc<dyn QueryHandler>,
}

impl std::fmt::Debug for SelectedQueryable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedQueryable")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Queryables of one session, in declaration order.
pub struct QueryableRegistry {
    next_id: u64,
    entries: BTreeMap<QueryableId, QueryableEntry>,
}

impl QueryableRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    pub fn declare(
        &mut self,
        key: ResourceKey,
        kind: QueryableKind,
        complete: bool,
        handler: Arc<dyn QueryHandler>,
    ) -> QueryableId {
        let id = QueryableId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            QueryableEntry {
                id,
                key,
                kind,
                complete,
                handler,
            },
        );
        id
    }

    pub fn undeclare(&mut self, id: QueryableId) -> Option<QueryableEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: QueryableId) -> Option<&QueryableEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queryables a query on `selector_key` is routed to under `target`.
    ///
    /// Candidates must be of an allowed kind and their key must intersect the
    /// selector; the target policy then picks among them in declaration
    /// order.
    pub fn select(
        &self,
        selector_key: &str,
        target: &QueryTarget,
        bindings: &ResourceBindings,
    ) -> Vec<SelectedQueryable> {
        let matching: Vec<&QueryableEntry> = self
            .entries
            .values()
            .filter(|entry| entry.kind.intersects(target.kinds))
            .filter(|entry| key::key_intersects(bindings, &entry.key, selector_key))
            .collect();

        target
            .target
            .select(matching, |entry| entry.complete)
            .into_iter()
            .map(|entry| SelectedQueryable {
                id: entry.id,
                kind: entry.kind,
                handler: entry.handler.clone(),
            })
            .collect()
    }
}

impl Default for QueryableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends one end-of-replies frame to a remote querier once every local
/// queryable serving its query has finished.
pub(crate) struct RemoteFinalGuard {
    pub(crate) origin: PeerId,
    pub(crate) correlation_id: CorrelationId,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) codec: Arc<dyn Codec>,
}

impl RemoteFinalGuard {
    fn send(&self, message: &Message) -> Result<(), SessionError> {
        let frame = self.codec.encode(message)?;
        self.transport.send(&self.origin, frame)?;
        Ok(())
    }
}

impl Drop for RemoteFinalGuard {
    fn drop(&mut self) {
        let message = Message::ReplyFinal {
            correlation_id: self.correlation_id,
        };
        match self.send(&message) {
            Ok(()) => {}
            Err(SessionError::Transport(TransportError::Closed)) => {}
            Err(e) => {
                tracing::warn!(
                    correlation_id = %self.correlation_id,
                    origin = %self.origin,
                    error = %e,
                    "failed to send end-of-replies"
                );
            }
        }
    }
}

pub(crate) enum Route {
    Local {
        events: mpsc::UnboundedSender<LocalEvent>,
        queryable: QueryableId,
    },
    Remote(Arc<RemoteFinalGuard>),
}

/// A query handed to a queryable.
pub struct Query {
    selector: Selector,
    correlation_id: CorrelationId,
    kind: QueryableKind,
    replier: PeerId,
    route: Route,
}

impl Query {
    pub(crate) fn new(
        selector: Selector,
        correlation_id: CorrelationId,
        kind: QueryableKind,
        replier: PeerId,
        route: Route,
    ) -> Self {
        Self {
            selector,
            correlation_id,
            kind,
            replier,
            route,
        }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Resolved key of the selector.
    pub fn key(&self) -> &str {
        self.selector.key()
    }

    pub fn predicate(&self) -> &str {
        self.selector.predicate()
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Send a reply to the querier.
    ///
    /// # Errors
    ///
    /// - `SessionError::SessionClosed` if the local session is gone
    /// - `SessionError::Transport` / `SessionError::Codec` for remote queriers
    pub fn reply(&self, sample: Sample) -> Result<(), SessionError> {
        let reply = Reply::from_sample(self.correlation_id, sample, self.kind, self.replier.clone());
        match &self.route {
            Route::Local { events, .. } => events
                .send(LocalEvent::Reply(reply))
                .map_err(|_| SessionError::SessionClosed),
            Route::Remote(guard) => guard.send(&Message::Reply(reply)),
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        if let Route::Local { events, queryable } = &self.route {
            // Session may be closed already; nobody is waiting then.
            let _ = events.send(LocalEvent::Final {
                correlation_id: self.correlation_id,
                replier: Replier::Local(*queryable),
            });
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("selector", &self.selector)
            .field("correlation_id", &self.correlation_id)
            .field("kind", &self.kind)
            .finish()
    }
}
