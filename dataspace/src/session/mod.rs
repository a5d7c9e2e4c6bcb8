//! The process-facing session handle.
//!
//! # Example
//!
//! ```rust,ignore
//! let session = dataspace::open(SessionConfig::default()).await?;
//!
//! session.query("/demo/example/**", "", query::from_fn(|reply| {
//!     println!(">> [Reply handler] received ('{}': '{}')", reply.res_name, reply.payload_str());
//!     Ok(())
//! }))?;
//!
//! tokio::time::sleep(Duration::from_secs(1)).await;
//! session.close();
//! ```

pub(crate) mod state;
pub(crate) mod worker;

use crate::config::SessionConfig;
use crate::error::{SelectorError, SessionError};
use crate::id::{CorrelationId, PeerId, QueryableId, ResourceId};
use crate::key::{self, ResourceBindings, ResourceKey};
use crate::messaging::{BinaryCodec, Codec};
use crate::query::dispatcher;
use crate::query::{
    ChannelHandler, CorrelationIdFactory, QueryEvent, QueryOptions, QueryableKind, ReplyAggregator,
    ReplyHandler, TimerQueue,
};
use crate::queryable::{QueryHandler, QueryableRegistry};
use crate::transport::{self, Link};
use state::SessionState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct SessionInner {
    state: Arc<SessionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancelled = self.state.aggregator.close();
        self.state.transport.close();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        tracing::info!(peer = %self.state.id, cancelled, "session closed");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle on an open session.
///
/// Cheap to clone; every clone refers to the same session. The session
/// closes on [`close`](Self::close) or when the last clone is dropped.
///
/// # Thread Safety
///
/// All methods are synchronous and may be called from any thread. Reply
/// handlers run on the session's I/O task, never on the caller's thread.
/// Calling [`close`](Self::close) from inside a reply handler of the same
/// session is not supported.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session: validate `config`, connect its transport and start the
    /// I/O worker.
    ///
    /// # Errors
    ///
    /// - `SessionError::Config` for an invalid mode, locator or timeout
    /// - `SessionError::Transport` if listeners cannot bind or peers cannot
    ///   be reached
    pub async fn open(config: SessionConfig) -> Result<Session, SessionError> {
        config.validate()?;
        let link = transport::connect(&config).await?;
        Ok(Self::with_link(config, link, Arc::new(BinaryCodec)))
    }

    /// Start a session over an already established link.
    ///
    /// The session id is the link's local id. Must be called from within a
    /// Tokio runtime.
    pub fn with_link(config: SessionConfig, link: Link, codec: Arc<dyn Codec>) -> Session {
        let Link { transport, inbound } = link;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (timer, timer_task) = TimerQueue::spawn(events.clone());

        let state = Arc::new(SessionState {
            id: transport.local_id().clone(),
            config,
            transport,
            codec,
            bindings: Mutex::new(ResourceBindings::new()),
            queryables: Mutex::new(QueryableRegistry::new()),
            correlation: CorrelationIdFactory::new(),
            aggregator: ReplyAggregator::new(),
            events,
            timer,
            closed: AtomicBool::new(false),
        });
        let worker_task = tokio::spawn(worker::run(state.clone(), events_rx, inbound));

        tracing::info!(
            peer = %state.id,
            mode = %state.config.mode(),
            locators = ?state.transport.locators(),
            peers = state.transport.peers().len(),
            "session opened"
        );

        Session {
            inner: Arc::new(SessionInner {
                state,
                tasks: Mutex::new(vec![worker_task, timer_task]),
            }),
        }
    }

    fn state(&self) -> &SessionState {
        &self.inner.state
    }

    /// This session's peer id.
    pub fn id(&self) -> &PeerId {
        &self.state().id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.state().config
    }

    /// Currently connected peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.state().transport.peers()
    }

    /// Locators this session accepts connections on, as bound.
    pub fn locators(&self) -> Vec<String> {
        self.state().transport.locators()
    }

    /// Bind a path to a numeric resource id.
    ///
    /// Declaring the same path twice returns the same id.
    pub fn declare_resource(&self, name: &str) -> Result<ResourceId, SessionError> {
        self.ensure_open()?;
        key::validate(name)?;
        let id = self.state().bindings().declare(name);
        tracing::debug!(peer = %self.id(), resource = %id, name, "resource declared");
        Ok(id)
    }

    /// Remove a resource id binding.
    ///
    /// Queryables declared through the id stop matching (a warning is logged
    /// each time they are skipped).
    pub fn undeclare_resource(&self, id: ResourceId) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.state()
            .bindings()
            .undeclare(id)
            .map(|_| ())
            .ok_or(SessionError::UnknownResource(id))
    }

    /// Declare a queryable answering queries that intersect `key`.
    ///
    /// # Parameters
    ///
    /// - `kind`: the queryable's kind, matched against a query's allowed kinds
    /// - `complete`: whether it holds every value under `key`
    ///   (used by `AllComplete`, `BestMatching` and `Complete(n)` targets)
    ///
    /// # Errors
    ///
    /// - `SessionError::UnknownResource` if `key` uses an unbound id
    /// - `SessionError::InvalidSelector` if the resolved key is malformed
    pub fn declare_queryable(
        &self,
        key: impl Into<ResourceKey>,
        kind: QueryableKind,
        complete: bool,
        handler: impl QueryHandler,
    ) -> Result<QueryableId, SessionError> {
        self.ensure_open()?;
        let key = key.into();
        let bindings = self.state().bindings();
        let Some(path) = bindings.resolve(&key).map(|path| path.into_owned()) else {
            return Err(match key.id() {
                Some(id) => SessionError::UnknownResource(id),
                None => SelectorError::UnresolvedKey(key.to_string()).into(),
            });
        };
        key::validate(&path)?;

        let id = self
            .state()
            .queryables()
            .declare(key, kind, complete, Arc::new(handler));
        tracing::debug!(peer = %self.id(), queryable = %id, key = %path, ?kind, complete, "queryable declared");
        Ok(id)
    }

    pub fn undeclare_queryable(&self, id: QueryableId) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.state()
            .queryables()
            .undeclare(id)
            .map(|_| ())
            .ok_or(SessionError::UnknownQueryable(id))
    }

    /// Query every queryable matching `key` with the default options.
    ///
    /// `key` may be a path with an inline `?predicate`, a resource id, or an
    /// id with a suffix. Returns as soon as the query is sent; `handler` is
    /// called on the session's I/O task for each reply and once more when
    /// the query finishes.
    ///
    /// # Errors
    ///
    /// - `SessionError::SessionClosed` after [`close`](Self::close)
    /// - `SessionError::InvalidSelector` for malformed or unresolved keys;
    ///   nothing is registered in that case
    pub fn query(
        &self,
        key: impl Into<ResourceKey>,
        predicate: &str,
        handler: impl ReplyHandler,
    ) -> Result<CorrelationId, SessionError> {
        self.query_with(key, predicate, handler, QueryOptions::default())
    }

    /// Query with explicit target, consolidation, routing and timeout.
    pub fn query_with(
        &self,
        key: impl Into<ResourceKey>,
        predicate: &str,
        handler: impl ReplyHandler,
        options: QueryOptions,
    ) -> Result<CorrelationId, SessionError> {
        dispatcher::dispatch(self.state(), &key.into(), predicate, options, Box::new(handler))
    }

    /// Query and receive replies on a channel instead of a handler.
    ///
    /// The channel yields every reply, then one [`QueryEvent::Finished`].
    pub fn query_channel(
        &self,
        key: impl Into<ResourceKey>,
        predicate: &str,
        options: QueryOptions,
    ) -> Result<(CorrelationId, mpsc::UnboundedReceiver<QueryEvent>), SessionError> {
        let (handler, receiver) = ChannelHandler::new();
        let id = self.query_with(key, predicate, handler, options)?;
        Ok((id, receiver))
    }

    /// Number of queries still waiting for replies.
    pub fn pending_count(&self) -> usize {
        self.state().aggregator.pending_count()
    }

    /// Whether a query is still waiting for replies.
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.state().aggregator.contains(id)
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Close the session.
    ///
    /// Stops accepting queries, cancels every pending query (each handler
    /// gets one final [`QueryOutcome::Cancelled`](crate::query::QueryOutcome)),
    /// releases the transport and stops the I/O tasks. No reply handler runs
    /// after this returns. Closing twice is a no-op.
    pub fn close(&self) {
        self.inner.close();
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", self.id())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}
