//! State shared by a session handle, its worker and its timer.

use crate::config::SessionConfig;
use crate::id::PeerId;
use crate::key::ResourceBindings;
use crate::messaging::Codec;
use crate::query::{CorrelationIdFactory, ReplyAggregator, TimerQueue};
use crate::queryable::QueryableRegistry;
use crate::session::worker::LocalEvent;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Everything a session owns.
///
/// # Lock order
///
/// `bindings` before `queryables`. A pending query's delivery lock before the
/// aggregator table. No lock here is held across an `.await`.
pub(crate) struct SessionState {
    pub(crate) id: PeerId,
    pub(crate) config: SessionConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) bindings: Mutex<ResourceBindings>,
    pub(crate) queryables: Mutex<QueryableRegistry>,
    pub(crate) correlation: CorrelationIdFactory,
    pub(crate) aggregator: ReplyAggregator,
    pub(crate) events: mpsc::UnboundedSender<LocalEvent>,
    pub(crate) timer: TimerQueue,
    pub(crate) closed: AtomicBool,
}

impl SessionState {
    pub(crate) fn bindings(&self) -> MutexGuard<'_, ResourceBindings> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn queryables(&self) -> MutexGuard<'_, QueryableRegistry> {
        self.queryables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
