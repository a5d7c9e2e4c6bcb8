//! Pending query state and correlation id issuance.
//!
//! Every query gets a [`PendingQuery`] registered before any message
//! leaves the session. The entry owns the caller's handler and tracks
//! which repliers still owe an end-of-replies signal.
//!
//! # Architecture
//!
//! ```text
//! Query Flow:
//!   1. Issue CorrelationId from CorrelationIdFactory
//!   2. Build PendingQuery with handler and outstanding repliers
//!   3. Register in the aggregator table
//!   4. Schedule the deadline on the timer queue
//!   5. Send the query to local queryables and remote peers
//!
//! Reply Flow:
//!   6. Reply arrives, lookup correlation_id
//!   7. deliver() invokes the handler under the delivery lock
//!
//! Retirement (exactly once):
//!   8a. Last outstanding replier finishes → Completed
//!   8b. Deadline elapses                  → TimedOut
//!   8c. Session closes                    → TimedOut (Cancelled notification)
//! ```

use crate::error::{HandlerError, SessionError};
use crate::id::{CorrelationId, PeerId, QueryableId};
use crate::messaging::{Reply, Timestamp};
use crate::query::handler::{QueryOutcome, ReplyHandler};
use crate::query::{QueryConsolidation, QueryTarget};
use crate::selector::Selector;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Factory for unique correlation ids.
///
/// Ids start at 1 and increase by one per query. The factory never wraps:
/// once `u64::MAX` would be reached it reports exhaustion instead.
#[derive(Debug)]
pub struct CorrelationIdFactory {
    next: AtomicU64,
}

impl CorrelationIdFactory {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Factory whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Issue the next id.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::CorrelationIdsExhausted` once the counter
    /// cannot advance.
    pub fn next(&self) -> Result<CorrelationId, SessionError> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(1)
            })
            .map(CorrelationId::new)
            .map_err(|_| SessionError::CorrelationIdsExhausted)
    }
}

impl Default for CorrelationIdFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// A party a query was addressed to, which owes an end-of-replies signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Replier {
    /// A queryable declared on this session.
    Local(QueryableId),
    /// A connected peer, answering for all of its queryables at once.
    Remote(PeerId),
}

/// Lifecycle of a pending query.
///
/// ```text
/// Open → Completed   (every addressed replier finished)
/// Open → TimedOut    (deadline elapsed or session closed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Open,
    Completed,
    TimedOut,
}

struct Delivery {
    state: QueryState,
    handler: Box<dyn ReplyHandler>,
    outstanding: HashSet<Replier>,
    consolidation: QueryConsolidation,
    /// Last delivered timestamp per resource name, for monotonic consolidation.
    latest: HashMap<String, Timestamp>,
    /// Newest reply per resource name, held back for latest consolidation.
    buffered: BTreeMap<String, Reply>,
}

/// A query waiting for replies.
///
/// # Thread Safety
///
/// The delivery lock is held for the whole duration of a handler call, so
/// handler calls for one query never overlap and a retirement waits for an
/// in-flight delivery to return. When the aggregator table lock is needed as
/// well, it is always taken after the delivery lock.
pub struct PendingQuery {
    correlation_id: CorrelationId,
    selector: Selector,
    target: QueryTarget,
    created_at: Instant,
    deadline: Instant,
    delivery: Mutex<Delivery>,
}

impl PendingQuery {
    /// Create an open query.
    ///
    /// # Parameters
    ///
    /// - `outstanding`: repliers the query is addressed to; an empty set keeps
    ///   the query open until its deadline
    pub fn new(
        correlation_id: CorrelationId,
        selector: Selector,
        target: QueryTarget,
        consolidation: QueryConsolidation,
        timeout: Duration,
        outstanding: HashSet<Replier>,
        handler: Box<dyn ReplyHandler>,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            correlation_id,
            selector,
            target,
            created_at,
            deadline: created_at + timeout,
            delivery: Mutex::new(Delivery {
                state: QueryState::Open,
                handler,
                outstanding,
                consolidation,
                latest: HashMap::new(),
                buffered: BTreeMap::new(),
            }),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn target(&self) -> QueryTarget {
        self.target
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time since the query was created.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn state(&self) -> QueryState {
        self.lock().state
    }

    /// Deliver a reply to the handler, or hold it back under latest
    /// consolidation.
    ///
    /// Returns `false` if the query is no longer open or consolidation
    /// filtered the reply out.
    pub fn deliver(&self, reply: &Reply) -> bool {
        let mut delivery = self.lock();
        if delivery.state != QueryState::Open {
            return false;
        }

        if delivery.consolidation == QueryConsolidation::Latest {
            let superseded = match delivery.buffered.get(&reply.res_name) {
                None => true,
                Some(held) => match (held.timestamp(), reply.timestamp()) {
                    (Some(older), Some(newer)) => newer > older,
                    (Some(_), None) => false,
                    (None, _) => true,
                },
            };
            if superseded {
                delivery.buffered.insert(reply.res_name.clone(), reply.clone());
            }
            return superseded;
        }

        if delivery.consolidation == QueryConsolidation::Monotonic {
            if let Some(ts) = reply.timestamp() {
                let stale = delivery
                    .latest
                    .get(&reply.res_name)
                    .is_some_and(|last| ts <= last);
                if stale {
                    tracing::debug!(
                        correlation_id = %self.correlation_id,
                        res_name = %reply.res_name,
                        timestamp = %ts,
                        "dropping reply not newer than last delivered"
                    );
                    return false;
                }
                delivery.latest.insert(reply.res_name.clone(), ts.clone());
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| delivery.handler.on_reply(reply)));
        self.report(outcome);
        true
    }

    /// Record that `replier` has no more replies.
    ///
    /// When it was the last outstanding replier the query completes: `unlink`
    /// runs (while the delivery lock is held) and the handler is notified.
    /// Returns `true` if this call completed the query.
    pub fn on_final(&self, replier: &Replier, unlink: impl FnOnce()) -> bool {
        let mut delivery = self.lock();
        if delivery.state != QueryState::Open {
            return false;
        }
        if !delivery.outstanding.remove(replier) {
            tracing::trace!(
                correlation_id = %self.correlation_id,
                replier = ?replier,
                "end-of-replies from a replier not addressed"
            );
            return false;
        }
        if !delivery.outstanding.is_empty() {
            return false;
        }

        delivery.state = QueryState::Completed;
        unlink();
        self.finish(&mut delivery, QueryOutcome::Completed);
        true
    }

    /// Move an open query to a terminal state and notify the handler once.
    ///
    /// Returns `false` if the query had already left `Open`.
    pub fn retire(&self, state: QueryState, outcome: QueryOutcome, unlink: impl FnOnce()) -> bool {
        let mut delivery = self.lock();
        if delivery.state != QueryState::Open {
            return false;
        }

        delivery.state = state;
        unlink();
        self.finish(&mut delivery, outcome);
        true
    }

    /// Hand held-back replies to the handler, then the final outcome.
    fn finish(&self, delivery: &mut Delivery, outcome: QueryOutcome) {
        let buffered = std::mem::take(&mut delivery.buffered);
        for reply in buffered.values() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| delivery.handler.on_reply(reply)));
            self.report(result);
        }

        tracing::debug!(
            correlation_id = %self.correlation_id,
            selector = %self.selector,
            outcome = ?outcome,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "query finished"
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            delivery.handler.on_finished(outcome);
            Ok(())
        }));
        self.report(result);
    }

    fn report(&self, outcome: std::thread::Result<Result<(), HandlerError>>) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(correlation_id = %self.correlation_id, error = %e, "reply handler failed");
            }
            Err(_) => {
                tracing::error!(correlation_id = %self.correlation_id, "reply handler panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PendingQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQuery")
            .field("correlation_id", &self.correlation_id)
            .field("selector", &self.selector)
            .field("target", &self.target)
            .field("deadline", &self.deadline)
            .finish()
    }
}
