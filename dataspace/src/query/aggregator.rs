//! Reply aggregation: correlates replies with pending queries.

use crate::error::SessionError;
use crate::id::{CorrelationId, PeerId};
use crate::messaging::Reply;
use crate::query::correlation::{PendingQuery, QueryState, Replier};
use crate::query::handler::QueryOutcome;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct QueryTable {
    entries: HashMap<CorrelationId, Arc<PendingQuery>>,
    closed: bool,
}

/// Table of pending queries keyed by correlation id.
///
/// Every path that retires a query goes through the entry's own delivery
/// lock, so exactly one of completion, timeout or close wins and the
/// handler is notified once.
#[derive(Default)]
pub struct ReplyAggregator {
    table: Mutex<QueryTable>,
}

impl ReplyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending query.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::SessionClosed` once [`close`](Self::close) ran.
    pub fn register(&self, query: Arc<PendingQuery>) -> Result<(), SessionError> {
        let mut table = self.lock();
        if table.closed {
            return Err(SessionError::SessionClosed);
        }
        table.entries.insert(query.correlation_id(), query);
        Ok(())
    }

    /// Route a reply to its pending query.
    ///
    /// Replies for unknown or retired ids are dropped. Replies whose name
    /// does not fall under the query's selector are dropped with a warning.
    pub fn on_reply(&self, reply: &Reply) -> bool {
        let Some(query) = self.get(reply.correlation_id) else {
            tracing::trace!(
                correlation_id = %reply.correlation_id,
                replier = %reply.replier,
                "reply for unknown query, dropping"
            );
            return false;
        };

        if !query.selector().matches(&reply.res_name) {
            tracing::warn!(
                correlation_id = %reply.correlation_id,
                res_name = %reply.res_name,
                selector = %query.selector(),
                replier = %reply.replier,
                "reply does not match query selector, dropping"
            );
            return false;
        }

        query.deliver(reply)
    }

    /// Record an end-of-replies signal. Returns `true` if the query completed.
    pub fn on_final(&self, correlation_id: CorrelationId, replier: &Replier) -> bool {
        let Some(query) = self.get(correlation_id) else {
            tracing::trace!(%correlation_id, replier = ?replier, "final for unknown query, dropping");
            return false;
        };
        query.on_final(replier, || self.unlink(correlation_id))
    }

    /// Count `peer` as finished for every open query, after its link went
    /// down. Returns how many queries this completed.
    pub fn on_disconnect(&self, peer: &PeerId) -> usize {
        let open: Vec<CorrelationId> = self.lock().entries.keys().copied().collect();
        let replier = Replier::Remote(peer.clone());
        open.into_iter()
            .filter(|correlation_id| self.on_final(*correlation_id, &replier))
            .count()
    }

    /// Retire a query whose deadline elapsed. Returns `true` if it was still open.
    pub fn on_timeout(&self, correlation_id: CorrelationId) -> bool {
        let Some(query) = self.get(correlation_id) else {
            return false;
        };
        let retired = query.retire(QueryState::TimedOut, QueryOutcome::TimedOut, || {
            self.unlink(correlation_id)
        });
        if retired {
            tracing::debug!(%correlation_id, selector = %query.selector(), "query timed out");
        }
        retired
    }

    /// Refuse new registrations and cancel every pending query.
    ///
    /// Waits for in-flight deliveries: once this returns no handler of a
    /// drained query runs again. Calling it again is a no-op.
    pub fn close(&self) -> usize {
        let drained: Vec<Arc<PendingQuery>> = {
            let mut table = self.lock();
            table.closed = true;
            table.entries.drain().map(|(_, query)| query).collect()
        };

        let mut cancelled = 0;
        for query in drained {
            if query.retire(QueryState::TimedOut, QueryOutcome::Cancelled, || {}) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled pending queries on close");
        }
        cancelled
    }

    /// Number of open queries.
    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether a query is still pending.
    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.lock().entries.contains_key(&correlation_id)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn get(&self, correlation_id: CorrelationId) -> Option<Arc<PendingQuery>> {
        self.lock().entries.get(&correlation_id).cloned()
    }

    fn unlink(&self, correlation_id: CorrelationId) {
        self.lock().entries.remove(&correlation_id);
    }

    fn lock(&self) -> MutexGuard<'_, QueryTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{PeerId, QueryableId};
    use crate::messaging::Sample;
    use crate::query::handler::{ChannelHandler, QueryEvent};
    use crate::query::{QueryConsolidation, QueryTarget, QueryableKind};
    use crate::selector::Selector;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn register(
        aggregator: &ReplyAggregator,
        id: u64,
        outstanding: Vec<Replier>,
    ) -> UnboundedReceiver<QueryEvent> {
        let (handler, rx) = ChannelHandler::new();
        let query = PendingQuery::new(
            CorrelationId::new(id),
            Selector::parse("/demo/example/**").unwrap(),
            QueryTarget::default(),
            QueryConsolidation::None,
            Duration::from_secs(10),
            outstanding.into_iter().collect::<HashSet<_>>(),
            Box::new(handler),
        );
        aggregator.register(Arc::new(query)).unwrap();
        rx
    }

    fn reply(id: u64, res_name: &str) -> Reply {
        Reply::from_sample(
            CorrelationId::new(id),
            Sample::new(res_name, b"payload".to_vec()),
            QueryableKind::EVAL,
            peer("replier"),
        )
    }

    #[test]
    fn test_reply_delivered_then_completed() {
        let aggregator = ReplyAggregator::new();
        let local = Replier::Local(QueryableId(1));
        let mut rx = register(&aggregator, 1, vec![local.clone()]);

        assert!(aggregator.on_reply(&reply(1, "/demo/example/item")));
        assert!(aggregator.on_final(CorrelationId::new(1), &local));
        assert_eq!(aggregator.pending_count(), 0);

        assert!(matches!(rx.try_recv().unwrap(), QueryEvent::Reply(r) if r.res_name == "/demo/example/item"));
        assert_eq!(rx.try_recv().unwrap(), QueryEvent::Finished(QueryOutcome::Completed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_correlation_id_dropped() {
        let aggregator = ReplyAggregator::new();
        let mut rx = register(&aggregator, 1, vec![]);
        assert!(!aggregator.on_reply(&reply(99, "/demo/example/item")));
        assert!(!aggregator.on_final(CorrelationId::new(99), &Replier::Remote(peer("x"))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reply_outside_selector_dropped() {
        let aggregator = ReplyAggregator::new();
        let mut rx = register(&aggregator, 1, vec![]);
        assert!(!aggregator.on_reply(&reply(1, "/other/item")));
        assert!(rx.try_recv().is_err());
        assert!(aggregator.contains(CorrelationId::new(1)));
    }

    #[test]
    fn test_timeout_retires_and_late_reply_ignored() {
        let aggregator = ReplyAggregator::new();
        let mut rx = register(&aggregator, 1, vec![Replier::Remote(peer("slow"))]);

        assert!(aggregator.on_timeout(CorrelationId::new(1)));
        assert!(!aggregator.on_timeout(CorrelationId::new(1)));
        assert!(!aggregator.on_reply(&reply(1, "/demo/example/item")));

        assert_eq!(rx.try_recv().unwrap(), QueryEvent::Finished(QueryOutcome::TimedOut));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_finishes_queries_waiting_on_peer() {
        let aggregator = ReplyAggregator::new();
        let gone = Replier::Remote(peer("gone"));
        let other = Replier::Remote(peer("other"));
        let mut only_gone = register(&aggregator, 1, vec![gone.clone()]);
        let mut both = register(&aggregator, 2, vec![gone, other.clone()]);
        let mut unrelated = register(&aggregator, 3, vec![other.clone()]);

        assert_eq!(aggregator.on_disconnect(&peer("gone")), 1);
        assert_eq!(only_gone.try_recv().unwrap(), QueryEvent::Finished(QueryOutcome::Completed));
        assert!(both.try_recv().is_err());
        assert!(unrelated.try_recv().is_err());

        assert!(aggregator.on_final(CorrelationId::new(2), &other));
        assert_eq!(both.try_recv().unwrap(), QueryEvent::Finished(QueryOutcome::Completed));
        assert_eq!(aggregator.pending_count(), 1);
    }

    #[test]
    fn test_close_cancels_pending_and_refuses_new() {
        let aggregator = ReplyAggregator::new();
        let mut first = register(&aggregator, 1, vec![]);
        let mut second = register(&aggregator, 2, vec![Replier::Local(QueryableId(4))]);

        assert_eq!(aggregator.close(), 2);
        assert_eq!(aggregator.close(), 0);
        assert!(aggregator.is_closed());
        assert_eq!(first.try_recv().unwrap(), QueryEvent::Finished(QueryOutcome::Cancelled));
        assert_eq!(second.try_recv().unwrap(), QueryEvent::Finished(QueryOutcome::Cancelled));

        let (handler, _rx) = ChannelHandler::new();
        let query = PendingQuery::new(
            CorrelationId::new(3),
            Selector::parse("/a").unwrap(),
            QueryTarget::default(),
            QueryConsolidation::None,
            Duration::from_secs(1),
            HashSet::new(),
            Box::new(handler),
        );
        assert!(matches!(
            aggregator.register(Arc::new(query)),
            Err(SessionError::SessionClosed)
        ));
    }
}
