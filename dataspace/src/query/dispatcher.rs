//! Query dispatch: resolve, register, fan out.

use crate::error::SessionError;
use crate::id::CorrelationId;
use crate::key::ResourceKey;
use crate::messaging::{Message, QueryMessage};
use crate::query::correlation::{PendingQuery, Replier};
use crate::query::handler::ReplyHandler;
use crate::query::QueryOptions;
use crate::selector::Selector;
use crate::session::state::SessionState;
use crate::session::worker::LocalEvent;
use std::collections::HashSet;
use std::sync::Arc;

/// Issue a query and return its correlation id.
///
/// Order of operations:
///
/// 1. resolve and validate the selector (no side effect on failure)
/// 2. pick local queryables and remote peers
/// 3. register the pending query and schedule its deadline
/// 4. hand the query to local queryables and send it to every peer
///
/// A peer the query cannot be sent to is treated as finished. A query that
/// reaches nobody stays open until its deadline.
///
/// # Errors
///
/// - `SessionError::SessionClosed` if the session is closed
/// - `SessionError::InvalidSelector` for malformed or unresolved keys
/// - `SessionError::CorrelationIdsExhausted` when ids run out
pub(crate) fn dispatch(
    state: &SessionState,
    key: &ResourceKey,
    predicate: &str,
    options: QueryOptions,
    handler: Box<dyn ReplyHandler>,
) -> Result<CorrelationId, SessionError> {
    if state.is_closed() {
        return Err(SessionError::SessionClosed);
    }

    let (selector, local_targets) = {
        let bindings = state.bindings();
        let selector = Selector::resolve(key, predicate, &bindings)?;
        let targets = if options.local_routing {
            state
                .queryables()
                .select(selector.key(), &options.target, &bindings)
        } else {
            Vec::new()
        };
        (selector, targets)
    };

    let correlation_id = state.correlation.next()?;
    let peers = state.transport.peers();
    let frame = if peers.is_empty() {
        None
    } else {
        Some(state.codec.encode(&Message::Query(QueryMessage {
            correlation_id,
            origin: state.id.clone(),
            selector: selector.key().to_string(),
            predicate: selector.predicate().to_string(),
            target: options.target,
        }))?)
    };

    let mut outstanding: HashSet<Replier> = local_targets
        .iter()
        .map(|target| Replier::Local(target.id))
        .collect();
    outstanding.extend(peers.iter().cloned().map(Replier::Remote));

    let timeout = options.timeout.unwrap_or_else(|| state.config.query_timeout());
    let pending = Arc::new(PendingQuery::new(
        correlation_id,
        selector.clone(),
        options.target,
        options.consolidation,
        timeout,
        outstanding,
        handler,
    ));
    let deadline = pending.deadline();
    state.aggregator.register(pending)?;
    state.timer.schedule(deadline, correlation_id);

    tracing::debug!(
        peer = %state.id,
        %correlation_id,
        selector = %selector,
        local = local_targets.len(),
        remote = peers.len(),
        timeout_ms = timeout.as_millis() as u64,
        "query dispatched"
    );

    if !local_targets.is_empty() {
        let event = LocalEvent::Query {
            correlation_id,
            selector,
            targets: local_targets,
        };
        if state.events.send(event).is_err() {
            tracing::debug!(%correlation_id, "worker stopped before local fan-out");
        }
    }

    if let Some(frame) = frame {
        for peer in peers {
            if let Err(e) = state.transport.send(&peer, frame.clone()) {
                tracing::warn!(%correlation_id, peer = %peer, error = %e, "failed to forward query");
                let _ = state.events.send(LocalEvent::Final {
                    correlation_id,
                    replier: Replier::Remote(peer),
                });
            }
        }
    }

    Ok(correlation_id)
}
