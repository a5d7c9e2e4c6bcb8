//! The session's I/O worker.
//!
//! One task per session drains two channels:
//!
//! ```text
//! local events ──┐
//!                ├──► worker ──► aggregator (handler calls)
//! link events ───┘          └──► queryable tasks (serving queries)
//! ```
//!
//! Every reply handler call happens here, which is why local replies,
//! end-of-replies signals and timeouts travel as [`LocalEvent`]s instead of
//! touching the aggregator directly.

use crate::id::{CorrelationId, PeerId};
use crate::messaging::{Message, QueryMessage, Reply};
use crate::query::correlation::Replier;
use crate::queryable::{Query, RemoteFinalGuard, Route, SelectedQueryable};
use crate::selector::Selector;
use crate::session::state::SessionState;
use crate::transport::{InboundFrame, LinkEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Work item produced inside the session.
pub(crate) enum LocalEvent {
    /// Serve a query with local queryables.
    Query {
        correlation_id: CorrelationId,
        selector: Selector,
        targets: Vec<SelectedQueryable>,
    },
    /// A local queryable replied.
    Reply(Reply),
    /// A replier has nothing more to send.
    Final {
        correlation_id: CorrelationId,
        replier: Replier,
    },
    /// A query deadline elapsed.
    Timeout(CorrelationId),
}

pub(crate) async fn run(
    state: Arc<SessionState>,
    mut events: mpsc::UnboundedReceiver<LocalEvent>,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) {
    tracing::debug!(peer = %state.id, "session worker started");
    loop {
        tokio::select! {
            Some(event) = events.recv() => handle_event(&state, event),
            Some(event) = inbound.recv() => match event {
                LinkEvent::Frame(frame) => handle_frame(&state, frame),
                LinkEvent::Disconnected(peer) => {
                    let completed = state.aggregator.on_disconnect(&peer);
                    tracing::debug!(peer = %state.id, remote = %peer, completed, "peer disconnected");
                }
            },
            else => break,
        }
    }
    tracing::debug!(peer = %state.id, "session worker stopped");
}

fn handle_event(state: &SessionState, event: LocalEvent) {
    match event {
        LocalEvent::Query {
            correlation_id,
            selector,
            targets,
        } => {
            for target in targets {
                let route = Route::Local {
                    events: state.events.clone(),
                    queryable: target.id,
                };
                spawn_query(state, &selector, correlation_id, target, route);
            }
        }
        LocalEvent::Reply(reply) => {
            state.aggregator.on_reply(&reply);
        }
        LocalEvent::Final {
            correlation_id,
            replier,
        } => {
            state.aggregator.on_final(correlation_id, &replier);
        }
        LocalEvent::Timeout(correlation_id) => {
            state.aggregator.on_timeout(correlation_id);
        }
    }
}

fn handle_frame(state: &SessionState, frame: InboundFrame) {
    let message = match state.codec.decode(&frame.bytes) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                peer = %state.id,
                from = %frame.from,
                len = frame.bytes.len(),
                error = %e,
                "dropping undecodable frame"
            );
            return;
        }
    };

    match message {
        Message::Query(query) => serve_remote(state, frame.from, query),
        Message::Reply(reply) => {
            state.aggregator.on_reply(&reply);
        }
        Message::ReplyFinal { correlation_id } => {
            state
                .aggregator
                .on_final(correlation_id, &Replier::Remote(frame.from));
        }
    }
}

/// Run local queryables for a query received from `from`.
///
/// The querier gets exactly one end-of-replies frame, sent when the last
/// spawned queryable drops its [`Query`], or right away when none matched.
///
/// A query whose `origin` is not the link it came in on is dropped without
/// an answer.
fn serve_remote(state: &SessionState, from: PeerId, message: QueryMessage) {
    if message.origin != from {
        tracing::warn!(
            peer = %state.id,
            from = %from,
            origin = %message.origin,
            correlation_id = %message.correlation_id,
            "query origin does not match its link, dropping"
        );
        return;
    }

    let guard = Arc::new(RemoteFinalGuard {
        origin: from.clone(),
        correlation_id: message.correlation_id,
        transport: state.transport.clone(),
        codec: state.codec.clone(),
    });

    let selector = match Selector::new(message.selector, message.predicate) {
        Ok(selector) => selector,
        Err(e) => {
            tracing::warn!(from = %from, correlation_id = %message.correlation_id, error = %e, "invalid remote selector");
            return;
        }
    };

    let targets = {
        let bindings = state.bindings();
        state
            .queryables()
            .select(selector.key(), &message.target, &bindings)
    };
    tracing::debug!(
        peer = %state.id,
        from = %from,
        correlation_id = %message.correlation_id,
        selector = %selector,
        matched = targets.len(),
        "serving remote query"
    );

    for target in targets {
        let route = Route::Remote(guard.clone());
        spawn_query(state, &selector, message.correlation_id, target, route);
    }
}

fn spawn_query(
    state: &SessionState,
    selector: &Selector,
    correlation_id: CorrelationId,
    target: SelectedQueryable,
    route: Route,
) {
    let query = Query::new(
        selector.clone(),
        correlation_id,
        target.kind,
        state.id.clone(),
        route,
    );
    let handler = target.handler;
    let queryable = target.id;
    tokio::spawn(async move {
        tracing::trace!(%correlation_id, %queryable, "queryable handling query");
        handler.handle(query).await;
    });
}
