//! Query dispatch, pending query tracking and reply aggregation.

pub mod aggregator;
pub mod correlation;
pub(crate) mod dispatcher;
pub mod handler;
pub mod target;
pub mod timer;

// Re-exports
pub use aggregator::ReplyAggregator;
pub use correlation::{CorrelationIdFactory, PendingQuery, QueryState, Replier};
pub use handler::{from_fn, ChannelHandler, FnHandler, QueryEvent, QueryOutcome, ReplyHandler};
pub use target::{QueryConsolidation, QueryOptions, QueryTarget, QueryableKind, Target};
pub use timer::TimerQueue;
