//! Reply handler contract.

use crate::error::HandlerError;
use crate::messaging::Reply;
use tokio::sync::mpsc;

/// How a query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Every addressed replier signalled end-of-replies.
    Completed,
    /// The deadline elapsed first.
    TimedOut,
    /// The session was closed while the query was pending.
    Cancelled,
}

/// Receives the replies of one query.
///
/// Both methods run on the session's I/O task, one call at a time per
/// query. They must not block and must not close the session.
///
/// # Example
///
/// ```rust,ignore
/// struct Printer;
///
/// impl ReplyHandler for Printer {
///     fn on_reply(&self, reply: &Reply) -> Result<(), HandlerError> {
///         println!("{}: {}", reply.res_name, reply.payload_str());
///         Ok(())
///     }
/// }
/// ```
pub trait ReplyHandler: Send + Sync + 'static {
    /// Called once per accepted reply.
    ///
    /// An error is logged and does not affect later deliveries.
    fn on_reply(&self, reply: &Reply) -> Result<(), HandlerError>;

    /// Called exactly once when the query leaves the pending table.
    fn on_finished(&self, _outcome: QueryOutcome) {}
}

/// Adapter turning a closure into a [`ReplyHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> ReplyHandler for FnHandler<F>
where
    F: Fn(&Reply) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn on_reply(&self, reply: &Reply) -> Result<(), HandlerError> {
        (self.f)(reply)
    }
}

/// Build a handler from a closure called for every reply.
///
/// # Example
///
/// ```rust,ignore
/// session.query("/demo/**", "", from_fn(|reply| {
///     println!(">> [Reply handler] received ('{}': '{}')", reply.res_name, reply.payload_str());
///     Ok(())
/// }))?;
/// ```
pub fn from_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Reply) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler { f }
}

/// Event forwarded by a [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    Reply(Reply),
    Finished(QueryOutcome),
}

/// Handler that forwards replies to a channel the caller can await.
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<QueryEvent>,
}

impl ChannelHandler {
    /// Create the handler and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueryEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ReplyHandler for ChannelHandler {
    fn on_reply(&self, reply: &Reply) -> Result<(), HandlerError> {
        self.sender
            .send(QueryEvent::Reply(reply.clone()))
            .map_err(|_| HandlerError::new("reply receiver dropped"))
    }

    fn on_finished(&self, outcome: QueryOutcome) {
        // Receiver may already be gone; nothing left to notify then.
        let _ = self.sender.send(QueryEvent::Finished(outcome));
    }
}
