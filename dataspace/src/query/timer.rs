//! Deadline queue for pending queries.
//!
//! A single task keeps every deadline in a min-heap and sleeps until the
//! earliest one. Expired ids are handed to the session worker as
//! [`LocalEvent::Timeout`], so timeout notifications run on the worker like
//! every other handler call.

use crate::id::CorrelationId;
use crate::session::worker::LocalEvent;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Deadline = Reverse<(Instant, CorrelationId)>;

/// Handle for scheduling query deadlines.
#[derive(Clone)]
pub struct TimerQueue {
    schedule: mpsc::UnboundedSender<(Instant, CorrelationId)>,
}

impl TimerQueue {
    /// Start the timer task, reporting expirations on `events`.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(events: mpsc::UnboundedSender<LocalEvent>) -> (Self, JoinHandle<()>) {
        let (schedule, requests) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(requests, events));
        (Self { schedule }, handle)
    }

    /// Fire `correlation_id` at `deadline`.
    ///
    /// Returns `false` if the timer task has stopped.
    pub fn schedule(&self, deadline: Instant, correlation_id: CorrelationId) -> bool {
        self.schedule.send((deadline, correlation_id)).is_ok()
    }
}

async fn run(
    mut requests: mpsc::UnboundedReceiver<(Instant, CorrelationId)>,
    events: mpsc::UnboundedSender<LocalEvent>,
) {
    let mut heap: BinaryHeap<Deadline> = BinaryHeap::new();

    loop {
        let next = heap.peek().map(|Reverse((deadline, _))| *deadline);

        tokio::select! {
            request = requests.recv() => match request {
                Some((deadline, id)) => heap.push(Reverse((deadline, id))),
                None => break,
            },
            _ = sleep_until(next) => {
                let now = Instant::now();
                while let Some(Reverse((deadline, id))) = heap.peek().copied() {
                    if deadline > now {
                        break;
                    }
                    heap.pop();
                    tracing::trace!(correlation_id = %id, "query deadline reached");
                    if events.send(LocalEvent::Timeout(id)).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
