//! End-to-end query/reply on a single session.

use dataspace::query::{self, QueryEvent, QueryOutcome};
use dataspace::queryable::{self, Query};
use dataspace::{
    HandlerError, QueryConsolidation, QueryOptions, QueryTarget, QueryableKind, Reply, ReplyHandler,
    ResourceKey, Sample, SelectorError, Session, SessionConfig, SessionError, Target, Timestamp,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

async fn open(timeout: Duration) -> Session {
    dataspace::logging::init_logger();
    let config = SessionConfig::builder().query_timeout(timeout).build().unwrap();
    dataspace::open(config).await.unwrap()
}

/// Drain a query channel until its final event.
async fn collect(rx: &mut UnboundedReceiver<QueryEvent>) -> (Vec<Reply>, QueryOutcome) {
    let mut replies = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("query did not finish in time")
            .expect("query channel closed before finishing");
        match event {
            QueryEvent::Reply(reply) => replies.push(reply),
            QueryEvent::Finished(outcome) => return (replies, outcome),
        }
    }
}

/// Queryable replying once on `res_name` with `payload`.
fn answer(res_name: &'static str, payload: &'static str) -> impl queryable::QueryHandler {
    queryable::from_fn(move |query: Query| async move {
        query.reply(Sample::new(res_name, payload)).unwrap();
    })
}

fn payloads(replies: &[Reply]) -> Vec<String> {
    let mut all: Vec<String> = replies.iter().map(|r| r.payload_str().into_owned()).collect();
    all.sort();
    all
}

#[tokio::test]
async fn test_local_queryable_answers_wildcard_query() {
    let session = open(Duration::from_secs(5)).await;
    session
        .declare_queryable("/demo/example/item", QueryableKind::EVAL, true, answer("/demo/example/item", "Hello"))
        .unwrap();

    let (id, mut rx) = session
        .query_channel("/demo/example/**", "", QueryOptions::default())
        .unwrap();
    let (replies, outcome) = collect(&mut rx).await;

    assert_eq!(outcome, QueryOutcome::Completed);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].res_name, "/demo/example/item");
    assert_eq!(replies[0].payload, b"Hello".to_vec());
    assert_eq!(replies[0].correlation_id, id);
    assert_eq!(&replies[0].replier, session.id());
    assert!(!session.is_pending(id));
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_query_without_match_times_out() {
    let session = open(Duration::from_millis(100)).await;
    let started = Instant::now();

    let (_, mut rx) = session
        .query_channel("/no/such/resource", "", QueryOptions::default())
        .unwrap();
    assert_eq!(session.pending_count(), 1);
    let (replies, outcome) = collect(&mut rx).await;

    assert!(replies.is_empty());
    assert_eq!(outcome, QueryOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_per_query_timeout_override() {
    let session = open(Duration::from_secs(30)).await;
    let options = QueryOptions::default().with_timeout(Duration::from_millis(50));
    let (_, mut rx) = session.query_channel("/nothing", "", options).unwrap();
    let (_, outcome) = collect(&mut rx).await;
    assert_eq!(outcome, QueryOutcome::TimedOut);
}

#[tokio::test]
async fn test_reply_after_timeout_triggers_no_callback() {
    let session = open(Duration::from_millis(100)).await;
    session
        .declare_queryable(
            "/slow/item",
            QueryableKind::STORAGE,
            true,
            queryable::from_fn(|query: Query| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let _ = query.reply(Sample::new("/slow/item", "late"));
            }),
        )
        .unwrap();

    let (_, mut rx) = session.query_channel("/slow/**", "", QueryOptions::default()).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert!(replies.is_empty());
    assert_eq!(outcome, QueryOutcome::TimedOut);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_every_matching_queryable_replies() {
    let session = open(Duration::from_secs(5)).await;
    session
        .declare_queryable("/demo/a", QueryableKind::EVAL, false, answer("/demo/a", "a"))
        .unwrap();
    session
        .declare_queryable(
            "/demo/**",
            QueryableKind::STORAGE,
            true,
            queryable::from_fn(|query: Query| async move {
                query.reply(Sample::new("/demo/b", "b")).unwrap();
                query.reply(Sample::new("/demo/c/d", "c")).unwrap();
            }),
        )
        .unwrap();
    session
        .declare_queryable("/elsewhere", QueryableKind::EVAL, true, answer("/elsewhere", "x"))
        .unwrap();

    let (_, mut rx) = session.query_channel("/demo/**", "", QueryOptions::default()).unwrap();
    let (replies, outcome) = collect(&mut rx).await;

    assert_eq!(outcome, QueryOutcome::Completed);
    assert_eq!(payloads(&replies), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_predicate_reaches_queryable() {
    let session = open(Duration::from_secs(5)).await;
    session
        .declare_queryable(
            "/demo/echo",
            QueryableKind::EVAL,
            true,
            queryable::from_fn(|query: Query| async move {
                let predicate = query.predicate().to_string();
                query.reply(Sample::new("/demo/echo", predicate)).unwrap();
            }),
        )
        .unwrap();

    let (_, mut rx) = session
        .query_channel("/demo/echo?inline", "", QueryOptions::default())
        .unwrap();
    assert_eq!(payloads(&collect(&mut rx).await.0), vec!["inline"]);

    let (_, mut rx) = session
        .query_channel("/demo/echo", "value>10", QueryOptions::default())
        .unwrap();
    assert_eq!(payloads(&collect(&mut rx).await.0), vec!["value>10"]);
}

async fn target_session() -> Session {
    let session = open(Duration::from_millis(300)).await;
    session
        .declare_queryable("/t/**", QueryableKind::EVAL, false, answer("/t/x", "partial"))
        .unwrap();
    session
        .declare_queryable("/t/**", QueryableKind::STORAGE, true, answer("/t/x", "first-complete"))
        .unwrap();
    session
        .declare_queryable("/t/x", QueryableKind::STORAGE, true, answer("/t/x", "second-complete"))
        .unwrap();
    session
}

async fn query_target(session: &Session, target: QueryTarget) -> Vec<String> {
    let options = QueryOptions::default().with_target(target);
    let (_, mut rx) = session.query_channel("/t/x", "", options).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert_eq!(outcome, QueryOutcome::Completed);
    payloads(&replies)
}

#[tokio::test]
async fn test_target_policies() {
    let session = target_session().await;

    let all = query_target(&session, QueryTarget::default()).await;
    assert_eq!(all, vec!["first-complete", "partial", "second-complete"]);

    let best = query_target(&session, QueryTarget::new(QueryableKind::ALL_KINDS, Target::BestMatching)).await;
    assert_eq!(best, vec!["first-complete"]);

    let complete = query_target(&session, QueryTarget::new(QueryableKind::ALL_KINDS, Target::AllComplete)).await;
    assert_eq!(complete, vec!["first-complete", "second-complete"]);

    let one = query_target(&session, QueryTarget::new(QueryableKind::ALL_KINDS, Target::Complete(1))).await;
    assert_eq!(one, vec!["first-complete"]);

    let eval_only = query_target(&session, QueryTarget::new(QueryableKind::EVAL, Target::All)).await;
    assert_eq!(eval_only, vec!["partial"]);
}

#[tokio::test]
async fn test_local_routing_disabled_skips_local_queryables() {
    let session = open(Duration::from_millis(100)).await;
    session
        .declare_queryable("/demo/item", QueryableKind::EVAL, true, answer("/demo/item", "v"))
        .unwrap();

    let options = QueryOptions::default().with_local_routing(false);
    let (_, mut rx) = session.query_channel("/demo/**", "", options).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert!(replies.is_empty());
    assert_eq!(outcome, QueryOutcome::TimedOut);
}

#[tokio::test]
async fn test_undeclared_queryable_no_longer_answers() {
    let session = open(Duration::from_millis(100)).await;
    let id = session
        .declare_queryable("/demo/item", QueryableKind::EVAL, true, answer("/demo/item", "v"))
        .unwrap();
    session.undeclare_queryable(id).unwrap();

    let (_, mut rx) = session.query_channel("/demo/item", "", QueryOptions::default()).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert!(replies.is_empty());
    assert_eq!(outcome, QueryOutcome::TimedOut);
}

#[tokio::test]
async fn test_monotonic_consolidation_drops_stale_values() {
    let session = open(Duration::from_secs(5)).await;
    let replier = session.id().clone();
    session
        .declare_queryable(
            "/demo/counter",
            QueryableKind::STORAGE,
            true,
            queryable::from_fn(move |query: Query| {
                let replier = replier.clone();
                async move {
                    for (time, value) in [(3, "three"), (1, "one"), (5, "five"), (5, "five-again")] {
                        let sample = Sample::new("/demo/counter", value)
                            .with_timestamp(Timestamp::new(time, replier.clone()));
                        query.reply(sample).unwrap();
                    }
                }
            }),
        )
        .unwrap();

    let options = QueryOptions::default().with_consolidation(QueryConsolidation::Monotonic);
    let (_, mut rx) = session.query_channel("/demo/counter", "", options).unwrap();
    let (replies, _) = collect(&mut rx).await;
    let values: Vec<String> = replies.iter().map(|r| r.payload_str().into_owned()).collect();
    assert_eq!(values, vec!["three", "five"]);

    let (_, mut rx) = session
        .query_channel("/demo/counter", "", QueryOptions::default())
        .unwrap();
    assert_eq!(collect(&mut rx).await.0.len(), 4);
}

#[tokio::test]
async fn test_latest_consolidation_keeps_newest_per_name() {
    let session = open(Duration::from_secs(5)).await;
    let replier = session.id().clone();
    session
        .declare_queryable(
            "/demo/latest/*",
            QueryableKind::STORAGE,
            true,
            queryable::from_fn(move |query: Query| {
                let replier = replier.clone();
                async move {
                    for (name, time, value) in [
                        ("/demo/latest/a", 1, "old"),
                        ("/demo/latest/a", 5, "new"),
                        ("/demo/latest/a", 3, "stale"),
                        ("/demo/latest/b", 2, "only"),
                    ] {
                        let sample = Sample::new(name, value)
                            .with_timestamp(Timestamp::new(time, replier.clone()));
                        query.reply(sample).unwrap();
                    }
                }
            }),
        )
        .unwrap();

    let options = QueryOptions::default().with_consolidation(QueryConsolidation::Latest);
    let (_, mut rx) = session.query_channel("/demo/latest/*", "", options).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert_eq!(outcome, QueryOutcome::Completed);

    let seen: Vec<(String, String, u64)> = replies
        .iter()
        .map(|r| {
            (
                r.res_name.clone(),
                r.payload_str().into_owned(),
                r.timestamp().unwrap().time,
            )
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            ("/demo/latest/a".to_string(), "new".to_string(), 5),
            ("/demo/latest/b".to_string(), "only".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn test_latest_consolidation_flushes_on_timeout() {
    let session = open(Duration::from_millis(150)).await;
    let replier = session.id().clone();
    session
        .declare_queryable(
            "/demo/held",
            QueryableKind::STORAGE,
            true,
            queryable::from_fn(move |query: Query| {
                let sample = Sample::new("/demo/held", "kept")
                    .with_timestamp(Timestamp::new(7, replier.clone()));
                async move {
                    query.reply(sample).unwrap();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }),
        )
        .unwrap();

    let options = QueryOptions::default().with_consolidation(QueryConsolidation::Latest);
    let (_, mut rx) = session.query_channel("/demo/held", "", options).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert_eq!(outcome, QueryOutcome::TimedOut);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload_str(), "kept");
}

#[tokio::test]
async fn test_reply_timestamp_reaches_handler() {
    let session = open(Duration::from_secs(5)).await;
    let replier = session.id().clone();
    session
        .declare_queryable(
            "/demo/stamped",
            QueryableKind::STORAGE,
            true,
            queryable::from_fn(move |query: Query| {
                let sample = Sample::new("/demo/stamped", "v")
                    .with_timestamp(Timestamp::now(replier.clone()))
                    .with_encoding("text/plain");
                async move {
                    query.reply(sample).unwrap();
                }
            }),
        )
        .unwrap();

    let (_, mut rx) = session.query_channel("/demo/stamped", "", QueryOptions::default()).unwrap();
    let (replies, _) = collect(&mut rx).await;
    let info = replies[0].data_info.as_ref().unwrap();
    assert!(info.timestamp.as_ref().unwrap().time > 0);
    assert_eq!(info.encoding.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn test_queryable_panic_still_completes_query() {
    let session = open(Duration::from_secs(5)).await;
    session
        .declare_queryable(
            "/demo/fragile",
            QueryableKind::EVAL,
            true,
            queryable::from_fn(|query: Query| async move {
                query.reply(Sample::new("/demo/fragile", "before")).unwrap();
                panic!("queryable failure");
            }),
        )
        .unwrap();

    let (_, mut rx) = session.query_channel("/demo/fragile", "", QueryOptions::default()).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert_eq!(payloads(&replies), vec!["before"]);
    assert_eq!(outcome, QueryOutcome::Completed);
}

#[tokio::test]
async fn test_reply_outside_selector_is_dropped() {
    let session = open(Duration::from_secs(5)).await;
    session
        .declare_queryable(
            "/demo/**",
            QueryableKind::EVAL,
            true,
            queryable::from_fn(|query: Query| async move {
                query.reply(Sample::new("/other/place", "stray")).unwrap();
                query.reply(Sample::new("/demo/ok", "kept")).unwrap();
            }),
        )
        .unwrap();

    let (_, mut rx) = session.query_channel("/demo/*", "", QueryOptions::default()).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert_eq!(payloads(&replies), vec!["kept"]);
    assert_eq!(outcome, QueryOutcome::Completed);
}

/// Records every call; fails or panics on selected payloads.
struct Fussy {
    seen: Arc<Mutex<Vec<String>>>,
    finished: tokio::sync::mpsc::UnboundedSender<QueryOutcome>,
}

impl ReplyHandler for Fussy {
    fn on_reply(&self, reply: &Reply) -> Result<(), HandlerError> {
        let payload = reply.payload_str().into_owned();
        self.seen.lock().unwrap().push(payload.clone());
        match payload.as_str() {
            "panic" => panic!("handler panic"),
            "error" => Err(HandlerError::new("handler refused")),
            _ => Ok(()),
        }
    }

    fn on_finished(&self, outcome: QueryOutcome) {
        let _ = self.finished.send(outcome);
    }
}

#[tokio::test]
async fn test_handler_errors_and_panics_are_isolated() {
    let session = open(Duration::from_secs(5)).await;
    session
        .declare_queryable(
            "/demo/mixed",
            QueryableKind::EVAL,
            true,
            queryable::from_fn(|query: Query| async move {
                for payload in ["panic", "error", "fine"] {
                    query.reply(Sample::new("/demo/mixed", payload)).unwrap();
                }
            }),
        )
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (finished, mut finished_rx) = tokio::sync::mpsc::unbounded_channel();
    session
        .query("/demo/mixed", "", Fussy { seen: seen.clone(), finished })
        .unwrap();

    // A second query runs unaffected alongside the fussy one.
    let (_, mut rx) = session.query_channel("/demo/mixed", "", QueryOptions::default()).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert_eq!(replies.len(), 3);
    assert_eq!(outcome, QueryOutcome::Completed);

    let outcome = tokio::time::timeout(Duration::from_secs(5), finished_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, QueryOutcome::Completed);
    assert_eq!(*seen.lock().unwrap(), vec!["panic", "error", "fine"]);
}

#[tokio::test]
async fn test_query_with_closure_handler() {
    let session = open(Duration::from_secs(5)).await;
    session
        .declare_queryable("/demo/item", QueryableKind::EVAL, true, answer("/demo/item", "v"))
        .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    session
        .query(
            "/demo/**",
            "",
            query::from_fn(move |reply: &Reply| {
                assert_eq!(reply.res_name, "/demo/item");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    for _ in 0..100 {
        if session.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.pending_count(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_query_by_resource_id() {
    let session = open(Duration::from_secs(5)).await;
    let rid = session.declare_resource("/demo").unwrap();
    session
        .declare_queryable(
            ResourceKey::IdWithSuffix(rid, "/example/item".to_string()),
            QueryableKind::EVAL,
            true,
            answer("/demo/example/item", "by-id"),
        )
        .unwrap();

    let (_, mut rx) = session
        .query_channel(ResourceKey::IdWithSuffix(rid, "/example/**".to_string()), "", QueryOptions::default())
        .unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert_eq!(outcome, QueryOutcome::Completed);
    assert_eq!(payloads(&replies), vec!["by-id"]);
}

#[tokio::test]
async fn test_invalid_selector_has_no_side_effect() {
    let session = open(Duration::from_secs(5)).await;
    for bad in ["", "/a//b", "/a/b**"] {
        let (handler, _rx) = query::ChannelHandler::new();
        let result = session.query(bad, "", handler);
        assert!(matches!(result, Err(SessionError::InvalidSelector(_))), "{:?} accepted", bad);
    }
    let (handler, _rx) = query::ChannelHandler::new();
    assert!(matches!(
        session.query(ResourceKey::Id(dataspace::ResourceId::new(77)), "", handler),
        Err(SessionError::InvalidSelector(SelectorError::UnresolvedKey(_)))
    ));
    assert_eq!(session.pending_count(), 0);

    // Failed attempts did not consume correlation ids.
    let (id, _rx) = session.query_channel("/ok", "", QueryOptions::default()).unwrap();
    assert_eq!(id.as_u64(), 1);
}

#[tokio::test]
async fn test_deep_selector_is_rejected_before_matching() {
    let session = open(Duration::from_secs(5)).await;
    session
        .declare_queryable("/demo/**", QueryableKind::EVAL, true, answer("/demo/x", "still here"))
        .unwrap();

    let deep = format!("/demo{}", "/*".repeat(150_000));
    let result = session.query_channel(deep.as_str(), "", QueryOptions::default());
    assert!(matches!(
        result,
        Err(SessionError::InvalidSelector(SelectorError::TooManySegments { segments: 150_001, .. }))
    ));
    assert_eq!(session.pending_count(), 0);

    let (_, mut rx) = session.query_channel("/demo/x", "", QueryOptions::default()).unwrap();
    let (replies, outcome) = collect(&mut rx).await;
    assert_eq!(outcome, QueryOutcome::Completed);
    assert_eq!(payloads(&replies), vec!["still here"]);
}

#[tokio::test]
async fn test_correlation_ids_are_unique_and_increasing() {
    let session = open(Duration::from_secs(5)).await;
    let mut previous = 0;
    for _ in 0..100 {
        let (handler, _rx) = query::ChannelHandler::new();
        let id = session.query("/demo/**", "", handler).unwrap().as_u64();
        assert!(id > previous);
        previous = id;
    }
    assert_eq!(session.pending_count(), 100);
}

#[tokio::test]
async fn test_close_cancels_pending_queries() {
    let session = open(Duration::from_secs(30)).await;
    let (_, mut first) = session.query_channel("/a/**", "", QueryOptions::default()).unwrap();
    let (_, mut second) = session.query_channel("/b", "", QueryOptions::default()).unwrap();
    assert_eq!(session.pending_count(), 2);

    session.close();
    assert!(session.is_closed());
    assert_eq!(session.pending_count(), 0);
    assert_eq!(collect(&mut first).await.1, QueryOutcome::Cancelled);
    assert_eq!(collect(&mut second).await.1, QueryOutcome::Cancelled);

    session.close();
    let (handler, _rx) = query::ChannelHandler::new();
    assert!(matches!(session.query("/a", "", handler), Err(SessionError::SessionClosed)));
}

/// Reply handler that holds the I/O task for a while inside each call.
struct Slow {
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl ReplyHandler for Slow {
    fn on_reply(&self, _reply: &Reply) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_callback_runs_after_close_returns() {
    let session = open(Duration::from_secs(30)).await;
    session
        .declare_queryable(
            "/demo/stream",
            QueryableKind::EVAL,
            false,
            queryable::from_fn(|query: Query| async move {
                for _ in 0..50 {
                    if query.reply(Sample::new("/demo/stream", "tick")).is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }),
        )
        .unwrap();

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    session
        .query(
            "/demo/stream",
            "",
            Slow {
                started: started.clone(),
                finished: finished.clone(),
                calls: calls.clone(),
            },
        )
        .unwrap();

    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let closer = session.clone();
    tokio::task::spawn_blocking(move || closer.close()).await.unwrap();
    assert!(finished.load(Ordering::SeqCst), "close returned while a callback was running");

    let after_close = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_close);
}
