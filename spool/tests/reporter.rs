// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    sync::{Arc, Mutex, OnceLock, mpsc},
    thread,
    time::{Duration, Instant},
};

use rstest::rstest;
use spool::{
    Cause, Closed, DroppedError, Future, Message, OverflowPolicy, Reporter, ReporterBuilder, ReporterState, Sender,
    metrics::{InMemoryMetrics, ReporterMetrics},
};

#[derive(Debug, Clone)]
struct Event {
    key: u32,
    id: usize,
}

impl Message for Event {
    type Key = u32;

    fn key(&self) -> u32 {
        self.key
    }
}

#[derive(Default)]
struct Recording {
    batches: Mutex<Vec<Vec<usize>>>,
}

impl Recording {
    fn batches(&self) -> Vec<Vec<usize>> {
        self.batches.lock().unwrap().clone()
    }
}

impl Sender<Event> for Recording {
    type Output = usize;

    fn send(&self, events: &[Event]) -> Result<Vec<Result<usize, Cause>>, Cause> {
        self.batches
            .lock()
            .unwrap()
            .push(events.iter().map(|e| e.id).collect());
        Ok(events.iter().map(|e| Ok(e.id)).collect())
    }
}

fn reporter(sender: Arc<Recording>, metrics: Arc<InMemoryMetrics<u32>>) -> ReporterBuilder<Event, Recording> {
    Reporter::builder_shared(sender)
        .metrics(metrics)
        .tick_duration(Duration::from_millis(5))
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Poll `condition` until it holds, failing the test after a minute.
fn eventually(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(60), "condition never held");
        thread::sleep(Duration::from_millis(1));
    }
}

fn dropped_cause<V>(future: &Future<V>) -> &Cause {
    future
        .cause()
        .expect("future failed")
        .downcast_ref::<DroppedError>()
        .expect("failed with a drop")
        .cause()
        .expect("drop has a cause")
}

#[test]
fn every_message_is_delivered_under_back_pressure() {
    init_logging();
    let sender = Arc::new(Recording::default());
    let metrics = Arc::new(InMemoryMetrics::<u32>::new());
    let reporter = reporter(sender.clone(), metrics.clone())
        .overflow_policy(OverflowPolicy::BackPressure)
        .queued_max_messages(10)
        .buffered_max_messages(10)
        .flush_threads(2)
        .message_timeout(Duration::from_millis(20))
        .build()
        .unwrap();

    let futures: Vec<Future<usize>> = thread::scope(|scope| {
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let reporter = &reporter;
                scope.spawn(move || {
                    (0..50)
                        .map(|i| reporter.report(Event { key: 7, id: producer * 50 + i }).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        producers
            .into_iter()
            .flat_map(|producer| producer.join().unwrap())
            .collect()
    });

    for (future, id) in futures.iter().zip(0..) {
        assert!(future.wait_timeout(Duration::from_secs(60)));
        assert_eq!(future.wait().ok(), Some(&id));
    }
    eventually(|| metrics.messages() == 200);
    assert_eq!(metrics.messages_dropped(), 0);

    let batches = sender.batches();
    assert!(batches.iter().all(|batch| batch.len() <= 10));
    let mut sent: Vec<_> = batches.into_iter().flatten().collect();
    sent.sort_unstable();
    assert_eq!(sent, (0..200).collect::<Vec<_>>());
}

#[test]
fn close_fails_what_is_still_queued() {
    let sender = Arc::new(Recording::default());
    let metrics = Arc::new(InMemoryMetrics::<u32>::new());
    let reporter = reporter(sender.clone(), metrics.clone())
        .message_timeout(Duration::ZERO)
        .buffered_max_messages(10)
        .build()
        .unwrap();
    let futures: Vec<_> = (0..25)
        .map(|id| reporter.report(Event { key: 1, id }).unwrap())
        .collect();

    reporter.close();
    assert_eq!(reporter.state(), ReporterState::Shutdown);

    // close sends one last batch, the other 15 are dropped
    for future in &futures[..10] {
        assert!(future.wait_timeout(Duration::from_secs(60)));
        assert!(future.is_success());
    }
    for future in &futures[10..] {
        assert!(future.is_failed());
        assert!(dropped_cause(future).is::<Closed>());
        assert_eq!(dropped_cause(future).to_string(), "closed");
    }
    assert_eq!(metrics.messages_dropped(), 15);
    assert_eq!(reporter.queues(), 0);
    assert_eq!(sender.batches().len(), 1);
}

#[test]
fn producer_blocked_on_the_global_cap_is_released_by_close() {
    let metrics = Arc::new(InMemoryMetrics::<u32>::new());
    let reporter = reporter(Arc::new(Recording::default()), metrics.clone())
        .message_timeout(Duration::ZERO)
        .queued_max_messages(2)
        .total_queued_messages(2)
        .build()
        .unwrap();
    // two keys with one message each: no queue is full, but the cap is reached
    reporter.report(Event { key: 1, id: 0 }).unwrap();
    reporter.report(Event { key: 2, id: 1 }).unwrap();
    assert_eq!(reporter.queued_messages(), 2);

    let blocked = thread::scope(|scope| {
        let producer = scope.spawn(|| reporter.report(Event { key: 3, id: 2 }).unwrap());
        thread::sleep(Duration::from_millis(20));
        reporter.close();
        producer.join().unwrap()
    });
    assert!(dropped_cause(&blocked).is::<Closed>());
}

struct Unreachable;

impl Sender<Event> for Unreachable {
    type Output = ();

    fn send(&self, _events: &[Event]) -> Result<Vec<Result<(), Cause>>, Cause> {
        Err(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "collector unreachable",
        )))
    }
}

#[test]
fn transport_failure_fails_the_batch() {
    init_logging();
    let metrics = Arc::new(InMemoryMetrics::<u32>::new());
    let reporter = Reporter::<Event, _>::builder(Unreachable)
        .metrics(metrics.clone())
        .message_timeout(Duration::ZERO)
        .build()
        .unwrap();
    let futures: Vec<_> = (0..3)
        .map(|id| reporter.report(Event { key: 1, id }).unwrap())
        .collect();
    reporter.flush_all();

    for future in &futures {
        assert!(future.wait_timeout(Duration::from_secs(60)));
        assert_eq!(dropped_cause(future).to_string(), "collector unreachable");
    }
    eventually(|| metrics.messages_dropped() == 3);
}

#[test]
fn timer_flushes_partial_batches() {
    let sender = Arc::new(Recording::default());
    let metrics = Arc::new(InMemoryMetrics::<u32>::new());
    let reporter = reporter(sender.clone(), metrics)
        .message_timeout(Duration::from_millis(20))
        .build()
        .unwrap();
    let future = reporter.report(Event { key: 3, id: 42 }).unwrap();

    // no flush_all: the per-key timer sends it
    let sent = futures::executor::block_on(future.wait_async());
    assert_eq!(sent.ok(), Some(42));
    assert_eq!(sender.batches(), vec![vec![42]]);
}

#[test]
fn idle_queues_are_evicted() {
    let metrics = Arc::new(InMemoryMetrics::<u32>::new());
    let reporter = reporter(Arc::new(Recording::default()), metrics.clone())
        .message_timeout(Duration::ZERO)
        .queued_keep_alive(Duration::from_millis(20))
        .build()
        .unwrap();
    for key in 0..3 {
        reporter.report(Event { key, id: 0 }).unwrap();
    }
    assert_eq!(reporter.queues(), 3);
    reporter.flush_all();

    eventually(|| reporter.queues() == 0);
    assert_eq!(metrics.keys(), 0);

    // a new message recreates the queue
    let future = reporter.report(Event { key: 0, id: 1 }).unwrap();
    assert_eq!(reporter.queues(), 1);
    reporter.flush_all();
    assert!(future.wait().is_ok());
}

/// A message whose key is only decided once its producer is inside `report`.
#[derive(Debug)]
struct Late {
    id: usize,
    key: Arc<LateKey>,
}

#[derive(Debug, Default)]
struct LateKey {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    key: OnceLock<u32>,
}

impl LateKey {
    fn fixed(key: u32) -> Arc<Self> {
        let late = Self::default();
        late.key.set(key).unwrap();
        Arc::new(late)
    }
}

impl Message for Late {
    type Key = u32;

    fn key(&self) -> u32 {
        if let Some(entered) = self.key.entered.lock().unwrap().take() {
            entered.send(()).unwrap();
        }
        *self.key.key.wait()
    }
}

/// Blocks in the first send until released, reporting which key it was sending.
struct HoldFirstBatch {
    started: Mutex<Option<mpsc::Sender<u32>>>,
    release: Mutex<mpsc::Receiver<()>>,
    sent: Mutex<Vec<usize>>,
}

impl Sender<Late> for HoldFirstBatch {
    type Output = ();

    fn send(&self, batch: &[Late]) -> Result<Vec<Result<(), Cause>>, Cause> {
        let started = self.started.lock().unwrap().take();
        if let Some(started) = started {
            started.send(*batch[0].key.key.get().unwrap()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        self.sent.lock().unwrap().extend(batch.iter().map(|m| m.id));
        Ok(batch.iter().map(|_| Ok(())).collect())
    }
}

#[test]
fn report_racing_close_leaves_queued_messages_to_close() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let sender = Arc::new(HoldFirstBatch {
        started: Mutex::new(Some(started_tx)),
        release: Mutex::new(release_rx),
        sent: Mutex::new(vec![]),
    });
    let reporter = Reporter::<Late, _>::builder_shared(sender.clone())
        .message_timeout(Duration::ZERO)
        .build()
        .unwrap();
    let mut futures: Vec<_> = (0..6)
        .map(|id| {
            let key = LateKey::fixed((id % 2) as u32);
            reporter.report(Late { id, key }).unwrap()
        })
        .collect();

    let (entered_tx, entered_rx) = mpsc::channel();
    let late_key = Arc::new(LateKey {
        entered: Mutex::new(Some(entered_tx)),
        key: OnceLock::new(),
    });
    let late = thread::scope(|scope| {
        let producer = scope.spawn(|| {
            reporter
                .report(Late {
                    id: 6,
                    key: late_key.clone(),
                })
                .unwrap()
        });
        // the producer passed the shutdown check before close starts
        entered_rx.recv().unwrap();
        let closer = scope.spawn(|| reporter.close());

        // close is sending its first batch; the late message joins the queue it has not reached yet
        let first = started_rx.recv().unwrap();
        late_key.key.set(1 - first).unwrap();
        let late = producer.join().unwrap();
        release_tx.send(()).unwrap();
        closer.join().unwrap();
        late
    });
    futures.push(late);

    for future in &futures {
        assert!(future.wait_timeout(Duration::from_secs(60)));
        assert!(future.is_success(), "{future:?}");
    }
    let mut sent = sender.sent.lock().unwrap().clone();
    sent.sort_unstable();
    assert_eq!(sent, (0..7).collect::<Vec<_>>());
}

#[rstest]
#[case::drop_head(OverflowPolicy::DropHead)]
#[case::drop_tail(OverflowPolicy::DropTail)]
#[case::drop_buffer(OverflowPolicy::DropBuffer)]
#[case::drop_new(OverflowPolicy::DropNew)]
#[case::back_pressure(OverflowPolicy::BackPressure)]
fn every_message_is_accounted_for(#[case] policy: OverflowPolicy) {
    let sender = Arc::new(Recording::default());
    let metrics = Arc::new(InMemoryMetrics::<u32>::new());
    let reporter = reporter(sender.clone(), metrics.clone())
        .overflow_policy(policy)
        .queued_max_messages(5)
        .buffered_max_messages(5)
        .flush_threads(2)
        .message_timeout(Duration::from_millis(10))
        .build()
        .unwrap();

    let futures: Vec<Future<usize>> = thread::scope(|scope| {
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let reporter = &reporter;
                scope.spawn(move || {
                    (0..100)
                        .map(|i| {
                            let key = (i % 2) as u32;
                            reporter.report(Event { key, id: producer * 100 + i }).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        producers
            .into_iter()
            .flat_map(|producer| producer.join().unwrap())
            .collect()
    });

    for future in &futures {
        assert!(future.wait_timeout(Duration::from_secs(60)));
    }
    let failed = futures.iter().filter(|future| future.is_failed()).count();
    let delivered: usize = sender.batches().iter().map(Vec::len).sum();
    assert_eq!(failed + delivered, 400);
    if policy == OverflowPolicy::BackPressure {
        assert_eq!(failed, 0);
    }
    for future in futures.iter().filter(|future| future.is_failed()) {
        let dropped = future.cause().unwrap().downcast_ref::<DroppedError>().unwrap();
        assert_eq!(dropped.policy(), Some(policy));
    }
    eventually(|| metrics.messages_dropped() == failed as u64);
    assert_eq!(metrics.messages(), 400);
}
