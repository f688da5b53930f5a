use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use super::ConsumerEventLoop;
use crate::config::{AckMode, ReceiverOptions, Subscription};
use crate::consumer::{CommitCallback, Consumer, RebalanceListener, SeekTo};
use crate::errors::{ConsumerError, ConsumerResult, ReceiverError, ReceiverResult};
use crate::executor::SerialExecutor;
use crate::kafka_types::{OffsetMap, Record, RecordBatch, TopicPartition};
use crate::sink::ChannelSink;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Subscribe,
    Assign,
    Poll,
    Pause(Vec<TopicPartition>),
    Resume(Vec<TopicPartition>),
    CommitSync(OffsetMap),
    CommitAsync(OffsetMap),
    Wakeup,
    Close,
}

struct LoggedCall {
    call: Call,
    thread: ThreadId,
}

enum PollScript {
    Batch(RecordBatch),
    Rebalance {
        revoked: Vec<TopicPartition>,
        assigned: Vec<TopicPartition>,
    },
}

/// A scripted consumer: serves queued poll outcomes, honors pause/resume,
/// records every call together with the calling thread, and lets tests drive
/// rebalance listeners and async commit callbacks.
pub(crate) struct MockConsumer {
    calls: Mutex<Vec<LoggedCall>>,
    script: Mutex<VecDeque<PollScript>>,
    listener: Mutex<Option<Box<dyn RebalanceListener>>>,
    assignment: Mutex<HashSet<TopicPartition>>,
    paused: Mutex<HashSet<TopicPartition>>,
    woken: AtomicBool,
    pending_async: Mutex<Vec<(OffsetMap, CommitCallback)>>,
    complete_async_on_poll: AtomicBool,
    subscribe_results: Mutex<VecDeque<ConsumerResult<()>>>,
    close_results: Mutex<VecDeque<ConsumerResult<()>>>,
}

impl MockConsumer {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            listener: Mutex::new(None),
            assignment: Mutex::new(HashSet::from([tp(0), tp(1)])),
            paused: Mutex::new(HashSet::new()),
            woken: AtomicBool::new(false),
            pending_async: Mutex::new(Vec::new()),
            complete_async_on_poll: AtomicBool::new(false),
            subscribe_results: Mutex::new(VecDeque::new()),
            close_results: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn script_batch(&self, batch: RecordBatch) {
        self.script.lock().push_back(PollScript::Batch(batch));
    }

    fn script_rebalance(&self, revoked: Vec<TopicPartition>, assigned: Vec<TopicPartition>) {
        self.script
            .lock()
            .push_back(PollScript::Rebalance { revoked, assigned });
    }

    fn fail_next_subscribe(&self, error: ConsumerError) {
        self.subscribe_results.lock().push_back(Err(error));
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().iter().map(|c| c.call.clone()).collect()
    }

    fn calls_with_threads(&self) -> Vec<(Call, ThreadId)> {
        self.calls
            .lock()
            .iter()
            .map(|c| (c.call.clone(), c.thread))
            .collect()
    }

    pub(crate) fn pending_async_count(&self) -> usize {
        self.pending_async.lock().len()
    }

    /// Complete the oldest outstanding async commit, on the calling thread,
    /// like a broker-client internal thread would.
    pub(crate) fn complete_next_async_commit(&self, error: Option<ConsumerError>) {
        let (offsets, callback) = {
            let mut pending = self.pending_async.lock();
            assert!(!pending.is_empty(), "no async commit in flight");
            pending.remove(0)
        };
        callback(&offsets, error);
    }

    pub(crate) fn complete_async_commits_on_poll(&self) {
        self.complete_async_on_poll.store(true, Ordering::SeqCst);
    }

    fn log(&self, call: Call) {
        self.calls.lock().push(LoggedCall {
            call,
            thread: thread::current().id(),
        });
    }
}

impl Consumer for MockConsumer {
    fn poll(&self, timeout: Duration) -> ConsumerResult<RecordBatch> {
        self.log(Call::Poll);
        if self.woken.swap(false, Ordering::SeqCst) {
            return Err(ConsumerError::Wakeup);
        }
        if self.complete_async_on_poll.load(Ordering::SeqCst) {
            let pending: Vec<(OffsetMap, CommitCallback)> =
                std::mem::take(&mut *self.pending_async.lock());
            for (offsets, callback) in pending {
                callback(&offsets, None);
            }
        }

        let deliverable = {
            let script = self.script.lock();
            match script.front() {
                Some(PollScript::Batch(batch)) => {
                    let paused = self.paused.lock();
                    !batch
                        .partitions()
                        .iter()
                        .any(|partition| paused.contains(partition))
                }
                Some(PollScript::Rebalance { .. }) => true,
                None => false,
            }
        };
        if !deliverable {
            thread::sleep(timeout.min(Duration::from_millis(2)));
            return Ok(RecordBatch::empty());
        }

        let Some(next) = self.script.lock().pop_front() else {
            return Ok(RecordBatch::empty());
        };
        match next {
            PollScript::Batch(batch) => Ok(batch),
            PollScript::Rebalance { revoked, assigned } => {
                let listener = self.listener.lock().take();
                if let Some(listener) = &listener {
                    if !revoked.is_empty() {
                        listener.on_partitions_revoked(&revoked);
                        let mut assignment = self.assignment.lock();
                        for partition in &revoked {
                            assignment.remove(partition);
                        }
                    }
                    if !assigned.is_empty() {
                        self.assignment.lock().extend(assigned.iter().cloned());
                        listener.on_partitions_assigned(&assigned);
                    }
                }
                *self.listener.lock() = listener;
                Ok(RecordBatch::empty())
            }
        }
    }

    fn pause(&self, partitions: &[TopicPartition]) -> ConsumerResult<()> {
        self.log(Call::Pause(partitions.to_vec()));
        self.paused.lock().extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> ConsumerResult<()> {
        self.log(Call::Resume(partitions.to_vec()));
        let mut paused = self.paused.lock();
        for partition in partitions {
            paused.remove(partition);
        }
        Ok(())
    }

    fn assignment(&self) -> ConsumerResult<HashSet<TopicPartition>> {
        Ok(self.assignment.lock().clone())
    }

    fn commit_sync(&self, offsets: &OffsetMap) -> ConsumerResult<()> {
        self.log(Call::CommitSync(offsets.clone()));
        Ok(())
    }

    fn commit_async(&self, offsets: OffsetMap, callback: CommitCallback) {
        self.log(Call::CommitAsync(offsets.clone()));
        self.pending_async.lock().push((offsets, callback));
    }

    fn wakeup(&self) {
        self.log(Call::Wakeup);
        self.woken.store(true, Ordering::SeqCst);
    }

    fn close(&self, _timeout: Duration) -> ConsumerResult<()> {
        self.log(Call::Close);
        self.close_results.lock().pop_front().unwrap_or(Ok(()))
    }

    fn subscribe(
        &self,
        _topics: &[String],
        listener: Box<dyn RebalanceListener>,
    ) -> ConsumerResult<()> {
        self.log(Call::Subscribe);
        *self.listener.lock() = Some(listener);
        self.subscribe_results.lock().pop_front().unwrap_or(Ok(()))
    }

    fn assign(&self, partitions: &[TopicPartition]) -> ConsumerResult<()> {
        self.log(Call::Assign);
        *self.assignment.lock() = partitions.iter().cloned().collect();
        Ok(())
    }

    fn seek(&self, _partition: &TopicPartition, _to: SeekTo) -> ConsumerResult<()> {
        Ok(())
    }

    fn position(&self, _partition: &TopicPartition, _timeout: Duration) -> ConsumerResult<i64> {
        Ok(0)
    }

    fn committed(
        &self,
        _partitions: &HashSet<TopicPartition>,
        _timeout: Duration,
    ) -> ConsumerResult<OffsetMap> {
        Ok(OffsetMap::new())
    }
}

pub(crate) fn tp(partition: u32) -> TopicPartition {
    TopicPartition::new("t", partition)
}

pub(crate) fn batch(partition: u32, offsets: &[i64]) -> RecordBatch {
    RecordBatch::new(
        offsets
            .iter()
            .map(|&offset| Record {
                topic: "t".to_string(),
                partition,
                offset,
                key: None,
                payload: Some(b"payload".to_vec()),
                read_datetime: chrono::Utc::now(),
            })
            .collect(),
    )
}

pub(crate) fn test_options() -> ReceiverOptions {
    ReceiverOptions::new(Subscription::Topics(vec!["t".to_string()]))
        .with_poll_timeout(Duration::from_millis(5))
        .with_commit_interval(Duration::ZERO)
        .with_commit_retry_interval(Duration::from_millis(10))
        .with_close_timeout(Duration::from_millis(500))
}

struct Harness {
    consumer: Arc<MockConsumer>,
    event_loop: Arc<ConsumerEventLoop>,
    rx: mpsc::Receiver<ReceiverResult<RecordBatch>>,
}

fn start(options: ReceiverOptions, consumer: Arc<MockConsumer>) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let (tx, rx) = mpsc::channel(64);
    let event_loop = ConsumerEventLoop::start(
        consumer.clone(),
        options,
        Box::new(ChannelSink::new(tx)),
        SerialExecutor::spawn("konveyor-test-loop"),
        Arc::new(AtomicBool::new(false)),
        CancellationToken::new(),
    );
    Harness {
        consumer,
        event_loop,
        rx,
    }
}

fn await_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn recv_item(
    rx: &mut mpsc::Receiver<ReceiverResult<RecordBatch>>,
    timeout: Duration,
) -> Option<ReceiverResult<RecordBatch>> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(item) => return Some(item),
            Err(TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Disconnected) => return None,
        }
    }
}

fn recv_batch(
    rx: &mut mpsc::Receiver<ReceiverResult<RecordBatch>>,
    timeout: Duration,
) -> RecordBatch {
    recv_item(rx, timeout)
        .expect("no emission within timeout")
        .expect("stream failed")
}

const LONG: Duration = Duration::from_secs(2);
const GRACE: Duration = Duration::from_millis(100);

#[test]
fn demand_drives_emission_and_is_conserved() {
    let consumer = Arc::new(MockConsumer::new());
    for offset in 0..3 {
        consumer.script_batch(batch(0, &[offset]));
    }
    let mut h = start(test_options(), consumer);

    h.event_loop.on_request(3);
    for offset in 0..3 {
        let received = recv_batch(&mut h.rx, LONG);
        assert_eq!(received.records()[0].offset, offset);
    }
    assert_eq!(h.event_loop.requested.load(Ordering::SeqCst), 0);

    // No pause while demand lasted: the first pause comes after the poll
    // that followed the third emission.
    assert!(await_until(LONG, || {
        h.consumer
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Pause(_)))
    }));
    let calls = h.consumer.calls();
    let third_poll = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Call::Poll))
        .map(|(i, _)| i)
        .nth(2)
        .expect("three polls");
    let first_pause = calls
        .iter()
        .position(|c| matches!(c, Call::Pause(_)))
        .expect("a pause");
    assert!(first_pause > third_poll);
}

#[test]
fn no_batch_is_emitted_beyond_requested_demand() {
    let consumer = Arc::new(MockConsumer::new());
    for offset in 0..5 {
        consumer.script_batch(batch(0, &[offset]));
    }
    let mut h = start(test_options(), consumer);

    h.event_loop.on_request(2);
    recv_batch(&mut h.rx, LONG);
    recv_batch(&mut h.rx, LONG);

    assert!(recv_item(&mut h.rx, GRACE).is_none());
    assert_eq!(h.event_loop.requested.load(Ordering::SeqCst), 0);
}

#[test]
fn backpressure_pauses_and_new_demand_wakes_the_consumer_up() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0]));
    let mut h = start(test_options(), consumer);

    h.event_loop.on_request(1);
    recv_batch(&mut h.rx, LONG);

    // Demand exhausted: the loop pauses the full assignment.
    assert!(await_until(LONG, || {
        h.consumer.calls().iter().any(
            |c| matches!(c, Call::Pause(parts) if parts.len() == 2),
        )
    }));
    assert!(h.event_loop.poll.is_paused());

    // New demand wakes the blocked poll and resumes everything not paused by
    // the user.
    h.event_loop.on_request(1);
    assert!(h.consumer.calls().iter().any(|c| matches!(c, Call::Wakeup)));
    assert!(await_until(LONG, || {
        h.consumer.calls().iter().any(
            |c| matches!(c, Call::Resume(parts) if parts.len() == 2),
        )
    }));
    assert!(!h.event_loop.poll.is_paused());
}

#[test]
fn user_paused_partitions_are_excluded_from_resume() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0]));
    let mut h = start(test_options(), consumer);

    h.event_loop.paused(&[tp(1)]);
    h.event_loop.on_request(1);
    recv_batch(&mut h.rx, LONG);

    assert!(await_until(LONG, || {
        h.consumer
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Pause(_)))
    }));

    h.event_loop.on_request(1);
    assert!(await_until(LONG, || {
        h.consumer
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Resume(_)))
    }));
    let resumed: Vec<Vec<TopicPartition>> = h
        .consumer
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Resume(parts) => Some(parts),
            _ => None,
        })
        .collect();
    for parts in resumed {
        assert!(parts.contains(&tp(0)));
        assert!(!parts.contains(&tp(1)));
    }
}

#[test]
fn commit_retries_then_surfaces_a_terminal_error() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0]));
    let options = test_options().with_max_commit_attempts(2);
    let mut h = start(options, consumer);

    h.event_loop.on_request(1);
    recv_batch(&mut h.rx, LONG);

    h.event_loop.commit_batch.acknowledge(&tp(0), 0);
    h.event_loop.schedule_commit_if_required();
    assert!(await_until(LONG, || h.consumer.pending_async_count() == 1));
    assert!(!h.event_loop.commit.is_retrying());

    // First failure: retriable, under the attempt cap. The loop enters the
    // retry window, restores the offsets and replays them.
    h.consumer
        .complete_next_async_commit(Some(ConsumerError::Retriable("offload".to_string())));
    assert!(await_until(LONG, || h.event_loop.commit.is_retrying()));
    assert!(await_until(LONG, || h.consumer.pending_async_count() == 1));

    // Second failure hits the cap: terminal error downstream, retry cleared.
    h.consumer
        .complete_next_async_commit(Some(ConsumerError::Retriable("offload".to_string())));
    let error = recv_item(&mut h.rx, LONG).expect("terminal error");
    assert_eq!(
        error,
        Err(ReceiverError::Commit {
            source: ConsumerError::Retriable("offload".to_string()),
            attempts: 2,
        })
    );
    assert!(await_until(LONG, || !h.event_loop.commit.is_retrying()));

    // Both dispatches carried the same restored offsets.
    let commits: Vec<OffsetMap> = h
        .consumer
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::CommitAsync(offsets) => Some(offsets),
            _ => None,
        })
        .collect();
    assert_eq!(commits.len(), 2);
    assert!(commits.iter().all(|o| o[&tp(0)] == 1));
}

#[test]
fn revocation_drains_the_pipeline_up_to_the_deadline() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0, 1]));
    consumer.script_rebalance(vec![tp(0)], vec![]);

    let revocations: Arc<Mutex<Vec<(Instant, Vec<TopicPartition>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&revocations);
    let options = test_options()
        .with_max_delay_rebalance(Duration::from_millis(500))
        .with_commit_interval_during_delay(Duration::from_millis(50))
        .with_revoke_listener(Box::new(move |partitions| {
            seen.lock().push((
                Instant::now(),
                partitions.iter().map(|p| p.topic_partition().clone()).collect(),
            ));
        }));
    let mut h = start(options, consumer);

    h.event_loop.on_request(2);
    recv_batch(&mut h.rx, LONG);
    let drained_from = Instant::now();

    // One record acknowledged, one forever in the pipeline: the drain holds
    // the revocation until its deadline, committing what it can.
    h.event_loop.commit_batch.acknowledge(&tp(0), 0);

    assert!(await_until(LONG, || !revocations.lock().is_empty()));
    let (revoked_at, revoked) = revocations.lock()[0].clone();
    assert_eq!(revoked, vec![tp(0)]);
    assert!(revoked_at.duration_since(drained_from) >= Duration::from_millis(500));

    let committed: Vec<Call> = h
        .consumer
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::CommitAsync(_)))
        .collect();
    assert!(!committed.is_empty());

    // Revoked partitions left no bookkeeping behind.
    assert_eq!(h.event_loop.commit_batch.in_pipeline(), 0);
}

#[test]
fn deferred_commit_gate_pauses_fetching_and_acks_reopen_it() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0, 1, 2, 3]));
    let options = test_options().with_max_deferred_commits(4);
    let mut h = start(options, consumer);

    h.event_loop.on_request(10);
    recv_batch(&mut h.rx, LONG);
    assert_eq!(h.event_loop.commit_batch.deferred_count(), 4);

    // Demand is plentiful, yet the gate pauses the whole assignment.
    assert!(await_until(LONG, || {
        h.consumer
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Pause(parts) if parts.len() == 2))
    }));
    assert!(h.event_loop.requested.load(Ordering::SeqCst) > 0);

    // Two in-order acks drop the deferred count below the threshold.
    h.event_loop.commit_batch.acknowledge(&tp(0), 0);
    h.event_loop.commit_batch.acknowledge(&tp(0), 1);
    assert_eq!(h.event_loop.commit_batch.deferred_count(), 2);

    assert!(await_until(LONG, || {
        h.consumer
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Resume(_)))
    }));
}

#[test]
fn awaiting_transaction_holds_the_assignment_paused() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0]));
    let mut h = start(test_options(), consumer);

    h.event_loop.set_awaiting_transaction(true);
    h.event_loop.on_request(1);

    assert!(await_until(LONG, || {
        h.consumer
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Pause(parts) if parts.len() == 2))
    }));
    assert!(recv_item(&mut h.rx, GRACE).is_none());

    h.event_loop.set_awaiting_transaction(false);
    recv_batch(&mut h.rx, LONG);
    assert!(h
        .consumer
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Resume(_))));
}

#[test]
fn close_waits_for_in_flight_commits_and_nulls_the_consumer_once() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0]));
    let mut h = start(test_options(), consumer);

    h.event_loop.on_request(1);
    recv_batch(&mut h.rx, LONG);
    h.event_loop.commit_batch.acknowledge(&tp(0), 0);
    h.event_loop.schedule_commit_if_required();
    assert!(await_until(LONG, || h.consumer.pending_async_count() == 1));

    // The commit result lands mid-close, from a broker-client thread, while
    // the close task sits in its short waiting polls.
    let broker_thread = {
        let consumer = Arc::clone(&h.consumer);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            consumer.complete_next_async_commit(None);
        })
    };
    h.event_loop
        .stop()
        .blocking_recv()
        .expect("stop completion");
    broker_thread.join().expect("broker thread");

    assert!(h.event_loop.consumer_handle().is_none());
    assert_eq!(h.event_loop.commit.in_progress(), 0);
    let closes = h
        .consumer
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Close))
        .count();
    assert_eq!(closes, 1);

    // Stopping again resolves immediately and closes nothing twice.
    h.event_loop.stop().blocking_recv().expect("idempotent stop");
    let closes = h
        .consumer
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Close))
        .count();
    assert_eq!(closes, 1);
}

#[test]
fn manual_commit_completion_resolves_when_the_commit_settles() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0]));
    let mut h = start(test_options(), consumer);

    h.event_loop.on_request(1);
    recv_batch(&mut h.rx, LONG);
    h.event_loop.commit_batch.acknowledge(&tp(0), 0);

    let (tx, mut completion) = tokio::sync::oneshot::channel();
    h.event_loop.commit_batch.add_commit_emitter(tx);
    h.event_loop.schedule_commit_if_required();

    assert!(await_until(LONG, || h.consumer.pending_async_count() == 1));
    assert!(completion.try_recv().is_err());
    h.consumer.complete_next_async_commit(None);

    assert!(await_until(LONG, || matches!(
        completion.try_recv(),
        Ok(Ok(()))
    )));
}

#[test]
fn at_most_once_commits_synchronously_before_emitting() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0, 1]));
    let options = test_options().with_ack_mode(AckMode::AtMostOnce);
    let mut h = start(options, consumer);

    h.event_loop.on_request(1);
    let received = recv_batch(&mut h.rx, LONG);
    assert_eq!(received.count(), 2);

    // By the time the batch is visible downstream its offsets are committed.
    let commits: Vec<OffsetMap> = h
        .consumer
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::CommitSync(offsets) => Some(offsets),
            _ => None,
        })
        .collect();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0][&tp(0)], 2);

    h.event_loop.stop().blocking_recv().expect("stop completion");
    assert!(h.consumer.calls().iter().any(|c| matches!(c, Call::Close)));
}

#[test]
fn exactly_once_never_commits_from_the_loop() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0]));
    let options = test_options().with_ack_mode(AckMode::ExactlyOnce);
    let mut h = start(options, consumer);

    h.event_loop.on_request(1);
    recv_batch(&mut h.rx, LONG);
    h.event_loop.commit_batch.acknowledge(&tp(0), 0);
    h.event_loop.schedule_commit_if_required();
    thread::sleep(GRACE);

    h.event_loop.stop().blocking_recv().expect("stop completion");

    let calls = h.consumer.calls();
    assert!(!calls
        .iter()
        .any(|c| matches!(c, Call::CommitSync(_) | Call::CommitAsync(_))));
    assert!(calls.iter().any(|c| matches!(c, Call::Close)));
}

#[test]
fn assignments_during_backpressure_are_repaused_and_user_pauses_reconciled() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_rebalance(vec![], vec![tp(0), tp(1)]);
    let mut h = start(test_options(), consumer);

    // tp(1) is paused by the user; tp(7) will no longer be assigned after
    // the rebalance and must be forgotten.
    h.event_loop.paused(&[tp(1), tp(7)]);

    // No demand: the first iteration parks the loop behind the back pressure
    // gate, then the scripted rebalance arrives inside the poll.
    h.event_loop.schedule_poll();

    assert!(await_until(LONG, || {
        h.consumer.calls().len() >= 3 && h.consumer.calls().iter().any(|c| matches!(c, Call::Poll))
    }));
    assert!(await_until(LONG, || {
        // The re-pause of the freshly assigned partitions, on top of the
        // back pressure pause.
        h.consumer
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Pause(_)))
            .count()
            >= 2
    }));
    assert!(await_until(LONG, || {
        let paused_by_user = h.event_loop.paused_by_user.lock();
        paused_by_user.contains(&tp(1)) && !paused_by_user.contains(&tp(7))
    }));
}

#[test]
fn subscription_failure_is_terminal() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.fail_next_subscribe(ConsumerError::Fatal("no brokers".to_string()));
    let mut h = start(test_options(), consumer);

    let error = recv_item(&mut h.rx, LONG).expect("terminal error");
    assert_eq!(
        error,
        Err(ReceiverError::Subscription(ConsumerError::Fatal(
            "no brokers".to_string()
        )))
    );
}

#[test]
fn close_revokes_manual_assignments_and_notifies_listeners() {
    let consumer = Arc::new(MockConsumer::new());
    let revocations: Arc<Mutex<Vec<Vec<TopicPartition>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&revocations);
    let options = ReceiverOptions::new(Subscription::Partitions(vec![tp(0)]))
        .with_poll_timeout(Duration::from_millis(5))
        .with_close_timeout(Duration::from_millis(500))
        .with_revoke_listener(Box::new(move |partitions| {
            seen.lock()
                .push(partitions.iter().map(|p| p.topic_partition().clone()).collect());
        }));
    let h = start(options, consumer);

    assert!(await_until(LONG, || {
        h.consumer.calls().iter().any(|c| matches!(c, Call::Assign))
    }));
    h.event_loop.stop().blocking_recv().expect("stop completion");

    assert_eq!(*revocations.lock(), vec![vec![tp(0)]]);
    assert!(h.consumer.calls().iter().any(|c| matches!(c, Call::Close)));
}

#[test]
fn every_consumer_call_except_wakeup_happens_on_the_executor_thread() {
    let consumer = Arc::new(MockConsumer::new());
    consumer.script_batch(batch(0, &[0]));
    consumer.script_batch(batch(0, &[1]));
    let mut h = start(test_options(), consumer);

    h.event_loop.on_request(2);
    recv_batch(&mut h.rx, LONG);
    recv_batch(&mut h.rx, LONG);
    h.event_loop.commit_batch.acknowledge(&tp(0), 1);
    h.event_loop.schedule_commit_if_required();
    assert!(await_until(LONG, || h.consumer.pending_async_count() == 1));
    h.consumer.complete_next_async_commit(None);
    h.event_loop.on_request(1);
    h.event_loop.stop().blocking_recv().expect("stop completion");

    let calls = h.consumer.calls_with_threads();
    let executor_thread = calls
        .iter()
        .find(|(call, _)| matches!(call, Call::Poll))
        .map(|(_, thread)| *thread)
        .expect("at least one poll");
    for (call, thread) in calls {
        if matches!(call, Call::Wakeup) {
            continue;
        }
        assert_eq!(
            thread, executor_thread,
            "{call:?} escaped the executor thread"
        );
    }
}
