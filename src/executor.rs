use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

/// A unit of work for the [`SerialExecutor`].
type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    RunAfter(Instant, Task),
}

/// Runs every submitted task on one dedicated thread, in submission order.
///
/// Immediate tasks are FIFO; delayed tasks run once their deadline passes,
/// between immediate tasks. Nothing ever runs concurrently with anything
/// else, which is what lets the event loop treat a non-thread-safe consumer
/// handle as single-threaded.
///
/// Handles are cheap to clone. The worker thread exits once every handle is
/// dropped; delayed tasks still outstanding at that point are discarded.
#[derive(Clone)]
pub(crate) struct SerialExecutor {
    tx: Sender<Message>,
}

impl SerialExecutor {
    pub(crate) fn spawn(thread_name: &str) -> Self {
        let (tx, rx) = unbounded::<Message>();

        if let Err(e) = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || worker(rx))
        {
            // Without its thread the executor is useless: nothing submitted
            // to it would ever run.
            panic!("Failed to spawn executor thread '{thread_name}': {e}");
        }

        Self { tx }
    }

    /// Enqueue `task` behind everything submitted before it.
    pub(crate) fn execute(&self, task: impl FnOnce() + Send + 'static) {
        // A send only fails once the worker is gone, and the worker only
        // goes once every handle (this one included) has been dropped.
        let _ = self.tx.send(Message::Run(Box::new(task)));
    }

    /// Run `task` once `delay` has elapsed.
    pub(crate) fn execute_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let _ = self
            .tx
            .send(Message::RunAfter(Instant::now() + delay, Box::new(task)));
    }
}

struct DelayedTask {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    // BinaryHeap is a max-heap: reverse so the earliest deadline pops first,
    // submission order breaking ties.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn worker(rx: Receiver<Message>) {
    let mut delayed: BinaryHeap<DelayedTask> = BinaryHeap::new();
    let mut seq = 0_u64;

    loop {
        // Run everything already due before blocking on the mailbox again.
        loop {
            let due = delayed
                .peek()
                .map_or(false, |d| d.deadline <= Instant::now());
            if !due {
                break;
            }
            if let Some(d) = delayed.pop() {
                (d.task)();
            }
        }

        let received = match delayed.peek() {
            Some(d) => rx.recv_timeout(d.deadline.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Message::Run(task)) => task(),
            Ok(Message::RunAfter(deadline, task)) => {
                seq += 1;
                delayed.push(DelayedTask {
                    deadline,
                    seq,
                    task,
                });
            }
            Err(RecvTimeoutError::Timeout) => {} //< due tasks run at loop top
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
