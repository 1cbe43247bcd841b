use std::collections::BTreeMap;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::Producer::task_runner::{Task, TaskRunner};

#[derive(Default)]
struct Queue {
    now_ms: u64,
    seq: u64,
    /// Keyed by (due time, post order).
    tasks: BTreeMap<(u64, u64), Task>,
}

/// Manually driven task runner with a virtual clock. Tasks only run from
/// `run_until_idle` / `advance_time_and_run`, on the thread that created the
/// runner.
pub struct TestTaskRunner {
    owner: ThreadId,
    queue: Mutex<Queue>,
}

impl Default for TestTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTaskRunner {
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            queue: Mutex::new(Queue::default()),
        }
    }

    fn push(&self, task: Task, delay_ms: u32) {
        let mut queue = self.queue.lock();
        queue.seq += 1;
        let key = (queue.now_ms + delay_ms as u64, queue.seq);
        queue.tasks.insert(key, task);
    }

    fn pop_due(&self, deadline_ms: u64) -> Option<Task> {
        let mut queue = self.queue.lock();
        let key = *queue.tasks.keys().next()?;
        if key.0 > deadline_ms {
            return None;
        }
        queue.now_ms = queue.now_ms.max(key.0);
        queue.tasks.remove(&key)
    }

    /// Runs every task that is due now, including tasks they post.
    pub fn run_until_idle(&self) -> usize {
        let now = self.now_ms();
        let mut ran = 0;
        while let Some(task) = self.pop_due(now) {
            task();
            ran += 1;
        }
        ran
    }

    /// Moves the clock forward by `ms`, running tasks as they become due.
    pub fn advance_time_and_run(&self, ms: u64) -> usize {
        let deadline = self.now_ms() + ms;
        let mut ran = 0;
        while let Some(task) = self.pop_due(deadline) {
            task();
            ran += 1;
        }
        self.queue.lock().now_ms = deadline;
        ran
    }

    pub fn now_ms(&self) -> u64 {
        self.queue.lock().now_ms
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    /// Due time of the earliest queued task.
    pub fn next_task_due_ms(&self) -> Option<u64> {
        self.queue.lock().tasks.keys().next().map(|key| key.0)
    }
}

impl TaskRunner for TestTaskRunner {
    fn post_task(&self, task: Task) {
        self.push(task, 0);
    }

    fn post_delayed_task(&self, task: Task, delay_ms: u32) {
        self.push(task, delay_ms);
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}
