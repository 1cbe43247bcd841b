// Single-threaded task execution for the arbiter's control flow: commits,
// writer registration and delayed batch flushes all run on one thread.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskRunner: Send + Sync {
    fn post_task(&self, task: Task);

    fn post_delayed_task(&self, task: Task, delay_ms: u32);

    fn runs_tasks_on_current_thread(&self) -> bool;
}

struct DelayedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed: BinaryHeap is a max-heap and the earliest task must pop first.
impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct RunnerQueue {
    immediate: VecDeque<Task>,
    delayed: BinaryHeap<DelayedTask>,
    seq: u64,
    quit: bool,
}

struct RunnerShared {
    queue: Mutex<RunnerQueue>,
    cv: Condvar,
}

/// A `TaskRunner` backed by a dedicated thread.
pub struct ThreadTaskRunner {
    shared: Arc<RunnerShared>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTaskRunner {
    pub fn spawn(name: &str) -> io::Result<Arc<Self>> {
        let shared = Arc::new(RunnerShared {
            queue: Mutex::new(RunnerQueue::default()),
            cv: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(&worker))?;
        Ok(Arc::new(Self {
            shared,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        }))
    }

    fn run(shared: &RunnerShared) {
        let mut queue = shared.queue.lock();
        loop {
            if queue.quit {
                return;
            }
            let now = Instant::now();
            while queue.delayed.peek().map_or(false, |t| t.due <= now) {
                if let Some(due) = queue.delayed.pop() {
                    queue.immediate.push_back(due.task);
                }
            }
            if let Some(task) = queue.immediate.pop_front() {
                drop(queue);
                task();
                queue = shared.queue.lock();
                continue;
            }
            match queue.delayed.peek().map(|t| t.due) {
                Some(due) => {
                    shared.cv.wait_until(&mut queue, due);
                }
                None => shared.cv.wait(&mut queue),
            }
        }
    }

    /// Stops the thread after the task currently running, dropping queued tasks.
    pub fn shutdown(&self) {
        self.shared.queue.lock().quit = true;
        self.shared.cv.notify_all();
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("task runner thread panicked");
            }
        }
    }
}

impl TaskRunner for ThreadTaskRunner {
    fn post_task(&self, task: Task) {
        self.shared.queue.lock().immediate.push_back(task);
        self.shared.cv.notify_one();
    }

    fn post_delayed_task(&self, task: Task, delay_ms: u32) {
        if delay_ms == 0 {
            return self.post_task(task);
        }
        let mut queue = self.shared.queue.lock();
        queue.seq += 1;
        let seq = queue.seq;
        queue.delayed.push(DelayedTask {
            due: Instant::now() + Duration::from_millis(delay_ms as u64),
            seq,
            task,
        });
        drop(queue);
        self.shared.cv.notify_one();
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for ThreadTaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
