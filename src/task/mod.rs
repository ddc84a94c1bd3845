//! Task abstraction and the strictly sequential task queue.
//!
//! # Overview
//!
//! A [`Task`] performs one pipeline step: usually one store transaction,
//! optionally followed by a non-blocking call into a collaborator. The
//! [`TaskQueue`] runs tasks one at a time in the order they were added, so
//! no two tasks ever touch the store concurrently. A task that panics is
//! logged and counted; the queue moves on.
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use prefetch_core::task::{Task, TaskQueue};
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Task for Hello {
//!     fn name(&self) -> &'static str {
//!         "hello"
//!     }
//!     async fn run(&mut self) {
//!         println!("hello");
//!     }
//! }
//!
//! # async fn example() {
//! let queue = TaskQueue::new();
//! queue.add_task(Box::new(Hello));
//! queue.wait_until_idle().await;
//! # }
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// One unit of pipeline work.
#[async_trait]
pub trait Task: Send {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Runs the task to completion.
    ///
    /// Returning signals completion to the queue. Implementations must not
    /// wait on external operations they start.
    async fn run(&mut self);
}

/// Counters for tasks processed by a queue.
#[derive(Debug, Default)]
pub struct TaskStats {
    completed: AtomicUsize,
    panicked: AtomicUsize,
}

impl TaskStats {
    /// Tasks that returned normally.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Tasks that panicked.
    #[must_use]
    pub fn panicked(&self) -> usize {
        self.panicked.load(Ordering::SeqCst)
    }
}

/// FIFO queue executing at most one [`Task`] at a time.
///
/// Cheap to clone; every clone feeds the same runner. The runner exits when
/// the last clone is dropped.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Box<dyn Task>>,
    pending: Arc<watch::Sender<usize>>,
    stats: Arc<TaskStats>,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &*self.pending.borrow())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Spawns the runner.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0_usize);
        let pending = Arc::new(pending);
        let stats = Arc::new(TaskStats::default());
        tokio::spawn(run_queue(receiver, Arc::clone(&pending), Arc::clone(&stats)));
        Self {
            sender,
            pending,
            stats,
        }
    }

    /// Appends a task; it runs after every task added before it.
    pub fn add_task(&self, task: Box<dyn Task>) {
        let name = task.name();
        self.pending.send_modify(|n| *n += 1);
        if self.sender.send(task).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            warn!(task = name, "task queue runner has stopped, dropping task");
        } else {
            debug!(task = name, "task queued");
        }
    }

    /// True while a task is queued or running.
    #[must_use]
    pub fn has_pending_tasks(&self) -> bool {
        *self.pending.borrow() > 0
    }

    /// Number of tasks queued or running.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        *self.pending.borrow()
    }

    /// Waits until no task is queued or running.
    pub async fn wait_until_idle(&self) {
        let mut receiver = self.pending.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = receiver.wait_for(|n| *n == 0).await;
    }

    /// Counters for processed tasks.
    #[must_use]
    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }
}

async fn run_queue(
    mut receiver: mpsc::UnboundedReceiver<Box<dyn Task>>,
    pending: Arc<watch::Sender<usize>>,
    stats: Arc<TaskStats>,
) {
    while let Some(mut task) = receiver.recv().await {
        let name = task.name();
        debug!(task = name, "task started");
        match AssertUnwindSafe(task.run()).catch_unwind().await {
            Ok(()) => {
                stats.completed.fetch_add(1, Ordering::SeqCst);
                debug!(task = name, "task finished");
            }
            Err(_) => {
                stats.panicked.fetch_add(1, Ordering::SeqCst);
                warn!(task = name, "task panicked; continuing with next task");
            }
        }
        drop(task);
        pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    struct Recording {
        label: usize,
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    #[async_trait]
    impl Task for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn run(&mut self) {
            self.log.lock().unwrap().push(format!("start {}", self.label));
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(format!("end {}", self.label));
        }
    }

    struct Panicking;

    #[async_trait]
    impl Task for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn run(&mut self) {
            panic!("task failure");
        }
    }

    #[tokio::test]
    async fn test_tasks_run_one_at_a_time_in_order() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (label, delay_ms) in [(1, 30), (2, 0), (3, 10)] {
            queue.add_task(Box::new(Recording {
                label,
                log: Arc::clone(&log),
                delay: Duration::from_millis(delay_ms),
            }));
        }
        queue.wait_until_idle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
        assert_eq!(queue.stats().completed(), 3);
        assert!(!queue.has_pending_tasks());
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stall_queue() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.add_task(Box::new(Panicking));
        queue.add_task(Box::new(Recording {
            label: 9,
            log: Arc::clone(&log),
            delay: Duration::ZERO,
        }));
        queue.wait_until_idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["start 9", "end 9"]);
        assert_eq!(queue.stats().panicked(), 1);
        assert_eq!(queue.stats().completed(), 1);
    }

    #[tokio::test]
    async fn test_pending_count_tracks_queued_tasks() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.add_task(Box::new(Recording {
            label: 1,
            log: Arc::clone(&log),
            delay: Duration::from_millis(50),
        }));
        assert!(queue.has_pending_tasks());
        assert_eq!(queue.pending_tasks(), 1);
        queue.wait_until_idle().await;
        assert_eq!(queue.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_wait_until_idle_returns_immediately_when_empty() {
        let queue = TaskQueue::new();
        tokio::time::timeout(Duration::from_secs(1), queue.wait_until_idle())
            .await
            .unwrap();
    }
}
