//! # Task Dispatch
//!
//! Work units are scheduled through a [`TaskDispatcher`]: a task is accepted
//! for a named queue and run at least once, with transient failures
//! ([`TaskError::Retry`]) retried under a [`RetryPolicy`]. Tasks share no
//! memory with each other beyond what they capture; all coordination between
//! units of one migration goes through the record store.
//!
//! [`enqueue_fan_out`] layers range fan-out on top of plain `enqueue`: every
//! unit is wrapped so the last one to complete enqueues the finalize task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use super::errors::{DispatchError, DispatchResult, TaskError};
use super::retry::RetryPolicy;

/// A schedulable unit of work; may run more than once
pub type Task = Arc<dyn Fn() -> Result<(), TaskError> + Send + Sync>;

/// Accepts tasks for eventual, at-least-once execution
pub trait TaskDispatcher: Send + Sync {
    fn enqueue(&self, queue: &str, task: Task) -> DispatchResult<()>;
}

fn validate_queue(queue: &str) -> DispatchResult<()> {
    if queue.trim().is_empty() {
        return Err(DispatchError::InvalidQueue {
            queue: queue.to_string(),
        });
    }
    Ok(())
}

fn log_abandoned(queue: &str, attempts: u32, err: &TaskError) {
    error!(queue, attempts, error = %err, "task abandoned");
}

/// Enqueue `units` and arrange for `finalize` to be enqueued once, after all
/// of them have completed.
///
/// A unit counts as complete the first time it returns `Ok`; retries of a
/// completed unit do not count again. With no units, `finalize` is enqueued
/// straight away.
pub fn enqueue_fan_out(
    dispatcher: &Arc<dyn TaskDispatcher>,
    queue: &str,
    units: Vec<Task>,
    finalize: Task,
) -> DispatchResult<()> {
    validate_queue(queue)?;
    if units.is_empty() {
        return dispatcher.enqueue(queue, finalize);
    }

    let remaining = Arc::new(AtomicUsize::new(units.len()));
    for unit in units {
        let remaining = remaining.clone();
        let finalize = finalize.clone();
        let unit_dispatcher = dispatcher.clone();
        let queue_name = queue.to_string();
        let counted = AtomicBool::new(false);
        let owes_finalize = AtomicBool::new(false);

        let wrapped: Task = Arc::new(move || {
            if !counted.load(Ordering::SeqCst) {
                unit()?;
                counted.store(true, Ordering::SeqCst);
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    owes_finalize.store(true, Ordering::SeqCst);
                }
            }
            if owes_finalize.load(Ordering::SeqCst) {
                unit_dispatcher
                    .enqueue(&queue_name, finalize.clone())
                    .map_err(|e| TaskError::Retry(e.to_string()))?;
                owes_finalize.store(false, Ordering::SeqCst);
                debug!(queue = %queue_name, "all units complete, finalize enqueued");
            }
            Ok(())
        });
        dispatcher.enqueue(queue, wrapped)?;
    }
    Ok(())
}

/// Runs each task on the caller's thread as soon as it is enqueued
#[derive(Debug, Clone, Default)]
pub struct InlineDispatcher {
    retry: RetryPolicy,
}

impl InlineDispatcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

impl TaskDispatcher for InlineDispatcher {
    fn enqueue(&self, queue: &str, task: Task) -> DispatchResult<()> {
        validate_queue(queue)?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match task() {
                Ok(()) => return Ok(()),
                Err(TaskError::Retry(reason)) if self.retry.should_retry(attempts) => {
                    let delay = self.retry.calculate_delay(attempts - 1);
                    warn!(queue, attempt = attempts, reason = %reason, "task failed, retrying");
                    std::thread::sleep(delay);
                }
                Err(err) => {
                    log_abandoned(queue, attempts, &err);
                    return Ok(());
                }
            }
        }
    }
}

struct Pending {
    queue: String,
    task: Task,
    attempts: u32,
}

/// Holds tasks until the owner drains them; FIFO, retries go to the back.
///
/// Nothing runs concurrently, which makes interleavings reproducible.
#[derive(Default)]
pub struct QueueDispatcher {
    retry: RetryPolicy,
    pending: Mutex<VecDeque<Pending>>,
}

impl QueueDispatcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue names of the pending tasks, in run order
    pub fn queues(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|p| p.iter().map(|t| t.queue.clone()).collect())
            .unwrap_or_default()
    }

    /// Run the task at the head of the queue; returns false when empty
    pub fn run_next(&self) -> bool {
        let next = match self.pending.lock() {
            Ok(mut pending) => pending.pop_front(),
            Err(_) => None,
        };
        let Some(mut pending) = next else {
            return false;
        };

        // The lock is released while the task runs; it may enqueue more work
        pending.attempts += 1;
        match (pending.task)() {
            Ok(()) => {}
            Err(TaskError::Retry(reason)) if self.retry.should_retry(pending.attempts) => {
                warn!(queue = %pending.queue, attempt = pending.attempts, reason = %reason, "task failed, requeued");
                if let Ok(mut queue) = self.pending.lock() {
                    queue.push_back(pending);
                }
            }
            Err(err) => log_abandoned(&pending.queue, pending.attempts, &err),
        }
        true
    }

    /// Run tasks until the queue is empty, including tasks enqueued along the
    /// way. Returns the number of task runs.
    pub fn run_pending(&self) -> usize {
        let mut runs = 0;
        while self.run_next() {
            runs += 1;
        }
        runs
    }
}

impl TaskDispatcher for QueueDispatcher {
    fn enqueue(&self, queue: &str, task: Task) -> DispatchResult<()> {
        validate_queue(queue)?;
        let mut pending = self.pending.lock().map_err(|_| DispatchError::Unavailable {
            message: "queue lock poisoned".to_string(),
        })?;
        pending.push_back(Pending {
            queue: queue.to_string(),
            task,
            attempts: 0,
        });
        Ok(())
    }
}

/// Runs tasks on a tokio runtime's blocking pool
#[derive(Clone)]
pub struct TokioDispatcher {
    handle: Handle,
    retry: RetryPolicy,
    in_flight: Arc<AtomicUsize>,
}

impl TokioDispatcher {
    pub fn new(handle: Handle, retry: RetryPolicy) -> Self {
        Self {
            handle,
            retry,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Dispatcher bound to the runtime of the calling context
    pub fn current(retry: RetryPolicy) -> DispatchResult<Self> {
        let handle = Handle::try_current().map_err(|e| DispatchError::Unavailable {
            message: e.to_string(),
        })?;
        Ok(Self::new(handle, retry))
    }

    /// Tasks accepted but not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every accepted task, including ones they enqueued, is done
    pub async fn wait_idle(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl TaskDispatcher for TokioDispatcher {
    fn enqueue(&self, queue: &str, task: Task) -> DispatchResult<()> {
        validate_queue(queue)?;
        let queue = queue.to_string();
        let retry = self.retry.clone();
        let in_flight = self.in_flight.clone();

        in_flight.fetch_add(1, Ordering::SeqCst);
        self.handle.spawn(async move {
            let mut attempts = 0;
            loop {
                attempts += 1;
                let run = task.clone();
                match tokio::task::spawn_blocking(move || run()).await {
                    Ok(Ok(())) => break,
                    Ok(Err(TaskError::Retry(reason))) if retry.should_retry(attempts) => {
                        warn!(queue = %queue, attempt = attempts, reason = %reason, "task failed, retrying");
                        tokio::time::sleep(retry.calculate_delay(attempts - 1)).await;
                    }
                    Ok(Err(err)) => {
                        log_abandoned(&queue, attempts, &err);
                        break;
                    }
                    Err(join_err) => {
                        error!(queue = %queue, error = %join_err, "task panicked");
                        break;
                    }
                }
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }
}
