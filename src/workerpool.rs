//! Worker pool - bounded task queue drained by a fixed set of workers
//!
//! `submit` never waits: a canceled task or a full queue is rejected on the
//! spot, which is how callers learn to back off. Cancellation is checked
//! again when a worker dequeues the task, but never while the executor is
//! running; an execution that already started always runs to completion.
//!
//! A panicking executor takes its worker down with it. That is not guarded
//! against.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coderun::CodeRun;
use crate::error::Result;
use crate::telemetry;

/// Reasons a task was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("workerpool task was canceled")]
    Canceled,
    #[error("workerpool queue is full")]
    QueueFull,
    #[error("workerpool task has no executor")]
    NoExecutor,
    #[error("workerpool is shut down")]
    Closed,
}

pub type TaskResult = Result<CodeRun>;

pub type Executor =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, TaskResult> + Send + 'static>;

/// One unit of work. Owned by the submitter until a worker picks it up.
pub struct Task {
    pub token: CancellationToken,
    pub execute: Option<Executor>,
    /// Receives exactly one message per task when present
    pub result: Option<oneshot::Sender<TaskResult>>,
}

impl Task {
    /// Build a task together with the receiving end of its result channel.
    pub fn new<F, Fut>(token: CancellationToken, execute: F) -> (Self, oneshot::Receiver<TaskResult>)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            token,
            execute: Some(Box::new(move |token| Box::pin(execute(token)))),
            result: Some(tx),
        };
        (task, rx)
    }
}

struct QueuedTask {
    task: Task,
    queued_at: Instant,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub capacity: usize,
}

pub struct WorkerPool {
    sender: mpsc::Sender<QueuedTask>,
    worker_count: usize,
    queue_capacity: usize,
    busy: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` workers (at least 1) sharing a queue of
    /// `queue_capacity` slots (defaults to the worker count when 0).
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let worker_count = workers.max(1);
        let queue_capacity = if queue_capacity == 0 {
            worker_count
        } else {
            queue_capacity
        };

        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let busy = Arc::new(AtomicUsize::new(0));

        let handles = (0..worker_count)
            .map(|id| tokio::spawn(worker(id, receiver.clone(), busy.clone())))
            .collect();

        telemetry::pool_started(worker_count, queue_capacity);
        info!(
            workers = worker_count,
            queue_capacity = queue_capacity,
            "Worker pool started"
        );

        Self {
            sender,
            worker_count,
            queue_capacity,
            busy,
            handles,
        }
    }

    /// Enqueue a task without waiting for queue space.
    pub fn submit(&self, task: Task) -> std::result::Result<(), PoolError> {
        if task.token.is_cancelled() {
            debug!("Rejected canceled task at submission");
            telemetry::task_canceled();
            return Err(PoolError::Canceled);
        }

        let queued = QueuedTask {
            task,
            queued_at: Instant::now(),
        };

        match self.sender.try_send(queued) {
            Ok(()) => {
                let queued = self.queued();
                telemetry::task_submitted(queued);
                debug!(queued, "Task submitted");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                telemetry::task_rejected();
                warn!(
                    capacity = self.queue_capacity,
                    "Worker pool queue is full, rejecting task"
                );
                Err(PoolError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(PoolError::Closed),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.worker_count,
            busy: self.busy.load(Ordering::SeqCst),
            queued: self.queued(),
            capacity: self.queue_capacity,
        }
    }

    fn queued(&self) -> usize {
        self.queue_capacity - self.sender.capacity()
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(self) {
        let Self {
            sender, handles, ..
        } = self;
        drop(sender);
        for handle in handles {
            let _ = handle.await;
        }
        info!("Worker pool stopped");
    }
}

async fn worker(id: usize, receiver: Arc<Mutex<mpsc::Receiver<QueuedTask>>>, busy: Arc<AtomicUsize>) {
    loop {
        let (next, remaining) = {
            let mut receiver = receiver.lock().await;
            let next = receiver.recv().await;
            (next, receiver.len())
        };
        let Some(QueuedTask { task, queued_at }) = next else {
            break;
        };

        telemetry::task_dequeued(remaining, queued_at.elapsed());
        debug!(
            worker = id,
            queue_wait_ms = queued_at.elapsed().as_millis() as u64,
            "Dequeued task"
        );

        let Task {
            token,
            execute,
            result,
        } = task;

        let Some(execute) = execute else {
            telemetry::task_finished(None, false);
            deliver(result, Err(PoolError::NoExecutor.into()));
            continue;
        };

        if token.is_cancelled() {
            debug!(worker = id, "Task canceled before execution");
            telemetry::task_canceled();
            deliver(result, Err(PoolError::Canceled.into()));
            continue;
        }

        telemetry::workers_busy(busy.fetch_add(1, Ordering::SeqCst) + 1);
        let started = Instant::now();
        let outcome = execute(token).await;
        let ran = started.elapsed();
        telemetry::workers_busy(busy.fetch_sub(1, Ordering::SeqCst) - 1);
        telemetry::task_finished(Some(ran), outcome.is_ok());

        debug!(
            worker = id,
            duration_ms = ran.as_millis() as u64,
            success = outcome.is_ok(),
            "Task finished"
        );

        deliver(result, outcome);
    }
    debug!(worker = id, "Worker exiting");
}

fn deliver(result: Option<oneshot::Sender<TaskResult>>, outcome: TaskResult) {
    if let Some(tx) = result {
        // receiver may have given up waiting
        let _ = tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn run_with_id(id: &str) -> CodeRun {
        let mut run = CodeRun::new("code-1");
        run.id = id.to_string();
        run
    }

    async fn wait<T>(rx: oneshot::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("timeout waiting for workerpool result")
            .expect("result channel closed")
    }

    /// A task that signals when it starts and blocks until released.
    fn blocking_task() -> (Task, oneshot::Receiver<TaskResult>, oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (task, result) = Task::new(CancellationToken::new(), move |_| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(run_with_id("blocking"))
        });
        (task, result, started_rx, release_tx)
    }

    fn quick_task(id: &'static str) -> (Task, oneshot::Receiver<TaskResult>) {
        Task::new(CancellationToken::new(), move |_| async move { Ok(run_with_id(id)) })
    }

    #[tokio::test]
    async fn test_pool_executes_task() {
        let pool = WorkerPool::new(1, 1);
        let (task, result) = quick_task("run-123");

        pool.submit(task).unwrap();

        let run = wait(result).await.unwrap();
        assert_eq!(run.id, "run-123");
    }

    #[tokio::test]
    async fn test_pool_minimums() {
        let pool = WorkerPool::new(0, 0);
        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.capacity, 1);

        let pool = WorkerPool::new(4, 0);
        assert_eq!(pool.stats().capacity, 4);
    }

    #[tokio::test]
    async fn test_submit_canceled_context() {
        let pool = WorkerPool::new(1, 1);
        let token = CancellationToken::new();
        token.cancel();

        let (task, _result) = Task::new(token, |_| async { Ok(run_with_id("never")) });

        assert_eq!(pool.submit(task), Err(PoolError::Canceled));
        assert_eq!(pool.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_submit_queue_full_then_recovers() {
        let pool = WorkerPool::new(1, 1);

        let (task1, result1, started, release) = blocking_task();
        pool.submit(task1).unwrap();
        wait(started).await;

        // worker busy, queue has one free slot
        let (task2, result2) = quick_task("queued");
        pool.submit(task2).unwrap();
        assert_eq!(pool.stats().queued, 1);

        let (task3, _result3) = quick_task("rejected");
        assert_eq!(pool.submit(task3), Err(PoolError::QueueFull));
        assert_eq!(pool.stats().queued, 1);

        release.send(()).unwrap();
        assert_eq!(wait(result1).await.unwrap().id, "blocking");
        assert_eq!(wait(result2).await.unwrap().id, "queued");

        let (task4, result4) = quick_task("accepted-again");
        pool.submit(task4).unwrap();
        assert_eq!(wait(result4).await.unwrap().id, "accepted-again");
    }

    #[tokio::test]
    async fn test_worker_no_executor() {
        let pool = WorkerPool::new(1, 1);
        let (tx, rx) = oneshot::channel();
        let task = Task {
            token: CancellationToken::new(),
            execute: None,
            result: Some(tx),
        };

        pool.submit(task).unwrap();

        let err = wait(rx).await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::NoExecutor)));
        assert_eq!(err.to_string(), "workerpool task has no executor");
    }

    #[tokio::test]
    async fn test_worker_context_canceled_before_execute() {
        let pool = WorkerPool::new(1, 1);

        let (task1, _result1, started, release) = blocking_task();
        pool.submit(task1).unwrap();
        wait(started).await;

        let token = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = ran.clone();
        let (task2, result2) = Task::new(token.clone(), move |_| async move {
            ran_flag.store(true, Ordering::SeqCst);
            Ok(run_with_id("should-not-run"))
        });
        pool.submit(task2).unwrap();

        token.cancel();
        release.send(()).unwrap();

        let err = wait(result2).await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::Canceled)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_during_execution_runs_to_completion() {
        let pool = WorkerPool::new(1, 1);
        let token = CancellationToken::new();
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let (task, result) = Task::new(token.clone(), move |_| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(run_with_id("finished"))
        });
        pool.submit(task).unwrap();
        wait(started_rx).await;

        token.cancel();
        release_tx.send(()).unwrap();

        assert_eq!(wait(result).await.unwrap().id, "finished");
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_stall_pool() {
        let pool = WorkerPool::new(1, 2);
        let (task, result) = quick_task("ignored");
        drop(result);
        pool.submit(task).unwrap();

        let (task, result) = quick_task("next");
        pool.submit(task).unwrap();
        assert_eq!(wait(result).await.unwrap().id, "next");
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let pool = WorkerPool::new(2, 4);
        let mut results = Vec::new();
        for id in ["a", "b", "c"] {
            let (task, result) = quick_task(id);
            pool.submit(task).unwrap();
            results.push(result);
        }

        pool.shutdown().await;

        for result in results {
            assert!(wait(result).await.is_ok());
        }
    }
}
