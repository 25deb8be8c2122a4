//! Periodic task scheduler. Each registered task runs in its own tokio task:
//! it fires immediately on start, then on every interval tick, until the
//! cancellation token fires. Errors are logged and never break the loop; a
//! panicking run is isolated and logged.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// The function executed on each tick, typically a collector's run cycle.
pub type TaskFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A periodically executed unit of work.
pub struct Task {
    pub name: String,
    pub interval: Duration,
    run_fn: TaskFn,
}

impl Task {
    pub fn new(name: impl Into<String>, interval: Duration, run_fn: TaskFn) -> Self {
        Self {
            name: name.into(),
            interval,
            run_fn,
        }
    }
}

/// Manages a set of periodic tasks, running each in its own worker.
#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<Task>,
    handles: Vec<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. Must be called before [`Scheduler::start`].
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Launches one worker per registered task. Workers stop when `parent`
    /// is cancelled or [`Scheduler::stop`] is called.
    pub fn start(&mut self, parent: &CancellationToken) {
        let cancel = parent.child_token();
        info!(task_count = self.tasks.len(), "starting scheduler");

        for task in self.tasks.drain(..) {
            let token = cancel.clone();
            self.handles.push(tokio::spawn(run_task_loop(task, token)));
        }

        self.cancel = Some(cancel);
    }

    /// Cancels all running tasks and waits for every worker to return.
    pub async fn stop(&mut self) {
        info!("stopping scheduler");
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}

async fn run_task_loop(task: Task, cancel: CancellationToken) {
    info!(task = %task.name, interval = ?task.interval, "task started");

    let mut ticker = tokio::time::interval(task.interval);
    // The first tick completes immediately, giving the immediate first fire.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(task = %task.name, "task stopping");
                return;
            }
            _ = ticker.tick() => {
                execute(&task, &cancel).await;
            }
        }
    }
}

/// Performs a single invocation in its own tokio task so a panic is caught
/// as a JoinError instead of taking down the worker loop.
async fn execute(task: &Task, cancel: &CancellationToken) {
    let start = std::time::Instant::now();
    let fut = (task.run_fn)(cancel.clone());

    match tokio::spawn(fut).await {
        Ok(Ok(())) => {
            debug!(task = %task.name, duration = ?start.elapsed(), "task execution completed");
        }
        Ok(Err(err)) => {
            error!(task = %task.name, error = %err, duration = ?start.elapsed(), "task execution failed");
        }
        Err(join_err) if join_err.is_panic() => {
            error!(task = %task.name, "task execution panicked");
        }
        Err(_) => {
            debug!(task = %task.name, "task execution aborted");
        }
    }
}

/// A queued unit of on-demand work (webhook-triggered refreshes).
pub type Job = BoxFuture<'static, ()>;

/// In-memory FIFO queue for on-demand execution. When the queue is full,
/// new work is dropped with a warning rather than blocking the webhook path.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Job>,
}

/// Consumes queued jobs sequentially until cancelled.
pub struct TaskQueueWorker {
    rx: mpsc::Receiver<Job>,
}

impl TaskQueue {
    pub fn new(buffer: usize) -> (Self, TaskQueueWorker) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, TaskQueueWorker { rx })
    }

    pub fn enqueue(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => debug!("task enqueued"),
            Err(_) => warn!("task queue full, dropping task"),
        }
    }
}

impl TaskQueueWorker {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("task queue started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("task queue stopping");
                    return;
                }
                job = self.rx.recv() => {
                    let Some(job) = job else { return };
                    // Isolate panics from the queue loop.
                    if let Err(err) = tokio::spawn(job).await {
                        if err.is_panic() {
                            error!("queued task panicked");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExporterError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(
        name: &str,
        interval: Duration,
        counter: Arc<AtomicUsize>,
        fail: bool,
    ) -> Task {
        let run_fn: TaskFn = Arc::new(move |_cancel| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(ExporterError::Config("boom".to_string()))
                } else {
                    Ok(())
                }
            })
        });
        Task::new(name, interval, run_fn)
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_fires_immediately_then_on_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.add_task(counting_task(
            "t",
            Duration::from_secs(30),
            counter.clone(),
            false,
        ));

        let cancel = CancellationToken::new();
        scheduler.start(&cancel);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_loop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.add_task(counting_task(
            "failing",
            Duration::from_secs(10),
            counter.clone(),
            true,
        ));

        let cancel = CancellationToken::new();
        scheduler.start(&cancel);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_isolated() {
        let counter = Arc::new(AtomicUsize::new(0));
        let run_fn: TaskFn = {
            let counter = counter.clone();
            Arc::new(move |_cancel| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("collector exploded");
                })
            })
        };

        let mut scheduler = Scheduler::new();
        scheduler.add_task(Task::new("panicky", Duration::from_secs(10), run_fn));

        let cancel = CancellationToken::new();
        scheduler.start(&cancel);

        tokio::time::sleep(Duration::from_secs(25)).await;
        // The loop survived the panics and kept firing.
        assert!(counter.load(Ordering::SeqCst) >= 3);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.add_task(counting_task(
            "t",
            Duration::from_secs(5),
            counter.clone(),
            false,
        ));

        let cancel = CancellationToken::new();
        scheduler.start(&cancel);

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop().await;

        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        scheduler.add_task(counting_task(
            "t",
            Duration::from_secs(5),
            counter.clone(),
            false,
        ));

        let cancel = CancellationToken::new();
        scheduler.start(&cancel);

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        scheduler.stop().await;

        let after_cancel = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn test_queue_runs_enqueued_jobs() {
        let (queue, worker) = TaskQueue::new(8);
        let counter = Arc::new(AtomicUsize::new(0));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        for _ in 0..3 {
            let counter = counter.clone();
            queue.enqueue(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        cancel.cancel();
        let _ = handle.await;
    }
}
