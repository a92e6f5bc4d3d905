//! Single-worker FIFO job queue.
//!
//! Every part-level write of one store instance goes through a
//! [`TaskQueue`], so operations on a thread never interleave. Jobs run
//! strictly in submission order on one background worker. A job that fails
//! (or panics) is logged and the worker moves on to the next one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};

/// Boxed unit of work accepted by the queue.
pub type Job = Pin<Box<dyn Future<Output = StoreResult<()>> + Send>>;

enum Command {
    Run { label: &'static str, job: Job },
    Barrier(oneshot::Sender<()>),
}

/// Cheaply cloneable handle to a queue worker.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Command>,
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    closed: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl TaskQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(QueueInner {
            name: name.into(),
            closed: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            info!(queue = %worker.name, "queue worker started");
            Self::worker_loop(worker.as_ref(), rx).await;
            info!(queue = %worker.name, "queue worker stopped");
        });
        Self { tx, inner }
    }

    async fn worker_loop(inner: &QueueInner, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Run { label, job } => {
                    // A separate task keeps a panicking job from taking the
                    // worker down with it.
                    match tokio::spawn(job).await {
                        Ok(Ok(())) => {
                            inner.completed.fetch_add(1, Ordering::Relaxed);
                            debug!(queue = %inner.name, job = label, "job completed");
                        }
                        Ok(Err(StoreError::StaleScope(scope))) => {
                            inner.completed.fetch_add(1, Ordering::Relaxed);
                            debug!(queue = %inner.name, job = label, %scope, "job discarded for stale scope");
                        }
                        Ok(Err(err)) => {
                            inner.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(queue = %inner.name, job = label, %err, "job failed");
                        }
                        Err(join_err) => {
                            inner.failed.fetch_add(1, Ordering::Relaxed);
                            error!(queue = %inner.name, job = label, %join_err, "job panicked");
                        }
                    }
                }
                Command::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Submit a job behind every job submitted before it.
    ///
    /// Returns `false` when the queue was closed; the job is dropped.
    pub fn enqueue<F>(&self, label: &'static str, job: F) -> bool
    where
        F: Future<Output = StoreResult<()>> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!(queue = %self.inner.name, job = label, "queue closed, job dropped");
            return false;
        }
        self.tx
            .send(Command::Run {
                label,
                job: Box::pin(job),
            })
            .is_ok()
    }

    /// Resolve once every job enqueued before this call has run.
    pub async fn drain(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Refuse further jobs. Already queued jobs still run.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let queue = TaskQueue::start("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5u64 {
            let seen = Arc::clone(&seen);
            queue.enqueue("push", async move {
                // Earlier jobs sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }
        queue.drain().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.completed(), 5);
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_worker() {
        let queue = TaskQueue::start("test");
        let ran = Arc::new(AtomicBool::new(false));

        queue.enqueue("fail", async { Err(StoreError::Backend("boom".into())) });
        let explode = Arc::new(AtomicBool::new(true));
        queue.enqueue("panic", async move {
            if explode.load(Ordering::SeqCst) {
                panic!("job blew up");
            }
            Ok(())
        });
        let flag = Arc::clone(&ran);
        queue.enqueue("after", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        queue.drain().await;

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(queue.failed(), 2);
        assert_eq!(queue.completed(), 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects_new_jobs() {
        let queue = TaskQueue::start("test");
        queue.close();
        assert!(!queue.enqueue("late", async { Ok(()) }));
        queue.drain().await;
        assert_eq!(queue.completed(), 0);
    }
}
