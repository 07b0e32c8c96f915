//! Event-driven dispatcher: drains the repo queue into a bounded worker
//! pool.
//!
//! One main loop blocks on the readiness channel (or shutdown) and
//! forwards ready tasks into a bounded channel of capacity `10 * workers`;
//! when the channel is full the loop blocks on send, which throttles
//! queue-driven work. Workers are peers: each receives a task, runs the
//! processor, and then releases the repo slot *unconditionally* --
//! completeness of the slot is the queue's job, not the worker's, so a
//! failing or panicking processor still frees the repository.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::queue::RepoTaskQueue;
use crate::task::Task;

/// Worker body supplied by the engine.
#[async_trait::async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(&self, task: Task);
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of parallel workers (`review.max_concurrent`).
    pub workers: usize,
    /// Grace period for in-flight work on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Handle to a running dispatcher.
pub struct Dispatcher {
    main_handle: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    shutdown_grace: Duration,
}

impl Dispatcher {
    /// Spawn the main loop and the worker pool.
    ///
    /// `ready_rx` is the receiver side of the queue's readiness channel;
    /// `cancel` is the process-wide shutdown token (child tokens are
    /// handed to workers through the processor's own context).
    pub fn start(
        queue: Arc<RepoTaskQueue>,
        ready_rx: mpsc::Receiver<()>,
        processor: Arc<dyn TaskProcessor>,
        config: DispatcherConfig,
        cancel: CancellationToken,
    ) -> Self {
        let workers = config.workers.max(1);
        let (task_tx, task_rx) = async_channel::bounded::<Task>(workers * 10);

        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = task_rx.clone();
            let queue = Arc::clone(&queue);
            let processor = Arc::clone(&processor);
            worker_handles.push(tokio::spawn(async move {
                while let Ok(task) = rx.recv().await {
                    let repo_url = task.repo_url.clone();
                    let review_id = task.review_id;
                    debug!(worker_id, %review_id, repo_url, "worker picked up task");

                    // A panic must not cross the worker boundary; it is
                    // contained here and the slot still released below.
                    let outcome =
                        std::panic::AssertUnwindSafe(processor.process(task))
                            .catch_unwind()
                            .await;
                    if let Err(panic) = outcome {
                        let msg = panic_message(&panic);
                        error!(worker_id, %review_id, panic = %msg, "task processor panicked");
                    }

                    queue.mark_complete(&repo_url, review_id);
                }
                debug!(worker_id, "worker exiting, task channel closed");
            }));
        }
        drop(task_rx);

        let main_cancel = cancel.clone();
        let main_handle = tokio::spawn(async move {
            let mut ready_rx = ready_rx;
            loop {
                tokio::select! {
                    _ = main_cancel.cancelled() => break,
                    token = ready_rx.recv() => {
                        if token.is_none() {
                            break;
                        }
                        // One token may stand for many enqueues: drain.
                        while let Some(task) = queue.dequeue() {
                            tokio::select! {
                                sent = task_tx.send(task) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                                _ = main_cancel.cancelled() => return,
                            }
                        }
                    }
                }
            }
            // task_tx drops here, closing the channel; workers drain the
            // backlog and exit.
        });

        Self {
            main_handle,
            worker_handles,
            cancel,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Cancel the main loop, close the task channel, and wait for the
    /// workers. In-flight work gets the configured grace period, then is
    /// aborted; anything cut short surfaces to recovery at next boot.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.main_handle.await;

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        for mut handle in self.worker_handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                debug!("worker exceeded shutdown grace period, aborting");
                handle.abort();
            }
        }
        info!("dispatcher shut down");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
