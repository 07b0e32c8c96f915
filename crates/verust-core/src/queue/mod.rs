//! Per-repository task queue.
//!
//! Two maps under one lock: `slots` (repo URL -> slot with a FIFO of
//! pending tasks plus the running marker) and `tasks` (review id -> task,
//! for duplicate detection and lookup). The queue enforces at most one
//! running task per repository at any instant.
//!
//! Readiness is a *signal*, not a count: producers do a non-blocking send
//! into a small buffered channel and drop the token when the buffer is
//! full, so one token can stand for many enqueue events. Consumers must
//! drain via repeated [`RepoTaskQueue::dequeue`] until it returns `None`.
//!
//! Slot invariants:
//! - `running` implies `current_task_id` is set.
//! - `dequeued` is only meaningful while `running`: it marks a recovered
//!   running task as already handed out, so a single drain loop cannot
//!   return it twice. `mark_complete` resets it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::task::Task;

/// Capacity of the readiness channel. Producers drop tokens when full.
const READY_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct RepoSlot {
    fifo: VecDeque<Task>,
    running: bool,
    current_task_id: Option<Uuid>,
    dequeued: bool,
}

impl RepoSlot {
    fn is_empty(&self) -> bool {
        !self.running && self.fifo.is_empty()
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    // BTreeMap so the dequeue tie-break between eligible repos is
    // deterministic (lexicographic by URL). Not a fairness contract.
    slots: BTreeMap<String, RepoSlot>,
    tasks: HashMap<Uuid, Task>,
}

impl QueueInner {
    fn contains(&self, review_id: Uuid) -> bool {
        self.tasks.contains_key(&review_id)
            || self
                .slots
                .values()
                .any(|slot| slot.current_task_id == Some(review_id))
    }
}

/// Per-repo detail for [`QueueStats`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RepoQueueDetail {
    pub repo_url: String,
    pub pending: usize,
    pub running: bool,
    pub current_task_id: Option<Uuid>,
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending_total: usize,
    pub running_repos: usize,
    pub repos: Vec<RepoQueueDetail>,
}

/// In-memory per-repository FIFO queue with at-most-one-running per repo.
#[derive(Debug)]
pub struct RepoTaskQueue {
    inner: Mutex<QueueInner>,
    ready_tx: mpsc::Sender<()>,
}

impl RepoTaskQueue {
    /// Create a queue and the readiness receiver the dispatcher blocks on.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (ready_tx, ready_rx) = mpsc::channel(READY_CAPACITY);
        (
            Self {
                inner: Mutex::new(QueueInner::default()),
                ready_tx,
            },
            ready_rx,
        )
    }

    /// Non-blocking readiness notification. Dropping the token when the
    /// buffer is full is correct: at least one token remains pending, and
    /// consumers drain until `dequeue` returns `None`.
    fn notify_ready(&self) {
        let _ = self.ready_tx.try_send(());
    }

    /// Append a task to its repo's FIFO.
    ///
    /// Returns `false` (leaving the queue unchanged) when a task for the
    /// same review is already present, pending or running.
    pub fn enqueue(&self, task: Task) -> bool {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.contains(task.review_id) {
                return false;
            }
            let review_id = task.review_id;
            let slot = inner.slots.entry(task.repo_url.clone()).or_default();
            slot.fifo.push_back(task.clone());
            inner.tasks.insert(review_id, task);
        }
        self.notify_ready();
        true
    }

    /// Install a recovered task directly into the running position of its
    /// repo slot, without touching the FIFO. Recovery only.
    ///
    /// The task is also recorded in the id map with `dequeued = false`, so
    /// the recovery pass of [`Self::dequeue`] hands it out exactly once
    /// for re-processing.
    pub fn enqueue_as_running(&self, task: Task) -> bool {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.contains(task.review_id) {
                return false;
            }
            let review_id = task.review_id;
            let slot = inner.slots.entry(task.repo_url.clone()).or_default();
            if slot.running {
                warn!(
                    repo_url = %task.repo_url,
                    review_id = %review_id,
                    "refusing to recover a second running task for repo"
                );
                return false;
            }
            slot.running = true;
            slot.current_task_id = Some(review_id);
            slot.dequeued = false;
            inner.tasks.insert(review_id, task);
        }
        self.notify_ready();
        true
    }

    /// Take the next ready task, if any.
    ///
    /// Recovery pass first: a slot that is `running` with an un-dequeued
    /// current task still present in the id map was installed by recovery
    /// and needs re-processing. Then the normal pass: any idle slot with a
    /// non-empty FIFO.
    pub fn dequeue(&self) -> Option<Task> {
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        // Split the guard so slots and tasks can be borrowed independently.
        let inner = &mut *guard;

        // Recovery pass.
        for slot in inner.slots.values_mut() {
            if slot.running && !slot.dequeued {
                if let Some(id) = slot.current_task_id {
                    if inner.tasks.contains_key(&id) {
                        slot.dequeued = true;
                        return inner.tasks.remove(&id);
                    }
                }
            }
        }

        // Normal pass.
        for slot in inner.slots.values_mut() {
            if !slot.running {
                if let Some(task) = slot.fifo.pop_front() {
                    slot.running = true;
                    slot.current_task_id = Some(task.review_id);
                    slot.dequeued = true;
                    inner.tasks.remove(&task.review_id);
                    return Some(task);
                }
            }
        }

        None
    }

    /// Release a repo slot after its task finished (whatever the outcome).
    ///
    /// Total: unknown repos or mismatched ids are logged, never an error —
    /// a leaked running flag would wedge the repo forever, which is worse
    /// than a noisy log line.
    pub fn mark_complete(&self, repo_url: &str, review_id: Uuid) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            match inner.slots.get_mut(repo_url) {
                None => {
                    warn!(repo_url, %review_id, "mark_complete for unknown repo slot");
                }
                Some(slot) => {
                    if slot.current_task_id != Some(review_id) {
                        warn!(
                            repo_url,
                            %review_id,
                            current = ?slot.current_task_id,
                            "mark_complete id does not match running task"
                        );
                    }
                    slot.running = false;
                    slot.current_task_id = None;
                    slot.dequeued = false;
                    if slot.fifo.is_empty() {
                        inner.slots.remove(repo_url);
                    }
                }
            }
            inner.tasks.remove(&review_id);
        }
        self.notify_ready();
    }

    /// Cancel a task whether pending or running.
    ///
    /// A pending task is spliced out of its FIFO; a running one has its
    /// slot cleared (the worker keeps executing until it observes the
    /// cancelled status, but the repo can already admit the next task).
    /// Returns whether anything was removed.
    pub fn remove_task(&self, review_id: Uuid) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");

            if let Some(task) = inner.tasks.remove(&review_id) {
                let emptied = if let Some(slot) = inner.slots.get_mut(&task.repo_url) {
                    slot.fifo.retain(|t| t.review_id != review_id);
                    slot.is_empty()
                } else {
                    false
                };
                if emptied {
                    inner.slots.remove(&task.repo_url);
                }
                true
            } else {
                let mut cleared = None;
                for (repo_url, slot) in inner.slots.iter_mut() {
                    if slot.current_task_id == Some(review_id) {
                        slot.running = false;
                        slot.current_task_id = None;
                        slot.dequeued = false;
                        cleared = Some((repo_url.clone(), slot.fifo.is_empty()));
                        break;
                    }
                }
                match cleared {
                    Some((repo_url, empty)) => {
                        if empty {
                            inner.slots.remove(&repo_url);
                        }
                        true
                    }
                    None => false,
                }
            }
        };
        if removed {
            self.notify_ready();
        }
        removed
    }

    /// True when the review has a task in the queue, pending or running.
    pub fn has_task(&self, review_id: Uuid) -> bool {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.contains(review_id)
    }

    /// Aggregate pending count, running-repo count and per-repo detail.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut stats = QueueStats::default();
        for (repo_url, slot) in &inner.slots {
            stats.pending_total += slot.fifo.len();
            if slot.running {
                stats.running_repos += 1;
            }
            stats.repos.push(RepoQueueDetail {
                repo_url: repo_url.clone(),
                pending: slot.fifo.len(),
                running: slot.running,
                current_task_id: slot.current_task_id,
            });
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(repo: &str) -> Task {
        Task::new(Uuid::now_v7(), repo)
    }

    fn queue() -> (RepoTaskQueue, mpsc::Receiver<()>) {
        RepoTaskQueue::new()
    }

    #[test]
    fn enqueue_then_dequeue_returns_task() {
        let (q, _rx) = queue();
        let t = task("https://example.com/a/b");
        assert!(q.enqueue(t.clone()));
        assert_eq!(q.dequeue(), Some(t));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn enqueue_is_idempotent_per_review() {
        let (q, _rx) = queue();
        let t = task("https://example.com/a/b");
        assert!(q.enqueue(t.clone()));
        assert!(!q.enqueue(t.clone()), "second enqueue must be rejected");

        let stats = q.stats();
        assert_eq!(stats.pending_total, 1);
    }

    #[test]
    fn enqueue_rejected_while_running() {
        let (q, _rx) = queue();
        let t = task("https://example.com/a/b");
        q.enqueue(t.clone());
        q.dequeue().unwrap();
        // The task is out of the id map but occupies the running slot.
        assert!(!q.enqueue(t));
    }

    #[test]
    fn same_repo_is_serialized_fifo() {
        let (q, _rx) = queue();
        let t1 = task("https://example.com/a/b");
        let t2 = task("https://example.com/a/b");
        let t3 = task("https://example.com/a/b");
        q.enqueue(t1.clone());
        q.enqueue(t2.clone());
        q.enqueue(t3.clone());

        assert_eq!(q.dequeue(), Some(t1.clone()));
        // Repo busy: nothing else is eligible.
        assert_eq!(q.dequeue(), None);

        q.mark_complete(&t1.repo_url, t1.review_id);
        assert_eq!(q.dequeue(), Some(t2.clone()));
        assert_eq!(q.dequeue(), None);

        q.mark_complete(&t2.repo_url, t2.review_id);
        assert_eq!(q.dequeue(), Some(t3));
    }

    #[test]
    fn different_repos_run_in_parallel() {
        let (q, _rx) = queue();
        q.enqueue(task("https://example.com/a/a"));
        q.enqueue(task("https://example.com/b/b"));
        q.enqueue(task("https://example.com/c/c"));

        assert!(q.dequeue().is_some());
        assert!(q.dequeue().is_some());
        assert!(q.dequeue().is_some());
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.stats().running_repos, 3);
    }

    #[test]
    fn dequeue_tie_break_is_lexicographic() {
        let (q, _rx) = queue();
        let tb = task("https://example.com/b/b");
        let ta = task("https://example.com/a/a");
        q.enqueue(tb.clone());
        q.enqueue(ta.clone());

        assert_eq!(q.dequeue(), Some(ta));
        assert_eq!(q.dequeue(), Some(tb));
    }

    #[test]
    fn mark_complete_unknown_repo_is_noisy_noop() {
        let (q, _rx) = queue();
        q.mark_complete("https://example.com/no/such", Uuid::now_v7());
        assert_eq!(q.stats().pending_total, 0);
    }

    #[test]
    fn mark_complete_frees_slot_and_drops_empty_repo() {
        let (q, _rx) = queue();
        let t = task("https://example.com/a/b");
        q.enqueue(t.clone());
        q.dequeue().unwrap();
        q.mark_complete(&t.repo_url, t.review_id);

        let stats = q.stats();
        assert!(stats.repos.is_empty(), "empty slot must be removed");
        assert!(!q.has_task(t.review_id));
    }

    #[test]
    fn remove_pending_task_splices_fifo() {
        let (q, _rx) = queue();
        let t1 = task("https://example.com/a/b");
        let t2 = task("https://example.com/a/b");
        let t3 = task("https://example.com/a/b");
        q.enqueue(t1.clone());
        q.enqueue(t2.clone());
        q.enqueue(t3.clone());

        assert!(q.remove_task(t2.review_id));
        assert!(!q.remove_task(t2.review_id));

        assert_eq!(q.dequeue(), Some(t1.clone()));
        q.mark_complete(&t1.repo_url, t1.review_id);
        assert_eq!(q.dequeue(), Some(t3));
    }

    #[test]
    fn remove_running_task_frees_slot() {
        let (q, _rx) = queue();
        let t1 = task("https://example.com/a/b");
        let t2 = task("https://example.com/a/b");
        q.enqueue(t1.clone());
        q.enqueue(t2.clone());
        q.dequeue().unwrap();

        assert!(q.remove_task(t1.review_id));
        // Slot freed: the next task dequeues immediately.
        assert_eq!(q.dequeue(), Some(t2));
    }

    #[test]
    fn has_task_covers_pending_and_running() {
        let (q, _rx) = queue();
        let t = task("https://example.com/a/b");
        q.enqueue(t.clone());
        assert!(q.has_task(t.review_id));

        q.dequeue().unwrap();
        assert!(q.has_task(t.review_id), "running tasks still count");

        q.mark_complete(&t.repo_url, t.review_id);
        assert!(!q.has_task(t.review_id));
    }

    #[test]
    fn recovery_task_is_returned_exactly_once() {
        let (q, _rx) = queue();
        let t = task("https://example.com/a/b");
        assert!(q.enqueue_as_running(t.clone()));
        assert!(q.has_task(t.review_id));

        assert_eq!(q.dequeue(), Some(t.clone()));
        assert_eq!(q.dequeue(), None, "recovery pass must not repeat");

        // Pending work behind the recovered task waits for mark_complete.
        let t2 = task("https://example.com/a/b");
        q.enqueue(t2.clone());
        assert_eq!(q.dequeue(), None);
        q.mark_complete(&t.repo_url, t.review_id);
        assert_eq!(q.dequeue(), Some(t2));
    }

    #[test]
    fn enqueue_as_running_rejects_duplicate_and_busy_slot() {
        let (q, _rx) = queue();
        let t = task("https://example.com/a/b");
        assert!(q.enqueue_as_running(t.clone()));
        assert!(!q.enqueue_as_running(t.clone()));

        let other = task("https://example.com/a/b");
        assert!(
            !q.enqueue_as_running(other),
            "second running task for the same repo must be refused"
        );
    }

    #[test]
    fn readiness_tokens_are_dropped_when_full() {
        let (q, mut rx) = queue();
        // Far more enqueues than the channel capacity.
        for _ in 0..(READY_CAPACITY * 3) {
            q.enqueue(task("https://example.com/a/b"));
        }
        // Drain whatever tokens exist; there must be at least one and at
        // most READY_CAPACITY.
        let mut tokens = 0;
        while rx.try_recv().is_ok() {
            tokens += 1;
        }
        assert!(tokens >= 1);
        assert!(tokens <= READY_CAPACITY);
    }

    #[test]
    fn stats_reports_pending_and_running() {
        let (q, _rx) = queue();
        let t1 = task("https://example.com/a/a");
        q.enqueue(t1.clone());
        q.enqueue(task("https://example.com/a/a"));
        q.enqueue(task("https://example.com/b/b"));
        q.dequeue(); // runs a/a

        let stats = q.stats();
        assert_eq!(stats.pending_total, 2);
        assert_eq!(stats.running_repos, 1);
        assert_eq!(stats.repos.len(), 2);
        let a = stats
            .repos
            .iter()
            .find(|r| r.repo_url.ends_with("/a/a"))
            .unwrap();
        assert!(a.running);
        assert_eq!(a.current_task_id, Some(t1.review_id));
    }
}
