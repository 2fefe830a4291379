// Copyright 2020 Joyent, Inc.

//! Bounded, prioritized executor for inbound Queries.
//!
//! At most `workers` jobs run at once and at most `queue_capacity` more
//! wait for a worker. Jobs are admitted per connection key so a single
//! noisy peer can be capped with `per_key_limit`. Waiting jobs run
//! highest priority first, in submission order within a priority.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

pub type Job = BoxFuture<'static, ()>;

struct QueuedJob {
    priority: i32,
    seq: u64,
    key: String,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct PoolState {
    queue: BinaryHeap<QueuedJob>,
    outstanding: usize,
    per_key: HashMap<String, usize>,
    running_workers: usize,
    next_seq: u64,
    stopped: bool,
}

struct PoolInner {
    workers: usize,
    capacity: usize,
    per_key_limit: Option<usize>,
    state: Mutex<PoolState>,
    space: Notify,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        per_key_limit: Option<usize>,
    ) -> WorkerPool {
        let workers = workers.max(1);
        WorkerPool {
            inner: Arc::new(PoolInner {
                workers,
                capacity: workers + queue_capacity,
                per_key_limit,
                state: Mutex::new(PoolState::default()),
                space: Notify::new(),
            }),
        }
    }

    /// Queues `job` on behalf of `key`, waiting up to `wait` for room.
    /// The job is handed back if it could not be admitted in time or the
    /// pool is stopped. Must be called from within a Tokio runtime.
    pub async fn submit(
        &self,
        key: &str,
        priority: i32,
        mut job: Job,
        wait: Duration,
    ) -> Result<(), Job> {
        let deadline = Instant::now() + wait;
        loop {
            let space = self.inner.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            job = match self.try_submit(key, priority, job) {
                Ok(()) => return Ok(()),
                Err(job) => job,
            };

            if self.inner.state.lock().stopped {
                return Err(job);
            }
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                return Err(job);
            }
        }
    }

    /// Queues `job` only if there is room right now.
    pub fn try_submit(&self, key: &str, priority: i32, job: Job) -> Result<(), Job> {
        let spawn_worker = {
            let mut state = self.inner.state.lock();
            let key_count = state.per_key.get(key).copied().unwrap_or(0);
            let key_full = self
                .inner
                .per_key_limit
                .map_or(false, |limit| key_count >= limit);
            if state.stopped || key_full || state.outstanding >= self.inner.capacity {
                return Err(job);
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.outstanding += 1;
            *state.per_key.entry(key.to_string()).or_insert(0) += 1;
            state.queue.push(QueuedJob {
                priority,
                seq,
                key: key.to_string(),
                job,
            });

            if state.running_workers < self.inner.workers {
                state.running_workers += 1;
                true
            } else {
                false
            }
        };

        if spawn_worker {
            tokio::spawn(run_worker(Arc::clone(&self.inner)));
        }
        Ok(())
    }

    /// Refuses further submissions. Jobs already admitted still run.
    pub fn stop(&self) {
        self.inner.state.lock().stopped = true;
        self.inner.space.notify_waiters();
    }

    /// Jobs admitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    pub fn outstanding_for(&self, key: &str) -> usize {
        self.inner.state.lock().per_key.get(key).copied().unwrap_or(0)
    }
}

async fn run_worker(inner: Arc<PoolInner>) {
    loop {
        let next = {
            let mut state = inner.state.lock();
            match state.queue.pop() {
                Some(next) => next,
                None => {
                    state.running_workers -= 1;
                    return;
                }
            }
        };

        let QueuedJob { key, job, .. } = next;
        // A panicking job must not take its worker slot with it.
        let _ = AssertUnwindSafe(job).catch_unwind().await;

        {
            let mut state = inner.state.lock();
            state.outstanding -= 1;
            let remove = match state.per_key.get_mut(&key) {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            };
            if remove {
                state.per_key.remove(&key);
            }
        }
        inner.space.notify_waiters();
    }
}
