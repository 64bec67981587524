//! The process group: context pool, tag allocator, and worker pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;

use crate::config::GroupOptions;
use crate::error::{CohortError, Result};
use crate::store::{PrefixStore, Store};
use crate::transport::Context;
use crate::types::Rank;
use crate::work::AsyncWork;

pub(crate) struct PoolState {
    pub queue: VecDeque<Arc<AsyncWork>>,
    pub in_progress: Vec<Option<Arc<AsyncWork>>>,
    pub stop: bool,
}

pub(crate) struct PoolShared {
    pub state: Mutex<PoolState>,
    /// Signalled when work is pushed onto the queue.
    pub produce: Condvar,
    /// Signalled when a worker pops work off the queue.
    pub consume: Condvar,
}

impl PoolShared {
    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| CohortError::LockPoisoned("work queue"))
    }
}

/// A group of `size` cooperating processes, of which this is rank `rank`.
///
/// Collectives are submitted from any thread and return a work handle;
/// a pool of worker threads drains the queue. Dropping the group waits for
/// the queue to drain, then joins the workers; it never aborts submitted
/// work.
pub struct ProcessGroup {
    rank: Rank,
    size: usize,
    contexts: Vec<Arc<dyn Context>>,
    collective_counter: AtomicU32,
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    #[cfg(feature = "cuda")]
    cuda: Arc<crate::cuda::CudaRuntime>,
}

impl ProcessGroup {
    /// Connect a context for every configured device and start the worker
    /// pool.
    ///
    /// The same logical device may be listed multiple times; each entry
    /// gets its own context (and its own rendezvous key prefix), which only
    /// affects how collectives are spread for I/O parallelism.
    pub fn new(
        store: Arc<dyn Store>,
        rank: Rank,
        size: usize,
        options: GroupOptions,
    ) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(CohortError::InvalidRank { rank, size });
        }
        if options.devices.is_empty() {
            return Err(CohortError::invalid_argument(
                "process group",
                "no device(s) specified",
            ));
        }
        if options.threads == 0 {
            return Err(CohortError::invalid_argument(
                "process group",
                "worker pool needs at least one thread",
            ));
        }

        let mut contexts = Vec::with_capacity(options.devices.len());
        for (i, device) in options.devices.iter().enumerate() {
            let sub_store = PrefixStore::new(i.to_string(), Arc::clone(&store));
            let context = device.connect_full_mesh(&sub_store, rank, size, options.timeout)?;
            contexts.push(context);
        }
        tracing::debug!(rank, size, contexts = contexts.len(), "process group connected");

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                in_progress: vec![None; options.threads],
                stop: false,
            }),
            produce: Condvar::new(),
            consume: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(options.threads);
        for worker_index in 0..options.threads {
            let shared = Arc::clone(&shared);
            workers.push(std::thread::spawn(move || {
                Self::run_loop(&shared, worker_index);
            }));
        }

        Ok(Self {
            rank,
            size,
            contexts,
            collective_counter: AtomicU32::new(0),
            shared,
            workers,
            #[cfg(feature = "cuda")]
            cuda: Arc::new(crate::cuda::CudaRuntime::new()),
        })
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn cuda_runtime(&self) -> Arc<crate::cuda::CudaRuntime> {
        Arc::clone(&self.cuda)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocate the next collective tag. Monotonic per group; called only
    /// after argument validation so every rank's counter stays in step.
    pub(crate) fn next_tag(&self) -> u32 {
        self.collective_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Contexts are multiplexed by tag. Together with the monotonic tag
    /// counter this guarantees two operations sharing a context also have
    /// distinct tags.
    pub(crate) fn context_for_tag(&self, tag: u32) -> Arc<dyn Context> {
        Arc::clone(&self.contexts[tag as usize % self.contexts.len()])
    }

    pub(crate) fn enqueue(&self, work: Arc<AsyncWork>) -> Result<()> {
        let mut state = self.shared.lock()?;
        state.queue.push_back(work);
        drop(state);
        // Notify after releasing the lock so that the waiter
        // does not immediately block.
        self.shared.produce.notify_one();
        Ok(())
    }

    /// Weak snapshot of everything in flight or queued, for barrier.
    pub(crate) fn snapshot_pending(&self) -> Result<Vec<Weak<AsyncWork>>> {
        let state = self.shared.lock()?;
        let mut pending = Vec::with_capacity(state.in_progress.len() + state.queue.len());
        for slot in &state.in_progress {
            if let Some(work) = slot {
                pending.push(Arc::downgrade(work));
            }
        }
        for work in &state.queue {
            pending.push(Arc::downgrade(work));
        }
        Ok(pending)
    }

    fn run_loop(shared: &PoolShared, worker_index: usize) {
        let mut state = match shared.state.lock() {
            Ok(s) => s,
            Err(_) => return,
        };
        loop {
            if state.queue.is_empty() {
                if state.stop {
                    return;
                }
                state = match shared.produce.wait(state) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                continue;
            }

            let work = match state.queue.pop_front() {
                Some(w) => w,
                None => continue,
            };
            state.in_progress[worker_index] = Some(Arc::clone(&work));
            drop(state);

            // Notify after releasing the lock so that the waiter
            // does not immediately block.
            shared.consume.notify_one();

            work.execute();

            state = match shared.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            state.in_progress[worker_index] = None;
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        // Drain the queue before stopping; dropping the group must not
        // silently discard submitted work.
        if let Ok(mut state) = self.shared.state.lock() {
            while !state.queue.is_empty() {
                state = match self.shared.consume.wait(state) {
                    Ok(s) => s,
                    Err(_) => return,
                };
            }
            state.stop = true;
        }
        self.shared.produce.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("worker thread panicked during shutdown");
            }
        }
        tracing::debug!(rank = self.rank, "process group shut down");
    }
}
