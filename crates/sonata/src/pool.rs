//! Fixed-size worker pool fed by a bounded queue.
//!
//! The queue is guarded by a mutex; a counting semaphore is the only thing
//! workers block on. Submission never blocks: a full queue hands the item back.

use crate::error::{SonataError, SonataResult};
use crate::sync::Semaphore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Returned by [`WorkerPool::submit`] when the queue is at capacity.
#[derive(Debug)]
pub struct QueueFull<T>(pub T);

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Semaphore,
    capacity: usize,
    closing: AtomicBool,
}

pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads named `{name}-{i}`, each running `handler` on dequeued items.
    pub fn new<F>(workers: usize, capacity: usize, name: &str, handler: F) -> SonataResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::with_affinity(workers, capacity, name, false, handler)
    }

    /// Same as [`WorkerPool::new`], optionally pinning worker `i` to core `i % cores`.
    pub fn with_affinity<F>(
        workers: usize,
        capacity: usize,
        name: &str,
        pin: bool,
        handler: F,
    ) -> SonataResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 || capacity == 0 {
            return Err(SonataError::Config(format!(
                "worker pool needs at least one worker and one queue slot (workers={workers}, capacity={capacity})"
            )));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Semaphore::new(0),
            capacity,
            closing: AtomicBool::new(false),
        });
        let handler = Arc::new(handler);
        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(workers),
        };

        for i in 0..workers {
            let shared = pool.shared.clone();
            let handler = handler.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let thread_name = format!("{name}-{i}");

            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, core = id.id, "worker pinned");
                        }
                    }
                    run_worker(&shared, &*handler);
                });

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                // Dropping `pool` stops the workers spawned so far.
                Err(source) => {
                    return Err(SonataError::Spawn {
                        name: thread_name,
                        source,
                    });
                }
            }
        }

        Ok(pool)
    }

    /// Enqueue `item` and wake one worker, or hand it back if the queue is full.
    pub fn submit(&self, item: T) -> Result<(), QueueFull<T>> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                return Err(QueueFull(item));
            }
            queue.push_back(item);
        }
        self.shared.ready.post();
        Ok(())
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

fn run_worker<T, F: Fn(T)>(shared: &Shared<T>, handler: &F) {
    loop {
        shared.ready.wait();
        if shared.closing.load(Ordering::Acquire) {
            break;
        }
        let item = shared.queue.lock().pop_front();
        let Some(item) = item else {
            continue;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(item))).is_err() {
            error!(
                thread = thread::current().name().unwrap_or("worker"),
                "work item panicked"
            );
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        for _ in 0..self.handles.len() {
            self.shared.ready.post();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
