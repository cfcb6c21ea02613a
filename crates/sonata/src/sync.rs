//! Blocking primitives shared by the worker pool, the resource pool and the
//! Reactor hand-off.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

/// Single-use channel carrying one result back to a waiting thread.
///
/// If the sending side is dropped without sending, `recv` fails instead of
/// blocking forever.
pub fn completion<T>() -> (Sender<T>, Receiver<T>) {
    channel::bounded(1)
}

/// Counting semaphore.
///
/// `wait` blocks while the count is zero, `post` increments it and wakes one
/// waiter.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }
}
