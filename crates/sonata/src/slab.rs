// src/slab.rs
use crate::config::TriggerMode;
use crate::http::HttpConn;
use crate::syscalls::Epoll;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Connection arena indexed by descriptor.
///
/// Slots are allocated once up front; each carries its own lock so a worker
/// and the dispatcher never touch the same connection at the same time. Every
/// open stamps a fresh generation, which work items carry to detect a slot
/// that was closed and reused while they sat in the queue.
pub struct ConnTable {
    slots: Box<[Mutex<HttpConn>]>,
    live: AtomicUsize,
    next_generation: AtomicU64,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(HttpConn::empty()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            live: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
        }
    }

    #[inline(always)]
    pub fn get(&self, fd: RawFd) -> Option<&Mutex<HttpConn>> {
        usize::try_from(fd).ok().and_then(|idx| self.slots.get(idx))
    }

    /// Open the slot for `fd`. `None` if the descriptor falls outside the table.
    pub fn open(&self, fd: RawFd, addr: SocketAddr, trigger: TriggerMode) -> Option<u64> {
        let slot = self.get(fd)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut conn = slot.lock();
        if !conn.is_open() {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        conn.open(fd, addr, generation, trigger);
        Some(generation)
    }

    /// Close the connection in `fd`'s slot. False if it was not open.
    pub fn close(&self, fd: RawFd, epoll: &Epoll) -> bool {
        let Some(slot) = self.get(fd) else {
            return false;
        };
        let closed = slot.lock().close(epoll);
        if closed {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        closed
    }

    /// Descriptors of every open connection.
    pub fn open_fds(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let conn = slot.lock();
                conn.is_open().then(|| conn.fd())
            })
            .collect()
    }

    #[inline(always)]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
