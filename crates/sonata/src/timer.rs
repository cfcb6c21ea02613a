//! Idle-connection deadlines.
//!
//! Timers are keyed by descriptor and kept in an ordered set, so the head of the
//! set is always the next connection to expire. The list is only ever touched by
//! the dispatcher thread.

use std::collections::{BTreeSet, HashMap};
use std::os::unix::io::RawFd;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub expire: Instant,
    pub fd: RawFd,
}

#[derive(Default)]
pub struct TimerList {
    order: BTreeSet<(Instant, RawFd)>,
    by_fd: HashMap<RawFd, Instant>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a timer. An existing timer for the same descriptor is replaced.
    pub fn add(&mut self, timer: Timer) {
        if let Some(old) = self.by_fd.insert(timer.fd, timer.expire) {
            self.order.remove(&(old, timer.fd));
        }
        self.order.insert((timer.expire, timer.fd));
    }

    /// Move the timer of `fd` to `expire`. No-op if `fd` has no timer.
    pub fn adjust(&mut self, fd: RawFd, expire: Instant) {
        let Some(slot) = self.by_fd.get_mut(&fd) else {
            return;
        };
        self.order.remove(&(*slot, fd));
        *slot = expire;
        self.order.insert((expire, fd));
    }

    /// Cancel the timer of `fd`. Returns whether one was present.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        match self.by_fd.remove(&fd) {
            Some(expire) => {
                self.order.remove(&(expire, fd));
                true
            }
            None => false,
        }
    }

    /// Detach and return every timer with `expire <= now`, earliest first.
    pub fn expire_due(&mut self, now: Instant) -> Vec<Timer> {
        let mut due = Vec::new();
        while let Some(&(expire, fd)) = self.order.first() {
            if expire > now {
                break;
            }
            self.order.pop_first();
            self.by_fd.remove(&fd);
            due.push(Timer { expire, fd });
        }
        due
    }

    pub fn get(&self, fd: RawFd) -> Option<Instant> {
        self.by_fd.get(&fd).copied()
    }

    pub fn len(&self) -> usize {
        self.by_fd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fd.is_empty()
    }

    /// Timers in expiration order.
    pub fn iter(&self) -> impl Iterator<Item = Timer> + '_ {
        self.order.iter().map(|&(expire, fd)| Timer { expire, fd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sorted(list: &TimerList) -> bool {
        let v: Vec<_> = list.iter().map(|t| t.expire).collect();
        v.windows(2).all(|w| w[0] <= w[1])
    }

    #[test]
    fn test_add_keeps_ascending_order() {
        let base = Instant::now();
        let mut list = TimerList::new();
        for (fd, secs) in [(5, 30u64), (6, 10), (7, 20), (8, 10)] {
            list.add(Timer { expire: base + Duration::from_secs(secs), fd });
            assert!(sorted(&list));
        }
        let fds: Vec<_> = list.iter().map(|t| t.fd).collect();
        assert_eq!(fds, vec![6, 8, 7, 5]);
    }

    #[test]
    fn test_adjust_moves_timer_later() {
        let base = Instant::now();
        let mut list = TimerList::new();
        list.add(Timer { expire: base + Duration::from_secs(1), fd: 1 });
        list.add(Timer { expire: base + Duration::from_secs(2), fd: 2 });
        list.adjust(1, base + Duration::from_secs(3));
        assert!(sorted(&list));
        assert_eq!(list.iter().next().unwrap().fd, 2);
        assert_eq!(list.len(), 2);

        // unknown fd is ignored
        list.adjust(99, base);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_twice_is_noop() {
        let mut list = TimerList::new();
        list.add(Timer { expire: Instant::now(), fd: 3 });
        assert!(list.remove(3));
        assert!(!list.remove(3));
        assert!(list.is_empty());
    }

    #[test]
    fn test_add_same_fd_replaces() {
        let base = Instant::now();
        let mut list = TimerList::new();
        list.add(Timer { expire: base, fd: 4 });
        list.add(Timer { expire: base + Duration::from_secs(9), fd: 4 });
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().count(), 1);
        assert_eq!(list.get(4), Some(base + Duration::from_secs(9)));
    }

    #[test]
    fn test_expire_due_returns_exact_prefix() {
        let base = Instant::now();
        let mut list = TimerList::new();
        for fd in 0..10 {
            list.add(Timer { expire: base + Duration::from_secs((fd * 7 % 10) as u64), fd });
        }
        list.remove(3);
        list.adjust(0, base + Duration::from_secs(12));

        let now = base + Duration::from_secs(5);
        let due = list.expire_due(now);
        assert!(due.iter().all(|t| t.expire <= now));
        assert!(due.windows(2).all(|w| w[0].expire <= w[1].expire));
        assert!(list.iter().all(|t| t.expire > now));
        assert_eq!(due.len() + list.len(), 9);

        // fd 0 moved to +12, fd 3 removed
        let fds: Vec<_> = due.iter().map(|t| t.fd).collect();
        assert_eq!(fds, vec![6, 9, 2, 5]);
        assert!(list.expire_due(now).is_empty());
    }
}
