// src/dispatcher.rs
use crate::config::{DispatchMode, ServerConfig, TriggerMode};
use crate::error::SonataResult;
use crate::http::Outcome;
use crate::http::response::busy_response;
use crate::pool::{QueueFull, WorkerPool};
use crate::server::Engine;
use crate::signal::Notifier;
use crate::sync::completion;
use crate::syscalls::{self, EV_HANGUP, EV_IN, EV_OUT, epoll_event};
use crate::timer::{Timer, TimerList};
use crossbeam::channel::Sender;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const MAX_EVENTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Reactor: read from the socket, then parse and respond.
    Read,
    /// Reactor: send the pending response.
    Write,
    /// Proactor: parse what the dispatcher already read.
    Process,
}

/// One unit of work for the pool.
pub struct WorkItem {
    pub fd: RawFd,
    pub generation: u64,
    pub op: Op,
    /// Present only under Reactor dispatch; the dispatcher blocks on it.
    pub reply: Option<Sender<Outcome>>,
}

/// Worker-side entry point.
pub fn handle_work(engine: &Engine, item: WorkItem) {
    let outcome = run_item(engine, item.fd, item.generation, item.op);
    if let Some(reply) = item.reply {
        let _ = reply.send(outcome);
    }
}

fn run_item(engine: &Engine, fd: RawFd, generation: u64, op: Op) -> Outcome {
    let Some(slot) = engine.conns.get(fd) else {
        return Outcome::Teardown;
    };
    let mut conn = slot.lock();
    if !conn.is_current(generation) {
        debug!(fd, generation, "stale work item dropped");
        return Outcome::Keep;
    }

    match op {
        Op::Read => {
            if !conn.read_once() {
                return Outcome::Teardown;
            }
            conn.process(engine)
        }
        Op::Write => {
            if conn.write(engine) {
                Outcome::Keep
            } else {
                Outcome::Teardown
            }
        }
        Op::Process => {
            let outcome = conn.process(engine);
            if outcome == Outcome::Teardown && conn.hang_up(&engine.epoll) == Outcome::Teardown {
                warn!(fd, "hangup not signalled, connection waits for the idle sweep");
            }
            outcome
        }
    }
}

/// The event loop. Owns the listener, the notification channel and the timer
/// list; the timer list and connection teardown are only touched here.
pub struct Dispatcher {
    engine: Arc<Engine>,
    pool: Option<WorkerPool<WorkItem>>,
    listener: OwnedFd,
    notifier: Notifier,
    timers: TimerList,
    listen_trigger: TriggerMode,
    dispatch: DispatchMode,
    idle_timeout: Duration,
    max_connections: usize,
    busy: Vec<u8>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<Engine>,
        pool: WorkerPool<WorkItem>,
        listener: OwnedFd,
        notifier: Notifier,
        config: &ServerConfig,
    ) -> Self {
        Self {
            engine,
            pool: Some(pool),
            listener,
            notifier,
            timers: TimerList::new(),
            listen_trigger: config.listen_trigger,
            dispatch: config.dispatch,
            idle_timeout: config.idle_timeout(),
            max_connections: config.max_connections,
            busy: busy_response(),
        }
    }

    /// Run until a shutdown notification arrives.
    pub fn run(&mut self) -> SonataResult<()> {
        let listen_fd = self.listener.as_raw_fd();
        let notify_fd = self.notifier.fd();
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        info!(mode = ?self.dispatch, "dispatcher entering event loop");
        let result = loop {
            let n = match self.engine.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll wait failed");
                    break Err(e);
                }
            };

            let mut tick = false;
            let mut stop = false;
            for event in events[..n].iter().copied() {
                let fd = event.u64 as RawFd;
                let flags = event.events;

                if fd == listen_fd {
                    self.accept(listen_fd);
                } else if fd == notify_fd {
                    let pending = self.notifier.drain();
                    tick |= pending.tick;
                    stop |= pending.shutdown;
                } else if flags & EV_HANGUP != 0 {
                    debug!(fd, flags, "peer hung up");
                    self.teardown(fd);
                } else if flags & EV_IN != 0 {
                    self.on_readable(fd);
                } else if flags & EV_OUT != 0 {
                    self.on_writable(fd);
                }
            }

            if tick {
                self.expire_idle();
            }
            if stop {
                break Ok(());
            }
        };

        self.shutdown();
        result
    }

    fn accept(&mut self, listen_fd: RawFd) {
        loop {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some((fd, addr))) => self.admit(fd, addr),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
            if self.listen_trigger == TriggerMode::Level {
                break;
            }
        }
    }

    fn admit(&mut self, fd: RawFd, addr: SocketAddr) {
        let engine = &self.engine;
        if engine.conns.live() >= self.max_connections || engine.conns.get(fd).is_none() {
            warn!(fd, peer = %addr, live = engine.conns.live(), "server busy, connection refused");
            syscalls::send_best_effort(fd, &self.busy);
            syscalls::close_fd(fd);
            engine.metrics.inc_rejected();
            return;
        }

        if engine.conns.open(fd, addr, engine.conn_trigger).is_none() {
            syscalls::close_fd(fd);
            return;
        }
        if let Err(e) = engine.epoll.add_connection(fd, engine.conn_trigger) {
            error!(fd, error = %e, "cannot register connection");
            engine.conns.close(fd, &engine.epoll);
            return;
        }
        self.timers.add(Timer {
            expire: Instant::now() + self.idle_timeout,
            fd,
        });
        debug!(fd, peer = %addr, "connection accepted");
    }

    /// Close `fd`'s connection and cancel its timer. Safe on an already closed slot.
    fn teardown(&mut self, fd: RawFd) {
        self.timers.remove(fd);
        self.close_conn(fd);
    }

    fn close_conn(&self, fd: RawFd) {
        self.engine.conns.close(fd, &self.engine.epoll);
    }

    fn touch(&mut self, fd: RawFd) {
        self.timers.adjust(fd, Instant::now() + self.idle_timeout);
    }

    fn current_generation(&self, fd: RawFd) -> Option<u64> {
        let conn = self.engine.conns.get(fd)?.lock();
        conn.is_open().then(|| conn.generation())
    }

    fn on_readable(&mut self, fd: RawFd) {
        let Some(generation) = self.current_generation(fd) else {
            return;
        };
        match self.dispatch {
            DispatchMode::Reactor => {
                self.touch(fd);
                self.hand_off(fd, generation, Op::Read);
            }
            DispatchMode::Proactor => {
                let read = match self.engine.conns.get(fd) {
                    Some(slot) => slot.lock().read_once(),
                    None => false,
                };
                if !read {
                    self.teardown(fd);
                    return;
                }
                self.touch(fd);
                self.submit(WorkItem {
                    fd,
                    generation,
                    op: Op::Process,
                    reply: None,
                });
            }
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        let Some(generation) = self.current_generation(fd) else {
            return;
        };
        match self.dispatch {
            DispatchMode::Reactor => {
                self.touch(fd);
                self.hand_off(fd, generation, Op::Write);
            }
            DispatchMode::Proactor => {
                let written = match self.engine.conns.get(fd) {
                    Some(slot) => slot.lock().write(&self.engine),
                    None => false,
                };
                if written {
                    self.touch(fd);
                } else {
                    self.teardown(fd);
                }
            }
        }
    }

    /// Queue an item; a full queue costs the connection.
    fn submit(&mut self, item: WorkItem) -> bool {
        let Some(pool) = &self.pool else {
            return false;
        };
        match pool.submit(item) {
            Ok(()) => true,
            Err(QueueFull(item)) => {
                warn!(fd = item.fd, queued = pool.queued(), "work queue full, dropping connection");
                self.engine.metrics.inc_rejected();
                self.teardown(item.fd);
                false
            }
        }
    }

    /// Reactor hand-off: submit and wait for the worker's verdict.
    fn hand_off(&mut self, fd: RawFd, generation: u64, op: Op) {
        let (reply, done) = completion();
        let item = WorkItem {
            fd,
            generation,
            op,
            reply: Some(reply),
        };
        if !self.submit(item) {
            return;
        }
        match done.recv() {
            Ok(Outcome::Keep) => {}
            Ok(Outcome::Teardown) => self.teardown(fd),
            Err(_) => {
                error!(fd, ?op, "worker dropped its reply, forcing teardown");
                self.teardown(fd);
            }
        }
    }

    fn expire_idle(&mut self) {
        for timer in self.timers.expire_due(Instant::now()) {
            info!(fd = timer.fd, "idle connection evicted");
            self.close_conn(timer.fd);
        }
        let stats = self.engine.metrics.snapshot();
        info!(
            live = self.engine.conns.live(),
            requests = stats.requests,
            bytes_sent = stats.bytes_sent,
            rejected = stats.rejected,
            queued = self.pool.as_ref().map_or(0, |p| p.queued()),
            "tick"
        );
    }

    fn shutdown(&mut self) {
        // Workers finish what they hold before connections go away.
        drop(self.pool.take());

        let fds = self.engine.conns.open_fds();
        info!(live = fds.len(), "dispatcher shutting down");
        for fd in fds {
            self.teardown(fd);
        }
        let _ = self.engine.epoll.delete(self.listener.as_raw_fd());
        let _ = self.engine.epoll.delete(self.notifier.fd());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::path::Path;

    fn engine(root: &Path) -> Engine {
        std::fs::write(root.join("index.html"), b"<h1>sonata</h1>").unwrap();
        std::fs::write(root.join("users.txt"), b"alice:secret\n").unwrap();
        let config = ServerConfig::new()
            .doc_root(root)
            .users_file(root.join("users.txt"))
            .store_handles(1)
            .max_fd(1024);
        Engine::new(&config).unwrap()
    }

    /// Open a slot for one end of a socket pair; `register` adds it to epoll.
    fn open(engine: &Engine, register: bool) -> (RawFd, u64, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let fd = ours.into_raw_fd();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1));
        let generation = engine.conns.open(fd, addr, TriggerMode::Level).unwrap();
        if register {
            engine.epoll.add_connection(fd, TriggerMode::Level).unwrap();
        }
        (fd, generation, peer)
    }

    #[test]
    fn test_failed_process_shuts_the_socket_down() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        // Not registered: the write re-arm fails, so processing cannot complete.
        let (fd, generation, mut peer) = open(&engine, false);

        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(engine.conns.get(fd).unwrap().lock().read_once());
        assert_eq!(run_item(&engine, fd, generation, Op::Process), Outcome::Teardown);

        // The client sees the connection end instead of waiting on it.
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        assert!(engine.conns.close(fd, &engine.epoll));
        assert_eq!(engine.conns.live(), 0);
    }

    #[test]
    fn test_hang_up_is_reported_as_hangup_event() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let (fd, _, _peer) = open(&engine, true);

        let outcome = engine.conns.get(fd).unwrap().lock().hang_up(&engine.epoll);
        assert_eq!(outcome, Outcome::Keep);

        let mut events = vec![epoll_event { events: 0, u64: 0 }; 4];
        let n = engine.epoll.wait(&mut events, 2000).unwrap();
        assert_eq!(n, 1);
        let event = events[0];
        let (token, flags) = (event.u64, event.events);
        assert_eq!(token as RawFd, fd);
        assert_ne!(flags & EV_HANGUP, 0, "the event loop tears down on this flag");

        assert!(engine.conns.close(fd, &engine.epoll));
    }

    #[test]
    fn test_stale_work_item_is_ignored() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let (fd, generation, _peer) = open(&engine, true);

        assert_eq!(run_item(&engine, fd, generation + 1, Op::Write), Outcome::Keep);
        assert!(engine.conns.get(fd).unwrap().lock().is_current(generation));
        assert_eq!(run_item(&engine, 2000, 1, Op::Read), Outcome::Teardown);

        assert!(engine.conns.close(fd, &engine.epoll));
    }
}
