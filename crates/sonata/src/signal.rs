//! Notification channel into the dispatcher.
//!
//! Ticks and shutdown requests arrive as tagged bytes on one end of a socket
//! pair whose other end is registered with the dispatcher's epoll set, so the
//! event loop wakes for them like for any other descriptor.

use crate::error::{SonataError, SonataResult};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Notification {
    Tick = b't',
    Shutdown = b's',
}

/// What a drain of the channel found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub tick: bool,
    pub shutdown: bool,
}

/// Receiving end, owned by the dispatcher.
pub struct Notifier {
    reader: UnixStream,
    sender: NotifySender,
}

/// Cloneable sending end.
#[derive(Clone)]
pub struct NotifySender {
    writer: Arc<UnixStream>,
    // A full socket buffer may swallow the byte; the flag never is.
    shutdown: Arc<AtomicBool>,
}

impl Notifier {
    pub fn new() -> SonataResult<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            reader,
            sender: NotifySender {
                writer: Arc::new(writer),
                shutdown: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub fn sender(&self) -> NotifySender {
        self.sender.clone()
    }

    /// Read everything queued so far.
    pub fn drain(&self) -> Pending {
        let mut pending = Pending::default();
        let mut buf = [0u8; 256];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for byte in &buf[..n] {
                        match *byte {
                            b if b == Notification::Tick as u8 => pending.tick = true,
                            b if b == Notification::Shutdown as u8 => pending.shutdown = true,
                            other => warn!(byte = other, "unknown notification"),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "notification channel read failed");
                    break;
                }
            }
        }
        pending.shutdown |= self.sender.shutdown.load(Ordering::Acquire);
        pending
    }
}

impl NotifySender {
    pub fn send(&self, notification: Notification) {
        if notification == Notification::Shutdown {
            self.shutdown.store(true, Ordering::Release);
        }
        match (&*self.writer).write(&[notification as u8]) {
            Ok(_) => {}
            // A byte is already waiting; the dispatcher will wake for it.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!(error = %e, "notification dropped"),
        }
    }
}

/// Asks a running server to stop. Safe to call from any thread, any number of times.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: NotifySender,
}

impl ShutdownHandle {
    pub(crate) fn new(sender: NotifySender) -> Self {
        Self { sender }
    }

    pub fn shutdown(&self) {
        self.sender.send(Notification::Shutdown);
    }
}

/// Background thread posting a `Tick` every interval. Stops on drop.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(sender: NotifySender, interval: Duration) -> SonataResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("sonata-ticker".to_string())
            .spawn(move || {
                loop {
                    thread::park_timeout(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    sender.send(Notification::Tick);
                }
            })
            .map_err(|source| SonataError::Spawn {
                name: "sonata-ticker".to_string(),
                source,
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

/// Route SIGINT and SIGTERM into the notification channel.
///
/// Only one handler can be installed per process.
pub fn install_signal_handler(sender: NotifySender) -> SonataResult<()> {
    ctrlc::set_handler(move || {
        info!("termination signal received, shutting down");
        sender.send(Notification::Shutdown);
    })
    .map_err(|e| SonataError::Config(format!("cannot install signal handler: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_drain_collects_tags() {
        let notifier = Notifier::new().unwrap();
        assert_eq!(notifier.drain(), Pending::default());

        let sender = notifier.sender();
        sender.send(Notification::Tick);
        sender.send(Notification::Tick);
        assert_eq!(
            notifier.drain(),
            Pending {
                tick: true,
                shutdown: false
            }
        );

        ShutdownHandle::new(notifier.sender()).shutdown();
        let pending = notifier.drain();
        assert!(pending.shutdown);
        assert!(!pending.tick);
    }

    #[test]
    fn test_ticker_posts_and_stops() {
        let notifier = Notifier::new().unwrap();
        let ticker = Ticker::spawn(notifier.sender(), Duration::from_millis(10)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut ticked = false;
        while Instant::now() < deadline && !ticked {
            thread::sleep(Duration::from_millis(5));
            ticked = notifier.drain().tick;
        }
        assert!(ticked);

        drop(ticker);
        notifier.drain();
        thread::sleep(Duration::from_millis(30));
        assert!(!notifier.drain().tick);
    }
}
