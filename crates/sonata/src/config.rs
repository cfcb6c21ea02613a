use crate::error::{SonataError, SonataResult};
use std::path::PathBuf;
use std::time::Duration;

/// Readiness notification style for a class of descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Notified as long as the descriptor stays ready.
    #[default]
    Level,
    /// Notified once per readiness transition; readers must drain until would-block.
    Edge,
}

impl TriggerMode {
    pub(crate) fn flag(self) -> u32 {
        match self {
            TriggerMode::Level => 0,
            TriggerMode::Edge => libc::EPOLLET as u32,
        }
    }

    /// Decode the listener/connection pair from the classic `0..=3` switch:
    /// 0 = LT+LT, 1 = LT+ET, 2 = ET+LT, 3 = ET+ET.
    pub fn pair_from_code(code: u8) -> Option<(TriggerMode, TriggerMode)> {
        use TriggerMode::*;
        match code {
            0 => Some((Level, Level)),
            1 => Some((Level, Edge)),
            2 => Some((Edge, Level)),
            3 => Some((Edge, Edge)),
            _ => None,
        }
    }
}

/// Who performs socket I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Dispatcher reads/writes, workers only parse and build responses.
    #[default]
    Proactor,
    /// Workers do the I/O as well; the dispatcher waits for each hand-off.
    Reactor,
}

/// `SO_LINGER` applied to the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LingerPolicy {
    #[default]
    Graceful,
    Abortive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogWrite {
    #[default]
    Sync,
    Async,
}

/// Logging setup consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// No subscriber is installed at all.
    pub disabled: bool,
    pub write: LogWrite,
    /// Directory for rolling log files; `None` logs to stdout.
    pub dir: Option<PathBuf>,
    pub file_name: String,
    /// Lines per file before a numbered continuation file is opened.
    pub split_lines: u64,
    /// Bounded queue length of the async sink.
    pub queue_capacity: usize,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            write: LogWrite::Sync,
            dir: None,
            file_name: "ServerLog".to_string(),
            split_lines: 800_000,
            queue_capacity: 800,
            level: "info".to_string(),
        }
    }
}

/// Static engine configuration, built before the engine starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub listen_trigger: TriggerMode,
    pub conn_trigger: TriggerMode,
    pub linger: LingerPolicy,
    pub dispatch: DispatchMode,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Interval of the idle sweep; a connection idles out after three ticks.
    pub tick: Duration,
    /// Size of the descriptor-indexed connection table.
    pub max_fd: usize,
    /// Live-connection ceiling; accepts beyond it get a busy response.
    pub max_connections: usize,
    pub doc_root: PathBuf,
    pub users_file: PathBuf,
    pub store_handles: usize,
    pub pin_workers: bool,
    /// Install SIGINT/SIGTERM handlers that request shutdown.
    pub handle_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            listen_trigger: TriggerMode::Level,
            conn_trigger: TriggerMode::Level,
            linger: LingerPolicy::Graceful,
            dispatch: DispatchMode::Proactor,
            workers: num_cpus::get(),
            queue_capacity: 10_000,
            tick: Duration::from_secs(5),
            max_fd: 65_536,
            max_connections: 65_536,
            doc_root: PathBuf::from("./resources"),
            users_file: PathBuf::from("./users.txt"),
            store_handles: 8,
            pin_workers: false,
            handle_signals: false,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn triggers(mut self, listen: TriggerMode, conn: TriggerMode) -> Self {
        self.listen_trigger = listen;
        self.conn_trigger = conn;
        self
    }

    pub fn linger(mut self, linger: LingerPolicy) -> Self {
        self.linger = linger;
        self
    }

    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn max_fd(mut self, max_fd: usize) -> Self {
        self.max_fd = max_fd;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn doc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.doc_root = root.into();
        self
    }

    pub fn users_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.users_file = path.into();
        self
    }

    pub fn store_handles(mut self, handles: usize) -> Self {
        self.store_handles = handles;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Idle time after which a connection is evicted.
    pub fn idle_timeout(&self) -> Duration {
        self.tick * 3
    }

    pub fn validate(&self) -> SonataResult<()> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(SonataError::Config(what.to_string()))
            }
        };
        check(self.workers > 0, "worker count must be positive")?;
        check(self.queue_capacity > 0, "queue capacity must be positive")?;
        check(self.store_handles > 0, "store pool size must be positive")?;
        check(self.max_fd > 0, "descriptor table size must be positive")?;
        check(self.max_connections > 0, "connection ceiling must be positive")?;
        check(!self.tick.is_zero(), "tick interval must be positive")?;
        Ok(())
    }
}
