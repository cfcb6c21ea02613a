// src/server.rs
use crate::auth::{StorePool, UserTable};
use crate::config::{ServerConfig, TriggerMode};
use crate::dispatcher::{Dispatcher, handle_work};
use crate::error::SonataResult;
use crate::metrics::EngineMetrics;
use crate::pool::WorkerPool;
use crate::resource::{FileUserStore, ResourcePool, UserStore};
use crate::signal::{Notifier, ShutdownHandle, Ticker, install_signal_handler};
use crate::slab::ConnTable;
use crate::syscalls::{self, EV_IN, Epoll};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Process-wide state, created once and shared by the dispatcher and every worker.
pub struct Engine {
    pub epoll: Epoll,
    pub conns: ConnTable,
    pub users: UserTable,
    pub store: StorePool,
    pub metrics: EngineMetrics,
    pub doc_root: PathBuf,
    pub conn_trigger: TriggerMode,
}

impl Engine {
    /// Build the engine with a file-backed user store at `config.users_file`.
    pub fn new(config: &ServerConfig) -> SonataResult<Self> {
        let handles = FileUserStore::open_many(&config.users_file, config.store_handles)?
            .into_iter()
            .map(|store| Box::new(store) as Box<dyn UserStore>)
            .collect();
        Self::with_store(config, ResourcePool::new(handles))
    }

    /// Build the engine around an existing store pool.
    pub fn with_store(config: &ServerConfig, store: StorePool) -> SonataResult<Self> {
        config.validate()?;
        let users = UserTable::load(&store)?;
        Ok(Self {
            epoll: Epoll::new()?,
            conns: ConnTable::new(config.max_fd),
            users,
            store,
            metrics: EngineMetrics::new(),
            doc_root: config.doc_root.clone(),
            conn_trigger: config.conn_trigger,
        })
    }
}

/// A bound, not yet running server.
///
/// ```rust,no_run
/// use sonata::{Server, ServerConfig};
///
/// let server = Server::new(ServerConfig::new().port(9006))?;
/// let stop = server.shutdown_handle();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(60));
///     stop.shutdown();
/// });
/// server.run()?;
/// # Ok::<(), sonata::SonataError>(())
/// ```
pub struct Server {
    config: ServerConfig,
    engine: Arc<Engine>,
    listener: OwnedFd,
    local_addr: SocketAddr,
    notifier: Notifier,
}

impl Server {
    pub fn new(config: ServerConfig) -> SonataResult<Self> {
        let engine = Engine::new(&config)?;
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: ServerConfig, engine: Engine) -> SonataResult<Self> {
        let fd = syscalls::create_listen_socket(&config.host, config.port, config.linger)?;
        // SAFETY: `fd` was just created and is owned by nothing else.
        let listener = unsafe { OwnedFd::from_raw_fd(fd) };
        let local_addr = syscalls::local_addr(listener.as_raw_fd())?;
        engine.epoll.add_listener(listener.as_raw_fd(), config.listen_trigger)?;

        let notifier = Notifier::new()?;
        engine.epoll.add(notifier.fd(), EV_IN)?;

        info!(
            addr = %local_addr,
            dispatch = ?config.dispatch,
            listen_trigger = ?config.listen_trigger,
            conn_trigger = ?config.conn_trigger,
            workers = config.workers,
            users = engine.users.len(),
            "server bound"
        );

        Ok(Self {
            config,
            engine: Arc::new(engine),
            listener,
            local_addr,
            notifier,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.notifier.sender())
    }

    /// Serve until shutdown is requested.
    pub fn run(self) -> SonataResult<()> {
        let Server {
            config,
            engine,
            listener,
            notifier,
            ..
        } = self;

        syscalls::ignore_sigpipe();
        if config.handle_signals {
            install_signal_handler(notifier.sender())?;
        }

        let worker_engine = engine.clone();
        let pool = WorkerPool::with_affinity(
            config.workers,
            config.queue_capacity,
            "sonata-worker",
            config.pin_workers,
            move |item| handle_work(&worker_engine, item),
        )?;
        info!(
            workers = pool.workers(),
            queue_capacity = pool.capacity(),
            slots = engine.conns.capacity(),
            "worker pool started"
        );
        let _ticker = Ticker::spawn(notifier.sender(), config.tick)?;

        let mut dispatcher = Dispatcher::new(engine.clone(), pool, listener, notifier, &config);
        let result = dispatcher.run();
        info!(served = engine.metrics.snapshot().requests, "server stopped");
        result
    }
}
