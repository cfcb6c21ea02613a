// src/lib.rs
#[cfg(not(target_os = "linux"))]
compile_error!("sonata drives its sockets through epoll and only builds on Linux");

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod resource;
pub mod server;
pub mod signal;
pub mod slab;
pub mod sync;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use config::{DispatchMode, LingerPolicy, LogConfig, LogWrite, ServerConfig, TriggerMode};
pub use error::{SonataError, SonataResult};
pub use logging::{LogGuard, init_logging};
pub use resource::{FileUserStore, ResourcePool, UserStore};
pub use server::{Engine, Server};
pub use signal::ShutdownHandle;
