use clap::Parser;
use sonata::{
    DispatchMode, LingerPolicy, LogConfig, LogWrite, Server, ServerConfig, TriggerMode,
    init_logging,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "sonata")]
#[command(about = "Readiness-driven HTTP/1.1 server with Reactor and Proactor dispatch")]
#[command(version)]
struct Cli {
    /// Listening port
    #[arg(short = 'p', long, default_value_t = 9006)]
    port: u16,

    /// Log write mode: 0 synchronous, 1 asynchronous
    #[arg(short = 'l', long = "log-write", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    log_write: u8,

    /// Trigger modes (listener+connection): 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET
    #[arg(short = 'm', long = "trig-mode", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    trig_mode: u8,

    /// Linger policy: 0 graceful, 1 abortive
    #[arg(short = 'o', long = "opt-linger", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    opt_linger: u8,

    /// Number of user-store handles in the resource pool
    #[arg(short = 's', long = "sql-num", default_value_t = 8)]
    store_handles: usize,

    /// Number of worker threads
    #[arg(short = 't', long = "thread-num", default_value_t = 8)]
    workers: usize,

    /// Disable logging: 0 keep, 1 close
    #[arg(short = 'c', long = "close-log", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    close_log: u8,

    /// Concurrency model: 0 Proactor, 1 Reactor
    #[arg(short = 'a', long = "actor-model", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    actor_model: u8,

    /// Document root for static files
    #[arg(long, default_value = "./resources")]
    root: PathBuf,

    /// Users file backing /login and /register
    #[arg(long, default_value = "./users.txt")]
    users: PathBuf,

    /// Idle sweep interval in seconds; idle connections close after three ticks
    #[arg(long, default_value_t = 5)]
    tick: u64,

    /// Live-connection ceiling
    #[arg(long = "max-conns", default_value_t = 65_536)]
    max_conns: usize,

    /// Directory for rolling log files; logs go to stdout when omitted
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Pin worker threads to CPU cores
    #[arg(long = "pin-workers")]
    pin_workers: bool,
}

impl Cli {
    fn log_config(&self) -> LogConfig {
        LogConfig {
            disabled: self.close_log == 1,
            write: if self.log_write == 1 {
                LogWrite::Async
            } else {
                LogWrite::Sync
            },
            dir: self.log_dir.clone(),
            ..LogConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        let (listen, conn) =
            TriggerMode::pair_from_code(self.trig_mode).unwrap_or((TriggerMode::Level, TriggerMode::Level));
        ServerConfig::new()
            .port(self.port)
            .triggers(listen, conn)
            .linger(if self.opt_linger == 1 {
                LingerPolicy::Abortive
            } else {
                LingerPolicy::Graceful
            })
            .dispatch(if self.actor_model == 1 {
                DispatchMode::Reactor
            } else {
                DispatchMode::Proactor
            })
            .workers(self.workers)
            .store_handles(self.store_handles)
            .tick(Duration::from_secs(self.tick))
            .max_connections(self.max_conns)
            .doc_root(self.root.clone())
            .users_file(self.users.clone())
            .pin_workers(self.pin_workers)
            .handle_signals(true)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match init_logging(&cli.log_config()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = Server::new(cli.server_config()).and_then(Server::run);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classic_flags() {
        let cli = Cli::parse_from(["sonata", "-p", "8080", "-m", "3", "-a", "1", "-t", "4", "-c", "1"]);
        let config = cli.server_config();
        assert_eq!(config.port, 8080);
        assert_eq!(config.listen_trigger, TriggerMode::Edge);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
        assert_eq!(config.dispatch, DispatchMode::Reactor);
        assert_eq!(config.workers, 4);
        assert!(cli.log_config().disabled);
    }

    #[test]
    fn test_out_of_range_mode_is_rejected() {
        assert!(Cli::try_parse_from(["sonata", "-m", "4"]).is_err());
        assert!(Cli::try_parse_from(["sonata", "-a", "2"]).is_err());
    }
}
