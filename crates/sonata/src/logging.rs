//! Log sink behind the `tracing` subscriber.
//!
//! Events are formatted by `tracing-subscriber`'s fmt layer and handed to a
//! [`SinkWriter`], which sends every formatted line to one of:
//!
//! - stdout, when no log directory is configured;
//! - a rolling file, written and flushed line by line (sync mode);
//! - a bounded queue drained by a single `sonata-log` thread (async mode).
//!   A full queue drops the line instead of blocking the caller.
//!
//! Rolling files are named `<dir>/<YYYY_MM_DD>_<name>`. A new file is opened
//! when the local date changes, and a numbered continuation (`.1`, `.2`, ...)
//! after every `split_lines` lines.
//!
//! The level filter comes from `RUST_LOG`, falling back to
//! [`LogConfig::level`]:
//!
//! ```bash
//! RUST_LOG=sonata=debug sonata -p 9006
//! ```

use crate::config::{LogConfig, LogWrite};
use crate::error::{SonataError, SonataResult};
use chrono::{Local, NaiveDate};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Append-only log file that rolls over by date and by line count.
pub struct RollingFile {
    dir: PathBuf,
    name: String,
    split_lines: u64,
    today: NaiveDate,
    part: u64,
    lines: u64,
    file: File,
}

impl RollingFile {
    pub fn open(dir: &Path, name: &str, split_lines: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let today = Local::now().date_naive();
        let file = Self::open_part(dir, name, today, 0)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            split_lines: split_lines.max(1),
            today,
            part: 0,
            lines: 0,
            file,
        })
    }

    fn file_path(dir: &Path, name: &str, date: NaiveDate, part: u64) -> PathBuf {
        let mut file_name = format!("{}_{}", date.format("%Y_%m_%d"), name);
        if part > 0 {
            file_name.push('.');
            file_name.push_str(itoa::Buffer::new().format(part));
        }
        dir.join(file_name)
    }

    fn open_part(dir: &Path, name: &str, date: NaiveDate, part: u64) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_path(dir, name, date, part))
    }

    /// Path of the file currently written to.
    pub fn current_path(&self) -> PathBuf {
        Self::file_path(&self.dir, &self.name, self.today, self.part)
    }

    pub fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.write_line_on(Local::now().date_naive(), line)
    }

    fn write_line_on(&mut self, date: NaiveDate, line: &[u8]) -> io::Result<()> {
        if date != self.today {
            self.today = date;
            self.part = 0;
            self.lines = 0;
            self.file = Self::open_part(&self.dir, &self.name, date, 0)?;
        } else if self.lines >= self.split_lines {
            self.part += 1;
            self.lines = 0;
            self.file = Self::open_part(&self.dir, &self.name, date, self.part)?;
        }
        self.file.write_all(line)?;
        self.file.flush()?;
        self.lines += 1;
        Ok(())
    }
}

#[derive(Clone)]
enum Target {
    Stdout,
    File(Arc<Mutex<RollingFile>>),
    Queue(Sender<Vec<u8>>),
}

/// `MakeWriter` handed to the fmt layer.
#[derive(Clone)]
pub struct SinkWriter {
    target: Target,
}

impl SinkWriter {
    fn deliver(&self, line: &[u8]) {
        // The sink never reports failures back into the logging call.
        match &self.target {
            Target::Stdout => {
                let _ = io::stdout().lock().write_all(line);
            }
            Target::File(file) => {
                let _ = file.lock().write_line(line);
            }
            Target::Queue(tx) => {
                if let Err(TrySendError::Disconnected(_)) = tx.try_send(line.to_vec()) {
                    let _ = io::stderr().write_all(line);
                }
            }
        }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.deliver(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Keeps the log sink alive. Dropping it drains the async queue and joins its thread.
pub struct LogGuard {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LogGuard {
    fn inert() -> Self {
        Self {
            stop: None,
            handle: None,
        }
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn drain_queue(mut file: RollingFile, lines: Receiver<Vec<u8>>, stop: Receiver<()>) {
    loop {
        crossbeam::select! {
            recv(lines) -> line => match line {
                Ok(line) => {
                    let _ = file.write_line(&line);
                }
                Err(_) => break,
            },
            recv(stop) -> _ => {
                for line in lines.try_iter() {
                    let _ = file.write_line(&line);
                }
                break;
            }
        }
    }
}

/// Build the writer and its guard without installing a subscriber.
pub fn build_sink(config: &LogConfig) -> SonataResult<(SinkWriter, LogGuard)> {
    let Some(dir) = &config.dir else {
        return Ok((SinkWriter { target: Target::Stdout }, LogGuard::inert()));
    };
    let file = RollingFile::open(dir, &config.file_name, config.split_lines)?;

    match config.write {
        LogWrite::Sync => Ok((
            SinkWriter {
                target: Target::File(Arc::new(Mutex::new(file))),
            },
            LogGuard::inert(),
        )),
        LogWrite::Async => {
            let (tx, rx) = channel::bounded(config.queue_capacity.max(1));
            let (stop_tx, stop_rx) = channel::bounded::<()>(0);
            let handle = thread::Builder::new()
                .name("sonata-log".to_string())
                .spawn(move || drain_queue(file, rx, stop_rx))
                .map_err(|source| SonataError::Spawn {
                    name: "sonata-log".to_string(),
                    source,
                })?;
            Ok((
                SinkWriter {
                    target: Target::Queue(tx),
                },
                LogGuard {
                    stop: Some(stop_tx),
                    handle: Some(handle),
                },
            ))
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// With `config.disabled` nothing is installed and every event is discarded.
/// Keep the returned guard alive for as long as the process logs.
pub fn init_logging(config: &LogConfig) -> SonataResult<LogGuard> {
    if config.disabled {
        return Ok(LogGuard::inert());
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let (writer, guard) = build_sink(config)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(config.dir.is_none())
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| SonataError::Config(format!("logging already initialized: {e}")))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, write: LogWrite) -> LogConfig {
        LogConfig {
            write,
            dir: Some(dir.to_path_buf()),
            file_name: "TestLog".to_string(),
            split_lines: 3,
            ..LogConfig::default()
        }
    }

    #[test]
    fn test_rolling_by_lines_and_date() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = RollingFile::open(dir.path(), "ServerLog", 2).unwrap();
        let day = file.today;
        let first = file.current_path();
        assert!(first.ends_with(format!("{}_ServerLog", day.format("%Y_%m_%d"))));

        for i in 0..5 {
            file.write_line_on(day, format!("line {i}\n").as_bytes()).unwrap();
        }
        assert_eq!(fs::read_to_string(&first).unwrap(), "line 0\nline 1\n");
        let third = file.current_path();
        assert!(third.to_string_lossy().ends_with("_ServerLog.2"));
        assert_eq!(fs::read_to_string(third).unwrap(), "line 4\n");

        let next_day = day.succ_opt().unwrap();
        file.write_line_on(next_day, b"tomorrow\n").unwrap();
        assert!(
            file.current_path()
                .ends_with(format!("{}_ServerLog", next_day.format("%Y_%m_%d")))
        );
    }

    #[test]
    fn test_async_sink_flushes_on_guard_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, guard) = build_sink(&config(dir.path(), LogWrite::Async)).unwrap();
        for i in 0..3 {
            writer.make_writer().write_all(format!("event {i}\n").as_bytes()).unwrap();
        }
        drop(guard);

        let mut contents = String::new();
        for entry in fs::read_dir(dir.path()).unwrap() {
            contents.push_str(&fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        assert_eq!(contents, "event 0\nevent 1\nevent 2\n");
    }

    #[test]
    fn test_sync_sink_writes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _guard) = build_sink(&config(dir.path(), LogWrite::Sync)).unwrap();
        writer.make_writer().write_all(b"hello\n").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let path = entries[0].as_ref().unwrap().path();
        assert_eq!(fs::read_to_string(path).unwrap(), "hello\n");
    }

    #[test]
    fn test_full_queue_drops_lines() {
        let (tx, rx) = channel::bounded(1);
        let writer = SinkWriter {
            target: Target::Queue(tx),
        };
        writer.make_writer().write_all(b"kept\n").unwrap();
        writer.make_writer().write_all(b"dropped\n").unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![b"kept\n".to_vec()]);
    }

    #[test]
    fn test_disabled_installs_nothing() {
        let config = LogConfig {
            disabled: true,
            ..LogConfig::default()
        };
        assert!(init_logging(&config).is_ok());
    }
}
