//! Bounded pool of backing-store handles.
//!
//! The pool is filled once at startup and never grows. `acquire` blocks on a
//! counting semaphore until a handle is free; the returned guard puts the handle
//! back when it goes out of scope, on every exit path.

use crate::error::{SonataError, SonataResult};
use crate::sync::Semaphore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

pub struct ResourcePool<R> {
    handles: Mutex<VecDeque<R>>,
    reserve: Semaphore,
    size: usize,
}

impl<R> ResourcePool<R> {
    pub fn new(handles: Vec<R>) -> Self {
        let size = handles.len();
        Self {
            handles: Mutex::new(handles.into()),
            reserve: Semaphore::new(size),
            size,
        }
    }

    /// Block until a handle is free.
    pub fn acquire(&self) -> SonataResult<Pooled<'_, R>> {
        if self.size == 0 {
            return Err(SonataError::PoolUninitialized);
        }
        self.reserve.wait();
        let handle = self
            .handles
            .lock()
            .pop_front()
            .ok_or(SonataError::PoolUninitialized)?;
        Ok(Pooled {
            pool: self,
            handle: ManuallyDrop::new(handle),
        })
    }

    fn release(&self, handle: R) {
        self.handles.lock().push_back(handle);
        self.reserve.post();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles not currently borrowed.
    pub fn free(&self) -> usize {
        self.handles.lock().len()
    }
}

/// A borrowed handle; returned to its pool on drop.
pub struct Pooled<'a, R> {
    pool: &'a ResourcePool<R>,
    handle: ManuallyDrop<R>,
}

impl<R> Deref for Pooled<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.handle
    }
}

impl<R> DerefMut for Pooled<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.handle
    }
}

impl<R> Drop for Pooled<'_, R> {
    fn drop(&mut self) {
        // SAFETY: the handle is taken exactly once, here, and never touched again.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        self.pool.release(handle);
    }
}

/// Backing store for the credential table.
pub trait UserStore: Send {
    fn load_users(&mut self) -> SonataResult<Vec<(String, String)>>;
    fn insert_user(&mut self, name: &str, password: &str) -> SonataResult<()>;
}

/// Users kept as `name:password` lines in a plain file.
///
/// Each handle owns its own append descriptor; lines are written with a single
/// `write_all`, so concurrent handles never interleave within a line.
pub struct FileUserStore {
    path: PathBuf,
    file: File,
}

impl FileUserStore {
    pub fn open(path: impl AsRef<Path>) -> SonataResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Open `count` handles on the same file.
    pub fn open_many(path: impl AsRef<Path>, count: usize) -> SonataResult<Vec<Self>> {
        (0..count).map(|_| Self::open(path.as_ref())).collect()
    }
}

impl UserStore for FileUserStore {
    fn load_users(&mut self) -> SonataResult<Vec<(String, String)>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut users = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((name, password)) if !name.is_empty() => {
                    users.push((name.to_string(), password.to_string()));
                }
                _ => tracing::warn!(path = %self.path.display(), line, "skipping malformed user entry"),
            }
        }
        Ok(users)
    }

    fn insert_user(&mut self, name: &str, password: &str) -> SonataResult<()> {
        if name.is_empty() || name.contains([':', '\n', '\r']) || password.contains(['\n', '\r']) {
            return Err(SonataError::Store(format!("invalid user name or password for `{name}`")));
        }
        let line = format!("{name}:{password}\n");
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}
