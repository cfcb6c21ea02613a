// src/http/file.rs
use super::HttpCode;
use libc::c_void;
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Component, Path, PathBuf};
use std::ptr;
use tracing::{debug, warn};

/// Read-only private mapping of a whole file. Empty files are not mapped.
pub struct MappedFile {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is read-only and owned exclusively by this value.
unsafe impl Send for MappedFile {}

impl MappedFile {
    pub fn map(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(Self {
                ptr: ptr::null_mut(),
                len: 0,
            });
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // The descriptor can go; the mapping stays valid until munmap.
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: ptr..ptr+len is a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut c_void, self.len);
            }
        }
    }
}

/// Resolve `url` under `root` and map it.
///
/// Any `..` segment is refused outright. Directories and missing paths are
/// `NoResource`; files without the world-read bit are `Forbidden`.
pub fn open_document(root: &Path, url: &str) -> Result<MappedFile, HttpCode> {
    let relative = Path::new(url.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        warn!(url, "path traversal refused");
        return Err(HttpCode::Forbidden);
    }
    let path: PathBuf = root.join(relative);

    let meta = match std::fs::metadata(&path) {
        Ok(meta) => meta,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no such document");
            return Err(HttpCode::NoResource);
        }
    };
    if meta.is_dir() {
        return Err(HttpCode::NoResource);
    }
    if meta.permissions().mode() & 0o004 == 0 {
        return Err(HttpCode::Forbidden);
    }

    MappedFile::map(&path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "mmap failed");
        HttpCode::InternalError
    })
}

/// `Content-Type` by file extension.
pub fn content_type(url: &str) -> &'static str {
    let ext = Path::new(url)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_open_document_resolution() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), b"<h1>hi</h1>").unwrap();
        fs::write(root.path().join("empty.txt"), b"").unwrap();
        fs::write(root.path().join("secret.txt"), b"s").unwrap();
        fs::set_permissions(root.path().join("secret.txt"), fs::Permissions::from_mode(0o600))
            .unwrap();
        fs::create_dir(root.path().join("dir")).unwrap();

        let page = open_document(root.path(), "/index.html").unwrap();
        assert_eq!(page.as_slice(), b"<h1>hi</h1>");

        let empty = open_document(root.path(), "/empty.txt").unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.as_slice(), b"");

        assert_eq!(open_document(root.path(), "/missing.html").err(), Some(HttpCode::NoResource));
        assert_eq!(open_document(root.path(), "/dir").err(), Some(HttpCode::NoResource));
        assert_eq!(open_document(root.path(), "/secret.txt").err(), Some(HttpCode::Forbidden));
        assert_eq!(
            open_document(root.path(), "/../etc/passwd").err(),
            Some(HttpCode::Forbidden)
        );
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type("/index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type("/a/B.PNG"), "image/png");
        assert_eq!(content_type("/noext"), "application/octet-stream");
    }
}
