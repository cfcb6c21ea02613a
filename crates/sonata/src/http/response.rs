// src/http/response.rs
use super::{HttpCode, WRITE_BUFFER_SIZE};
use std::time::SystemTime;

/// Status line and canned body for a response class.
pub struct Status {
    pub code: u16,
    pub title: &'static str,
    /// Body sent with error responses; empty for success and redirects.
    pub body: &'static str,
}

pub const OK: Status = Status {
    code: 200,
    title: "OK",
    body: "",
};
pub const FOUND: Status = Status {
    code: 302,
    title: "Found",
    body: "",
};
pub const BAD_REQUEST: Status = Status {
    code: 400,
    title: "Bad Request",
    body: "Your request has bad syntax or is inherently impossible to satisfy.\n",
};
pub const FORBIDDEN: Status = Status {
    code: 403,
    title: "Forbidden",
    body: "You do not have permission to get file from this server.\n",
};
pub const NOT_FOUND: Status = Status {
    code: 404,
    title: "Not Found",
    body: "The requested file was not found on this server.\n",
};
pub const INTERNAL_ERROR: Status = Status {
    code: 500,
    title: "Internal Error",
    body: "There was an unusual problem serving the requested file.\n",
};

/// Body used for an empty file, so clients always receive some markup.
pub const EMPTY_PAGE: &str = "<html><body></body></html>";

impl Status {
    /// Error class for a terminal parse/resolve code, if it is one.
    pub fn for_error(code: HttpCode) -> Option<&'static Status> {
        match code {
            HttpCode::BadRequest => Some(&BAD_REQUEST),
            HttpCode::Forbidden => Some(&FORBIDDEN),
            HttpCode::NoResource => Some(&NOT_FOUND),
            HttpCode::InternalError => Some(&INTERNAL_ERROR),
            _ => None,
        }
    }
}

/// Fixed-capacity header buffer. Every push either fits entirely or fails
/// without writing, so the buffer never holds a truncated line.
pub struct ResponseBuffer {
    buf: Vec<u8>,
    len: usize,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        let mut response = Self::unallocated();
        response.allocate();
        response
    }

    pub(crate) fn unallocated() -> Self {
        Self {
            buf: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn allocate(&mut self) {
        if self.buf.len() != WRITE_BUFFER_SIZE {
            self.buf = vec![0; WRITE_BUFFER_SIZE];
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn push(&mut self, bytes: &[u8]) -> bool {
        let end = self.len + bytes.len();
        if end > self.buf.len() {
            return false;
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        true
    }

    fn push_all(&mut self, parts: &[&[u8]]) -> bool {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if self.len + total > self.buf.len() {
            return false;
        }
        parts.iter().all(|part| self.push(part))
    }

    pub fn status_line(&mut self, status: &Status) -> bool {
        let mut code = itoa::Buffer::new();
        self.push_all(&[
            b"HTTP/1.1 ",
            code.format(status.code).as_bytes(),
            b" ",
            status.title.as_bytes(),
            b"\r\n",
        ])
    }

    pub fn header(&mut self, name: &str, value: &[u8]) -> bool {
        self.push_all(&[name.as_bytes(), b": ", value, b"\r\n"])
    }

    pub fn content_length(&mut self, len: usize) -> bool {
        let mut digits = itoa::Buffer::new();
        self.header("Content-Length", digits.format(len).as_bytes())
    }

    pub fn date(&mut self) -> bool {
        let now = httpdate::fmt_http_date(SystemTime::now());
        self.header("Date", now.as_bytes())
    }

    pub fn connection(&mut self, keep_alive: bool) -> bool {
        let value: &[u8] = if keep_alive { b"keep-alive" } else { b"close" };
        self.header("Connection", value)
    }

    pub fn blank_line(&mut self) -> bool {
        self.push(b"\r\n")
    }

    /// Status line plus the common header block, terminated by a blank line.
    pub fn head(
        &mut self,
        status: &Status,
        content_type: &str,
        content_len: usize,
        keep_alive: bool,
        location: Option<&str>,
    ) -> bool {
        self.status_line(status)
            && self.date()
            && self.header("Content-Type", content_type.as_bytes())
            && self.content_length(content_len)
            && self.connection(keep_alive)
            && location.is_none_or(|loc| self.header("Location", loc.as_bytes()))
            && self.blank_line()
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete response sent to a client that cannot be admitted.
pub fn busy_response() -> Vec<u8> {
    const BODY: &str = "Internal server busy";
    let mut digits = itoa::Buffer::new();
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/plain\r\nContent-Length: ");
    out.extend_from_slice(digits.format(BODY.len()).as_bytes());
    out.extend_from_slice(b"\r\nConnection: close\r\n\r\n");
    out.extend_from_slice(BODY.as_bytes());
    out
}
