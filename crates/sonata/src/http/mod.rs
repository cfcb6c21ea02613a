// src/http/mod.rs
pub mod conn;
pub mod file;
pub mod parser;
pub mod response;

pub use conn::{HttpConn, Outcome};
pub use parser::RequestParser;
pub use response::ResponseBuffer;

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    /// Only GET and POST are served.
    pub fn is_supported(self) -> bool {
        matches!(self, Method::Get | Method::Post)
    }
}

/// Outcome of driving the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Request incomplete; wait for more bytes.
    NoRequest,
    /// A complete request was parsed.
    GetRequest,
    BadRequest,
    NoResource,
    Forbidden,
    /// A file was resolved and mapped.
    FileRequest,
    InternalError,
    ClosedConnection,
    /// A credential endpoint answered with a redirect.
    Redirect,
}

/// Parser position within the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Content,
}

/// Result of scanning for one CRLF-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    Bad,
    Open,
}
