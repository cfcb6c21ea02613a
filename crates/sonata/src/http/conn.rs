// src/http/conn.rs
use super::file::{MappedFile, content_type, open_document};
use super::response::{EMPTY_PAGE, FOUND, OK, ResponseBuffer, Status};
use super::{HttpCode, RequestParser};
use crate::auth::{AuthRoute, authenticate};
use crate::config::TriggerMode;
use crate::server::Engine;
use crate::syscalls::{self, Epoll, Interest};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

/// What the dispatcher should do with a connection after a round of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The descriptor has been re-armed; wait for its next event.
    Keep,
    /// Close the connection.
    Teardown,
}

/// One client connection: read buffer and parser, response buffer, and the
/// mapped file being sent. Lives in the connection table slot of its descriptor.
pub struct HttpConn {
    fd: RawFd,
    addr: Option<SocketAddr>,
    generation: u64,
    trigger: TriggerMode,
    request: RequestParser,
    response: ResponseBuffer,
    file: Option<MappedFile>,
    location: Option<&'static str>,
    bytes_to_send: usize,
    bytes_sent: usize,
    keep_alive: bool,
}

impl HttpConn {
    /// An unused slot. Buffers are allocated on first open.
    pub fn empty() -> Self {
        Self {
            fd: -1,
            addr: None,
            generation: 0,
            trigger: TriggerMode::Level,
            request: RequestParser::unallocated(),
            response: ResponseBuffer::unallocated(),
            file: None,
            location: None,
            bytes_to_send: 0,
            bytes_sent: 0,
            keep_alive: false,
        }
    }

    pub fn open(&mut self, fd: RawFd, addr: SocketAddr, generation: u64, trigger: TriggerMode) {
        self.request.allocate();
        self.response.allocate();
        self.fd = fd;
        self.addr = Some(addr);
        self.generation = generation;
        self.trigger = trigger;
        self.reset();
    }

    /// Deregister and close the descriptor. Returns false if already closed.
    pub fn close(&mut self, epoll: &Epoll) -> bool {
        if self.fd < 0 {
            return false;
        }
        if let Err(e) = epoll.delete(self.fd) {
            warn!(fd = self.fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(self.fd);
        debug!(fd = self.fd, peer = ?self.addr, "connection closed");
        self.fd = -1;
        self.addr = None;
        self.reset();
        true
    }

    /// Prepare for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        self.request.reset();
        self.response.clear();
        self.file = None;
        self.location = None;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.keep_alive = false;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    /// True if this slot still holds the connection a work item was made for.
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_open() && self.generation == generation
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn request(&self) -> &RequestParser {
        &self.request
    }

    pub fn response(&self) -> &ResponseBuffer {
        &self.response
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Pull bytes from the socket into the read buffer.
    ///
    /// Level-triggered sockets get one read per notification. Edge-triggered
    /// sockets are drained until the kernel reports would-block.
    pub fn read_once(&mut self) -> bool {
        if self.request.is_full() {
            return false;
        }
        loop {
            match syscalls::read_nonblocking(self.fd, self.request.spare_mut()) {
                Ok(Some(0)) => return false,
                Ok(Some(n)) => {
                    self.request.advance(n);
                    if self.trigger == TriggerMode::Level || self.request.is_full() {
                        return true;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    return false;
                }
            }
        }
    }

    /// Parse what has been read and, once a request is complete, build its response.
    pub fn process(&mut self, engine: &Engine) -> Outcome {
        let code = self.process_read(engine);
        if code == HttpCode::NoRequest {
            return self.rearm(&engine.epoll, Interest::Read);
        }
        if !self.process_write(code) {
            warn!(fd = self.fd, ?code, "response did not fit the write buffer");
            return Outcome::Teardown;
        }
        self.rearm(&engine.epoll, Interest::Write)
    }

    pub fn process_read(&mut self, engine: &Engine) -> HttpCode {
        let mut code = self.request.parse();
        if code == HttpCode::NoRequest && self.request.is_full() {
            code = HttpCode::BadRequest;
        }
        if code == HttpCode::GetRequest {
            engine.metrics.inc_req();
            debug!(
                fd = self.fd,
                method = ?self.request.method(),
                url = self.request.url(),
                host = self.request.host(),
                "request"
            );
            code = self.do_request(engine);
        }
        code
    }

    /// Answer a complete request: credential endpoints or a static file.
    pub fn do_request(&mut self, engine: &Engine) -> HttpCode {
        if self.request.has_body() {
            if let Some(route) = AuthRoute::from_url(self.request.url()) {
                let body = self.request.body().unwrap_or_default();
                self.location = Some(authenticate(route, body, &engine.users, &engine.store));
                return HttpCode::Redirect;
            }
        }
        match open_document(&engine.doc_root, self.request.url()) {
            Ok(file) => {
                self.file = Some(file);
                HttpCode::FileRequest
            }
            Err(code) => code,
        }
    }

    /// Fill the write buffer for `code`. False if the headers do not fit.
    pub fn process_write(&mut self, code: HttpCode) -> bool {
        self.response.clear();
        self.bytes_sent = 0;
        let keep_alive = self.request.keep_alive();

        let written = match code {
            HttpCode::FileRequest => match self.file.take() {
                Some(file) if !file.is_empty() => {
                    let ok = self.response.head(
                        &OK,
                        content_type(self.request.url()),
                        file.len(),
                        keep_alive,
                        None,
                    );
                    self.file = Some(file);
                    ok
                }
                _ => {
                    self.response
                        .head(&OK, "text/html", EMPTY_PAGE.len(), keep_alive, None)
                        && self.response.push(EMPTY_PAGE.as_bytes())
                }
            },
            HttpCode::Redirect => {
                self.response
                    .head(&FOUND, "text/html", 0, keep_alive, self.location)
            }
            other => match Status::for_error(other) {
                Some(status) => {
                    self.response
                        .head(status, "text/html", status.body.len(), false, None)
                        && self.response.push(status.body.as_bytes())
                }
                None => false,
            },
        };

        self.keep_alive = keep_alive && matches!(code, HttpCode::FileRequest | HttpCode::Redirect);
        self.bytes_to_send = self.response.len() + self.file.as_ref().map_or(0, |f| f.len());
        written
    }

    /// Send the pending response.
    ///
    /// Returns true while the connection stays open: either the socket filled
    /// up and write interest was re-armed, or the response was sent on a
    /// keep-alive connection which now waits for its next request.
    pub fn write(&mut self, engine: &Engine) -> bool {
        if self.bytes_to_send == 0 {
            self.reset();
            return self.rearm(&engine.epoll, Interest::Read) == Outcome::Keep;
        }

        loop {
            let result = {
                let head = self.response.as_bytes();
                let body = self.file.as_ref().map_or(&[][..], |f| f.as_slice());
                if self.bytes_sent < head.len() {
                    syscalls::writev_nonblocking(self.fd, &[&head[self.bytes_sent..], body])
                } else {
                    syscalls::writev_nonblocking(self.fd, &[&body[self.bytes_sent - head.len()..]])
                }
            };

            match result {
                Ok(None) => return self.rearm(&engine.epoll, Interest::Write) == Outcome::Keep,
                Ok(Some(n)) if n > 0 => {
                    self.bytes_sent += n;
                    engine.metrics.add_bytes(n);
                    if self.bytes_sent >= self.bytes_to_send {
                        self.file = None;
                        if !self.keep_alive {
                            return false;
                        }
                        self.reset();
                        return self.rearm(&engine.epoll, Interest::Read) == Outcome::Keep;
                    }
                }
                Ok(Some(_)) => {
                    self.file = None;
                    return false;
                }
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "write failed");
                    self.file = None;
                    return false;
                }
            }
        }
    }

    /// Shut the socket down and re-arm it, so the dispatcher sees a hangup and
    /// closes the connection from its own thread.
    ///
    /// `Teardown` means the re-arm failed and no hangup will be reported.
    pub fn hang_up(&self, epoll: &Epoll) -> Outcome {
        if !self.is_open() {
            return Outcome::Keep;
        }
        syscalls::shutdown_fd(self.fd);
        self.rearm(epoll, Interest::Read)
    }

    fn rearm(&self, epoll: &Epoll, interest: Interest) -> Outcome {
        match epoll.rearm(self.fd, interest, self.trigger) {
            Ok(()) => Outcome::Keep,
            Err(e) => {
                warn!(fd = self.fd, error = %e, "re-arm failed");
                Outcome::Teardown
            }
        }
    }
}

impl Default for HttpConn {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::http::READ_BUFFER_SIZE;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, Shutdown};
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::path::Path;

    fn engine(root: &Path) -> Engine {
        std::fs::write(root.join("index.html"), b"<h1>sonata</h1>").unwrap();
        std::fs::write(root.join("users.txt"), b"alice:secret\n").unwrap();
        let config = ServerConfig::new()
            .doc_root(root)
            .users_file(root.join("users.txt"))
            .store_handles(1)
            .max_fd(1024);
        Engine::new(&config).unwrap()
    }

    /// An open connection on one end of a socket pair, registered with the engine.
    fn connect(engine: &Engine, trigger: TriggerMode) -> (HttpConn, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let fd = ours.into_raw_fd();
        engine.epoll.add_connection(fd, trigger).unwrap();
        let mut conn = HttpConn::empty();
        conn.open(fd, SocketAddr::from((Ipv4Addr::LOCALHOST, 1)), 7, trigger);
        (conn, peer)
    }

    fn response_text(peer: &mut UnixStream) -> String {
        peer.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(n) = peer.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            if out.windows(4).any(|w| w == b"\r\n\r\n") && out.ends_with(b"</h1>") {
                break;
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_keep_alive_file_round() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let (mut conn, mut peer) = connect(&engine, TriggerMode::Edge);

        peer.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.process(&engine), Outcome::Keep);
        assert_eq!(conn.bytes_to_send(), conn.response().len() + 15);

        assert!(conn.write(&engine));
        let text = response_text(&mut peer);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("<h1>sonata</h1>"));

        // Ready for the next request on the same connection.
        assert_eq!(conn.request().read_idx(), 0);
        assert!(conn.is_current(7));
        assert_eq!(engine.metrics.snapshot().requests, 1);
        assert!(conn.close(&engine.epoll));
        assert!(!conn.close(&engine.epoll));
    }

    #[test]
    fn test_partial_request_waits() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let (mut conn, mut peer) = connect(&engine, TriggerMode::Level);

        peer.write_all(b"GET /index.html HT").unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.process_read(&engine), HttpCode::NoRequest);
        peer.write_all(b"TP/1.1\r\n\r\n").unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.process_read(&engine), HttpCode::FileRequest);
        conn.close(&engine.epoll);
    }

    #[test]
    fn test_error_responses_force_close() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let (mut conn, mut peer) = connect(&engine, TriggerMode::Level);

        peer.write_all(b"GET /missing.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.process(&engine), Outcome::Keep);
        assert!(!conn.write(&engine), "error responses close the connection");
        conn.close(&engine.epoll);

        let mut text = String::new();
        peer.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("was not found on this server.\n"));
    }

    #[test]
    fn test_login_redirect() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let (mut conn, peer) = connect(&engine, TriggerMode::Level);

        let body = "user=alice&password=secret";
        let req = format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        (&peer).write_all(req.as_bytes()).unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.process_read(&engine), HttpCode::Redirect);
        assert!(conn.process_write(HttpCode::Redirect));
        let head = std::str::from_utf8(conn.response().as_bytes()).unwrap();
        assert!(head.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(head.contains("Location: /welcome.html\r\n"));
        conn.close(&engine.epoll);

        // Without a body the credential routes are plain paths.
        let (mut conn, peer) = connect(&engine, TriggerMode::Level);
        (&peer).write_all(b"GET /login HTTP/1.1\r\n\r\n").unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.process_read(&engine), HttpCode::NoResource);
        conn.close(&engine.epoll);
    }

    #[test]
    fn test_peer_close_and_full_buffer() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());

        let (mut conn, peer) = connect(&engine, TriggerMode::Edge);
        peer.shutdown(Shutdown::Write).unwrap();
        assert!(!conn.read_once());
        conn.close(&engine.epoll);

        let (mut conn, mut peer) = connect(&engine, TriggerMode::Edge);
        peer.write_all(&[b'a'; READ_BUFFER_SIZE]).unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.process_read(&engine), HttpCode::BadRequest);
        assert!(!conn.read_once());
        conn.close(&engine.epoll);
    }
}
