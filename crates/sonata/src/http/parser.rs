// src/http/parser.rs
use super::{CheckState, HttpCode, LineStatus, Method, READ_BUFFER_SIZE};
use memchr::{memchr, memchr2};
use tracing::debug;

/// Incremental HTTP/1.1 request parser over a fixed-capacity read buffer.
///
/// Bytes are appended at `read_idx`; `checked_idx` is how far the line scanner
/// has looked and `start_line` is where the current line begins. Parsing can be
/// resumed after every read, so a request may arrive in any number of pieces.
pub struct RequestParser {
    buf: Vec<u8>,
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
    state: CheckState,
    method: Method,
    url: String,
    version: String,
    host: String,
    content_length: usize,
    keep_alive: bool,
    has_body: bool,
    body_start: Option<usize>,
}

impl RequestParser {
    pub fn new() -> Self {
        let mut parser = Self::unallocated();
        parser.allocate();
        parser
    }

    /// A parser without a buffer; call [`RequestParser::allocate`] before use.
    pub(crate) fn unallocated() -> Self {
        Self {
            buf: Vec::new(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            state: CheckState::RequestLine,
            method: Method::Get,
            url: String::new(),
            version: String::new(),
            host: String::new(),
            content_length: 0,
            keep_alive: false,
            has_body: false,
            body_start: None,
        }
    }

    pub(crate) fn allocate(&mut self) {
        if self.buf.len() != READ_BUFFER_SIZE {
            self.buf = vec![0; READ_BUFFER_SIZE];
        }
    }

    /// Forget the current request. Buffered bytes are discarded.
    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.version.clear();
        self.host.clear();
        self.content_length = 0;
        self.keep_alive = false;
        self.has_body = false;
        self.body_start = None;
    }

    /// Free space at the fill position.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_idx..]
    }

    /// Record `n` bytes written into [`RequestParser::spare_mut`].
    pub fn advance(&mut self, n: usize) {
        self.read_idx = (self.read_idx + n).min(self.buf.len());
    }

    /// Copy as much of `bytes` as fits; returns how many were taken.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = spare.len().min(bytes.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.advance(n);
        n
    }

    pub fn is_full(&self) -> bool {
        self.read_idx >= self.buf.len()
    }

    /// Find the next CRLF at or after `checked_idx`.
    pub fn parse_line(&mut self) -> LineStatus {
        let window = &self.buf[self.checked_idx..self.read_idx];
        let Some(offset) = memchr2(b'\r', b'\n', window) else {
            self.checked_idx = self.read_idx;
            return LineStatus::Open;
        };
        let pos = self.checked_idx + offset;

        if self.buf[pos] == b'\n' {
            // A CR would have been found first.
            self.checked_idx = pos;
            return LineStatus::Bad;
        }
        if pos + 1 == self.read_idx {
            // CR is the last byte so far; rescan from it next time.
            self.checked_idx = pos;
            return LineStatus::Open;
        }
        if self.buf[pos + 1] == b'\n' {
            self.checked_idx = pos + 2;
            return LineStatus::Ok;
        }
        self.checked_idx = pos;
        LineStatus::Bad
    }

    /// Drive the state machine as far as the buffered bytes allow.
    pub fn parse(&mut self) -> HttpCode {
        loop {
            if self.state == CheckState::Content {
                return self.parse_content();
            }

            match self.parse_line() {
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
                LineStatus::Ok => {}
            }

            let (start, end) = (self.start_line, self.checked_idx - 2);
            self.start_line = self.checked_idx;

            let code = match self.state {
                CheckState::RequestLine => self.parse_request_line(start, end),
                CheckState::Headers => self.parse_headers(start, end),
                CheckState::Content => unreachable!("content is handled before line scanning"),
            };
            if code != HttpCode::NoRequest {
                return code;
            }
        }
    }

    fn parse_request_line(&mut self, start: usize, end: usize) -> HttpCode {
        let line = &self.buf[start..end];
        let mut parts = line
            .split(|b| *b == b' ' || *b == b'\t')
            .filter(|part| !part.is_empty());

        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return HttpCode::BadRequest;
        };

        let method = Method::from_bytes(method);
        if !method.is_supported() {
            return HttpCode::BadRequest;
        }
        if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
            return HttpCode::BadRequest;
        }
        let Ok(target) = std::str::from_utf8(target) else {
            return HttpCode::BadRequest;
        };
        let Some(path) = strip_authority(target) else {
            return HttpCode::BadRequest;
        };
        let path = path.split('?').next().unwrap_or(path);

        self.method = method;
        self.has_body = method == Method::Post;
        self.url.clear();
        self.url.push_str(if path == "/" { "/index.html" } else { path });
        self.version.clear();
        self.version.push_str("HTTP/1.1");
        self.state = CheckState::Headers;
        HttpCode::NoRequest
    }

    fn parse_headers(&mut self, start: usize, end: usize) -> HttpCode {
        if start == end {
            if self.content_length == 0 {
                return HttpCode::GetRequest;
            }
            // The body must fit in what is left of the buffer.
            if self.body_end().is_none_or(|end| end > self.buf.len()) {
                return HttpCode::BadRequest;
            }
            self.state = CheckState::Content;
            return HttpCode::NoRequest;
        }

        let line = &self.buf[start..end];
        let Some(colon) = memchr(b':', line) else {
            return HttpCode::BadRequest;
        };
        let name = line[..colon].trim_ascii();
        let value = line[colon + 1..].trim_ascii();

        if name.eq_ignore_ascii_case(b"connection") {
            self.keep_alive = value
                .split(|b| *b == b',')
                .any(|token| token.trim_ascii().eq_ignore_ascii_case(b"keep-alive"));
        } else if name.eq_ignore_ascii_case(b"content-length") {
            if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
                return HttpCode::BadRequest;
            }
            match std::str::from_utf8(value).ok().and_then(|v| v.parse::<usize>().ok()) {
                Some(len) => self.content_length = len,
                None => return HttpCode::BadRequest,
            }
        } else if name.eq_ignore_ascii_case(b"host") {
            self.host = String::from_utf8_lossy(value).into_owned();
        } else {
            debug!(header = %String::from_utf8_lossy(name), "ignoring header");
        }
        HttpCode::NoRequest
    }

    fn parse_content(&mut self) -> HttpCode {
        match self.body_end() {
            Some(end) if self.read_idx >= end => {
                self.body_start = Some(self.checked_idx);
                HttpCode::GetRequest
            }
            Some(_) => HttpCode::NoRequest,
            None => HttpCode::BadRequest,
        }
    }

    /// Where the declared body ends, if that is addressable at all.
    fn body_end(&self) -> Option<usize> {
        self.checked_idx.checked_add(self.content_length)
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn has_body(&self) -> bool {
        self.has_body
    }

    /// The complete body, once the content state has been satisfied.
    pub fn body(&self) -> Option<&[u8]> {
        let start = self.body_start?;
        self.buf.get(start..start.checked_add(self.content_length)?)
    }

    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// `http://host/path` and `https://host/path` become `/path`.
fn strip_authority(target: &str) -> Option<&str> {
    for scheme in ["http://", "https://"] {
        let matches = target
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme));
        if matches {
            let rest = &target[scheme.len()..];
            return rest.find('/').map(|idx| &rest[idx..]);
        }
    }
    target.starts_with('/').then_some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET_KEEP_ALIVE: &[u8] =
        b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n";
    const POST_LOGIN: &[u8] =
        b"POST /login HTTP/1.1\r\nHost: x\r\nContent-Length: 22\r\n\r\nuser=a&password=b12345";

    fn parse_whole(req: &[u8]) -> (HttpCode, RequestParser) {
        let mut parser = RequestParser::new();
        assert_eq!(parser.feed(req), req.len());
        let code = parser.parse();
        (code, parser)
    }

    /// Feed `req` in the given chunk sizes, parsing after every chunk.
    fn parse_split(req: &[u8], sizes: impl Iterator<Item = usize>) -> (Vec<HttpCode>, RequestParser) {
        let mut parser = RequestParser::new();
        let mut codes = Vec::new();
        let mut pos = 0;
        for size in sizes {
            if pos >= req.len() {
                break;
            }
            let end = (pos + size.max(1)).min(req.len());
            parser.feed(&req[pos..end]);
            pos = end;
            codes.push(parser.parse());
        }
        if pos < req.len() {
            parser.feed(&req[pos..]);
            codes.push(parser.parse());
        }
        (codes, parser)
    }

    fn same_request(a: &RequestParser, b: &RequestParser) {
        assert_eq!(a.method(), b.method());
        assert_eq!(a.url(), b.url());
        assert_eq!(a.version(), b.version());
        assert_eq!(a.content_length(), b.content_length());
        assert_eq!(a.keep_alive(), b.keep_alive());
        assert_eq!(a.host(), b.host());
        assert_eq!(a.body(), b.body());
    }

    #[test]
    fn test_parse_basic_get() {
        let (code, parser) = parse_whole(GET_KEEP_ALIVE);
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.method(), Method::Get);
        assert_eq!(parser.url(), "/index.html");
        assert_eq!(parser.version(), "HTTP/1.1");
        assert_eq!(parser.host(), "x");
        assert!(parser.keep_alive());
        assert!(!parser.has_body());
        assert_eq!(parser.checked_idx(), GET_KEEP_ALIVE.len());
    }

    #[test]
    fn test_split_invariance_fixed_sizes() {
        for req in [GET_KEEP_ALIVE, POST_LOGIN] {
            let (whole_code, whole) = parse_whole(req);
            assert_eq!(whole_code, HttpCode::GetRequest);
            for size in 1..=req.len() {
                let (codes, split) = parse_split(req, std::iter::repeat(size));
                let (last, rest) = codes.split_last().unwrap();
                assert_eq!(*last, HttpCode::GetRequest, "chunk size {size}");
                assert!(rest.iter().all(|c| *c == HttpCode::NoRequest), "chunk size {size}");
                same_request(&whole, &split);
            }
        }
    }

    #[test]
    fn test_split_invariance_irregular_sizes() {
        // Deterministic pseudo-random chunking.
        let mut seed = 0x2545_f491_u32;
        for _ in 0..64 {
            let sizes: Vec<usize> = (0..POST_LOGIN.len())
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    (seed % 9) as usize + 1
                })
                .collect();
            let (codes, split) = parse_split(POST_LOGIN, sizes.into_iter());
            assert_eq!(*codes.last().unwrap(), HttpCode::GetRequest);
            assert_eq!(codes.iter().filter(|c| **c == HttpCode::GetRequest).count(), 1);
            same_request(&parse_whole(POST_LOGIN).1, &split);
        }
    }

    #[test]
    fn test_malformed_request_lines() {
        for req in [
            &b"GET /index.html\r\n\r\n"[..],
            b"FOO /index.html HTTP/1.1\r\n\r\n",
            b"PUT /index.html HTTP/1.1\r\n\r\n",
            b"GET index.html HTTP/1.1\r\n\r\n",
            b"GET /index.html HTTP/2.0\r\n\r\n",
            b"GET /a HTTP/1.1 extra\r\n\r\n",
            b"GET /index.html HTTP/1.1\n\n",
            b"GET /index.html HTTP/1.1\rX\r\n",
            b"GET http://host HTTP/1.1\r\n\r\n",
        ] {
            let (code, _) = parse_whole(req);
            assert_eq!(code, HttpCode::BadRequest, "{:?}", String::from_utf8_lossy(req));
        }
    }

    #[test]
    fn test_request_line_normalisation() {
        let (code, parser) = parse_whole(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.url(), "/index.html");
        assert!(!parser.keep_alive());

        let (code, parser) =
            parse_whole(b"get\thttp://example.com/pics/a.png?v=2   http/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest, "method names are case-sensitive");
        drop(parser);

        let (code, parser) =
            parse_whole(b"GET\tHTTPS://example.com/pics/a.png?v=2   http/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.url(), "/pics/a.png");
    }

    #[test]
    fn test_post_waits_for_full_body() {
        let head = b"POST /login HTTP/1.1\r\nContent-Length: 10\r\n\r\n";
        let mut parser = RequestParser::new();
        parser.feed(head);
        assert_eq!(parser.parse(), HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::Content);

        parser.feed(b"user=");
        assert_eq!(parser.parse(), HttpCode::NoRequest);
        parser.feed(b"abcd");
        assert_eq!(parser.parse(), HttpCode::NoRequest);
        parser.feed(b"e");
        assert_eq!(parser.parse(), HttpCode::GetRequest);
        assert_eq!(parser.body(), Some(&b"user=abcde"[..]));
        assert!(parser.has_body());
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let (code, _) = parse_whole(b"POST /login HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);

        // A length that overflows the buffer index must not wrap around.
        let (code, parser) =
            parse_whole(b"POST /login HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
        assert_eq!(parser.body(), None);

        let (code, _) = parse_whole(
            b"POST /login HTTP/1.1\r\nContent-Length: 99999999999999999999999\r\n\r\n",
        );
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn test_bad_headers() {
        let (code, _) = parse_whole(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
        let (code, _) = parse_whole(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
        let (code, _) = parse_whole(b"POST /login HTTP/1.1\r\nContent-Length: +5\r\n\r\nuser=");
        assert_eq!(code, HttpCode::BadRequest);
        let (code, _) = parse_whole(b"POST /login HTTP/1.1\r\nContent-Length:\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
        let (code, parser) = parse_whole(b"GET / HTTP/1.1\r\nX-Whatever: 1\r\nconnection: Close\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert!(!parser.keep_alive());
    }

    #[test]
    fn test_reset_clears_state() {
        let (_, mut parser) = parse_whole(POST_LOGIN);
        parser.reset();
        assert_eq!(parser.read_idx(), 0);
        assert_eq!(parser.state(), CheckState::RequestLine);
        assert_eq!(parser.body(), None);
        assert_eq!(parser.url(), "");
        parser.feed(GET_KEEP_ALIVE);
        assert_eq!(parser.parse(), HttpCode::GetRequest);
    }

    #[test]
    fn test_feed_stops_at_capacity() {
        let mut parser = RequestParser::new();
        let big = vec![b'a'; READ_BUFFER_SIZE + 10];
        assert_eq!(parser.feed(&big), READ_BUFFER_SIZE);
        assert!(parser.is_full());
        assert_eq!(parser.parse(), HttpCode::NoRequest);
    }
}
