// src/conn.rs
//! Per-connection state: the incremental request parser, the dispatch
//! into the router, and the scatter-gather writer. One instance lives in
//! each slot of the server's fd-indexed table and is recycled on close.
//!
//! The one-shot epoll discipline guarantees a single thread advances a
//! given connection at a time, so the state here needs no locking of its
//! own beyond the slot mutex.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::config::TriggerMode;
use crate::http::{HttpRequest, HttpResponse, Method, READ_BUFFER_SIZE};
use crate::parser::{self, CheckState, HeaderLine, LineStatus, ParseCode};
use crate::router::Router;
use crate::store::UserStore;
use crate::syscalls::{self, Epoll, READ_EVENT, WRITE_EVENT};

pub struct HttpConn {
    fd: i32,
    peer: SocketAddr,
    open: bool,
    trigger: TriggerMode,

    read_buf: [u8; READ_BUFFER_SIZE],
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,

    check_state: CheckState,
    method: Method,
    url: String,
    version: String,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,
    body: Vec<u8>,

    pub resp: HttpResponse,
}

impl HttpConn {
    /// An unused table slot. `init` turns it into a live connection.
    pub fn vacant(doc_root: &Path) -> Self {
        Self {
            fd: -1,
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            open: false,
            trigger: TriggerMode::Level,
            read_buf: [0; READ_BUFFER_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            check_state: CheckState::RequestLine,
            method: Method::Get,
            url: String::new(),
            version: String::new(),
            host: None,
            content_length: 0,
            keep_alive: false,
            body: Vec::new(),
            resp: HttpResponse::new(doc_root.to_path_buf()),
        }
    }

    pub fn init(&mut self, fd: i32, peer: SocketAddr, trigger: TriggerMode) {
        self.fd = fd;
        self.peer = peer;
        self.open = true;
        self.trigger = trigger;
        self.reset_parse();
        self.resp.reset(false);
    }

    /// Recycle between keep-alive requests. The buffers are not zeroed;
    /// the indices alone bound what is visible.
    fn reset_for_next(&mut self) {
        self.reset_parse();
        self.resp.reset(false);
    }

    fn reset_parse(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.version.clear();
        self.host = None;
        self.content_length = 0;
        self.keep_alive = false;
        self.body.clear();
    }

    pub(crate) fn close(&mut self) {
        self.open = false;
        self.fd = -1;
        self.resp.unmap();
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Pull whatever the socket has into the read buffer. Level-triggered
    /// mode reads once and relies on epoll re-reporting; edge-triggered
    /// mode drains until the socket would block. `false` means the
    /// connection is done for (peer gone, hard error, or buffer full).
    pub fn read_once(&mut self) -> bool {
        if self.read_idx >= READ_BUFFER_SIZE {
            return false;
        }
        match self.trigger {
            TriggerMode::Level => {
                match syscalls::recv_bytes(self.fd, &mut self.read_buf[self.read_idx..]) {
                    Ok(0) => false,
                    Ok(n) => {
                        self.read_idx += n;
                        true
                    }
                    Err(_) => false,
                }
            }
            TriggerMode::Edge => loop {
                match syscalls::recv_bytes(self.fd, &mut self.read_buf[self.read_idx..]) {
                    Ok(0) => return false,
                    Ok(n) => self.read_idx += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                    Err(_) => return false,
                }
            },
        }
    }

    /// Advance the parse as far as the buffered bytes allow, dispatching
    /// a complete request into the router. `NoRequest` means "come back
    /// with more bytes".
    pub(crate) fn process_read(
        &mut self,
        router: &Router,
        store: &mut dyn UserStore,
    ) -> ParseCode {
        loop {
            if self.check_state == CheckState::Body {
                if self.read_idx >= self.checked_idx + self.content_length {
                    let start = self.checked_idx;
                    self.body = self.read_buf[start..start + self.content_length].to_vec();
                    self.checked_idx += self.content_length;
                    return self.do_request(router, store);
                }
                return ParseCode::NoRequest;
            }

            match parser::extract_line(&mut self.read_buf, &mut self.checked_idx, self.read_idx) {
                LineStatus::Open => return ParseCode::NoRequest,
                LineStatus::Bad => return ParseCode::BadRequest,
                LineStatus::Ok => {}
            }
            let line = match self.current_line() {
                Some(line) => line,
                None => return ParseCode::BadRequest,
            };
            self.start_line = self.checked_idx;

            match self.check_state {
                CheckState::RequestLine => match parser::parse_request_line(&line) {
                    Some(parsed) => {
                        log::debug!("request line: {} {}", parsed.method, parsed.url);
                        self.method = parsed.method;
                        self.url = if parsed.url == "/" {
                            "/judge.html".to_string()
                        } else {
                            parsed.url.to_string()
                        };
                        self.version = parsed.version.to_string();
                        self.check_state = CheckState::Headers;
                    }
                    None => return ParseCode::BadRequest,
                },
                CheckState::Headers => {
                    if line.is_empty() {
                        if self.content_length > 0 {
                            self.check_state = CheckState::Body;
                        } else {
                            return self.do_request(router, store);
                        }
                    } else {
                        match parser::parse_header_line(&line) {
                            HeaderLine::Connection(value) => {
                                if value.eq_ignore_ascii_case("keep-alive") {
                                    self.keep_alive = true;
                                }
                            }
                            HeaderLine::ContentLength(value) => {
                                self.content_length = value.trim().parse().unwrap_or(0);
                            }
                            HeaderLine::Host(value) => {
                                self.host = Some(value.to_string());
                            }
                            HeaderLine::Other(_) => {
                                log::debug!("ignoring unknown header: {}", line);
                            }
                        }
                    }
                }
                CheckState::Body => unreachable!("body phase handled above"),
            }
        }
    }

    fn do_request(&mut self, router: &Router, store: &mut dyn UserStore) -> ParseCode {
        self.apply_page_alias();
        let request = HttpRequest {
            method: self.method,
            path: self.url.clone(),
            version: self.version.clone(),
            host: self.host.clone(),
            keep_alive: self.keep_alive,
            peer: self.peer,
            body: std::mem::take(&mut self.body),
        };
        self.resp.reset(self.keep_alive);
        router.handle(&request, &mut self.resp, store)
    }

    /// Legacy one-digit action codes select fixed pages.
    fn apply_page_alias(&mut self) {
        let alias = match self.url.as_str() {
            "/0" => "/register.html",
            "/1" => "/log.html",
            "/5" => "/picture.html",
            "/6" => "/video.html",
            "/7" => "/fans.html",
            _ => return,
        };
        self.url = alias.to_string();
    }

    /// Parse buffered bytes and, when a request completes, stage the
    /// response and flip the descriptor to writable. `false` asks the
    /// reactor to close this connection.
    pub fn process(&mut self, epoll: &Epoll, router: &Router, store: &mut dyn UserStore) -> bool {
        let code = self.process_read(router, store);
        if code == ParseCode::NoRequest {
            return epoll
                .modify(self.fd, READ_EVENT, self.trigger, true)
                .is_ok();
        }
        let ready = match code {
            ParseCode::FileRequest | ParseCode::GetRequest => true,
            ParseCode::ClosedConnection => false,
            other => self.resp.prepare_error(other),
        };
        if !ready {
            return false;
        }
        epoll
            .modify(self.fd, WRITE_EVENT, self.trigger, true)
            .is_ok()
    }

    /// Push pending response bytes. Returns `false` when the connection
    /// should be closed (error, or a completed non-keep-alive exchange).
    pub fn write(&mut self, epoll: &Epoll) -> bool {
        if self.resp.remaining() == 0 {
            let ok = epoll
                .modify(self.fd, READ_EVENT, self.trigger, true)
                .is_ok();
            self.reset_for_next();
            return ok;
        }
        loop {
            let (head, tail) = self.resp.pending_slices();
            let written = syscalls::writev_slices(self.fd, head, tail);
            match written {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return epoll
                        .modify(self.fd, WRITE_EVENT, self.trigger, true)
                        .is_ok();
                }
                Err(_) => {
                    self.resp.unmap();
                    return false;
                }
                Ok(n) => self.resp.advance(n),
            }
            if self.resp.remaining() == 0 {
                self.resp.unmap();
                if !self.keep_alive {
                    return false;
                }
                let ok = epoll
                    .modify(self.fd, READ_EVENT, self.trigger, true)
                    .is_ok();
                self.reset_for_next();
                return ok;
            }
        }
    }

    fn current_line(&self) -> Option<String> {
        let bytes = &self.read_buf[self.start_line..];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end])
            .ok()
            .map(|s| s.to_string())
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.read_buf[self.read_idx..self.read_idx + bytes.len()].copy_from_slice(bytes);
        self.read_idx += bytes.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::fs;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn root_with(pages: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in pages {
            fs::File::create(dir.path().join(name))
                .unwrap()
                .write_all(content.as_bytes())
                .unwrap();
        }
        dir
    }

    fn live_conn(root: &Path, trigger: TriggerMode) -> HttpConn {
        let mut conn = HttpConn::vacant(root);
        conn.init(
            -1,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            trigger,
        );
        conn
    }

    fn response_text(conn: &HttpConn) -> String {
        let (head, tail) = conn.resp.pending_slices();
        let mut text = String::from_utf8_lossy(head).into_owned();
        text.push_str(&String::from_utf8_lossy(tail));
        text
    }

    #[test]
    fn root_url_is_rewritten_to_judge_page() {
        let root = root_with(&[("judge.html", "<html>judge</html>")]);
        let mut conn = live_conn(root.path(), TriggerMode::Level);
        let router = Router::new();
        let mut store = MemoryStore::new();

        conn.feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let code = conn.process_read(&router, &mut store);
        assert_eq!(code, ParseCode::FileRequest);
        let text = response_text(&conn);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type:text/html\r\n"));
        assert!(text.ends_with("<html>judge</html>"));
    }

    #[test]
    fn chunked_feeding_matches_whole_feeding() {
        let root = root_with(&[("page.html", "x")]);
        let request = b"GET /page.html HTTP/1.1\r\nHost: a\r\nConnection: keep-alive\r\n\r\n";
        let router = Router::new();
        let mut store = MemoryStore::new();

        let mut whole = live_conn(root.path(), TriggerMode::Level);
        whole.feed(request);
        let whole_code = whole.process_read(&router, &mut store);

        let mut chunked = live_conn(root.path(), TriggerMode::Level);
        let mut last = ParseCode::NoRequest;
        for (i, byte) in request.iter().enumerate() {
            chunked.feed(&[*byte]);
            last = chunked.process_read(&router, &mut store);
            if i + 1 < request.len() {
                assert_eq!(last, ParseCode::NoRequest, "early terminal at byte {}", i);
            }
        }
        assert_eq!(last, whole_code);
        assert_eq!(last, ParseCode::FileRequest);
        assert!(chunked.keep_alive);
    }

    #[test]
    fn missing_page_yields_not_found_form() {
        let root = root_with(&[]);
        let mut conn = live_conn(root.path(), TriggerMode::Level);
        let router = Router::new();
        let mut store = MemoryStore::new();

        conn.feed(b"GET /nonexistent HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(
            conn.process_read(&router, &mut store),
            ParseCode::NoResource
        );
    }

    #[test]
    fn unsupported_method_is_bad_request() {
        let root = root_with(&[]);
        let mut conn = live_conn(root.path(), TriggerMode::Level);
        let router = Router::new();
        let mut store = MemoryStore::new();

        conn.feed(b"PUT /x HTTP/1.1\r\n\r\n");
        assert_eq!(conn.process_read(&router, &mut store), ParseCode::BadRequest);
    }

    #[test]
    fn post_body_reaches_the_handler() {
        let root = root_with(&[]);
        let router = Router::new();
        router.post("/login", |req: &HttpRequest, res: &mut HttpResponse, _store: &mut dyn UserStore| {
            let user = req.form_value("user").unwrap_or("?").to_string();
            res.send(200, &format!("hello {}", user));
        });
        let mut store = MemoryStore::new();
        let mut conn = live_conn(root.path(), TriggerMode::Level);

        let body = b"user=a&passwd=b";
        conn.feed(
            format!(
                "POST /login HTTP/1.1\r\nContent-Length:{}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        );
        conn.feed(body);
        assert_eq!(
            conn.process_read(&router, &mut store),
            ParseCode::FileRequest
        );
        assert!(response_text(&conn).ends_with("hello a"));
    }

    #[test]
    fn split_body_waits_for_missing_bytes() {
        let root = root_with(&[]);
        let router = Router::new();
        router.post("/e", |req: &HttpRequest, res: &mut HttpResponse, _store: &mut dyn UserStore| {
            res.send(200, &format!("{} bytes", req.body.len()));
        });
        let mut store = MemoryStore::new();
        let mut conn = live_conn(root.path(), TriggerMode::Level);

        conn.feed(b"POST /e HTTP/1.1\r\nContent-Length:10\r\n\r\n12345");
        assert_eq!(conn.process_read(&router, &mut store), ParseCode::NoRequest);
        conn.feed(b"67890");
        assert_eq!(
            conn.process_read(&router, &mut store),
            ParseCode::FileRequest
        );
        assert!(response_text(&conn).ends_with("10 bytes"));
    }

    #[test]
    fn digit_codes_select_legacy_pages() {
        let root = root_with(&[("register.html", "reg")]);
        let mut conn = live_conn(root.path(), TriggerMode::Level);
        let router = Router::new();
        let mut store = MemoryStore::new();

        conn.feed(b"GET /0 HTTP/1.1\r\n\r\n");
        assert_eq!(
            conn.process_read(&router, &mut store),
            ParseCode::FileRequest
        );
        assert!(response_text(&conn).ends_with("reg"));
    }

    #[test]
    fn read_once_drains_socket_in_edge_mode() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let root = root_with(&[]);
        let mut conn = live_conn(root.path(), TriggerMode::Edge);
        conn.fd = ours.as_raw_fd();

        (&theirs).write_all(b"GET / HTTP/1.1\r\n").unwrap();
        assert!(conn.read_once());
        assert_eq!(&conn.read_buf[..conn.read_idx], &b"GET / HTTP/1.1\r\n"[..]);

        drop(theirs);
        assert!(!conn.read_once());
    }

    #[test]
    fn read_once_reports_peer_close_in_level_mode() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let root = root_with(&[]);
        let mut conn = live_conn(root.path(), TriggerMode::Level);
        conn.fd = ours.as_raw_fd();

        (&theirs).write_all(b"abc").unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.read_idx, 3);

        drop(theirs);
        assert!(!conn.read_once());
    }
}
