// src/http.rs
//! Request/response types and the response builder.
//!
//! A response is assembled directly into a 1 KiB header buffer with
//! checked appends. Inline bodies ride in the same buffer; static files
//! are mmapped and sent as the second scatter-gather slot.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::parser::ParseCode;
use crate::syscalls::MappedFile;

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

pub(crate) const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub(crate) const ERROR_403_FORM: &str =
    "You do not have permission to get file from this server.\n";
pub(crate) const ERROR_404_FORM: &str = "The request file was not found on this server.\n";
pub(crate) const ERROR_500_FORM: &str =
    "There was an unusual problem serving the request file.\n";
const EMPTY_PAGE: &str = "<html><body></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parsed request handed to route handlers.
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub host: Option<String>,
    pub keep_alive: bool,
    pub peer: SocketAddr,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Body parsed as a JSON tree, when it is one.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Lookup in a `key=value&key=value` form body.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        let body = self.body_str()?;
        body.split('&').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            (name == key).then_some(value)
        })
    }
}

/// Why a static render was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderError {
    NotFound,
    Forbidden,
    IsDirectory,
    Internal,
}

impl RenderError {
    pub(crate) fn code(self) -> ParseCode {
        match self {
            RenderError::NotFound => ParseCode::NoResource,
            RenderError::Forbidden => ParseCode::ForbiddenRequest,
            RenderError::IsDirectory => ParseCode::BadRequest,
            RenderError::Internal => ParseCode::InternalError,
        }
    }
}

pub struct HttpResponse {
    write_buf: [u8; WRITE_BUFFER_SIZE],
    write_idx: usize,
    doc_root: PathBuf,
    keep_alive: bool,
    file: Option<MappedFile>,
    real_path: PathBuf,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl HttpResponse {
    pub fn new(doc_root: PathBuf) -> Self {
        Self {
            write_buf: [0; WRITE_BUFFER_SIZE],
            write_idx: 0,
            doc_root,
            keep_alive: false,
            file: None,
            real_path: PathBuf::new(),
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    pub(crate) fn reset(&mut self, keep_alive: bool) {
        self.start_fresh();
        self.keep_alive = keep_alive;
        self.real_path = PathBuf::new();
    }

    fn start_fresh(&mut self) {
        self.write_idx = 0;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
        self.file = None;
    }

    /// Inline response: status line, headers and the body all in the
    /// header buffer, one scatter-gather slot.
    pub fn send(&mut self, status: u16, content: &str) -> bool {
        self.start_fresh();
        let ok = self.add_status_line(status)
            && self.add_content_type("text/plain")
            && self.add_content_length(content.len())
            && self.add_linger()
            && self.add_blank_line()
            && self.add_content(content);
        if !ok {
            return false;
        }
        self.bytes_to_send = self.write_idx;
        true
    }

    /// Static-file response: headers in the buffer, the file mapped
    /// read-only as the second slot.
    pub fn render(&mut self, status: u16, path: &str) -> Result<(), RenderError> {
        self.start_fresh();
        let full = self.doc_root.join(path.trim_start_matches('/'));
        let meta = fs::metadata(&full).map_err(|_| RenderError::NotFound)?;
        if meta.permissions().mode() & 0o004 == 0 {
            return Err(RenderError::Forbidden);
        }
        if meta.is_dir() {
            return Err(RenderError::IsDirectory);
        }
        self.real_path = full.clone();

        let len = meta.len() as usize;
        if len == 0 {
            let ok = self.add_status_line(status)
                && self.add_content_type(content_type_for(path))
                && self.add_content_length(EMPTY_PAGE.len())
                && self.add_linger()
                && self.add_blank_line()
                && self.add_content(EMPTY_PAGE);
            if !ok {
                return Err(RenderError::Internal);
            }
            self.bytes_to_send = self.write_idx;
            return Ok(());
        }

        let file = MappedFile::open(&full, len).map_err(|_| RenderError::Internal)?;
        let ok = self.add_status_line(status)
            && self.add_content_type(content_type_for(path))
            && self.add_content_length(len)
            && self.add_linger()
            && self.add_blank_line();
        if !ok {
            return Err(RenderError::Internal);
        }
        self.file = Some(file);
        self.bytes_to_send = self.write_idx + len;
        Ok(())
    }

    /// Canonical error page for a terminal parse/render code.
    pub(crate) fn prepare_error(&mut self, code: ParseCode) -> bool {
        match code {
            ParseCode::BadRequest => self.send(400, ERROR_400_FORM),
            ParseCode::NoResource => self.send(404, ERROR_404_FORM),
            ParseCode::ForbiddenRequest => self.send(403, ERROR_403_FORM),
            _ => self.send(500, ERROR_500_FORM),
        }
    }

    /// Drop the mapping. Safe to call repeatedly.
    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// On-disk path of the last successful render.
    pub fn resolved_path(&self) -> Option<&Path> {
        if self.real_path.as_os_str().is_empty() {
            None
        } else {
            Some(self.real_path.as_path())
        }
    }

    pub(crate) fn prepared(&self) -> bool {
        self.bytes_to_send > 0
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes_to_send
    }

    pub(crate) fn sent(&self) -> usize {
        self.bytes_have_send
    }

    pub(crate) fn header_len(&self) -> usize {
        self.write_idx
    }

    pub(crate) fn mapped_len(&self) -> usize {
        self.file.as_ref().map_or(0, |f| f.len())
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.bytes_have_send += n;
        self.bytes_to_send = self.bytes_to_send.saturating_sub(n);
    }

    /// The two scatter-gather slots as they stand: first the unsent tail
    /// of the header buffer, then the unsent tail of the mapped file.
    pub(crate) fn pending_slices(&self) -> (&[u8], &[u8]) {
        let file = self.file.as_ref().map_or(&[][..], |f| f.as_slice());
        if self.bytes_have_send < self.write_idx {
            (&self.write_buf[self.bytes_have_send..self.write_idx], file)
        } else {
            let offset = (self.bytes_have_send - self.write_idx).min(file.len());
            (&self.write_buf[0..0], &file[offset..])
        }
    }

    fn add_response(&mut self, args: fmt::Arguments) -> bool {
        if self.write_idx >= WRITE_BUFFER_SIZE {
            return false;
        }
        let mut cursor = io::Cursor::new(&mut self.write_buf[self.write_idx..]);
        match cursor.write_fmt(args) {
            Ok(()) => {
                self.write_idx += cursor.position() as usize;
                true
            }
            Err(_) => false,
        }
    }

    fn add_status_line(&mut self, status: u16) -> bool {
        self.add_response(format_args!(
            "HTTP/1.1 {} {}\r\n",
            status,
            status_message(status)
        ))
    }

    fn add_content_type(&mut self, content_type: &str) -> bool {
        self.add_response(format_args!("Content-Type:{}\r\n", content_type))
    }

    fn add_content_length(&mut self, len: usize) -> bool {
        self.add_response(format_args!("Content-Length:{}\r\n", len))
    }

    fn add_linger(&mut self) -> bool {
        self.add_response(format_args!(
            "Connection:{}\r\n",
            if self.keep_alive { "keep-alive" } else { "close" }
        ))
    }

    fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }
}

fn status_message(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown Status",
    }
}

fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "css" => "text/css",
        "js" => "application/javascript",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "mp4" => "video/mp4",
        _ => "text/html",
    }
}
