// src/parser.rs
//! Line-oriented request parsing over the connection's read buffer.
//!
//! `extract_line` walks raw bytes and zero-terminates complete lines in
//! place; the request-line and header helpers then work on `&str` views
//! of those terminated lines. The connection state machine in `conn.rs`
//! drives the two in alternation.

use crate::http::Method;

/// Phase of the incremental request parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    Body,
}

/// Outcome of scanning for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line was terminated in place.
    Ok,
    /// Malformed line break.
    Bad,
    /// Ran out of bytes mid-line.
    Open,
}

/// Terminal and intermediate codes of the request processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseCode {
    NoRequest,
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    InternalError,
    ClosedConnection,
}

/// Scan forward from `checked_idx` for a CRLF. On success both break
/// bytes are rewritten to NUL so the line reads as a zero-terminated
/// string, and `checked_idx` lands on the first byte of the next line.
pub fn extract_line(buf: &mut [u8], checked_idx: &mut usize, read_idx: usize) -> LineStatus {
    while *checked_idx < read_idx {
        let byte = buf[*checked_idx];
        if byte == b'\r' {
            if *checked_idx + 1 == read_idx {
                return LineStatus::Open;
            }
            if buf[*checked_idx + 1] == b'\n' {
                buf[*checked_idx] = 0;
                buf[*checked_idx + 1] = 0;
                *checked_idx += 2;
                return LineStatus::Ok;
            }
            return LineStatus::Bad;
        }
        if byte == b'\n' {
            // Tolerated lone LF, but only directly after a CR.
            if *checked_idx >= 1 && buf[*checked_idx - 1] == b'\r' {
                buf[*checked_idx - 1] = 0;
                buf[*checked_idx] = 0;
                *checked_idx += 1;
                return LineStatus::Ok;
            }
            return LineStatus::Bad;
        }
        *checked_idx += 1;
    }
    LineStatus::Open
}

pub struct RequestLine<'a> {
    pub method: Method,
    pub url: &'a str,
    pub version: &'a str,
}

/// Split `METHOD URL VERSION` on runs of SP/HT. Only GET and POST are
/// accepted; the version must be HTTP/1.1; an absolute-form URL has its
/// `http://host` / `https://host` prefix stripped down to the path.
pub fn parse_request_line(line: &str) -> Option<RequestLine<'_>> {
    let ws = |c: char| c == ' ' || c == '\t';

    let method_end = line.find(ws)?;
    let method = match &line[..method_end] {
        m if m.eq_ignore_ascii_case("GET") => Method::Get,
        m if m.eq_ignore_ascii_case("POST") => Method::Post,
        _ => return None,
    };

    let rest = line[method_end..].trim_start_matches(ws);
    let url_end = rest.find(ws)?;
    let mut url = &rest[..url_end];
    let version = rest[url_end..].trim_start_matches(ws);
    if !version.eq_ignore_ascii_case("HTTP/1.1") {
        return None;
    }

    for prefix in ["http://", "https://"] {
        if url.len() >= prefix.len() && url[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let host_and_path = &url[prefix.len()..];
            url = &host_and_path[host_and_path.find('/')?..];
        }
    }
    if !url.starts_with('/') {
        return None;
    }

    Some(RequestLine {
        method,
        url,
        version,
    })
}

/// One parsed header line, dispatched on a case-insensitive name prefix.
pub enum HeaderLine<'a> {
    Connection(&'a str),
    ContentLength(&'a str),
    Host(&'a str),
    Other(&'a str),
}

pub fn parse_header_line(line: &str) -> HeaderLine<'_> {
    fn value_of(rest: &str) -> &str {
        rest.trim_start_matches(|c| c == ' ' || c == '\t')
    }
    if let Some(rest) = strip_prefix_ignore_case(line, "Connection:") {
        HeaderLine::Connection(value_of(rest))
    } else if let Some(rest) = strip_prefix_ignore_case(line, "Content-Length:") {
        HeaderLine::ContentLength(value_of(rest))
    } else if let Some(rest) = strip_prefix_ignore_case(line, "Host:") {
        HeaderLine::Host(value_of(rest))
    } else {
        HeaderLine::Other(line)
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}
