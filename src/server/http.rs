/*!
HTTP/1.1 plumbing for the bridge listeners: tolerant request-head parsing,
streaming body framing, a size-limiting reader, and response writers.

Head parsing accepts CRLFCRLF and LFLF terminators and caps the head at 64 KiB.
Bodies are never buffered here: `BodyReader` yields exactly the framed body
(Content-Length or chunked) starting with whatever bytes were read past the
head, and `LimitReader` turns "more than N bytes" into a distinct error.
Every response closes the connection.
*/
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};

use crate::types::WireHeaders;
use crate::util::{canonical_header_key, find_header_end};

const HDR_CAP: usize = 64 * 1024;
const MAX_HEADERS: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    /// Uppercased method token.
    pub method: String,
    /// Raw request target as sent (path plus query).
    pub target: String,
    /// Raw path component of the target (no query, not decoded).
    pub path: String,
    /// Header fields in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Headers grouped by canonical name, the shape the UI receives.
    pub fn wire_headers(&self) -> WireHeaders {
        let mut out = WireHeaders::new();
        for (k, v) in &self.headers {
            out.entry(canonical_header_key(k))
                .or_default()
                .push(v.clone());
        }
        out
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

#[derive(Debug)]
pub(crate) enum HeadError {
    /// Peer closed before sending anything.
    Closed,
    TooLarge,
    Malformed(String),
    Io(io::Error),
}

/// Read and parse a request head. Returns the head and the bytes already read past it.
pub(crate) fn read_request_head<R: Read>(reader: &mut R) -> Result<(RequestHead, Vec<u8>), HeadError> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() >= HDR_CAP {
            return Err(HeadError::TooLarge);
        }
        let n = reader.read(&mut tmp).map_err(HeadError::Io)?;
        if n == 0 {
            if buf.is_empty() {
                return Err(HeadError::Closed);
            }
            return Err(HeadError::Malformed("incomplete request head".to_string()));
        }
        buf.extend_from_slice(&tmp[..n]);
    };
    if header_end > HDR_CAP {
        return Err(HeadError::TooLarge);
    }

    let leftover = buf[header_end..].to_vec();
    let head_str = String::from_utf8_lossy(&buf[..header_end]);
    let mut lines = head_str.lines();
    let request_line = lines.next().unwrap_or_default().trim().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_ascii_uppercase();
    let target = parts.next().unwrap_or("").to_string();
    if method.is_empty() || target.is_empty() {
        return Err(HeadError::Malformed(format!(
            "invalid request line: {request_line}"
        )));
    }
    let path = target.split('?').next().unwrap_or(&target).to_string();

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
            if headers.len() > MAX_HEADERS {
                return Err(HeadError::TooLarge);
            }
        }
    }

    Ok((
        RequestHead {
            method,
            target,
            path,
            headers,
        },
        leftover,
    ))
}

enum Framing {
    Length(u64),
    Chunked(ChunkState),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Done,
}

/// Streams exactly the request body; signals EOF at the end of the framing.
pub(crate) struct BodyReader<'a, R: Read> {
    inner: &'a mut R,
    prefix: Vec<u8>,
    pos: usize,
    framing: Framing,
}

impl<'a, R: Read> BodyReader<'a, R> {
    pub fn new(head: &RequestHead, leftover: Vec<u8>, inner: &'a mut R) -> Self {
        let framing = if head.is_chunked() {
            Framing::Chunked(ChunkState::Size)
        } else {
            Framing::Length(head.content_length().unwrap_or(0))
        };
        BodyReader {
            inner,
            prefix: leftover,
            pos: 0,
            framing,
        }
    }

    fn raw_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.prefix.len() {
            let n = buf.len().min(self.prefix.len() - self.pos);
            buf[..n].copy_from_slice(&self.prefix[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read(buf)
    }

    fn raw_read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();
        let mut b = [0u8; 1];
        loop {
            let n = self.raw_read(&mut b)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated chunked body",
                ));
            }
            if b[0] == b'\n' {
                break;
            }
            line.push(b[0]);
            if line.len() > 4096 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk size line too long",
                ));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn read_chunked(&mut self, buf: &mut [u8], state: ChunkState) -> io::Result<(usize, ChunkState)> {
        let mut state = state;
        loop {
            match state {
                ChunkState::Done => return Ok((0, ChunkState::Done)),
                ChunkState::Size => {
                    let line = self.raw_read_line()?;
                    let size_hex = line.split(';').next().unwrap_or("").trim();
                    if size_hex.is_empty() {
                        continue;
                    }
                    let size = u64::from_str_radix(size_hex, 16).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                    })?;
                    if size == 0 {
                        // Trailers until blank line
                        loop {
                            if self.raw_read_line()?.is_empty() {
                                break;
                            }
                        }
                        state = ChunkState::Done;
                    } else {
                        state = ChunkState::Data(size);
                    }
                }
                ChunkState::Data(left) => {
                    let want = (buf.len() as u64).min(left) as usize;
                    let n = self.raw_read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "truncated chunk",
                        ));
                    }
                    let left = left - n as u64;
                    let next = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    return Ok((n, next));
                }
                ChunkState::DataEnd => {
                    let _ = self.raw_read_line()?;
                    state = ChunkState::Size;
                }
            }
        }
    }
}

impl<'a, R: Read> Read for BodyReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.framing {
            Framing::Length(0) => Ok(0),
            Framing::Length(left) => {
                let want = (buf.len() as u64).min(left) as usize;
                let n = self.raw_read(&mut buf[..want])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body shorter than Content-Length",
                    ));
                }
                self.framing = Framing::Length(left - n as u64);
                Ok(n)
            }
            Framing::Chunked(state) => {
                let (n, next) = self.read_chunked(buf, state)?;
                self.framing = Framing::Chunked(next);
                Ok(n)
            }
        }
    }
}

/// Marker error for bodies over the configured limit.
#[derive(Debug)]
pub(crate) struct BodyTooLarge(pub u64);

impl fmt::Display for BodyTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request body too large (limit {} bytes)", self.0)
    }
}

impl std::error::Error for BodyTooLarge {}

pub(crate) fn is_body_too_large(e: &io::Error) -> bool {
    e.get_ref()
        .map(|inner| inner.is::<BodyTooLarge>())
        .unwrap_or(false)
}

/// Fails with `BodyTooLarge` as soon as more than `limit` bytes come through.
pub(crate) struct LimitReader<R> {
    inner: R,
    limit: u64,
    seen: u64,
}

impl<R: Read> LimitReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        LimitReader {
            inner,
            limit,
            seen: 0,
        }
    }
}

impl<R: Read> Read for LimitReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.seen > self.limit {
            return Err(io::Error::new(io::ErrorKind::Other, BodyTooLarge(self.limit)));
        }
        // Ask for at most one byte past the limit so an oversize body is detected
        // without reading far beyond it.
        let room = (self.limit - self.seen).saturating_add(1);
        let want = (buf.len() as u64).min(room) as usize;
        let n = self.inner.read(&mut buf[..want])?;
        self.seen += n as u64;
        if self.seen > self.limit {
            return Err(io::Error::new(io::ErrorKind::Other, BodyTooLarge(self.limit)));
        }
        Ok(n)
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Status",
    }
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
}

/// Write status line and headers. Framing headers from `headers` are replaced by
/// our own Content-Length and `Connection: close`.
pub(crate) fn write_head<W: Write>(
    w: &mut W,
    status: u16,
    headers: &BTreeMap<String, String>,
    content_length: u64,
) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    for (k, v) in headers {
        if is_framing_header(k) || k.contains(['\r', '\n']) || v.contains(['\r', '\n']) {
            continue;
        }
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {content_length}\r\nConnection: close\r\n\r\n"
    ));
    w.write_all(head.as_bytes())
}

pub(crate) fn write_response<W: Write>(
    w: &mut W,
    status: u16,
    headers: &BTreeMap<String, String>,
    body: &[u8],
) -> io::Result<()> {
    write_head(w, status, headers, body.len() as u64)?;
    w.write_all(body)?;
    w.flush()
}

/// Plain-text response on top of caller headers; write errors are ignored
/// (the peer may already be gone).
pub(crate) fn respond_plain<W: Write>(
    w: &mut W,
    status: u16,
    extra: &BTreeMap<String, String>,
    body: &str,
) {
    let mut headers = extra.clone();
    headers
        .entry("Content-Type".to_string())
        .or_insert_with(|| "text/plain; charset=utf-8".to_string());
    let _ = write_response(w, status, &headers, body.as_bytes());
}

pub(crate) fn respond_status<W: Write>(w: &mut W, status: u16, body: &str) {
    respond_plain(w, status, &BTreeMap::new(), body);
}
