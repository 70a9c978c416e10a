/*!
Streaming `multipart/form-data` reader.

Parts are consumed in order: `next_part` yields the part headers, `copy_part`
streams the part body to a writer without buffering more than one read chunk
plus a delimiter-sized tail. A part left unread is skipped by the next call
to `next_part`.
*/
use std::io::{self, Read, Write};

use crate::util::strip_outer_quotes;

const CHUNK: usize = 8192;
const MAX_PART_HEADER: usize = 16 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PartHeaders {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Boundary parameter of a `multipart/form-data` content type, if any.
pub(crate) fn boundary_from_content_type(ct: &str) -> Option<String> {
    let mut parts = ct.split(';');
    let mime = parts.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    for p in parts {
        if let Some((k, v)) = p.split_once('=') {
            if k.trim().eq_ignore_ascii_case("boundary") {
                let b = strip_outer_quotes(v.trim());
                if !b.is_empty() && b.len() <= 70 {
                    return Some(b);
                }
            }
        }
    }
    None
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("multipart: {msg}"))
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "multipart: unexpected end of body")
}

pub(crate) struct Multipart<R: Read> {
    inner: R,
    delim: Vec<u8>,
    buf: Vec<u8>,
    eof: bool,
    started: bool,
    in_part: bool,
    finished: bool,
}

impl<R: Read> Multipart<R> {
    pub fn new(inner: R, boundary: &str) -> Self {
        let mut delim = b"\r\n--".to_vec();
        delim.extend_from_slice(boundary.as_bytes());
        Multipart {
            inner,
            delim,
            // Lets the first boundary (no leading CRLF) match the same delimiter.
            buf: b"\r\n".to_vec(),
            eof: false,
            started: false,
            in_part: false,
            finished: false,
        }
    }

    fn fill(&mut self, want: usize) -> io::Result<()> {
        let mut tmp = [0u8; CHUNK];
        while self.buf.len() < want && !self.eof {
            let n = self.inner.read(&mut tmp)?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
        Ok(())
    }

    /// Write everything before the next delimiter to `out` and consume the delimiter.
    fn copy_until_delim<W: Write>(&mut self, out: &mut W) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            if let Some(pos) = find(&self.buf, &self.delim) {
                out.write_all(&self.buf[..pos])?;
                total += pos as u64;
                self.buf.drain(..pos + self.delim.len());
                return Ok(total);
            }
            let keep = self.delim.len() - 1;
            if self.buf.len() > keep {
                let n = self.buf.len() - keep;
                out.write_all(&self.buf[..n])?;
                total += n as u64;
                self.buf.drain(..n);
            }
            if self.eof {
                return Err(truncated());
            }
            let want = self.buf.len() + CHUNK;
            self.fill(want)?;
        }
    }

    /// Advance to the next part. `Ok(None)` after the closing boundary.
    pub fn next_part(&mut self) -> io::Result<Option<PartHeaders>> {
        if self.finished {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            self.copy_until_delim(&mut io::sink())?;
        } else if self.in_part {
            self.in_part = false;
            self.copy_until_delim(&mut io::sink())?;
        }

        self.fill(2)?;
        if self.buf.starts_with(b"--") {
            self.finished = true;
            return Ok(None);
        }
        // Rest of the boundary line (transport padding).
        loop {
            if let Some(pos) = find(&self.buf, b"\r\n") {
                self.buf.drain(..pos + 2);
                break;
            }
            if self.eof {
                return Err(truncated());
            }
            if self.buf.len() > 1024 {
                return Err(invalid("malformed boundary line"));
            }
            let want = self.buf.len() + 1;
            self.fill(want)?;
        }
        // Part headers up to the blank line.
        loop {
            if self.buf.len() >= 2 && self.buf.starts_with(b"\r\n") {
                self.buf.drain(..2);
                self.in_part = true;
                return Ok(Some(PartHeaders::default()));
            }
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                let raw = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                self.buf.drain(..pos + 4);
                self.in_part = true;
                return Ok(Some(parse_part_headers(&raw)));
            }
            if self.buf.len() > MAX_PART_HEADER {
                return Err(invalid("part header too large"));
            }
            if self.eof {
                return Err(truncated());
            }
            let want = self.buf.len() + 1;
            self.fill(want)?;
        }
    }

    /// Stream the current part's body into `out`. Returns the byte count.
    pub fn copy_part<W: Write>(&mut self, out: &mut W) -> io::Result<u64> {
        if !self.in_part {
            return Ok(0);
        }
        self.in_part = false;
        self.copy_until_delim(out)
    }
}

fn parse_part_headers(raw: &str) -> PartHeaders {
    let mut h = PartHeaders::default();
    for line in raw.split("\r\n") {
        let Some((k, v)) = line.split_once(':') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim();
        if k.eq_ignore_ascii_case("content-disposition") {
            for param in v.split(';').skip(1) {
                if let Some((pk, pv)) = param.split_once('=') {
                    let pv = strip_outer_quotes(pv.trim());
                    match pk.trim().to_ascii_lowercase().as_str() {
                        "name" => h.name = Some(pv),
                        "filename" => h.filename = Some(pv),
                        _ => {}
                    }
                }
            }
        } else if k.eq_ignore_ascii_case("content-type") {
            h.content_type = Some(v.to_string());
        }
    }
    h
}
