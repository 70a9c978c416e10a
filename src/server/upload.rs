//! Upload route: multipart parts or a raw body with `X-Filename`, written into
//! one directory under a size cap.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use super::http::{is_body_too_large, respond_plain, BodyReader, LimitReader, RequestHead};
use super::multipart::{boundary_from_content_type, Multipart};

#[derive(Debug, Clone)]
pub(crate) struct UploadRoute {
    pub route: String,
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub headers: BTreeMap<String, String>,
}

/// Reduce a client-supplied name to its final component. A drive or volume
/// prefix (`C:name`) is dropped along with any directories.
/// Empty, `.`, `..` and names with NUL are rejected.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\', ':']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return None;
    }
    Some(base.to_string())
}

enum UploadError {
    BadRequest(String),
    TooLarge,
    Internal(String),
}

impl UploadError {
    fn from_read(e: io::Error, what: &str) -> Self {
        if is_body_too_large(&e) {
            UploadError::TooLarge
        } else {
            UploadError::Internal(format!("{what}: {e}"))
        }
    }
}

/// Copy `src` into a new file at `dest`; the file is removed again on any error.
fn save_stream<F>(dest: &Path, copy: F) -> Result<u64, UploadError>
where
    F: FnOnce(&mut File) -> io::Result<u64>,
{
    let mut file = File::create(dest)
        .map_err(|e| UploadError::Internal(format!("Error creating file: {e}")))?;
    let res = copy(&mut file).and_then(|n| file.flush().map(|_| n));
    match res {
        Ok(n) => Ok(n),
        Err(e) => {
            drop(file);
            let _ = fs::remove_file(dest);
            Err(UploadError::from_read(e, "Error saving file"))
        }
    }
}

fn receive<R: Read>(
    route: &UploadRoute,
    head: &RequestHead,
    body: &mut LimitReader<BodyReader<'_, R>>,
) -> Result<Vec<String>, UploadError> {
    let content_type = head.header("content-type").unwrap_or("");
    let mut saved = Vec::new();

    if content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
            UploadError::BadRequest("Invalid multipart form: missing boundary".to_string())
        })?;
        let mut mp = Multipart::new(body, &boundary);
        while let Some(part) = mp.next_part().map_err(multipart_error)? {
            let Some(raw_name) = part.filename.as_deref().filter(|f| !f.is_empty()) else {
                continue;
            };
            let name = sanitize_filename(raw_name)
                .ok_or_else(|| UploadError::BadRequest("Invalid filename".to_string()))?;
            let dest = route.dir.join(&name);
            let n = save_stream(&dest, |f| mp.copy_part(f))?;
            tracing::debug!(file = %dest.display(), bytes = n, "upload part saved");
            saved.push(name);
        }
        return Ok(saved);
    }

    let raw_name = head
        .header("x-filename")
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| UploadError::BadRequest("Missing X-Filename header".to_string()))?;
    let name = sanitize_filename(raw_name)
        .ok_or_else(|| UploadError::BadRequest("Invalid filename".to_string()))?;
    let dest = route.dir.join(&name);
    let n = save_stream(&dest, |f| io::copy(body, f))?;
    tracing::debug!(file = %dest.display(), bytes = n, "raw upload saved");
    saved.push(name);
    Ok(saved)
}

fn multipart_error(e: io::Error) -> UploadError {
    if is_body_too_large(&e) {
        UploadError::TooLarge
    } else if e.kind() == io::ErrorKind::InvalidData || e.kind() == io::ErrorKind::UnexpectedEof {
        UploadError::BadRequest(format!("Invalid multipart form: {e}"))
    } else {
        UploadError::Internal(format!("Error reading upload stream: {e}"))
    }
}

pub(crate) fn handle_upload<S: Read + Write>(
    route: &UploadRoute,
    stream: &mut S,
    head: &RequestHead,
    leftover: Vec<u8>,
) {
    let headers = &route.headers;
    if head.method == "OPTIONS" {
        respond_plain(stream, 204, headers, "");
        return;
    }
    if head.method != "POST" && head.method != "PUT" {
        respond_plain(stream, 405, headers, "Method not allowed");
        return;
    }
    if head.content_length().map(|n| n > route.max_bytes).unwrap_or(false) {
        respond_plain(stream, 413, headers, "File too large");
        return;
    }

    let result = {
        let mut body = LimitReader::new(BodyReader::new(head, leftover, stream), route.max_bytes);
        receive(route, head, &mut body)
    };
    match result {
        Ok(saved) => {
            tracing::info!(route = %route.route, files = ?saved, "upload complete");
            respond_plain(stream, 200, headers, "File uploaded successfully");
        }
        Err(UploadError::BadRequest(msg)) => {
            tracing::warn!(route = %route.route, "upload rejected: {msg}");
            respond_plain(stream, 400, headers, &msg);
        }
        Err(UploadError::TooLarge) => {
            tracing::warn!(route = %route.route, limit = route.max_bytes, "upload too large");
            respond_plain(stream, 413, headers, "File too large");
        }
        Err(UploadError::Internal(msg)) => {
            tracing::warn!(route = %route.route, "upload failed: {msg}");
            respond_plain(stream, 500, headers, &msg);
        }
    }
}
