//! Static file route: files under `root` served below a URL prefix.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::http::{respond_plain, write_head, RequestHead};
use crate::util::{clean_relative, percent_decode_path};

#[derive(Debug, Clone)]
pub(crate) struct StaticRoute {
    pub route: String,
    pub root: PathBuf,
    pub headers: BTreeMap<String, String>,
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" | "log" => "text/plain; charset=utf-8",
        "yaml" | "yml" => "application/yaml",
        "xml" => "text/xml; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

/// Map a request path below `route` to a file under `root`.
/// `None` when the path would leave the root.
pub(crate) fn resolve_under(route: &str, root: &Path, req_path: &str) -> Option<PathBuf> {
    let rest = req_path.strip_prefix(route).unwrap_or("");
    let decoded = percent_decode_path(rest);
    if decoded.contains('\0') {
        return None;
    }
    let parts = clean_relative(&decoded)?;
    let mut out = root.to_path_buf();
    for p in parts {
        out.push(p);
    }
    Some(out)
}

pub(crate) fn handle_static<S: Write>(route: &StaticRoute, stream: &mut S, head: &RequestHead) {
    let headers = &route.headers;
    if head.method == "OPTIONS" {
        respond_plain(stream, 204, headers, "");
        return;
    }
    if head.method != "GET" && head.method != "HEAD" {
        respond_plain(stream, 405, headers, "Method not allowed");
        return;
    }
    let Some(mut path) = resolve_under(&route.route, &route.root, &head.path) else {
        tracing::warn!(path = %head.path, "static path escapes root");
        respond_plain(stream, 400, headers, "invalid URL path");
        return;
    };
    if path.is_dir() {
        path.push("index.html");
    }
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            respond_plain(stream, 404, headers, "404 page not found");
            return;
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            respond_plain(stream, 403, headers, "403 Forbidden");
            return;
        }
        Err(e) => {
            respond_plain(stream, 500, headers, &format!("500 Internal Server Error: {e}"));
            return;
        }
    };
    let len = match file.metadata() {
        Ok(m) if m.is_file() => m.len(),
        _ => {
            respond_plain(stream, 404, headers, "404 page not found");
            return;
        }
    };

    let mut out_headers = headers.clone();
    out_headers
        .entry("Content-Type".to_string())
        .or_insert_with(|| content_type_for(&path).to_string());
    if write_head(stream, 200, &out_headers, len).is_err() {
        return;
    }
    if head.method == "GET" {
        let mut file = file;
        if let Err(e) = io::copy(&mut file, stream) {
            tracing::debug!(file = %path.display(), "static send aborted: {e}");
        }
    }
    let _ = stream.flush();
}
