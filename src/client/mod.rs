/*!
Outbound HTTP on behalf of the UI: plain requests, downloads to disk and
multipart uploads from disk.

Every call builds a client from its `RequestOptions` (proxy, TLS verification,
timeout, redirect policy) and runs on the runtime owned by `OutboundClient`.
With a non-empty `CancelId`, a one-shot subscription on that topic is held for
the duration of the call; the UI firing it aborts the call.

Results follow one rule: a transport-level failure is `flag: false` with status
500 and the error text, any received response is `flag: true` whatever its
status.
*/
mod progress;

pub use progress::ProgressTracker;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::BridgeConfig;
use crate::env::AppEnv;
use crate::events::{EventBus, Subscription};
use crate::types::{HttpResult, RequestOptions, WireHeaders};
use crate::util::canonical_header_key;

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Explicit proxy for a UI proxy string. Empty or unparsable selects the
/// environment proxies (`None`); a missing scheme defaults to `http://`.
pub fn resolve_proxy(raw: &str) -> Option<url::Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    match url::Url::parse(&candidate) {
        Ok(u) if u.host_str().map(|h| !h.is_empty()).unwrap_or(false) => Some(u),
        Ok(_) => {
            tracing::warn!(proxy = raw, "proxy has no host; using environment proxies");
            None
        }
        Err(e) => {
            tracing::warn!(proxy = raw, "invalid proxy ({e}); using environment proxies");
            None
        }
    }
}

/// Error text with its source chain, `outer: inner: root`.
fn error_text(e: &(dyn std::error::Error + 'static)) -> String {
    let mut out = e.to_string();
    let mut cur = e.source();
    while let Some(src) = cur {
        let s = src.to_string();
        if !out.contains(&s) {
            out.push_str(": ");
            out.push_str(&s);
        }
        cur = src.source();
    }
    out
}

fn wire_headers(headers: &HeaderMap) -> WireHeaders {
    let mut out = WireHeaders::new();
    for (k, v) in headers {
        out.entry(canonical_header_key(k.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(v.as_bytes()).into_owned());
    }
    out
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| format!("invalid header name {k:?}: {e}"))?;
        let value =
            HeaderValue::from_str(v).map_err(|e| format!("invalid header value for {k}: {e}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn parse_method(method: &str) -> Result<reqwest::Method, String> {
    reqwest::Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|e| format!("invalid method {method:?}: {e}"))
}

pub struct OutboundClient {
    runtime: tokio::runtime::Runtime,
    bus: Arc<dyn EventBus>,
    env: AppEnv,
    config: BridgeConfig,
}

impl OutboundClient {
    pub fn new(bus: Arc<dyn EventBus>, env: AppEnv, config: BridgeConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("corebridge-net")
            .enable_all()
            .build()?;
        Ok(OutboundClient {
            runtime,
            bus,
            env,
            config,
        })
    }

    fn timeout_for(&self, options: &RequestOptions) -> Duration {
        if options.timeout > 0 {
            Duration::from_secs(options.timeout as u64)
        } else {
            self.config.request_timeout()
        }
    }

    fn build_client(&self, options: &RequestOptions) -> Result<reqwest::Client, String> {
        let redirect = if options.redirect {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        };
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout_for(options))
            .danger_accept_invalid_certs(options.insecure)
            .redirect(redirect);
        if let Some(proxy_url) = resolve_proxy(&options.proxy) {
            match reqwest::Proxy::all(proxy_url.as_str()) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => {
                    tracing::warn!(proxy = %proxy_url, "proxy rejected ({e}); using environment proxies")
                }
            }
        }
        builder.build().map_err(|e| error_text(&e))
    }

    fn prepare(
        &self,
        method: &str,
        headers: &BTreeMap<String, String>,
        options: &RequestOptions,
    ) -> Result<(reqwest::Method, HeaderMap, reqwest::Client), String> {
        Ok((
            parse_method(method)?,
            header_map(headers)?,
            self.build_client(options)?,
        ))
    }

    /// Run `fut` to completion unless the UI fires `cancel_id` first.
    fn run_cancellable<T, F>(&self, cancel_id: &str, what: &str, fut: F) -> Result<T, String>
    where
        F: Future<Output = Result<T, String>>,
    {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let _sub = if cancel_id.is_empty() {
            None
        } else {
            let label = what.to_string();
            Some(Subscription::once(self.bus.clone(), cancel_id, move |_| {
                tracing::info!("{label} canceled");
                let _ = tx.send(());
            }))
        };
        let cancelled = async move {
            // A dropped sender (no subscription, or torn down) never cancels.
            if rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        self.runtime.block_on(async {
            tokio::select! {
                res = fut => res,
                _ = cancelled => Err("context canceled".to_string()),
            }
        })
    }

    /// Send a request with a text body and return the response text.
    pub fn request(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
        options: &RequestOptions,
    ) -> HttpResult {
        tracing::info!(method, url, "outbound request");
        let (method_v, header_v, client) = match self.prepare(method, headers, options) {
            Ok(p) => p,
            Err(e) => return HttpResult::failure(e),
        };
        let body = body.to_string();
        let what = format!("request {method} {url}");
        let res = self.run_cancellable(&options.cancel_id, &what, async move {
            let resp = client
                .request(method_v, url)
                .headers(header_v)
                .body(body)
                .send()
                .await
                .map_err(|e| error_text(&e))?;
            let status = resp.status().as_u16();
            let headers = wire_headers(resp.headers());
            let bytes = resp.bytes().await.map_err(|e| error_text(&e))?;
            Ok(HttpResult {
                flag: true,
                status,
                headers,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        });
        finish(&what, res)
    }

    /// Stream the response body into `path` (relative to the base directory),
    /// emitting progress on `event`. A failed or canceled transfer removes the file.
    pub fn download(
        &self,
        method: &str,
        url: &str,
        path: &str,
        headers: &BTreeMap<String, String>,
        event: &str,
        options: &RequestOptions,
    ) -> HttpResult {
        tracing::info!(method, url, path, "download");
        let dest = match self.env.resolve(path) {
            Ok(p) => p,
            Err(e) => return HttpResult::failure(e.to_string()),
        };
        let (method_v, header_v, client) = match self.prepare(method, headers, options) {
            Ok(p) => p,
            Err(e) => return HttpResult::failure(e),
        };
        let created = Arc::new(AtomicBool::new(false));
        let bus = self.bus.clone();
        let threshold = self.config.progress_threshold_bytes;
        let what = format!("download {url} -> {}", dest.display());
        let res = {
            let dest = dest.clone();
            let created = created.clone();
            let event = event.to_string();
            self.run_cancellable(&options.cancel_id, &what, async move {
                let resp = client
                    .request(method_v, url)
                    .headers(header_v)
                    .send()
                    .await
                    .map_err(|e| error_text(&e))?;
                let status = resp.status().as_u16();
                let headers = wire_headers(resp.headers());
                let total = resp.content_length().map(|n| n as i64).unwrap_or(-1);
                let mut tracker = ProgressTracker::new(bus, &event, total, threshold);

                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                let mut file = tokio::fs::File::create(&dest)
                    .await
                    .map_err(|e| e.to_string())?;
                created.store(true, Ordering::SeqCst);

                let mut stream = resp.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| error_text(&e))?;
                    file.write_all(&chunk).await.map_err(|e| e.to_string())?;
                    tracker.advance(chunk.len() as u64);
                }
                file.flush().await.map_err(|e| e.to_string())?;
                tracing::debug!(bytes = tracker.progress(), "download complete");
                Ok(HttpResult {
                    flag: true,
                    status,
                    headers,
                    body: "Success".to_string(),
                })
            })
        };
        if res.is_err() && created.load(Ordering::SeqCst) {
            let _ = std::fs::remove_file(&dest);
        }
        finish(&what, res)
    }

    /// Send the file at `path` as one multipart field (`FileField`, default
    /// `file`), streaming it from disk and emitting progress on `event`.
    pub fn upload(
        &self,
        method: &str,
        url: &str,
        path: &str,
        headers: &BTreeMap<String, String>,
        event: &str,
        options: &RequestOptions,
    ) -> HttpResult {
        tracing::info!(method, url, path, "upload");
        let src = match self.env.resolve(path) {
            Ok(p) => p,
            Err(e) => return HttpResult::failure(e.to_string()),
        };
        let size = match std::fs::metadata(&src) {
            Ok(m) if m.is_file() => m.len(),
            Ok(_) => return HttpResult::failure(format!("{}: not a file", src.display())),
            Err(e) => return HttpResult::failure(e.to_string()),
        };
        let mut headers = headers.clone();
        headers.retain(|k, _| !k.eq_ignore_ascii_case("content-type"));
        let (method_v, header_v, client) = match self.prepare(method, &headers, options) {
            Ok(p) => p,
            Err(e) => return HttpResult::failure(e),
        };
        let field = if options.file_field.is_empty() {
            "file".to_string()
        } else {
            options.file_field.clone()
        };
        let tracker = ProgressTracker::new(
            self.bus.clone(),
            event,
            size as i64,
            self.config.progress_threshold_bytes,
        );
        let what = format!("upload {} -> {url}", src.display());
        let res = self.run_cancellable(&options.cancel_id, &what, async move {
            let file = tokio::fs::File::open(&src)
                .await
                .map_err(|e| e.to_string())?;
            let part = reqwest::multipart::Part::stream_with_length(
                reqwest::Body::wrap_stream(file_stream(file, tracker)),
                size,
            )
            .file_name(file_name_of(&src));
            let form = reqwest::multipart::Form::new().part(field, part);
            let resp = client
                .request(method_v, url)
                .headers(header_v)
                .multipart(form)
                .send()
                .await
                .map_err(|e| error_text(&e))?;
            let status = resp.status().as_u16();
            let headers = wire_headers(resp.headers());
            let bytes = resp.bytes().await.map_err(|e| error_text(&e))?;
            Ok(HttpResult {
                flag: true,
                status,
                headers,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        });
        finish(&what, res)
    }
}

fn finish(what: &str, res: Result<HttpResult, String>) -> HttpResult {
    match res {
        Ok(r) => {
            tracing::debug!(status = r.status, "{what} finished");
            r
        }
        Err(e) => {
            tracing::warn!("{what} failed: {e}");
            HttpResult::failure(e)
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

fn file_stream(
    file: tokio::fs::File,
    tracker: ProgressTracker,
) -> impl futures_util::Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    futures_util::stream::unfold(
        Some((file, tracker)),
        |state| async move {
            let (mut file, mut tracker) = state?;
            let mut buf = vec![0u8; UPLOAD_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    tracker.advance(n as u64);
                    Some((Ok(buf), Some((file, tracker))))
                }
                Err(e) => Some((Err(e), None)),
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_proxy() {
        assert!(resolve_proxy("").is_none());
        assert!(resolve_proxy("   ").is_none());
        assert_eq!(
            resolve_proxy("127.0.0.1:7890").unwrap().as_str(),
            "http://127.0.0.1:7890/"
        );
        assert_eq!(
            resolve_proxy("socks5://127.0.0.1:1080").unwrap().scheme(),
            "socks5"
        );
        assert!(resolve_proxy("http://[::1").is_none());
    }

    #[test]
    fn test_header_map_rejects_bad_names() {
        let mut h = BTreeMap::new();
        h.insert("X-Ok".to_string(), "1".to_string());
        assert!(header_map(&h).is_ok());
        h.insert("bad name".to_string(), "1".to_string());
        assert!(header_map(&h).is_err());
    }

    #[test]
    fn test_parse_method_uppercases() {
        assert_eq!(parse_method("get").unwrap(), reqwest::Method::GET);
        assert!(parse_method("GE T").is_err());
    }
}
