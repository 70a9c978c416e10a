/*!
Embedded HTTP bridge servers.

`BridgeServers` owns every listener started by the UI, keyed by server id.
Each listener runs a non-blocking accept loop on its own thread and a thread
per connection. A connection is routed to the static route, the upload route
or the catch-all bridge, whichever pattern matches the path most specifically.

`stop` removes the registration under the map lock, flips the running flag,
shuts down every tracked connection, and joins the accept thread, so the
port is released and no handler outlives the registration by more than its
current write.
*/
mod bridge;
mod http;
mod multipart;
mod statics;
mod tls;
mod upload;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::correlation::CorrelationRegistry;
use crate::env::AppEnv;
use crate::errors::BridgeError;
use crate::events::EventBus;
use crate::types::ServerOptions;

use bridge::{handle_bridge, BridgeRoute};
use http::{read_request_head, respond_status, HeadError};
use statics::{handle_static, StaticRoute};
use upload::{handle_upload, UploadRoute};

pub use upload::sanitize_filename;

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const LINGER_TIMEOUT: Duration = Duration::from_millis(250);
const LINGER_MAX_BYTES: usize = 1024 * 1024;

/// Live connections of one listener, so `stop` can abort them.
#[derive(Default)]
struct ConnTable {
    next: AtomicU64,
    conns: Mutex<HashMap<u64, TcpStream>>,
}

impl ConnTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.conns.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, stream: TcpStream) -> u64 {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(id, stream);
        id
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn abort_all(&self) -> usize {
        let drained: Vec<TcpStream> = self.lock().drain().map(|(_, s)| s).collect();
        for s in &drained {
            let _ = s.shutdown(Shutdown::Both);
        }
        drained.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct ConnGuard {
    table: Arc<ConnTable>,
    id: u64,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

struct ServerCtx {
    bridge: BridgeRoute,
    statics: Option<StaticRoute>,
    upload: Option<UploadRoute>,
    read_timeout: Duration,
}

enum Route<'a> {
    Static(&'a StaticRoute),
    Upload(&'a UploadRoute),
    Bridge,
}

/// `/a/` matches the subtree, `/a` only itself.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern.ends_with('/') {
        path.starts_with(pattern)
    } else {
        path == pattern
    }
}

impl ServerCtx {
    fn route_for(&self, path: &str) -> Route<'_> {
        let mut best = (0usize, Route::Bridge);
        if let Some(s) = &self.statics {
            if pattern_matches(&s.route, path) && s.route.len() > best.0 {
                best = (s.route.len(), Route::Static(s));
            }
        }
        if let Some(u) = &self.upload {
            if pattern_matches(&u.route, path) && u.route.len() > best.0 {
                best = (u.route.len(), Route::Upload(u));
            }
        }
        best.1
    }

    fn serve<S: Read + Write>(&self, stream: &mut S) {
        let (head, leftover) = match read_request_head(stream) {
            Ok(pair) => pair,
            Err(HeadError::Closed) => return,
            Err(HeadError::TooLarge) => {
                respond_status(stream, 431, "Request Header Fields Too Large");
                return;
            }
            Err(HeadError::Malformed(msg)) => {
                respond_status(stream, 400, &msg);
                return;
            }
            Err(HeadError::Io(e)) => {
                tracing::debug!(server = %self.bridge.server_id, "request read failed: {e}");
                return;
            }
        };
        match self.route_for(&head.path) {
            Route::Static(s) => handle_static(s, stream, &head),
            Route::Upload(u) => handle_upload(u, stream, &head, leftover),
            Route::Bridge => handle_bridge(&self.bridge, stream, &head, leftover),
        }
        let _ = stream.flush();
    }
}

fn handle_connection(
    ctx: &ServerCtx,
    tls: Option<&Arc<rustls::ServerConfig>>,
    stream: TcpStream,
) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(ctx.read_timeout));
    let _ = stream.set_write_timeout(None);
    match tls {
        None => {
            let mut s = stream;
            ctx.serve(&mut s);
            let _ = s.shutdown(Shutdown::Write);
            linger(&s);
        }
        Some(cfg) => {
            let conn = match rustls::ServerConnection::new(cfg.clone()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(server = %ctx.bridge.server_id, "tls session setup failed: {e}");
                    return;
                }
            };
            let mut s = rustls::StreamOwned::new(conn, stream);
            ctx.serve(&mut s);
            s.conn.send_close_notify();
            let _ = s.flush();
            let _ = s.sock.shutdown(Shutdown::Write);
            linger(&s.sock);
        }
    }
}

/// Swallow input the handler left unread so closing does not reset the
/// connection before the peer has read the response.
fn linger(sock: &TcpStream) {
    let _ = sock.set_read_timeout(Some(LINGER_TIMEOUT));
    let mut buf = [0u8; 8192];
    let mut reader = sock;
    let mut total = 0usize;
    while total < LINGER_MAX_BYTES {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n,
        }
    }
}

struct Registration {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    conns: Arc<ConnTable>,
    accept: Option<JoinHandle<()>>,
}

impl Registration {
    fn shutdown(mut self) -> usize {
        self.running.store(false, Ordering::SeqCst);
        let aborted = self.conns.abort_all();
        if let Some(h) = self.accept.take() {
            let _ = h.join();
        }
        aborted
    }
}

fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerCtx>,
    tls: Option<Arc<rustls::ServerConfig>>,
    running: Arc<AtomicBool>,
    conns: Arc<ConnTable>,
) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    tracing::debug!(server = %ctx.bridge.server_id, "accept error: {e}");
                }
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
        };
        let tracked = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(server = %ctx.bridge.server_id, "connection clone failed: {e}");
                continue;
            }
        };
        let conn_id = conns.insert(tracked);
        // stop() may have drained the table between accept and insert.
        if !running.load(Ordering::SeqCst) {
            conns.remove(conn_id);
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
        let guard = ConnGuard {
            table: conns.clone(),
            id: conn_id,
        };
        let ctx = ctx.clone();
        let tls = tls.clone();
        tracing::trace!(server = %ctx.bridge.server_id, %peer, "connection accepted");
        std::thread::spawn(move || {
            let _guard = guard;
            handle_connection(&ctx, tls.as_ref(), stream);
        });
    }
    tracing::debug!(server = %ctx.bridge.server_id, "accept loop stopped");
}

/// Registry of running bridge servers.
pub struct BridgeServers {
    bus: Arc<dyn EventBus>,
    correlations: Arc<CorrelationRegistry>,
    env: AppEnv,
    config: BridgeConfig,
    servers: Mutex<HashMap<String, Registration>>,
}

impl BridgeServers {
    pub fn new(bus: Arc<dyn EventBus>, env: AppEnv, config: BridgeConfig) -> Self {
        BridgeServers {
            bus,
            correlations: CorrelationRegistry::new(),
            env,
            config,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn correlations(&self) -> &Arc<CorrelationRegistry> {
        &self.correlations
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.servers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn build_ctx(&self, server_id: &str, options: &ServerOptions) -> Result<ServerCtx, BridgeError> {
        let statics = if !options.static_path.is_empty() && !options.static_route.is_empty() {
            Some(StaticRoute {
                route: options.static_route.clone(),
                root: self.env.resolve(&options.static_path)?,
                headers: options.static_headers.clone(),
            })
        } else {
            None
        };
        let upload = if !options.upload_path.is_empty() && !options.upload_route.is_empty() {
            let dir = self.env.resolve(&options.upload_path)?;
            std::fs::create_dir_all(&dir).map_err(|e| {
                BridgeError::Message(format!("Failed to create upload directory: {e}"))
            })?;
            let max_bytes = if options.max_upload_size > 0 {
                options.max_upload_size as u64
            } else {
                self.config.default_max_upload_bytes
            };
            Some(UploadRoute {
                route: options.upload_route.clone(),
                dir,
                max_bytes,
                headers: options.upload_headers.clone(),
            })
        } else {
            None
        };
        Ok(ServerCtx {
            bridge: BridgeRoute {
                server_id: server_id.to_string(),
                bus: self.bus.clone(),
                correlations: self.correlations.clone(),
                timeout: self.config.bridge_timeout(),
                max_body: self.config.max_body_bytes,
            },
            statics,
            upload,
            read_timeout: self.config.header_read_timeout(),
        })
    }

    /// Bind `address` and start serving under `server_id`. Returns the bound address.
    /// Nothing is registered unless every step succeeds.
    pub fn start(
        &self,
        address: &str,
        server_id: &str,
        options: &ServerOptions,
    ) -> Result<SocketAddr, BridgeError> {
        if server_id.is_empty() {
            return Err(BridgeError::Message("server id must not be empty".to_string()));
        }
        if self.lock().contains_key(server_id) {
            return Err(BridgeError::Duplicate(server_id.to_string()));
        }
        let ctx = self.build_ctx(server_id, options)?;
        let tls = if !options.cert.is_empty() && !options.key.is_empty() {
            let cert = self.env.resolve(&options.cert)?;
            let key = self.env.resolve(&options.key)?;
            Some(tls::load_server_config(&cert, &key)?)
        } else {
            None
        };

        let mut servers = self.lock();
        if servers.contains_key(server_id) {
            return Err(BridgeError::Duplicate(server_id.to_string()));
        }
        let listener =
            TcpListener::bind(address).map_err(|e| BridgeError::Bind(format!("{address}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Bind(format!("{address}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| BridgeError::Bind(format!("{address}: {e}")))?;

        let running = Arc::new(AtomicBool::new(true));
        let conns = Arc::new(ConnTable::default());
        let is_tls = tls.is_some();
        let handle = {
            let ctx = Arc::new(ctx);
            let running = running.clone();
            let conns = conns.clone();
            std::thread::Builder::new()
                .name(format!("bridge-{server_id}"))
                .spawn(move || accept_loop(listener, ctx, tls, running, conns))?
        };
        servers.insert(
            server_id.to_string(),
            Registration {
                addr,
                running,
                conns,
                accept: Some(handle),
            },
        );
        tracing::info!(server = server_id, %addr, tls = is_tls, "bridge server started");
        Ok(addr)
    }

    pub fn stop(&self, server_id: &str) -> Result<(), BridgeError> {
        let reg = self
            .lock()
            .remove(server_id)
            .ok_or_else(|| BridgeError::NotFound("server not found".to_string()))?;
        let aborted = reg.shutdown();
        tracing::info!(server = server_id, aborted, "bridge server stopped");
        Ok(())
    }

    /// Snapshot of running server ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn local_addr(&self, server_id: &str) -> Option<SocketAddr> {
        self.lock().get(server_id).map(|r| r.addr)
    }

    /// Open connections of a server (diagnostics).
    pub fn connection_count(&self, server_id: &str) -> usize {
        self.lock()
            .get(server_id)
            .map(|r| r.conns.len())
            .unwrap_or(0)
    }

    pub fn stop_all(&self) {
        let regs: Vec<(String, Registration)> = self.lock().drain().collect();
        for (id, reg) in regs {
            reg.shutdown();
            tracing::debug!(server = %id, "bridge server stopped");
        }
    }
}

impl Drop for BridgeServers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("/static/", "/static/a.js"));
        assert!(pattern_matches("/static/", "/static/"));
        assert!(!pattern_matches("/static/", "/static"));
        assert!(pattern_matches("/upload", "/upload"));
        assert!(!pattern_matches("/upload", "/upload/x"));
    }

    #[test]
    fn test_most_specific_route_wins() {
        let (bus, _rx) = crate::events::LocalBus::new();
        let ctx = ServerCtx {
            bridge: BridgeRoute {
                server_id: "s".into(),
                bus,
                correlations: CorrelationRegistry::new(),
                timeout: Duration::from_secs(1),
                max_body: 10,
            },
            statics: Some(StaticRoute {
                route: "/".into(),
                root: "/tmp".into(),
                headers: Default::default(),
            }),
            upload: Some(UploadRoute {
                route: "/upload".into(),
                dir: "/tmp".into(),
                max_bytes: 10,
                headers: Default::default(),
            }),
            read_timeout: Duration::from_secs(1),
        };
        assert!(matches!(ctx.route_for("/upload"), Route::Upload(_)));
        assert!(matches!(ctx.route_for("/index.html"), Route::Static(_)));
    }
}
