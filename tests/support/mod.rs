/*!
Test support helpers shared across integration tests.

- bridge_fixture(config): servers + local bus rooted in a temp dir
- http_exchange(addr, raw): one raw HTTP/1.1 exchange over TcpStream
- UiResponder: background "UI" answering bridged requests from the bus outbox
*/
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use corebridge::{AppEnv, BridgeConfig, BridgeServers, BusEvent, LocalBus};
use serde_json::Value;

pub struct Fixture {
    pub servers: BridgeServers,
    pub bus: Arc<LocalBus>,
    pub outbox: Option<Receiver<BusEvent>>,
    pub dir: tempfile::TempDir,
}

pub fn bridge_fixture(config: BridgeConfig) -> Fixture {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (bus, outbox) = LocalBus::new();
    let servers = BridgeServers::new(bus.clone(), AppEnv::with_base(dir.path()), config);
    Fixture {
        servers,
        bus,
        outbox: Some(outbox),
        dir,
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Send `raw` and read until the server closes (responses carry `Connection: close`).
pub fn http_exchange(addr: SocketAddr, raw: &[u8]) -> RawResponse {
    let mut s = TcpStream::connect(addr).expect("connect");
    s.set_read_timeout(Some(Duration::from_secs(20))).ok();
    s.write_all(raw).expect("write request");
    let mut buf = Vec::new();
    s.read_to_end(&mut buf).expect("read response");
    parse_response(&buf)
}

pub fn http_get(addr: SocketAddr, path: &str) -> RawResponse {
    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    http_exchange(addr, req.as_bytes())
}

pub fn parse_response(buf: &[u8]) -> RawResponse {
    let end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&buf[..end]).into_owned();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    RawResponse {
        status,
        headers,
        body: buf[end + 4..].to_vec(),
    }
}

pub fn multipart_body(boundary: &str, field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    b.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    b.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    b.extend_from_slice(content);
    b.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    b
}

/// Answers every bridged request emitted on `server_id` with `reply(args)`.
/// Non-matching events are kept in `others` for inspection.
pub struct UiResponder {
    stop: Arc<AtomicBool>,
    pub seen: Arc<Mutex<Vec<Vec<Value>>>>,
    pub others: Arc<Mutex<Vec<BusEvent>>>,
    handle: Option<JoinHandle<()>>,
}

impl UiResponder {
    pub fn spawn<F>(bus: Arc<LocalBus>, outbox: Receiver<BusEvent>, server_id: &str, reply: F) -> Self
    where
        F: Fn(&[Value]) -> Option<Vec<Value>> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let others = Arc::new(Mutex::new(Vec::new()));
        let server_id = server_id.to_string();
        let handle = {
            let stop = stop.clone();
            let seen = seen.clone();
            let others = others.clone();
            std::thread::spawn(move || loop {
                match outbox.recv_timeout(Duration::from_millis(20)) {
                    Ok(ev) if ev.topic == server_id => {
                        seen.lock().unwrap().push(ev.args.clone());
                        let id = ev.args[0].as_str().unwrap_or_default().to_string();
                        if let Some(answer) = reply(&ev.args) {
                            bus.dispatch(&id, answer);
                        }
                    }
                    Ok(ev) => others.lock().unwrap().push(ev),
                    Err(RecvTimeoutError::Timeout) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
        };
        UiResponder {
            stop,
            seen,
            others,
            handle: Some(handle),
        }
    }
}

impl Drop for UiResponder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
