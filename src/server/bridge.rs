//! Catch-all route: forward the request to the UI and block for its correlated reply.
use base64::Engine as _;
use serde_json::json;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::http::{
    is_body_too_large, respond_status, write_response, BodyReader, LimitReader, RequestHead,
};
use crate::correlation::{CorrelationRegistry, Outcome, ResponseData};
use crate::events::{EventBus, Subscription};

pub(crate) struct BridgeRoute {
    pub server_id: String,
    pub bus: Arc<dyn EventBus>,
    pub correlations: Arc<CorrelationRegistry>,
    pub timeout: Duration,
    pub max_body: u64,
}

pub(crate) fn handle_bridge<S: Read + Write>(
    route: &BridgeRoute,
    stream: &mut S,
    head: &RequestHead,
    leftover: Vec<u8>,
) {
    if head.content_length().map(|n| n > route.max_body).unwrap_or(false) {
        respond_status(stream, 413, "Request body too large");
        return;
    }
    let mut body = Vec::new();
    let read = {
        let mut rd = LimitReader::new(BodyReader::new(head, leftover, stream), route.max_body);
        rd.read_to_end(&mut body)
    };
    if let Err(e) = read {
        if is_body_too_large(&e) {
            respond_status(stream, 413, "Request body too large");
        } else {
            respond_status(stream, 500, &format!("Failed to read request body: {e}"));
        }
        return;
    }

    let started = Instant::now();
    let pending = route.correlations.register(&route.server_id);
    let request_id = pending.id().to_string();

    let registry = route.correlations.clone();
    let reply_id = request_id.clone();
    let sub = Subscription::once(route.bus.clone(), &request_id, move |args| {
        let data = ResponseData::from_event_args(&args);
        if registry.deliver(&reply_id, data).is_err() {
            tracing::debug!(id = %reply_id, "late reply dropped");
        }
    });

    route.bus.emit(
        &route.server_id,
        vec![
            json!(request_id),
            json!(head.method),
            json!(head.target),
            json!(head.wire_headers()),
            json!(base64::engine::general_purpose::STANDARD.encode(&body)),
        ],
    );

    let outcome = pending.wait(route.timeout);
    drop(sub);

    match outcome {
        Outcome::Delivered(resp) => {
            tracing::debug!(
                id = %request_id,
                method = %head.method,
                target = %head.target,
                status = resp.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "bridged request answered"
            );
            let _ = write_response(stream, resp.status, &resp.headers, &resp.body);
        }
        Outcome::TimedOut => {
            tracing::warn!(
                id = %request_id,
                method = %head.method,
                target = %head.target,
                "bridged request timed out"
            );
            respond_status(stream, 504, "Request timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LocalBus;
    use std::io::Cursor;

    /// In-memory duplex: reads from `input`, collects writes in `output`.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn head(raw: &[u8]) -> (RequestHead, Vec<u8>) {
        super::super::http::read_request_head(&mut Cursor::new(raw.to_vec())).unwrap()
    }

    #[test]
    fn test_oversized_body_is_413_without_emitting() {
        let (bus, rx) = LocalBus::new();
        let route = BridgeRoute {
            server_id: "s".into(),
            bus,
            correlations: CorrelationRegistry::new(),
            timeout: Duration::from_millis(50),
            max_body: 4,
        };
        let (h, left) = head(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        let mut d = Duplex {
            input: Cursor::new(Vec::new()),
            output: Vec::new(),
        };
        handle_bridge(&route, &mut d, &h, left);
        assert!(String::from_utf8_lossy(&d.output).starts_with("HTTP/1.1 413 "));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reply_through_bus_is_written() {
        let (bus, rx) = LocalBus::new();
        let route = BridgeRoute {
            server_id: "srv".into(),
            bus: bus.clone(),
            correlations: CorrelationRegistry::new(),
            timeout: Duration::from_secs(5),
            max_body: 1024,
        };
        let ui = std::thread::spawn(move || {
            let ev = rx.recv().unwrap();
            assert_eq!(ev.topic, "srv");
            let id = ev.args[0].as_str().unwrap().to_string();
            assert_eq!(ev.args[1], json!("PUT"));
            assert_eq!(ev.args[4], json!("aGk="));
            bus.dispatch(&id, vec![json!(202), json!("{}"), json!("ok"), json!("{}")]);
        });
        let (h, left) = head(b"PUT /x HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi");
        let mut d = Duplex {
            input: Cursor::new(Vec::new()),
            output: Vec::new(),
        };
        handle_bridge(&route, &mut d, &h, left);
        ui.join().unwrap();
        let out = String::from_utf8_lossy(&d.output).into_owned();
        assert!(out.starts_with("HTTP/1.1 202 Accepted\r\n"));
        assert!(out.ends_with("ok"));
        assert!(route.correlations.is_empty());
    }
}
