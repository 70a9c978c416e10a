/*!
Correlation registry: pairs a blocked caller with the one UI reply meant for it.

- `register(prefix)` hands out a `Pending` slot whose id is `<prefix>#<n>`, where
  `n` comes from one atomic counter shared by every caller of this registry.
  The counter alone makes ids unique; the prefix is only for readability.
- `Pending::wait(timeout)` blocks until `deliver` or the deadline.
- Whoever removes the id from the table owns the resolution: `deliver` removes
  it and sends, the timeout path removes it and gives up. A delivery that lost
  the race to the deadline reports `NotFound`; one that won it is still picked
  up from the channel even if the waiter woke up late.
*/
use base64::Engine as _;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::types::{BodyMode, IoOptions};

/// UI-authored reply to a bridged HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseData {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Default for ResponseData {
    fn default() -> Self {
        ResponseData {
            status: 200,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }
}

impl ResponseData {
    /// Build a reply from the UI tuple `(status, headersJSON, body, optionsJSON)`.
    ///
    /// Every field is optional and malformed values fall back to defaults;
    /// only an undecodable Binary body turns into a 500 carrying the decode error.
    pub fn from_event_args(args: &[Value]) -> Self {
        let mut resp = ResponseData::default();
        if let Some(status) = args.first().and_then(status_from_value) {
            resp.status = status;
        }
        if let Some(Value::String(raw)) = args.get(1) {
            resp.headers = parse_header_json(raw);
        }
        let body = match args.get(2) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        let mode = match args.get(3) {
            Some(Value::String(raw)) => serde_json::from_str::<IoOptions>(raw)
                .map(|o| o.mode)
                .unwrap_or_default(),
            _ => BodyMode::Text,
        };
        match mode {
            BodyMode::Text => resp.body = body.into_bytes(),
            BodyMode::Binary => match base64::engine::general_purpose::STANDARD.decode(body.trim()) {
                Ok(bytes) => resp.body = bytes,
                Err(e) => {
                    resp.status = 500;
                    resp.body = e.to_string().into_bytes();
                }
            },
        }
        resp
    }
}

fn status_from_value(v: &Value) -> Option<u16> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if (100.0..1000.0).contains(&n) {
        Some(n as u16)
    } else {
        None
    }
}

fn parse_header_json(raw: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        for (k, v) in map {
            let val = match v {
                Value::String(s) => s,
                Value::Null => continue,
                other => other.to_string(),
            };
            out.insert(k, val);
        }
    }
    out
}

/// Outcome of waiting on a pending slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered(ResponseData),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound;

#[derive(Default)]
pub struct CorrelationRegistry {
    counter: AtomicU64,
    pending: Mutex<HashMap<String, SyncSender<ResponseData>>>,
}

/// A registered id awaiting its reply. Dropping it without waiting unregisters the id.
pub struct Pending {
    id: String,
    rx: Receiver<ResponseData>,
    registry: Arc<CorrelationRegistry>,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, prefix: &str) -> Pending {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{prefix}#{n}");
        let (tx, rx) = mpsc::sync_channel(1);
        let mut map = self.lock();
        let prev = map.insert(id.clone(), tx);
        assert!(prev.is_none(), "correlation id collision: {id}");
        drop(map);
        Pending {
            id,
            rx,
            registry: self.clone(),
        }
    }

    /// Resolve `id` with `data`. Only the first delivery for a live id succeeds.
    pub fn deliver(&self, id: &str, data: ResponseData) -> Result<(), NotFound> {
        let slot = self.lock().remove(id).ok_or(NotFound)?;
        // Capacity 1 and a single sender: this cannot block. A dropped receiver
        // means the waiter vanished, which is the same as not found.
        slot.try_send(data).map_err(|_| NotFound)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SyncSender<ResponseData>>> {
        // A panic while holding this lock cannot leave the map half-updated
        // (single insert/remove per critical section), so poisoning is ignored.
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Pending {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn wait(self, timeout: Duration) -> Outcome {
        match self.rx.recv_timeout(timeout) {
            Ok(data) => Outcome::Delivered(data),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                if self.registry.unregister(&self.id) {
                    Outcome::TimedOut
                } else {
                    // deliver() removed the id first; its value is (or is about to be) in the slot.
                    match self.rx.recv_timeout(Duration::from_millis(50)) {
                        Ok(data) => Outcome::Delivered(data),
                        Err(_) => Outcome::TimedOut,
                    }
                }
            }
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}
