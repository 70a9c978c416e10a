/*!
Event bus adapter: the only channel between this backend and the UI.

The UI side is fire-and-forget: the backend `emit`s topics with JSON arguments,
and reacts to UI events through one-shot handlers registered with `on_once`.
`Subscription` wraps a one-shot registration and calls `off` when dropped, so
every exit path of the code holding it unsubscribes.

`LocalBus` is the in-process implementation: emitted events are pushed to an
mpsc outbox (drained by the stdio host or by tests), and UI events are fed in
through `LocalBus::dispatch`.
*/
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub type EventArgs = Vec<Value>;
pub type Handler = Box<dyn FnOnce(EventArgs) + Send + 'static>;

/// Publish/subscribe capability consumed by the server, client and supervisor.
pub trait EventBus: Send + Sync {
    fn emit(&self, topic: &str, args: EventArgs);
    fn on_once(&self, topic: &str, handler: Handler);
    fn off(&self, topic: &str);
}

/// Scoped one-shot subscription; unsubscribes its topic on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Arc<dyn EventBus>,
    topic: String,
}

impl Subscription {
    pub fn once<F>(bus: Arc<dyn EventBus>, topic: &str, handler: F) -> Self
    where
        F: FnOnce(EventArgs) + Send + 'static,
    {
        bus.on_once(topic, Box::new(handler));
        Subscription {
            bus,
            topic: topic.to_string(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.off(&self.topic);
    }
}

/// An event emitted towards the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub topic: String,
    pub args: EventArgs,
}

pub struct LocalBus {
    outbox: Mutex<Sender<BusEvent>>,
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl LocalBus {
    pub fn new() -> (Arc<LocalBus>, Receiver<BusEvent>) {
        let (tx, rx) = mpsc::channel();
        let bus = LocalBus {
            outbox: Mutex::new(tx),
            handlers: Mutex::new(HashMap::new()),
        };
        (Arc::new(bus), rx)
    }

    /// Deliver a UI event to the handlers registered for `topic`.
    /// Handlers are taken out of the table before they run, so each fires once
    /// and may call back into the bus. Returns the number of handlers invoked.
    pub fn dispatch(&self, topic: &str, args: EventArgs) -> usize {
        let taken = match self.handlers.lock() {
            Ok(mut map) => map.remove(topic).unwrap_or_default(),
            Err(_) => return 0,
        };
        let n = taken.len();
        for handler in taken {
            handler(args.clone());
        }
        if n == 0 {
            tracing::debug!(topic, "event without listeners dropped");
        }
        n
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.handlers
            .lock()
            .map(|map| map.get(topic).map(|v| v.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl EventBus for LocalBus {
    fn emit(&self, topic: &str, args: EventArgs) {
        if let Ok(tx) = self.outbox.lock() {
            // Receiver gone means the UI went away; nothing left to notify.
            let _ = tx.send(BusEvent {
                topic: topic.to_string(),
                args,
            });
        }
    }

    fn on_once(&self, topic: &str, handler: Handler) {
        if let Ok(mut map) = self.handlers.lock() {
            map.entry(topic.to_string()).or_default().push(handler);
        }
    }

    fn off(&self, topic: &str) {
        if let Ok(mut map) = self.handlers.lock() {
            map.remove(topic);
        }
    }
}
