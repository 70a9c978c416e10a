/*!
Operation dispatch and the JSON-lines stdio transport.

`Bridge` bundles the three components and maps a named call with positional
JSON arguments onto them, returning a `FlagResult` or `HttpResult` value.

`serve` speaks the line protocol:
- in:  `{"call":"StartServer","seq":1,"args":[...]}` runs on its own thread,
  answered by `{"seq":1,"result":{...}}`;
- in:  `{"event":"topic","args":[...]}` fires the once-handlers for `topic`;
- out: `{"event":"topic","args":[...]}` for everything the backend emits.
*/
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::client::OutboundClient;
use crate::config::BridgeConfig;
use crate::env::AppEnv;
use crate::errors::BridgeError;
use crate::events::{BusEvent, EventBus, LocalBus};
use crate::process::Supervisor;
use crate::server::BridgeServers;
use crate::types::{ExecOptions, FlagResult, HttpResult, RequestOptions, ServerOptions};

pub const CALLS: &[&str] = &[
    "StartServer",
    "StopServer",
    "ListServer",
    "Requests",
    "Download",
    "Upload",
    "Exec",
    "ExecBackground",
    "KillProcess",
    "ProcessInfo",
    "ProcessMemory",
    "GetEnv",
];

fn arg_str(args: &[Value], i: usize, name: &str) -> Result<String, String> {
    match args.get(i) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Null) | None => Ok(String::new()),
        Some(other) => Err(format!("argument {name}: expected string, got {other}")),
    }
}

fn arg_i64(args: &[Value], i: usize, name: &str) -> Result<i64, String> {
    match args.get(i) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| format!("argument {name}: not an integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("argument {name}: {e}")),
        _ => Err(format!("argument {name}: missing")),
    }
}

fn arg_pid(args: &[Value], i: usize) -> Result<u32, String> {
    let n = arg_i64(args, i, "pid")?;
    u32::try_from(n).map_err(|_| format!("argument pid: out of range: {n}"))
}

/// Missing or null arguments take the type's default.
fn arg_de<T: DeserializeOwned + Default>(args: &[Value], i: usize, name: &str) -> Result<T, String> {
    match args.get(i) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| format!("argument {name}: {e}")),
    }
}

fn to_value<T: serde::Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

fn flag(r: Result<String, String>) -> Value {
    to_value(&match r {
        Ok(s) => FlagResult::ok(s),
        Err(e) => FlagResult::fail(e),
    })
}

fn http(r: Result<HttpResult, String>) -> Value {
    to_value(&r.unwrap_or_else(HttpResult::failure))
}

pub struct Bridge {
    env: AppEnv,
    config: BridgeConfig,
    servers: BridgeServers,
    client: OutboundClient,
    supervisor: Supervisor,
}

impl Bridge {
    pub fn new(bus: Arc<dyn EventBus>, env: AppEnv, config: BridgeConfig) -> io::Result<Self> {
        Ok(Bridge {
            servers: BridgeServers::new(bus.clone(), env.clone(), config.clone()),
            client: OutboundClient::new(bus.clone(), env.clone(), config.clone())?,
            supervisor: Supervisor::new(bus, env.clone(), config.clone()),
            env,
            config,
        })
    }

    pub fn env(&self) -> &AppEnv {
        &self.env
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn servers(&self) -> &BridgeServers {
        &self.servers
    }

    pub fn client(&self) -> &OutboundClient {
        &self.client
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Run a named operation with positional JSON arguments.
    pub fn call(&self, name: &str, args: &[Value]) -> Value {
        tracing::debug!(call = name, "dispatch");
        match name {
            "Requests" | "Download" | "Upload" => http(self.call_http(name, args)),
            "GetEnv" => to_value(&self.env),
            _ => flag(self.call_flag(name, args)),
        }
    }

    fn call_flag(&self, name: &str, args: &[Value]) -> Result<String, String> {
        let text = |e: BridgeError| e.to_string();
        match name {
            "StartServer" => {
                let address = arg_str(args, 0, "address")?;
                let id = arg_str(args, 1, "serverID")?;
                let options: ServerOptions = arg_de(args, 2, "options")?;
                self.servers.start(&address, &id, &options).map_err(text)?;
                Ok("Success".to_string())
            }
            "StopServer" => {
                let id = arg_str(args, 0, "id")?;
                self.servers.stop(&id).map_err(text)?;
                Ok("Success".to_string())
            }
            "ListServer" => Ok(self.servers.list().join("|")),
            "Exec" => {
                let path = arg_str(args, 0, "path")?;
                let argv: Vec<String> = arg_de(args, 1, "args")?;
                let options: ExecOptions = arg_de(args, 2, "options")?;
                self.supervisor.exec(&path, &argv, &options).map_err(text)
            }
            "ExecBackground" => {
                let path = arg_str(args, 0, "path")?;
                let argv: Vec<String> = arg_de(args, 1, "args")?;
                let out_event = arg_str(args, 2, "outEvent")?;
                let end_event = arg_str(args, 3, "endEvent")?;
                let options: ExecOptions = arg_de(args, 4, "options")?;
                let pid = self
                    .supervisor
                    .exec_background(&path, &argv, &out_event, &end_event, &options)
                    .map_err(text)?;
                Ok(pid.to_string())
            }
            "KillProcess" => {
                let pid = arg_pid(args, 0)?;
                let secs = arg_i64(args, 1, "timeout").unwrap_or(10).max(0) as u64;
                self.supervisor
                    .kill_process(pid, Duration::from_secs(secs))
                    .map_err(text)?;
                Ok("Success".to_string())
            }
            "ProcessInfo" => {
                let pid = arg_pid(args, 0)?;
                self.supervisor.process_info(pid).map_err(text)
            }
            "ProcessMemory" => {
                let pid = arg_pid(args, 0)?;
                let rss = self.supervisor.process_memory(pid).map_err(text)?;
                Ok(rss.to_string())
            }
            other => Err(format!("unknown call: {other}")),
        }
    }

    fn call_http(&self, name: &str, args: &[Value]) -> Result<HttpResult, String> {
        let method = arg_str(args, 0, "method")?;
        let url = arg_str(args, 1, "url")?;
        if name == "Requests" {
            let headers: BTreeMap<String, String> = arg_de(args, 2, "headers")?;
            let body = arg_str(args, 3, "body")?;
            let options: RequestOptions = arg_de(args, 4, "options")?;
            return Ok(self.client.request(&method, &url, &headers, &body, &options));
        }
        let path = arg_str(args, 2, "path")?;
        let headers: BTreeMap<String, String> = arg_de(args, 3, "headers")?;
        let event = arg_str(args, 4, "event")?;
        let options: RequestOptions = arg_de(args, 5, "options")?;
        Ok(if name == "Download" {
            self.client
                .download(&method, &url, &path, &headers, &event, &options)
        } else {
            self.client
                .upload(&method, &url, &path, &headers, &event, &options)
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Call {
        call: String,
        seq: u64,
        #[serde(default)]
        args: Vec<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

/// Run the line protocol until `input` ends. In-flight calls are answered
/// before returning.
pub fn serve<R, W>(
    bridge: Arc<Bridge>,
    bus: Arc<LocalBus>,
    outbox: Receiver<BusEvent>,
    input: R,
    output: W,
) -> io::Result<()>
where
    R: BufRead,
    W: Write + Send + 'static,
{
    let (line_tx, line_rx) = mpsc::channel::<String>();

    let writer = thread::spawn(move || {
        let mut out = output;
        for line in line_rx {
            if out
                .write_all(line.as_bytes())
                .and_then(|_| out.write_all(b"\n"))
                .and_then(|_| out.flush())
                .is_err()
            {
                break;
            }
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    let forwarder = {
        let stop = stop.clone();
        let tx = line_tx.clone();
        thread::spawn(move || loop {
            match outbox.recv_timeout(Duration::from_millis(100)) {
                Ok(ev) => {
                    let line = json!({"event": ev.topic, "args": ev.args}).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
    };

    let mut calls = Vec::new();
    for line in input.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Incoming>(trimmed) {
            Ok(Incoming::Call { call, seq, args }) => {
                let bridge = bridge.clone();
                let tx = line_tx.clone();
                calls.push(thread::spawn(move || {
                    let result = bridge.call(&call, &args);
                    let _ = tx.send(json!({"seq": seq, "result": result}).to_string());
                }));
                calls.retain(|h| !h.is_finished());
            }
            Ok(Incoming::Event { event, args }) => {
                bus.dispatch(&event, args);
            }
            Err(e) => tracing::warn!("ignoring malformed host line: {e}"),
        }
    }

    tracing::debug!(in_flight = calls.len(), "input closed");
    for h in calls {
        let _ = h.join();
    }
    stop.store(true, Ordering::SeqCst);
    let _ = forwarder.join();
    drop(line_tx);
    let _ = writer.join();
    Ok(())
}
