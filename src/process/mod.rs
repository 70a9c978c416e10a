/*!
Process supervisor: foreground `exec`, background children with streamed
output, and escalating termination.

Background children are tracked from spawn until a reaper thread has waited
on them; only then is the entry dropped, the pid file removed and the end
event emitted. Termination runs `Running -> SignalSent -> Exited | ForceKilled`
against a `ProcessControl`, so the state machine is the same on every OS.
*/
pub mod control;
pub mod output;
pub mod procinfo;
pub mod run;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::env::AppEnv;
use crate::errors::BridgeError;
use crate::events::EventBus;
use crate::types::ExecOptions;
use crate::util::encoding::decode_output;
use crate::util::{poll_until, Backoff};

pub use control::{hide_window, ProcessControl, SystemControl};
use output::{scan_lines, OutputFilter, ScanShared};
use run::{run_captured, RunRequest};

/// How a kill request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the timeout after the graceful signal.
    Exited,
    ForceKilled,
}

/// Graceful signal, bounded liveness polling, then a forced kill.
///
/// A failed graceful signal is logged and polling proceeds. Liveness errors
/// and a failed forced kill are returned.
pub fn terminate(
    control: &dyn ProcessControl,
    pid: u32,
    timeout: Duration,
    backoff: Backoff,
) -> Result<Termination, BridgeError> {
    if let Err(e) = control.graceful_terminate(pid) {
        tracing::warn!(pid, "graceful signal failed: {e}");
    }
    let exited = poll_until(timeout, backoff, || control.is_alive(pid).map(|alive| !alive))
        .map_err(|e| {
            BridgeError::Message(format!("failed to check status of process {pid}: {e}"))
        })?;
    if exited {
        return Ok(Termination::Exited);
    }
    tracing::warn!(pid, timeout_ms = timeout.as_millis() as u64, "process ignored graceful signal, killing");
    control.force_kill(pid).map_err(|e| {
        BridgeError::Message(format!(
            "timed out after {} seconds waiting for process {pid}, and failed to kill it: {e}",
            timeout.as_secs()
        ))
    })?;
    Ok(Termination::ForceKilled)
}

#[derive(Debug, Clone)]
struct ChildEntry {
    program: PathBuf,
    started: Arc<AtomicBool>,
}

/// Snapshot of a tracked background child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    pub pid: u32,
    pub program: PathBuf,
    pub started: bool,
}

type ChildTable = Arc<Mutex<HashMap<u32, ChildEntry>>>;

fn lock_table(t: &ChildTable) -> MutexGuard<'_, HashMap<u32, ChildEntry>> {
    t.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct Supervisor {
    bus: Arc<dyn EventBus>,
    env: AppEnv,
    config: BridgeConfig,
    control: Arc<dyn ProcessControl>,
    children: ChildTable,
}

impl Supervisor {
    pub fn new(bus: Arc<dyn EventBus>, env: AppEnv, config: BridgeConfig) -> Self {
        Self::with_control(bus, env, config, Arc::new(SystemControl))
    }

    pub fn with_control(
        bus: Arc<dyn EventBus>,
        env: AppEnv,
        config: BridgeConfig,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Supervisor {
            bus,
            env,
            config,
            control,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.kill_poll_initial(), self.config.kill_poll_ceiling())
    }

    /// Base-relative path when it exists there, otherwise the path as given
    /// (left to PATH lookup).
    fn resolve_executable(&self, path: &str) -> PathBuf {
        match self.env.resolve(path) {
            Ok(p) if p.exists() => p,
            _ => PathBuf::from(path),
        }
    }

    /// Run to completion; returns the trimmed combined output, with stdout and
    /// stderr interleaved in the order the child wrote them.
    /// A non-zero exit fails with that output, or with the exit status when silent.
    pub fn exec(&self, path: &str, args: &[String], options: &ExecOptions) -> Result<String, BridgeError> {
        let exe = self.resolve_executable(path);
        tracing::info!(program = %exe.display(), ?args, "exec");
        let mut req = RunRequest::new(&exe).args(args);
        for (k, v) in &options.env {
            req = req.env(k, v);
        }
        let out = run_captured(req).map_err(|e| BridgeError::Message(format!("{e:#}")))?;
        let text = decode_output(&out.output, options.convert).trim().to_string();
        tracing::debug!(program = %exe.display(), status = %out.status, elapsed_ms = out.duration.as_millis() as u64, "exec finished");
        if out.status.success() {
            Ok(text)
        } else if text.is_empty() {
            Err(BridgeError::Message(out.status.to_string()))
        } else {
            Err(BridgeError::Message(text))
        }
    }

    /// Spawn a tracked child whose output lines are emitted on `out_event`.
    /// Returns the pid. `end_event` fires once the child has been reaped.
    pub fn exec_background(
        &self,
        path: &str,
        args: &[String],
        out_event: &str,
        end_event: &str,
        options: &ExecOptions,
    ) -> Result<u32, BridgeError> {
        let exe = self.resolve_executable(path);
        let pid_path = if options.pid_file.is_empty() {
            None
        } else {
            Some(self.env.resolve(&options.pid_file)?)
        };

        let mut cmd = Command::new(&exe);
        cmd.args(args)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_window(&mut cmd);
        let mut child = cmd.spawn()?;
        let pid = child.id();

        if let Some(p) = &pid_path {
            if let Err(e) = fs::write(p, pid.to_string()) {
                tracing::warn!(pid, pid_file = %p.display(), "pid file write failed, stopping child: {e}");
                self.stop_unregistered(&mut child);
                return Err(BridgeError::Io(e));
            }
        }

        let started = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(ScanShared {
            bus: self.bus.clone(),
            out_event: out_event.to_string(),
            convert: options.convert,
            filter: Mutex::new(OutputFilter::new(
                &options.stop_output_keyword,
                options.keep_output_after_keyword,
            )),
            started: started.clone(),
        });

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let mut scanners = 0;
        if let Some(out) = child.stdout.take() {
            scanners += 1;
            let shared = shared.clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                scan_lines(out, &shared);
                let _ = done.send(());
            });
        }
        if let Some(err) = child.stderr.take() {
            scanners += 1;
            let shared = shared.clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                scan_lines(err, &shared);
                let _ = done.send(());
            });
        }
        drop(done_tx);

        lock_table(&self.children).insert(
            pid,
            ChildEntry {
                program: exe.clone(),
                started,
            },
        );
        tracing::info!(pid, program = %exe.display(), "background process started");

        let children = self.children.clone();
        let bus = self.bus.clone();
        let end_event = end_event.to_string();
        thread::spawn(move || {
            let status = child.wait();
            // Give the scanners a moment to flush the last lines before the end event.
            for _ in 0..scanners {
                if done_rx.recv_timeout(Duration::from_secs(1)).is_err() {
                    break;
                }
            }
            lock_table(&children).remove(&pid);
            if let Some(p) = pid_path {
                let _ = fs::remove_file(p);
            }
            match status {
                Ok(s) => tracing::info!(pid, status = %s, "background process exited"),
                Err(e) => tracing::warn!(pid, "wait failed: {e}"),
            }
            if !end_event.is_empty() {
                bus.emit(&end_event, vec![]);
            }
        });

        Ok(pid)
    }

    /// Terminate a child that never got registered: graceful, bounded wait, kill, reap.
    fn stop_unregistered(&self, child: &mut Child) {
        let _ = self.control.graceful_terminate(child.id());
        let exited = poll_until(Duration::from_secs(10), self.backoff(), || {
            child.try_wait().map(|s| s.is_some())
        })
        .unwrap_or(false);
        if !exited {
            let _ = child.kill();
        }
        let _ = child.wait();
    }

    pub fn kill_process(&self, pid: u32, timeout: Duration) -> Result<Termination, BridgeError> {
        if pid == 0 {
            return Err(BridgeError::Message("invalid pid 0".to_string()));
        }
        tracing::info!(pid, timeout_ms = timeout.as_millis() as u64, "kill process");
        let outcome = terminate(self.control.as_ref(), pid, timeout, self.backoff())?;
        tracing::info!(pid, ?outcome, "process terminated");
        Ok(outcome)
    }

    pub fn process_info(&self, pid: u32) -> Result<String, BridgeError> {
        Ok(procinfo::process_name(pid)?)
    }

    pub fn process_memory(&self, pid: u32) -> Result<u64, BridgeError> {
        Ok(procinfo::process_rss(pid)?)
    }

    /// Tracked children, sorted by pid.
    pub fn list(&self) -> Vec<ChildInfo> {
        let mut out: Vec<ChildInfo> = lock_table(&self.children)
            .iter()
            .map(|(pid, e)| ChildInfo {
                pid: *pid,
                program: e.program.clone(),
                started: e.started.load(Ordering::SeqCst),
            })
            .collect();
        out.sort_by_key(|c| c.pid);
        out
    }

    /// Whether the child's ready keyword has been seen.
    pub fn is_started(&self, pid: u32) -> bool {
        lock_table(&self.children)
            .get(&pid)
            .map(|e| e.started.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        lock_table(&self.children).contains_key(&pid)
    }
}
