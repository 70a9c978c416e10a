use std::ffi::OsString;
use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

use super::control::hide_window;

/// A foreground command whose stdout and stderr are captured together.
#[derive(Debug, Default)]
pub struct RunRequest {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Added on top of the inherited environment; later values win.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug)]
pub struct RunOutput {
    pub status: ExitStatus,
    pub duration: Duration,
    /// stdout and stderr as written, through one shared pipe.
    pub output: Vec<u8>,
}

fn drain(mut pipe: io::PipeReader) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// Run to completion. stdout and stderr share one pipe, drained while the
/// child runs so a chatty child cannot block on a full pipe.
pub fn run_captured(request: RunRequest) -> Result<RunOutput> {
    let (reader, writer) = io::pipe().context("failed to create output pipe")?;
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .envs(request.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(writer.try_clone().context("failed to clone output pipe")?)
        .stderr(writer);
    hide_window(&mut cmd);

    let started = Instant::now();
    let spawned = cmd.spawn();
    // The command still holds both write ends; the reader only sees EOF once they are gone.
    drop(cmd);
    let mut child = spawned.with_context(|| {
        format!(
            "failed to spawn {:?} with args {:?}",
            request.program, request.args
        )
    })?;
    let out = drain(reader);

    let status = match request.timeout {
        None => child.wait().context("failed to wait for process")?,
        Some(timeout) => match child
            .wait_timeout(timeout)
            .context("failed to wait with timeout")?
        {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "command {:?} timed out after {:?}",
                    request.program,
                    timeout
                ));
            }
        },
    };

    let output = out
        .join()
        .map_err(|_| anyhow!("output reader panicked"))?;
    Ok(RunOutput {
        status,
        duration: started.elapsed(),
        output,
    })
}
