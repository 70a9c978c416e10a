//! Name and resident memory of an arbitrary pid.
use std::io;
use sysinfo::{Pid, Process, ProcessesToUpdate, System};

fn not_found(pid: u32) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("process not found: {pid}"))
}

/// Refresh only `pid` and hand its entry to `f`.
fn with_process<T>(pid: u32, f: impl FnOnce(&Process) -> T) -> io::Result<T> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system.process(target).map(f).ok_or_else(|| not_found(pid))
}

pub fn process_name(pid: u32) -> io::Result<String> {
    with_process(pid, |p| p.name().to_string_lossy().into_owned())
}

/// Resident set size in bytes (working set on Windows).
pub fn process_rss(pid: u32) -> io::Result<u64> {
    with_process(pid, Process::memory)
}
