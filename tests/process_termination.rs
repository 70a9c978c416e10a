#![cfg(unix)]

use corebridge::{AppEnv, BridgeConfig, BusEvent, ExecOptions, LocalBus, Supervisor, Termination};
use serde_json::json;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

fn supervisor() -> (Supervisor, Receiver<BusEvent>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (bus, rx) = LocalBus::new();
    let sup = Supervisor::new(bus, AppEnv::with_base(dir.path()), BridgeConfig::default());
    (sup, rx, dir)
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Collect emitted events until `topic` shows up (inclusive).
fn events_until(rx: &Receiver<BusEvent>, topic: &str, within: Duration) -> Vec<BusEvent> {
    let deadline = Instant::now() + within;
    let mut out = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(ev) => {
                let done = ev.topic == topic;
                out.push(ev);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    out
}

#[test]
fn test_prompt_exit_on_graceful_signal() {
    let (sup, rx, _dir) = supervisor();
    let pid = sup
        .exec_background("sleep", &args(&["30"]), "", "sleep-end", &ExecOptions::default())
        .expect("spawn");
    assert!(sup.is_tracked(pid));

    let outcome = sup.kill_process(pid, Duration::from_secs(5)).expect("kill");
    assert_eq!(outcome, Termination::Exited);

    let evs = events_until(&rx, "sleep-end", Duration::from_secs(5));
    assert_eq!(evs.last().map(|e| e.topic.as_str()), Some("sleep-end"));
    assert!(!sup.is_tracked(pid));
}

#[test]
fn test_ignored_signal_is_force_killed_within_bound() {
    let (sup, rx, _dir) = supervisor();
    let script = "trap '' INT; echo armed; while :; do sleep 0.1; done";
    let pid = sup
        .exec_background("sh", &args(&["-c", script]), "trap-out", "trap-end", &ExecOptions::default())
        .expect("spawn");
    let evs = events_until(&rx, "trap-out", Duration::from_secs(5));
    assert_eq!(evs.last().map(|e| e.args.clone()), Some(vec![json!("armed")]));

    let timeout = Duration::from_secs(1);
    let started = Instant::now();
    let outcome = sup.kill_process(pid, timeout).expect("kill");
    let elapsed = started.elapsed();
    assert_eq!(outcome, Termination::ForceKilled);
    assert!(elapsed >= timeout, "{elapsed:?}");
    // timeout plus at most one polling interval (ceiling 1s)
    assert!(elapsed < timeout + Duration::from_millis(1000), "{elapsed:?}");

    let evs = events_until(&rx, "trap-end", Duration::from_secs(5));
    assert_eq!(evs.last().map(|e| e.topic.as_str()), Some("trap-end"));
}

#[test]
fn test_output_after_keyword_is_suppressed() {
    let (sup, rx, _dir) = supervisor();
    let options = ExecOptions {
        stop_output_keyword: "started".into(),
        ..ExecOptions::default()
    };
    let script = "echo booting; echo core started; echo hidden; sleep 0.1; echo hidden2 1>&2; sleep 0.2";
    let pid = sup
        .exec_background("sh", &args(&["-c", script]), "core-out", "core-end", &options)
        .unwrap();

    let evs = events_until(&rx, "core-end", Duration::from_secs(10));
    let lines: Vec<_> = evs
        .iter()
        .filter(|e| e.topic == "core-out")
        .map(|e| e.args[0].clone())
        .collect();
    assert_eq!(lines, vec![json!("booting"), json!("core started")]);
    assert_eq!(evs.last().map(|e| e.topic.as_str()), Some("core-end"));
    assert!(!sup.is_tracked(pid));
}

#[test]
fn test_started_flag_and_pid_file_lifecycle() {
    let (sup, rx, dir) = supervisor();
    let options = ExecOptions {
        stop_output_keyword: "ready".into(),
        keep_output_after_keyword: true,
        pid_file: "core.pid".into(),
        ..ExecOptions::default()
    };
    let pid = sup
        .exec_background(
            "sh",
            &args(&["-c", "echo ready; exec sleep 30"]),
            "pf-out",
            "pf-end",
            &options,
        )
        .unwrap();
    let pid_path = dir.path().join("core.pid");
    assert_eq!(std::fs::read_to_string(&pid_path).unwrap(), pid.to_string());

    events_until(&rx, "pf-out", Duration::from_secs(5));
    assert!(sup.is_started(pid));
    assert_eq!(sup.list().iter().map(|c| c.pid).collect::<Vec<_>>(), vec![pid]);

    sup.kill_process(pid, Duration::from_secs(2)).unwrap();
    events_until(&rx, "pf-end", Duration::from_secs(5));
    assert!(!pid_path.exists());
    assert!(sup.list().is_empty());
}

#[test]
fn test_pid_file_failure_stops_child() {
    let (sup, _rx, _dir) = supervisor();
    let options = ExecOptions {
        pid_file: "no/such/dir/core.pid".into(),
        ..ExecOptions::default()
    };
    let err = sup
        .exec_background("sleep", &args(&["30"]), "", "", &options)
        .unwrap_err();
    assert!(!err.to_string().is_empty());
    assert!(sup.list().is_empty());
}

#[test]
fn test_exec_foreground_output_and_failure() {
    let (sup, _rx, _dir) = supervisor();
    let mut options = ExecOptions::default();
    options.env.insert("CORE_NAME".into(), "sing-box".into());
    let out = sup
        .exec("sh", &args(&["-c", "echo \"  $CORE_NAME  \""]), &options)
        .unwrap();
    assert_eq!(out, "sing-box");

    let err = sup
        .exec("sh", &args(&["-c", "echo broken config; exit 2"]), &ExecOptions::default())
        .unwrap_err();
    assert_eq!(err.to_string(), "broken config");

    let mixed = sup
        .exec("sh", &args(&["-c", "echo first; echo second 1>&2; echo third"]), &ExecOptions::default())
        .unwrap();
    assert_eq!(mixed, "first\nsecond\nthird");
}

#[test]
fn test_process_info_and_memory_for_child() {
    let (sup, rx, _dir) = supervisor();
    let pid = sup
        .exec_background("sleep", &args(&["30"]), "", "info-end", &ExecOptions::default())
        .unwrap();
    assert_eq!(sup.process_info(pid).unwrap(), "sleep");
    assert!(sup.process_memory(pid).unwrap() > 0);
    sup.kill_process(pid, Duration::from_secs(2)).unwrap();
    events_until(&rx, "info-end", Duration::from_secs(5));
}
