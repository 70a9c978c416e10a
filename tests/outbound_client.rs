mod support;

use corebridge::{AppEnv, BridgeConfig, LocalBus, OutboundClient, RequestOptions, ServerOptions};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use support::bridge_fixture;

fn client() -> (OutboundClient, Arc<LocalBus>, std::sync::mpsc::Receiver<corebridge::BusEvent>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (bus, rx) = LocalBus::new();
    let c = OutboundClient::new(bus.clone(), AppEnv::with_base(dir.path()), BridgeConfig::default())
        .expect("client");
    (c, bus, rx, dir)
}

fn static_server(fx: &support::Fixture) -> std::net::SocketAddr {
    let root = fx.dir.path().join("www");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("hello.txt"), "hello").unwrap();
    fs::write(root.join("core.bin"), vec![5u8; 1024 * 1024]).unwrap();
    let opts = ServerOptions {
        static_path: "www".into(),
        static_route: "/files/".into(),
        upload_path: "incoming".into(),
        upload_route: "/upload".into(),
        ..ServerOptions::default()
    };
    fx.servers.start("127.0.0.1:0", "files", &opts).unwrap()
}

#[test]
fn test_http_error_status_is_still_flag_true() {
    let fx = bridge_fixture(BridgeConfig::default());
    let addr = static_server(&fx);
    let (c, _bus, _rx, _dir) = client();

    let ok = c.request(
        "get",
        &format!("http://{addr}/files/hello.txt"),
        &BTreeMap::new(),
        "",
        &RequestOptions::default(),
    );
    assert!(ok.flag);
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body, "hello");
    assert_eq!(ok.headers["Content-Type"], vec!["text/plain; charset=utf-8".to_string()]);

    let missing = c.request(
        "GET",
        &format!("http://{addr}/files/nope.txt"),
        &BTreeMap::new(),
        "",
        &RequestOptions::default(),
    );
    assert!(missing.flag);
    assert_eq!(missing.status, 404);
}

#[test]
fn test_transport_failure_is_flag_false() {
    let (c, _bus, _rx, _dir) = client();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let r = c.request(
        "GET",
        &format!("http://{addr}/"),
        &BTreeMap::new(),
        "",
        &RequestOptions::default(),
    );
    assert!(!r.flag);
    assert_eq!(r.status, 500);
    assert!(!r.body.is_empty());

    let bad = c.request("BAD METHOD", "http://x/", &BTreeMap::new(), "", &RequestOptions::default());
    assert!(!bad.flag);
}

#[test]
fn test_download_writes_file_and_reports_progress() {
    let fx = bridge_fixture(BridgeConfig::default());
    let addr = static_server(&fx);
    let (c, _bus, rx, dir) = client();

    let r = c.download(
        "GET",
        &format!("http://{addr}/files/core.bin"),
        "data/core.bin",
        &BTreeMap::new(),
        "dl",
        &RequestOptions::default(),
    );
    assert!(r.flag, "{}", r.body);
    assert_eq!(r.body, "Success");
    assert_eq!(fs::metadata(dir.path().join("data/core.bin")).unwrap().len(), 1024 * 1024);

    let progress: Vec<_> = rx.try_iter().filter(|e| e.topic == "dl").collect();
    assert!(!progress.is_empty());
    // at most one event per threshold step plus the final one
    assert!(progress.len() <= 1024 * 1024 / (128 * 1024) + 1, "{}", progress.len());
    assert_eq!(
        progress.last().unwrap().args,
        vec![json!(1024 * 1024), json!(1024 * 1024)]
    );
}

#[test]
fn test_upload_streams_file_as_multipart() {
    let fx = bridge_fixture(BridgeConfig::default());
    let addr = static_server(&fx);
    let (c, _bus, rx, dir) = client();
    fs::write(dir.path().join("profile.yaml"), "mixed-port: 7890\n").unwrap();

    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    let r = c.upload(
        "POST",
        &format!("http://{addr}/upload"),
        "profile.yaml",
        &headers,
        "up",
        &RequestOptions::default(),
    );
    assert!(r.flag, "{}", r.body);
    assert_eq!(r.status, 200);
    assert_eq!(r.body, "File uploaded successfully");
    assert_eq!(
        fs::read_to_string(fx.dir.path().join("incoming/profile.yaml")).unwrap(),
        "mixed-port: 7890\n"
    );
    assert!(rx.try_iter().any(|e| e.topic == "up"));
}

#[test]
fn test_cancel_event_aborts_pending_call() {
    let cfg = BridgeConfig {
        bridge_timeout_secs: 5,
        ..BridgeConfig::default()
    };
    let fx = bridge_fixture(cfg);
    // Nobody answers bridged requests, so the call hangs until canceled.
    let addr = fx
        .servers
        .start("127.0.0.1:0", "mute", &ServerOptions::default())
        .unwrap();
    let (c, bus, _rx, dir) = client();

    let canceller = {
        let bus = bus.clone();
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while bus.listener_count("cancel-7") == 0 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            std::thread::sleep(Duration::from_millis(100));
            bus.dispatch("cancel-7", vec![]);
        })
    };
    let options = RequestOptions {
        cancel_id: "cancel-7".into(),
        ..RequestOptions::default()
    };
    let started = Instant::now();
    let r = c.download(
        "GET",
        &format!("http://{addr}/slow"),
        "partial.bin",
        &BTreeMap::new(),
        "",
        &options,
    );
    canceller.join().unwrap();
    assert!(!r.flag);
    assert_eq!(r.body, "context canceled");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(bus.listener_count("cancel-7"), 0);
    assert!(!dir.path().join("partial.bin").exists());
}
