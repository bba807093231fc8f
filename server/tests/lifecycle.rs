//! process-level tests against the real binary.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const PAGES: [&str; 7] = [
    "index.html",
    "broadcast.html",
    "result.html",
    "error.html",
    "docs.html",
    "status.html",
    "logos.html",
];

fn write_fixture(dir: &Path, port: u16) -> std::path::PathBuf {
    let static_dir = dir.join("static");
    fs::create_dir_all(&static_dir).unwrap();
    for name in PAGES {
        fs::write(static_dir.join(name), format!("<html>{name}</html>")).unwrap();
    }

    let config_path = dir.join("config.ini");
    fs::write(
        &config_path,
        format!(
            "[network]\nchain = regtest\n\
             [server]\nport = {port}\n\
             [static]\ndir = {}\n\
             [ratelimit]\nrps = 0\n",
            static_dir.display()
        ),
    )
    .unwrap();
    config_path
}

fn connect_with_retries(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(e) => {
                assert!(Instant::now() < deadline, "server never came up: {e}");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn read_one_response(stream: &mut TcpStream) -> String {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "connection closed before a full response");
        out.extend_from_slice(&chunk[..n]);
        if let Some(head_end) = out.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&out[..head_end]).into_owned();
            let body_len: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .map(|v| v.parse().unwrap())
                .unwrap_or(0);
            if out.len() >= head_end + 4 + body_len {
                return String::from_utf8(out).unwrap();
            }
        }
    }
}

fn wait_for_exit(child: &mut Child, within: Duration) -> std::process::ExitStatus {
    let deadline = Instant::now() + within;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("process did not exit within {within:?}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn binary() -> &'static str {
    env!("CARGO_BIN_EXE_txrelay")
}

// distinct ports per test so they can run in parallel.
fn test_port(offset: u16) -> u16 {
    30000 + (std::process::id() % 10000) as u16 + offset
}

#[test]
fn config_test_mode_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), test_port(0));

    let output = Command::new(binary())
        .arg("--test")
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("configuration ok"), "{stdout}");
    assert!(stdout.contains("chain=regtest"), "{stdout}");
}

#[test]
fn missing_chain_is_a_fatal_init_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.ini");
    fs::write(&config, "[server]\nport = 1\n").unwrap();

    let output = Command::new(binary()).arg(&config).output().unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn worker_serves_then_drains_on_signal() {
    let port = test_port(1);
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), port);

    let mut child = Command::new(binary())
        .arg("--worker-id")
        .arg("0")
        .arg(&config)
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // plain request/response.
    let mut probe = connect_with_retries(port);
    probe
        .write_all(b"GET /health HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_one_response(&mut probe);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("\"status\":\"healthy\""));
    drop(probe);

    // keep a connection open across the drain signal.
    let mut held = connect_with_retries(port);
    held.write_all(b"GET /ready HTTP/1.1\r\n\r\n").unwrap();
    let response = read_one_response(&mut held);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

    // SAFETY: plain kill(2) on the child we just spawned.
    unsafe {
        libc::kill(child.id() as i32, libc::SIGUSR1);
    }

    // the held connection keeps working but now reports draining.
    std::thread::sleep(Duration::from_millis(200));
    held.write_all(b"GET /ready HTTP/1.1\r\n\r\n").unwrap();
    let response = read_one_response(&mut held);
    assert!(
        response.starts_with("HTTP/1.1 503 Service Unavailable"),
        "{response}"
    );

    // closing the last connection lets the worker finish its drain.
    drop(held);
    let status = wait_for_exit(&mut child, Duration::from_secs(10));
    assert!(status.success(), "worker exited with {status}");
}

#[test]
fn supervisor_shuts_down_gracefully() {
    let port = test_port(2);
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), port);

    let mut child = Command::new(binary())
        .arg("--workers")
        .arg("1")
        .arg(&config)
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let mut probe = connect_with_retries(port);
    probe
        .write_all(b"GET /alive HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_one_response(&mut probe);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    drop(probe);

    // SAFETY: plain kill(2) on the child we just spawned.
    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }

    let status = wait_for_exit(&mut child, Duration::from_secs(35));
    assert!(status.success(), "supervisor exited with {status}");
}
