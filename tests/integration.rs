//! Integration tests for the worker pool.
//!
//! These drive the `echo-pool` demo binary as a real multi-process pool.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use predicates::prelude::*;
use tempfile::tempdir;

const ECHO_POOL: &str = env!("CARGO_BIN_EXE_echo-pool");

/// Get a command for the echo-pool binary.
fn echo_pool() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("echo-pool").unwrap()
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Send a GET request, returning the raw response or `None` if the
/// connection failed.
fn http_get(port: u16, path: &str) -> Option<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).ok()?;
    let mut response = String::new();
    stream.read_to_string(&mut response).ok()?;
    Some(response)
}

/// A running pool with its stderr collected line by line.
struct Pool {
    child: Child,
    logs: Arc<Mutex<Vec<String>>>,
}

impl Pool {
    fn start(port: u16, log_file: &std::path::Path, args: &[&str]) -> Self {
        let mut child = std::process::Command::new(ECHO_POOL)
            .arg("--addr")
            .arg(format!("127.0.0.1:{port}"))
            .args(args)
            .env("ROTA_LOG_FORMAT", "json")
            .env("ROTA_LOG_LEVEL", "info")
            .env("ROTA_LOG_FILE", log_file)
            .env_remove("ROTA_WORKER_ID")
            .env_remove("ROTA_LOG")
            .env_remove("RUST_LOG")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .expect("Failed to start echo-pool");

        let stderr = child.stderr.take().unwrap();
        let logs = Arc::new(Mutex::new(Vec::new()));
        let sink = logs.clone();
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                sink.lock().unwrap().push(line);
            }
        });

        Self { child, logs }
    }

    fn count(&self, needle: &str) -> usize {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    fn count_where(&self, matches: impl Fn(&str) -> bool) -> usize {
        self.logs.lock().unwrap().iter().filter(|line| matches(line)).count()
    }

    fn wait_for_log(&self, needle: &str, at_least: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.count(needle) < at_least {
            if Instant::now() > deadline {
                panic!(
                    "Timed out waiting for {} x {:?} in logs:\n{}",
                    at_least,
                    needle,
                    self.logs.lock().unwrap().join("\n")
                );
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn terminate(&mut self) -> std::process::ExitStatus {
        signal::kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM).unwrap();
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() > deadline {
                let _ = self.child.kill();
                panic!("echo-pool did not shut down");
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[test]
fn test_pool_rotates_respawns_and_shuts_down() {
    let dir = tempdir().unwrap();
    let log_file = dir.path().join("echo-pool.log");
    let port = free_port();
    let mut pool = Pool::start(
        port,
        &log_file,
        &["--workers", "2", "--max-requests", "3", "--kill-deadline-ms", "2000"],
    );

    pool.wait_for_log("Worker listening", 2, Duration::from_secs(20));
    let response = http_get(port, "/").expect("pool should answer");
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("worker "));

    // Some requests may hit a worker that is just closing its listener.
    for _ in 0..12 {
        let _ = http_get(port, "/");
    }
    pool.wait_for_log("Worker requested replacement", 1, Duration::from_secs(10));
    pool.wait_for_log("Replacing worker", 1, Duration::from_secs(10));
    pool.wait_for_log("Worker terminated", 1, Duration::from_secs(10));

    // Let every requested rotation finish so the crash below is a plain one.
    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.count("Worker terminated") < pool.count("Worker requested replacement") {
        assert!(Instant::now() < deadline, "rotations did not complete");
        std::thread::sleep(Duration::from_millis(50));
    }

    // Retired workers drained and exited on their own.
    assert_eq!(pool.count("Ensured death"), 0);
    assert!(
        pool.count_where(|line| line.contains("Worker terminated") && line.contains("\"clean\":true")) >= 1,
        "expected a retired worker to exit with code 0"
    );

    let _ = http_get(port, "/crash");
    pool.wait_for_log("Worker crashed", 1, Duration::from_secs(10));
    pool.wait_for_log("Respawning worker", 1, Duration::from_secs(10));

    let status = pool.terminate();
    assert!(status.success(), "echo-pool exited with {status}");
    pool.wait_for_log("Worker pool stopped", 1, Duration::from_secs(5));
    assert!(http_get(port, "/").is_none());

    let written = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .any(|entry| {
            entry.file_name().to_string_lossy().starts_with("echo-pool.log")
                && entry.metadata().map(|m| m.len() > 0).unwrap_or(false)
        });
    assert!(written, "expected a non-empty rolling log file");
}

/// Start echo-pool directly in worker mode and wait for its readiness report.
fn start_worker(port: u16) -> (Child, BufReader<std::process::ChildStdout>) {
    let mut child = std::process::Command::new(ECHO_POOL)
        .arg("--addr")
        .arg(format!("127.0.0.1:{port}"))
        .env("ROTA_WORKER_ID", "7")
        .env_remove("ROTA_LOG_FILE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start worker");

    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    let mut line = String::new();
    stdout.read_line(&mut line).unwrap();
    assert_eq!(line.trim(), r#"{"command":"listening","workerId":7}"#);
    (child, stdout)
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::process::ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("worker did not exit");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_worker_drains_on_disconnect() {
    let port = free_port();
    let (mut child, _stdout) = start_worker(port);
    assert!(http_get(port, "/").unwrap().contains("worker 7"));

    drop(child.stdin.take());
    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_worker_drains_on_sigterm() {
    let port = free_port();
    let (mut child, _stdout) = start_worker(port);

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(0));
    assert!(http_get(port, "/").is_none());
}

#[test]
fn test_zero_workers_is_rejected() {
    echo_pool()
        .env("ROTA_WORKERS", "0")
        .env_remove("ROTA_WORKER_ID")
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker count"));
}

#[test]
fn test_invalid_worker_id_is_rejected() {
    echo_pool()
        .env("ROTA_WORKER_ID", "not-a-number")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid worker id"));
}

#[test]
fn test_help_lists_pool_flags() {
    echo_pool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-requests"))
        .stdout(predicate::str::contains("--kill-deadline-ms"));
}
