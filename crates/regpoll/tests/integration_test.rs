use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

struct PollerProcess {
    child: Child,
    addr: String,
}

impl PollerProcess {
    fn start(extra_args: &[&str]) -> Self {
        let bin_path = env!("CARGO_BIN_EXE_regpoll");

        let listener = TcpListener::bind("127.0.0.1:0")
            .expect("Failed to bind ephemeral port for integration test");
        let addr = listener
            .local_addr()
            .expect("Failed to resolve bound address");
        let bind_addr = format!("127.0.0.1:{}", addr.port());
        drop(listener);

        let child = Command::new(bin_path)
            .args([
                "--simulate",
                "--registers",
                "3044,3066,3078",
                "--bind",
                &bind_addr,
            ])
            .args(extra_args)
            .stdout(Stdio::null())
            .spawn()
            .expect("Failed to start regpoll");

        // Loop until port is open (up to 5s)
        let start = Instant::now();
        while start.elapsed().as_secs() < 5 {
            if TcpStream::connect(&bind_addr).is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }

        Self {
            child,
            addr: bind_addr,
        }
    }

    fn connect(&self) -> BridgeClient {
        let stream = TcpStream::connect(&self.addr).expect("Failed to connect to bridge");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        BridgeClient {
            reader: BufReader::new(stream.try_clone().unwrap()),
            stream,
        }
    }
}

impl Drop for PollerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct BridgeClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl BridgeClient {
    fn send(&mut self, msg: serde_json::Value) {
        writeln!(self.stream, "{}", msg).unwrap();
    }

    fn next(&mut self) -> serde_json::Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn next_matching(&mut self, pred: impl Fn(&serde_json::Value) -> bool) -> serde_json::Value {
        for _ in 0..50 {
            let msg = self.next();
            if pred(&msg) {
                return msg;
            }
        }
        panic!("expected message never arrived");
    }
}

#[test]
fn test_first_outcome_covers_all_registers() {
    let poller = PollerProcess::start(&[]);
    let mut client = poller.connect();

    let outcome = client.next_matching(|m| m["type"] == "outcome" && m["status"] == "success");
    assert_eq!(outcome["protocol_version"]["major"], 1);
    let values = outcome["values"].as_object().unwrap();
    assert_eq!(values.len(), 3);
    for key in ["3044", "3066", "3078"] {
        assert!(values.contains_key(key), "missing register {}", key);
    }
    assert!(outcome["stale"].as_array().unwrap().is_empty());
}

#[test]
fn test_write_is_read_back_by_follow_up_cycle() {
    let poller = PollerProcess::start(&[]);
    let mut client = poller.connect();
    client.next_matching(|m| m["status"] == "success");

    client.send(serde_json::json!({
        "type": "write",
        "protocol_version": { "major": 1, "minor": 0 },
        "request_id": 1,
        "register": 3078,
        "value": 50
    }));

    let result = client.next_matching(|m| m["type"] == "write_result");
    assert_eq!(result["ok"], true);
    assert_eq!(result["register"], 3078);

    // Interval is 30 s, so this value can only come from the on-demand cycle.
    let outcome = client.next_matching(|m| m["type"] == "outcome" && m["values"]["3078"] == 50);
    assert_eq!(outcome["status"], "success");
}

#[test]
fn test_toggle_and_refresh() {
    let poller = PollerProcess::start(&["--require-handshake"]);
    let mut client = poller.connect();
    let first = client.next_matching(|m| m["status"] == "success");
    let first_sequence = first["sequence"].as_u64().unwrap();

    client.send(serde_json::json!({ "type": "toggle", "register": 3078 }));
    let err = client.next_matching(|m| m["type"] == "error");
    assert_eq!(err["message"], "handshake required");

    client.send(serde_json::json!({ "type": "hello", "client_id": "integration" }));
    client.send(serde_json::json!({ "type": "toggle", "register": 3078, "request_id": 9 }));
    let result = client.next_matching(|m| m["type"] == "write_result");
    assert_eq!(result["ok"], true);
    assert_eq!(result["value"], 1);
    assert_eq!(result["request_id"], 9);

    client.send(serde_json::json!({ "type": "refresh" }));
    let later = client.next_matching(|m| m["type"] == "outcome" && m["values"]["3078"] == 1);
    assert!(later["sequence"].as_u64().unwrap() > first_sequence);
}

#[test]
fn test_run_seconds_exits_cleanly_and_writes_audit_log() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");

    let status = Command::new(env!("CARGO_BIN_EXE_regpoll"))
        .args([
            "--simulate",
            "--registers",
            "7001,7002",
            "--no-bridge",
            "--run-seconds",
            "1",
            "--audit-log",
            audit_path.to_str().unwrap(),
        ])
        .stdout(Stdio::null())
        .status()
        .expect("Failed to run regpoll");
    assert!(status.success());

    let content = std::fs::read_to_string(&audit_path).unwrap();
    let kinds: Vec<String> = content
        .lines()
        .map(|line| {
            let entry: serde_json::Value = serde_json::from_str(line).unwrap();
            entry["event_type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("system_start"));
    assert_eq!(kinds.last().map(String::as_str), Some("system_shutdown"));
}

#[test]
fn test_log_dir_receives_json_lines() {
    let dir = tempfile::tempdir().unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_regpoll"))
        .args([
            "--simulate",
            "--registers",
            "7001",
            "--no-bridge",
            "--run-seconds",
            "1",
            "--log-dir",
            dir.path().to_str().unwrap(),
        ])
        .stdout(Stdio::null())
        .status()
        .expect("Failed to run regpoll");
    assert!(status.success());

    let log_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("regpoll.log"))
        })
        .collect();
    assert!(!log_files.is_empty(), "no rolling log file in {:?}", dir.path());

    let content: String = log_files
        .iter()
        .map(|path| std::fs::read_to_string(path).unwrap())
        .collect();
    let lines: Vec<&str> = content.lines().collect();
    assert!(!lines.is_empty());
    for line in lines {
        let entry: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(entry["level"].is_string());
    }
    assert!(content.contains("Run complete"));
}

#[test]
fn test_invalid_arguments_exit_with_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_regpoll"))
        .args(["--registers", "3044"])
        .output()
        .expect("Failed to run regpoll");
    assert!(!output.status.success());

    let output = Command::new(env!("CARGO_BIN_EXE_regpoll"))
        .args(["--port", "not-a-port"])
        .output()
        .expect("Failed to run regpoll");
    assert_eq!(output.status.code(), Some(2));
}
