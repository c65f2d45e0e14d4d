#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use engine_supervisor::{
    allocate_loopback_port, stats_key, EmbeddedEngine, EmbeddedInstance, ExecutionMode, SupervisorConfig,
    SupervisorError, SupervisorResult,
};
use tempfile::TempDir;

pub fn fake_engine_path() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_fake_engine") {
        return PathBuf::from(path);
    }

    // Fallback to the workspace target directory.
    let mut path = std::env::current_exe().expect("current exe");
    path.pop(); // deps
    path.pop(); // debug or release
    path.push("fake_engine");
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

/// Supervisor config pointed at the fake engine with a private scratch dir.
pub fn fake_engine_config(mode: ExecutionMode) -> (SupervisorConfig, TempDir) {
    let scratch = TempDir::new().expect("scratch dir");
    let config = SupervisorConfig::new()
        .with_execution_mode(mode)
        .with_engine_binary(fake_engine_path())
        .with_scratch_dir(scratch.path())
        .with_ready_timeout(Duration::from_secs(5));
    (config, scratch)
}

/// Supervisor config whose external engine can never be found.
pub fn missing_engine_config(mode: ExecutionMode) -> (SupervisorConfig, TempDir) {
    let scratch = TempDir::new().expect("scratch dir");
    let config = SupervisorConfig::new()
        .with_execution_mode(mode)
        .with_engine_name("engine-supervisor-missing-engine")
        .with_engine_binary(scratch.path().join("no-such-engine"))
        .with_scratch_dir(scratch.path());
    (config, scratch)
}

/// Engine config with one mixed inbound on a fresh loopback port.
pub fn engine_config_with_inbound() -> (String, u16) {
    let port = allocate_loopback_port().expect("free port");
    let config = serde_json::json!({
        "log": { "level": "info" },
        "inbounds": [
            { "tag": "mixed-in", "type": "mixed", "listen": "127.0.0.1", "listen_port": port }
        ],
        "outbounds": [ { "type": "direct" } ]
    });
    (config.to_string(), port)
}

/// Engine config without any local proxy inbound.
pub fn engine_config_without_inbound() -> String {
    serde_json::json!({
        "inbounds": [ { "type": "tun", "interface_name": "tun0" } ],
        "outbounds": [ { "type": "direct" } ]
    })
    .to_string()
}

pub fn with_fake_knobs(config: &str, knobs: serde_json::Value) -> String {
    let mut document: serde_json::Value = serde_json::from_str(config).expect("valid config");
    document["fake"] = knobs;
    document.to_string()
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|entry| entry.path()).collect())
        .unwrap_or_default()
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

pub fn connect_fails_within(port: u16, window: Duration) -> bool {
    wait_until(window, || {
        TcpStream::connect_timeout(
            &format!("127.0.0.1:{port}").parse().expect("addr"),
            Duration::from_millis(100),
        )
        .is_err()
    })
}

#[cfg(unix)]
pub fn kill_out_of_band(pid: u32) {
    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .expect("kill should run");
    assert!(status.success(), "kill -9 {pid} failed");
}

/// Minimal HTTP/1.1 responder for probe targets.
///
/// `/bytes/<n>` answers 200 with `n` bytes, `/status/<code>` answers that code,
/// anything else answers 204.
pub struct HttpResponder {
    port: u16,
    hits: Arc<AtomicUsize>,
}

impl HttpResponder {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind responder");
        let port = listener.local_addr().expect("local addr").port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let counter = counter.clone();
                thread::spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = respond(stream);
                });
            }
        });
        Self { port, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn respond(mut stream: TcpStream) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            return Ok(());
        }
        request.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&request);
    let path = text.split_whitespace().nth(1).unwrap_or("/");

    if let Some(size) = path.strip_prefix("/bytes/").and_then(|n| n.parse::<usize>().ok()) {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {size}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(head.as_bytes())?;
        stream.write_all(&vec![b'x'; size])?;
    } else if let Some(code) = path.strip_prefix("/status/") {
        let head = format!("HTTP/1.1 {code} Test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        stream.write_all(head.as_bytes())?;
    } else {
        stream.write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")?;
    }
    stream.flush()
}

/// In-memory embedded engine that dials directly.
#[derive(Default)]
pub struct MockEmbedded {
    pub created: AtomicUsize,
    pub fail_create: AtomicBool,
    pub instances: Mutex<Vec<Arc<MockInstance>>>,
}

impl MockEmbedded {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_instance(&self) -> Option<Arc<MockInstance>> {
        self.instances.lock().expect("instances").last().cloned()
    }
}

impl EmbeddedEngine for MockEmbedded {
    fn create(
        &self,
        config: &str,
        stats_outbounds: &[String],
    ) -> SupervisorResult<Arc<dyn EmbeddedInstance>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SupervisorError::InvalidConfig("mock refused config".to_string()));
        }
        serde_json::from_str::<serde_json::Value>(config)?;
        self.created.fetch_add(1, Ordering::SeqCst);
        let instance = Arc::new(MockInstance::default());
        {
            // Only registered outbounds get counters, each seeded with some traffic.
            let mut stats = instance.stats.lock().expect("stats");
            for tag in stats_outbounds {
                stats.insert(stats_key(tag, "uplink"), 1024);
                stats.insert(stats_key(tag, "downlink"), 4096);
            }
        }
        self.instances
            .lock()
            .expect("instances")
            .push(instance.clone());
        Ok(instance)
    }
}

#[derive(Default)]
pub struct MockInstance {
    pub closed: AtomicUsize,
    pub stats: Mutex<HashMap<String, i64>>,
}

impl MockInstance {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) > 0
    }
}

impl EmbeddedInstance for MockInstance {
    fn http_client(&self, timeout: Duration) -> SupervisorResult<reqwest::blocking::Client> {
        Ok(reqwest::blocking::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?)
    }

    fn query_stats(&self, name: &str) -> i64 {
        self.stats
            .lock()
            .expect("stats")
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
