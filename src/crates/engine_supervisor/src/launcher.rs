//! Spawning and tearing down the external engine binary.
//!
//! Every spawned engine owns a temporary config file in the scratch directory.
//! The file is removed when the process is terminated, when the exit watcher
//! sees the process die on its own, or when the handle is dropped, whichever
//! happens first.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::locate::locate_engine;
use crate::net::{port_accepts, wait_port_ready};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Origin stream of a forwarded engine output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Reported once by the exit watcher when the engine process ends.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub pid: u32,
    /// `None` when the status could not be collected.
    pub status: Option<ExitStatus>,
    /// Whether the exit followed a [`EngineProcess::terminate`] call.
    pub requested: bool,
}

/// Callback run by the exit watcher after the process has been reaped.
pub type ExitHook = Box<dyn FnOnce(ExitEvent) + Send + 'static>;

/// Spawns engine processes according to a [`SupervisorConfig`].
#[derive(Debug, Clone)]
pub struct Launcher {
    config: SupervisorConfig,
}

impl Launcher {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the engine with `document` as its config and wait until `expected_port` accepts.
    ///
    /// Output lines are forwarded to the log under `log_tag`. On any failure the
    /// process is killed and its config file removed before returning.
    pub fn spawn(
        &self,
        document: &str,
        expected_port: u16,
        log_tag: &str,
    ) -> SupervisorResult<EngineProcess> {
        if expected_port == 0 {
            return Err(SupervisorError::MissingInboundPort);
        }
        // A listener already on the port would pass the readiness check for us.
        if port_accepts(expected_port, self.config.connect_attempt_timeout) {
            return Err(SupervisorError::PortInUse(expected_port));
        }
        let binary = locate_engine(&self.config)?;
        let config_file = write_config_file(&self.config.scratch_dir, document)?;

        let mut cmd = Command::new(&binary);
        cmd.args(&self.config.run_args);
        cmd.arg(&*config_file);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            SupervisorError::unavailable(format!("failed to start {}: {err}", binary.display()))
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            spawn_output_forwarder(stdout, OutputStream::Stdout, log_tag.to_string());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_forwarder(stderr, OutputStream::Stderr, log_tag.to_string());
        }

        let config_path = config_file.to_path_buf();
        let shared = Arc::new(ProcessShared {
            child: Mutex::new(child),
            config_file: Mutex::new(Some(config_file)),
            terminated: AtomicBool::new(false),
            exit: Mutex::new(ExitSlot::Running(None)),
        });
        spawn_exit_watcher(shared.clone(), pid, log_tag.to_string());

        let process = EngineProcess {
            shared,
            pid,
            port: expected_port,
            config_path,
            tag: log_tag.to_string(),
        };
        debug!(tag = %log_tag, pid, port = expected_port, "engine spawned, waiting for port");

        let ready = wait_port_ready(
            expected_port,
            self.config.ready_timeout,
            self.config.connect_attempt_timeout,
            self.config.ready_poll_interval,
            || process.exit_status().is_some(),
        );
        let status = process.exit_status();
        if !ready || status.is_some() {
            process.terminate();
            return Err(match status {
                Some(status) => SupervisorError::EngineExited(status),
                None => SupervisorError::EngineNotReady {
                    port: expected_port,
                    timeout: self.config.ready_timeout,
                },
            });
        }

        info!(tag = %log_tag, pid, port = expected_port, "engine ready");
        Ok(process)
    }
}

/// Handle to a spawned engine process.
///
/// Dropping the handle terminates the process.
pub struct EngineProcess {
    shared: Arc<ProcessShared>,
    pid: u32,
    port: u16,
    config_path: PathBuf,
    tag: String,
}

impl EngineProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Local proxy port the engine was verified to accept on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Temporary config file handed to the engine.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Exit status if the process has already ended.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        lock(&self.shared.child).try_wait().ok().flatten()
    }

    /// Cloneable handle for registering an exit hook without borrowing the process.
    pub fn exit_watch(&self) -> ExitWatch {
        ExitWatch {
            shared: self.shared.clone(),
        }
    }

    /// Kill the process if still running and remove its config file. Idempotent.
    pub fn terminate(&self) {
        if !self.shared.terminated.swap(true, Ordering::SeqCst) {
            debug!(tag = %self.tag, pid = self.pid, "terminating engine");
        }
        {
            let mut child = lock(&self.shared.child);
            if matches!(child.try_wait(), Ok(None)) {
                if let Err(err) = child.kill() {
                    warn!(tag = %self.tag, pid = self.pid, error = %err, "failed to kill engine");
                }
                let _ = child.wait();
            }
        }
        self.shared.remove_config_file();
    }
}

impl fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineProcess")
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("config_path", &self.config_path)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Registration point for a process's exit hook.
#[derive(Clone)]
pub struct ExitWatch {
    shared: Arc<ProcessShared>,
}

impl ExitWatch {
    /// Run `hook` once the process exits; immediately if it already has.
    ///
    /// The hook runs on the watcher thread or, for an already-dead process, on
    /// the caller's thread. A later registration replaces an earlier pending one.
    pub fn on_exit(&self, hook: impl FnOnce(ExitEvent) + Send + 'static) {
        let event = {
            let mut slot = lock(&self.shared.exit);
            match &mut *slot {
                ExitSlot::Running(pending) => {
                    *pending = Some(Box::new(hook));
                    return;
                }
                ExitSlot::Exited(event) => event.clone(),
            }
        };
        hook(event);
    }
}

struct ProcessShared {
    child: Mutex<Child>,
    config_file: Mutex<Option<TempPath>>,
    terminated: AtomicBool,
    exit: Mutex<ExitSlot>,
}

impl ProcessShared {
    fn remove_config_file(&self) {
        if let Some(path) = lock(&self.config_file).take() {
            let removed = path.to_path_buf();
            if let Err(err) = path.close() {
                warn!(path = %removed.display(), error = %err, "failed to remove engine config file");
            }
        }
    }
}

enum ExitSlot {
    Running(Option<ExitHook>),
    Exited(ExitEvent),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_config_file(dir: &Path, document: &str) -> SupervisorResult<TempPath> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix("engine-")
        .suffix(".json")
        .tempfile_in(dir)?;
    file.write_all(document.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

fn spawn_output_forwarder<R: Read + Send + 'static>(reader: R, stream: OutputStream, tag: String) {
    thread::spawn(move || {
        let buf_reader = BufReader::new(reader);
        for line in buf_reader.lines().map_while(Result::ok) {
            let line = line.trim();
            if !line.is_empty() {
                info!(tag = %tag, stream = ?stream, "{line}");
            }
        }
    });
}

fn spawn_exit_watcher(shared: Arc<ProcessShared>, pid: u32, tag: String) {
    thread::spawn(move || {
        let status = loop {
            match lock(&shared.child).try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(err) => {
                    warn!(tag = %tag, pid, error = %err, "failed to poll engine process");
                    break None;
                }
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };

        let requested = shared.terminated.load(Ordering::SeqCst);
        match status {
            Some(status) if !requested => warn!(tag = %tag, pid, %status, "engine process exited"),
            Some(status) => debug!(tag = %tag, pid, %status, "engine process exited"),
            None => {}
        }
        shared.remove_config_file();

        let event = ExitEvent {
            pid,
            status,
            requested,
        };
        let hook = {
            let mut slot = lock(&shared.exit);
            match std::mem::replace(&mut *slot, ExitSlot::Exited(event.clone())) {
                ExitSlot::Running(hook) => hook,
                ExitSlot::Exited(_) => None,
            }
        };
        if let Some(hook) = hook {
            hook(event);
        }
    });
}
