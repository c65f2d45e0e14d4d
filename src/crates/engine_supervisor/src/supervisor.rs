use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::document::find_local_proxy_port;
use crate::embedded::{stats_key, EmbeddedEngine, EmbeddedInstance};
use crate::error::{SupervisorError, SupervisorResult};
use crate::launcher::{EngineProcess, ExitEvent, Launcher};

const ACTIVE_LOG_TAG: &str = "engine-active";

/// Observable state of the active runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeMode {
    Idle,
    EmbeddedActive,
    ExternalActive,
}

/// Owner of the single active engine runtime.
///
/// Construct one per process and share it by cloning; clones refer to the same
/// state. All transitions happen under one lock, while spawning and readiness
/// polling run outside it.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    launcher: Launcher,
    embedded: Option<Arc<dyn EmbeddedEngine>>,
    state: Mutex<RuntimeState>,
    next_generation: AtomicU64,
}

enum RuntimeState {
    Idle,
    /// A start has claimed the slot and is launching outside the lock.
    Starting {
        generation: u64,
    },
    Embedded {
        generation: u64,
        instance: Arc<dyn EmbeddedInstance>,
    },
    External {
        generation: u64,
        process: EngineProcess,
    },
}

enum Launched {
    External(EngineProcess),
    Embedded(Arc<dyn EmbeddedInstance>),
}

impl Launched {
    fn shutdown(self) {
        match self {
            Launched::External(process) => process.terminate(),
            Launched::Embedded(instance) => instance.close(),
        }
    }
}

/// Runtime the test sessions can route through.
pub(crate) enum ActiveTarget {
    External(u16),
    Embedded(Arc<dyn EmbeddedInstance>),
}

impl Supervisor {
    /// Supervisor without an embedded engine; embedded paths fail with `EngineUnavailable`.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_embedded(config: SupervisorConfig, engine: Arc<dyn EmbeddedEngine>) -> Self {
        Self::build(config, Some(engine))
    }

    fn build(config: SupervisorConfig, embedded: Option<Arc<dyn EmbeddedEngine>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                launcher: Launcher::new(config),
                embedded,
                state: Mutex::new(RuntimeState::Idle),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        self.shared.launcher.config()
    }

    pub(crate) fn launcher(&self) -> &Launcher {
        &self.shared.launcher
    }

    pub fn mode(&self) -> RuntimeMode {
        match &*self.lock_state() {
            RuntimeState::Idle | RuntimeState::Starting { .. } => RuntimeMode::Idle,
            RuntimeState::Embedded { .. } => RuntimeMode::EmbeddedActive,
            RuntimeState::External { .. } => RuntimeMode::ExternalActive,
        }
    }

    /// Local proxy port of an external active runtime.
    ///
    /// Embedded runtimes expose no dialable port.
    pub fn current_proxy_port(&self) -> Option<u16> {
        match &*self.lock_state() {
            RuntimeState::External { process, .. } => Some(process.port()),
            _ => None,
        }
    }

    /// Process id of an external active runtime.
    pub fn engine_pid(&self) -> Option<u32> {
        match &*self.lock_state() {
            RuntimeState::External { process, .. } => Some(process.pid()),
            _ => None,
        }
    }

    /// Start the active runtime from a serialized engine config.
    pub fn start(&self, config: &str) -> SupervisorResult<()> {
        self.start_with_stats(config, &[])
    }

    /// Like [`Supervisor::start`], counting traffic for the named outbounds.
    ///
    /// Only embedded runtimes keep counters; an external runtime ignores the list.
    pub fn start_with_stats(&self, config: &str, stats_outbounds: &[String]) -> SupervisorResult<()> {
        let generation = {
            let mut state = self.lock_state();
            if !matches!(*state, RuntimeState::Idle) {
                return Err(SupervisorError::AlreadyRunning);
            }
            let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
            *state = RuntimeState::Starting { generation };
            generation
        };

        let launched = match self.launch(config, stats_outbounds) {
            Ok(launched) => launched,
            Err(err) => {
                let mut state = self.lock_state();
                if matches!(*state, RuntimeState::Starting { generation: g } if g == generation) {
                    *state = RuntimeState::Idle;
                }
                return Err(err);
            }
        };

        let mut state = self.lock_state();
        if !matches!(*state, RuntimeState::Starting { generation: g } if g == generation) {
            drop(state);
            launched.shutdown();
            return Err(SupervisorError::StartAborted);
        }

        let watch = match launched {
            Launched::External(process) => {
                info!(generation, port = process.port(), "external runtime active");
                let watch = process.exit_watch();
                *state = RuntimeState::External {
                    generation,
                    process,
                };
                Some(watch)
            }
            Launched::Embedded(instance) => {
                info!(generation, "embedded runtime active");
                *state = RuntimeState::Embedded {
                    generation,
                    instance,
                };
                None
            }
        };
        drop(state);

        // Registered after the lock is released: a process that already died
        // runs the hook on this thread.
        if let Some(watch) = watch {
            let shared = Arc::downgrade(&self.shared);
            watch.on_exit(move |event| clear_if_current(&shared, generation, event));
        }
        Ok(())
    }

    /// Stop the active runtime. Stopping an idle supervisor is not an error.
    pub fn stop(&self) -> SupervisorResult<()> {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, RuntimeState::Idle) {
            RuntimeState::Idle => {}
            RuntimeState::Starting { generation } => {
                info!(generation, "stop requested while start in flight");
            }
            RuntimeState::External {
                generation,
                process,
            } => {
                info!(generation, pid = process.pid(), "stopping external runtime");
                process.terminate();
            }
            RuntimeState::Embedded {
                generation,
                instance,
            } => {
                info!(generation, "stopping embedded runtime");
                instance.close();
            }
        }
        Ok(())
    }

    /// Traffic counter of an embedded runtime's outbound; zero otherwise.
    pub fn query_stats(&self, tag: &str, direction: &str) -> i64 {
        match &*self.lock_state() {
            RuntimeState::Embedded { instance, .. } => {
                instance.query_stats(&stats_key(tag, direction))
            }
            _ => 0,
        }
    }

    pub(crate) fn active_target(&self) -> SupervisorResult<ActiveTarget> {
        match &*self.lock_state() {
            RuntimeState::External { process, .. } => Ok(ActiveTarget::External(process.port())),
            RuntimeState::Embedded { instance, .. } => {
                Ok(ActiveTarget::Embedded(instance.clone()))
            }
            RuntimeState::Idle | RuntimeState::Starting { .. } => {
                Err(SupervisorError::NotRunning)
            }
        }
    }

    pub(crate) fn has_embedded(&self) -> bool {
        self.shared.embedded.is_some()
    }

    pub(crate) fn create_embedded(
        &self,
        config: &str,
        stats_outbounds: &[String],
    ) -> SupervisorResult<Arc<dyn EmbeddedInstance>> {
        let engine = self
            .shared
            .embedded
            .as_ref()
            .ok_or_else(|| SupervisorError::unavailable("no embedded engine linked"))?;
        engine.create(config, stats_outbounds)
    }

    fn launch(&self, config: &str, stats_outbounds: &[String]) -> SupervisorResult<Launched> {
        let mode = self.config().execution_mode;
        if mode.prefers_external() {
            match self.launch_external(config) {
                Ok(process) => {
                    if !stats_outbounds.is_empty() {
                        debug!(outbounds = ?stats_outbounds, "external runtime keeps no traffic counters");
                    }
                    return Ok(Launched::External(process));
                }
                Err(err) if mode.requires_external() || !self.has_embedded() => return Err(err),
                Err(err) => {
                    warn!(error = %err, "external engine failed to start, falling back to embedded")
                }
            }
        }
        self.create_embedded(config, stats_outbounds)
            .map(Launched::Embedded)
    }

    // The active runtime's config is used as given; no inbound is injected.
    fn launch_external(&self, config: &str) -> SupervisorResult<EngineProcess> {
        let document: serde_json::Value = serde_json::from_str(config)?;
        let port = find_local_proxy_port(&document).ok_or(SupervisorError::MissingInboundPort)?;
        self.shared.launcher.spawn(config, port, ACTIVE_LOG_TAG)
    }

    fn lock_state(&self) -> MutexGuard<'_, RuntimeState> {
        lock_state(&self.shared)
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("mode", &self.mode())
            .field("execution_mode", &self.config().execution_mode)
            .field("embedded", &self.has_embedded())
            .finish()
    }
}

fn lock_state(shared: &Shared) -> MutexGuard<'_, RuntimeState> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exit hook of an active external runtime: clear the state only if it still
/// belongs to the generation that spawned the process.
fn clear_if_current(shared: &Weak<Shared>, generation: u64, event: ExitEvent) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let removed = {
        let mut state = lock_state(&shared);
        let current = matches!(
            &*state,
            RuntimeState::External { generation: g, .. } if *g == generation
        );
        if !current {
            return;
        }
        std::mem::replace(&mut *state, RuntimeState::Idle)
    };
    if !event.requested {
        warn!(generation, pid = event.pid, status = ?event.status, "active engine exited, runtime cleared");
    }
    drop(removed);
}
