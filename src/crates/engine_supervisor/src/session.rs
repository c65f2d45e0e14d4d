//! Disposable runtimes for latency and throughput tests.
//!
//! A [`TestSession`] lives for one test call. Ephemeral runtimes it owns are
//! never recorded as the active runtime and are torn down when the session is
//! closed or dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::document::ensure_test_inbound;
use crate::embedded::EmbeddedInstance;
use crate::error::SupervisorResult;
use crate::launcher::EngineProcess;
use crate::net::tcp_ping;
use crate::probe::{full_test, socks_client, url_test, FullTestReport};
use crate::supervisor::{ActiveTarget, Supervisor};

const URL_TEST_LOG_TAG: &str = "engine-test";
const FULL_TEST_LOG_TAG: &str = "engine-full-test";

/// Where test traffic is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestTarget {
    /// An already-running SOCKS5 proxy on `127.0.0.1:<port>`; no runtime lifecycle.
    DirectSocks(u16),
    /// A request-supplied engine config run as an ephemeral runtime.
    Config(String),
    /// The active runtime.
    Active,
}

impl TestTarget {
    /// Request config value naming a running SOCKS5 port instead of a config.
    pub const DIRECT_SOCKS_PREFIX: &'static str = "EXTERNAL_SOCKS:";

    /// Interpret the optional config carried by a test request.
    ///
    /// Blank configs select the active runtime. `EXTERNAL_SOCKS:<port>` with a
    /// positive port selects a direct proxy; anything else is an engine config.
    pub fn from_request(config: Option<&str>) -> Self {
        let Some(config) = config.map(str::trim).filter(|config| !config.is_empty()) else {
            return TestTarget::Active;
        };
        if let Some(port) = config
            .strip_prefix(Self::DIRECT_SOCKS_PREFIX)
            .and_then(|port| port.trim().parse::<u16>().ok())
            .filter(|port| *port > 0)
        {
            return TestTarget::DirectSocks(port);
        }
        TestTarget::Config(config.to_string())
    }
}

/// How a session resolved its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Direct,
    EphemeralExternal,
    EphemeralEmbedded,
    ReuseActive,
}

enum SessionRuntime {
    Direct,
    EphemeralExternal(EngineProcess),
    EphemeralEmbedded(Arc<dyn EmbeddedInstance>),
    ReuseActive,
}

/// HTTP client for one test plus whatever ephemeral runtime backs it.
pub struct TestSession {
    runtime: Option<SessionRuntime>,
    client: Client,
    proxy_port: Option<u16>,
}

impl TestSession {
    fn new(runtime: SessionRuntime, client: Client, proxy_port: Option<u16>) -> Self {
        Self {
            runtime: Some(runtime),
            client,
            proxy_port,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Local SOCKS5 port the client tunnels through, if any.
    pub fn proxy_port(&self) -> Option<u16> {
        self.proxy_port
    }

    /// Temporary config file of an ephemeral external runtime.
    pub fn config_path(&self) -> Option<&std::path::Path> {
        match &self.runtime {
            Some(SessionRuntime::EphemeralExternal(process)) => Some(process.config_path()),
            _ => None,
        }
    }

    pub fn mode(&self) -> SessionMode {
        match &self.runtime {
            Some(SessionRuntime::Direct) | None => SessionMode::Direct,
            Some(SessionRuntime::EphemeralExternal(_)) => SessionMode::EphemeralExternal,
            Some(SessionRuntime::EphemeralEmbedded(_)) => SessionMode::EphemeralEmbedded,
            Some(SessionRuntime::ReuseActive) => SessionMode::ReuseActive,
        }
    }

    /// Tear down the owned runtime. A reused active runtime is left running.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        match self.runtime.take() {
            Some(SessionRuntime::EphemeralExternal(process)) => {
                debug!(pid = process.pid(), port = process.port(), "tearing down test runtime");
                process.terminate();
            }
            Some(SessionRuntime::EphemeralEmbedded(instance)) => instance.close(),
            Some(SessionRuntime::Direct) | Some(SessionRuntime::ReuseActive) | None => {}
        }
    }
}

impl fmt::Debug for TestSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSession")
            .field("mode", &self.mode())
            .field("proxy_port", &self.proxy_port)
            .finish()
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Supervisor {
    /// Resolve `target` into a ready HTTP client, building an ephemeral runtime if needed.
    pub fn open_test_session(
        &self,
        target: &TestTarget,
        timeout: Duration,
    ) -> SupervisorResult<TestSession> {
        self.open_session(target, timeout, URL_TEST_LOG_TAG)
    }

    /// Time one GET through the runtime selected by `target`.
    pub fn run_url_test(
        &self,
        target: &TestTarget,
        url: Option<&str>,
        timeout: Duration,
    ) -> SupervisorResult<u64> {
        let url = non_blank(url).unwrap_or(self.config().test_url.as_str()).to_string();
        let session = self.open_session(target, timeout, URL_TEST_LOG_TAG)?;
        let result = url_test(session.client(), &url, timeout);
        session.close();
        result
    }

    /// Latency plus a bulk download through the runtime selected by `target`.
    pub fn run_full_test(
        &self,
        target: &TestTarget,
        url: Option<&str>,
        download_url: Option<&str>,
        timeout: Duration,
    ) -> SupervisorResult<FullTestReport> {
        let url = non_blank(url).unwrap_or(self.config().test_url.as_str()).to_string();
        let download_url = non_blank(download_url)
            .unwrap_or(self.config().full_test_url.as_str())
            .to_string();
        let session = self.open_session(target, timeout, FULL_TEST_LOG_TAG)?;
        let result = full_test(session.client(), &url, &download_url, timeout);
        session.close();
        result
    }

    /// Raw TCP connect timing; independent of any runtime.
    pub fn run_tcp_ping(&self, address: &str, timeout: Duration) -> SupervisorResult<u64> {
        tcp_ping(address, timeout)
    }

    fn open_session(
        &self,
        target: &TestTarget,
        timeout: Duration,
        log_tag: &str,
    ) -> SupervisorResult<TestSession> {
        match target {
            TestTarget::DirectSocks(port) => {
                debug!(port, "testing through direct socks endpoint");
                let client = socks_client(*port, timeout)?;
                Ok(TestSession::new(SessionRuntime::Direct, client, Some(*port)))
            }
            TestTarget::Config(config) => self.open_ephemeral(config, timeout, log_tag),
            TestTarget::Active => match self.active_target()? {
                ActiveTarget::External(port) => {
                    let client = socks_client(port, timeout)?;
                    Ok(TestSession::new(SessionRuntime::ReuseActive, client, Some(port)))
                }
                ActiveTarget::Embedded(instance) => {
                    let client = instance.http_client(timeout)?;
                    Ok(TestSession::new(SessionRuntime::ReuseActive, client, None))
                }
            },
        }
    }

    fn open_ephemeral(
        &self,
        config: &str,
        timeout: Duration,
        log_tag: &str,
    ) -> SupervisorResult<TestSession> {
        let mode = self.config().execution_mode;
        if mode.prefers_external() {
            match self.spawn_ephemeral(config, log_tag) {
                Ok(process) => {
                    let port = process.port();
                    let client = socks_client(port, timeout)?;
                    return Ok(TestSession::new(
                        SessionRuntime::EphemeralExternal(process),
                        client,
                        Some(port),
                    ));
                }
                Err(err) if mode.requires_external() || !self.has_embedded() => return Err(err),
                Err(err) => {
                    warn!(tag = %log_tag, error = %err, "external test runtime failed, falling back to embedded")
                }
            }
        }

        let instance = self.create_embedded(config, &[])?;
        match instance.http_client(timeout) {
            Ok(client) => Ok(TestSession::new(
                SessionRuntime::EphemeralEmbedded(instance),
                client,
                None,
            )),
            Err(err) => {
                instance.close();
                Err(err)
            }
        }
    }

    fn spawn_ephemeral(&self, config: &str, log_tag: &str) -> SupervisorResult<EngineProcess> {
        let (document, port) = ensure_test_inbound(config)?;
        self.launcher().spawn(&document, port, log_tag)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
