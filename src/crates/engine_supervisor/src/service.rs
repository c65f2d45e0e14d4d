//! Request/response surface consumed by whichever RPC transport hosts the supervisor.
//!
//! Errors never escape as `Err`: they are rendered into the `error` string of
//! the response, empty on success.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::probe::FullTestReport;
use crate::session::TestTarget;
use crate::supervisor::Supervisor;

/// Timeout applied when a test request carries none.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub config: String,
    /// Outbound tags whose traffic [`CoreService::query_stats`] can report.
    #[serde(default)]
    pub stats_outbounds: Vec<String>,
}

impl StartRequest {
    pub fn new(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            stats_outbounds: Vec::new(),
        }
    }

    pub fn with_stats_outbound(mut self, tag: impl Into<String>) -> Self {
        self.stats_outbounds.push(tag.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    UrlTest,
    TcpPing,
    FullTest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub mode: TestMode,
    /// Engine config, `EXTERNAL_SOCKS:<port>`, or absent for the active runtime.
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub full_test_url: Option<String>,
    /// `host:port` for TCP pings.
    #[serde(default)]
    pub address: Option<String>,
    /// Zero selects [`DEFAULT_TEST_TIMEOUT`].
    #[serde(default)]
    pub timeout_ms: u64,
}

impl TestRequest {
    pub fn new(mode: TestMode) -> Self {
        Self {
            mode,
            config: None,
            url: None,
            full_test_url: None,
            address: None,
            timeout_ms: 0,
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_full_test_url(mut self, url: impl Into<String>) -> Self {
        self.full_test_url = Some(url.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout_ms == 0 {
            DEFAULT_TEST_TIMEOUT
        } else {
            Duration::from_millis(self.timeout_ms)
        }
    }

    pub fn target(&self) -> TestTarget {
        TestTarget::from_request(self.config.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResponse {
    pub ms: u64,
    pub error: String,
    /// Present for successful full tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<FullTestReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStatsRequest {
    pub tag: String,
    pub direction: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatsResponse {
    pub traffic: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListConnectionsResponse {
    pub connections: Vec<String>,
}

/// Operations exposed to remote callers.
#[derive(Debug, Clone)]
pub struct CoreService {
    supervisor: Supervisor,
}

impl CoreService {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn start(&self, request: &StartRequest) -> ErrorResponse {
        debug!(bytes = request.config.len(), "start requested");
        error_response(
            self.supervisor
                .start_with_stats(&request.config, &request.stats_outbounds),
        )
    }

    pub fn stop(&self) -> ErrorResponse {
        error_response(self.supervisor.stop())
    }

    pub fn test(&self, request: &TestRequest) -> TestResponse {
        let timeout = request.timeout();
        let mut response = TestResponse::default();
        let outcome = match request.mode {
            TestMode::UrlTest => self
                .supervisor
                .run_url_test(&request.target(), request.url.as_deref(), timeout)
                .map(|ms| response.ms = ms),
            TestMode::TcpPing => self
                .supervisor
                .run_tcp_ping(request.address.as_deref().unwrap_or_default(), timeout)
                .map(|ms| response.ms = ms),
            TestMode::FullTest => self
                .supervisor
                .run_full_test(
                    &request.target(),
                    request.url.as_deref(),
                    request.full_test_url.as_deref(),
                    timeout,
                )
                .map(|report| {
                    response.ms = report.latency_ms;
                    response.full = Some(report);
                }),
        };
        if let Err(err) = outcome {
            debug!(mode = ?request.mode, error = %err, "test failed");
            response.error = err.to_string();
        }
        response
    }

    pub fn query_stats(&self, request: &QueryStatsRequest) -> QueryStatsResponse {
        QueryStatsResponse {
            traffic: self.supervisor.query_stats(&request.tag, &request.direction),
        }
    }

    /// Connection listing is not provided by the engine yet; always empty.
    pub fn list_connections(&self) -> ListConnectionsResponse {
        ListConnectionsResponse::default()
    }
}

fn error_response(result: crate::SupervisorResult<()>) -> ErrorResponse {
    ErrorResponse {
        error: result.err().map(|err| err.to_string()).unwrap_or_default(),
    }
}
