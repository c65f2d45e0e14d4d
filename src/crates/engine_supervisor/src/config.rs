use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable selecting the [`ExecutionMode`].
pub const MODE_ENV: &str = "ENGINE_SUPERVISOR_MODE";
/// Environment variable overriding the external engine binary path.
pub const ENGINE_PATH_ENV: &str = "ENGINE_SUPERVISOR_ENGINE_PATH";

pub const DEFAULT_TEST_URL: &str = "https://www.youtube.com/generate_204";
pub const DEFAULT_FULL_TEST_URL: &str = "http://cachefly.cachefly.net/10mb.test";

/// How the supervisor chooses between the external binary and the embedded engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Never spawn the external binary.
    EmbeddedOnly,
    /// Try the external binary first and fall back to the embedded engine.
    #[default]
    ExternalPreferred,
    /// Only the external binary; its failures are reported as-is.
    ExternalRequired,
}

impl ExecutionMode {
    pub fn prefers_external(self) -> bool {
        self != ExecutionMode::EmbeddedOnly
    }

    pub fn requires_external(self) -> bool {
        self == ExecutionMode::ExternalRequired
    }
}

impl FromStr for ExecutionMode {
    type Err = std::convert::Infallible;

    /// Unknown values select the default rather than failing.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mode = match value.trim().to_ascii_lowercase().as_str() {
            "embedded" | "embedded-only" => ExecutionMode::EmbeddedOnly,
            "external" | "external-only" | "external-required" => ExecutionMode::ExternalRequired,
            _ => ExecutionMode::ExternalPreferred,
        };
        Ok(mode)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::EmbeddedOnly => "embedded-only",
            ExecutionMode::ExternalPreferred => "external-preferred",
            ExecutionMode::ExternalRequired => "external-required",
        };
        f.write_str(name)
    }
}

/// Process-level configuration for the supervisor and the engines it launches.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// External vs. embedded selection policy.
    pub execution_mode: ExecutionMode,
    /// Explicit path to the engine binary; relative paths resolve against the current executable.
    pub engine_binary: Option<PathBuf>,
    /// File name looked up next to the executable and on `PATH`.
    pub engine_name: String,
    /// Arguments preceding the config file path on the engine command line.
    pub run_args: Vec<String>,
    /// Directory receiving temporary engine config files.
    pub scratch_dir: PathBuf,
    /// Hard ceiling on waiting for a spawned engine to accept connections.
    pub ready_timeout: Duration,
    /// Timeout of a single readiness connect attempt.
    pub connect_attempt_timeout: Duration,
    /// Pause between readiness attempts.
    pub ready_poll_interval: Duration,
    /// URL probed by latency tests when the request leaves it blank.
    pub test_url: String,
    /// URL downloaded by full tests when the request leaves it blank.
    pub full_test_url: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            engine_binary: None,
            engine_name: "sing-box".to_string(),
            run_args: vec!["run".to_string(), "-c".to_string()],
            scratch_dir: std::env::temp_dir().join("engine-supervisor"),
            ready_timeout: Duration::from_secs(8),
            connect_attempt_timeout: Duration::from_millis(200),
            ready_poll_interval: Duration::from_millis(120),
            test_url: DEFAULT_TEST_URL.to_string(),
            full_test_url: DEFAULT_FULL_TEST_URL.to_string(),
        }
    }

    /// Defaults overlaid with [`MODE_ENV`] and [`ENGINE_PATH_ENV`].
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Ok(mode) = std::env::var(MODE_ENV) {
            config.execution_mode = mode.parse().unwrap_or_default();
        }
        if let Ok(path) = std::env::var(ENGINE_PATH_ENV) {
            let path = path.trim();
            if !path.is_empty() {
                config.engine_binary = Some(PathBuf::from(path));
            }
        }
        config
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_engine_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_binary = Some(path.into());
        self
    }

    pub fn with_engine_name(mut self, name: impl Into<String>) -> Self {
        self.engine_name = name.into();
        self
    }

    /// Replace the arguments placed before the config file path.
    pub fn with_run_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_connect_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.connect_attempt_timeout = timeout;
        self
    }

    pub fn with_ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }

    pub fn with_test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = url.into();
        self
    }

    pub fn with_full_test_url(mut self, url: impl Into<String>) -> Self {
        self.full_test_url = url.into();
        self
    }
}
