//! Control plane for a single proxy engine, run either as an external process or
//! as an embedded library instance, plus disposable engines for measurements.
//!
//! Typical usage:
//! ```no_run
//! use std::time::Duration;
//! use engine_supervisor::{Supervisor, SupervisorConfig, TestTarget};
//!
//! let config = SupervisorConfig::from_env().with_engine_binary("/usr/local/bin/sing-box");
//! let supervisor = Supervisor::new(config);
//!
//! let engine_config = r#"{"inbounds":[{"type":"mixed","listen":"127.0.0.1","listen_port":2080}]}"#;
//! supervisor.start(engine_config).expect("engine should start");
//! assert_eq!(supervisor.current_proxy_port(), Some(2080));
//!
//! let ms = supervisor
//!     .run_url_test(&TestTarget::Active, None, Duration::from_secs(5))
//!     .expect("probe should succeed");
//! println!("latency {ms} ms");
//!
//! supervisor.stop().unwrap();
//! ```

mod config;
mod document;
mod embedded;
mod error;
mod launcher;
mod locate;
mod net;
mod probe;
mod service;
mod session;
mod supervisor;

pub use config::{
    ExecutionMode, SupervisorConfig, DEFAULT_FULL_TEST_URL, DEFAULT_TEST_URL, ENGINE_PATH_ENV,
    MODE_ENV,
};
pub use document::{
    ensure_test_inbound, find_local_proxy_port, find_local_proxy_port_str, PROXY_INBOUND_TYPES,
    TEST_INBOUND_TAG,
};
pub use embedded::{stats_key, EmbeddedEngine, EmbeddedInstance};
pub use error::{SupervisorError, SupervisorResult};
pub use launcher::{EngineProcess, ExitEvent, ExitHook, ExitWatch, Launcher, OutputStream};
pub use locate::{engine_version, locate_engine, parse_version};
pub use net::{allocate_loopback_port, port_accepts, tcp_ping, wait_port_ready};
pub use probe::{full_test, socks_client, url_test, FullTestReport};
pub use service::{
    CoreService, ErrorResponse, ListConnectionsResponse, QueryStatsRequest, QueryStatsResponse,
    StartRequest, TestMode, TestRequest, TestResponse, DEFAULT_TEST_TIMEOUT,
};
pub use session::{SessionMode, TestSession, TestTarget};
pub use supervisor::{RuntimeMode, Supervisor};
