//! Seam for an in-process engine library.
//!
//! The library itself lives outside this crate; hosts that link one implement
//! [`EmbeddedEngine`] and hand it to [`crate::Supervisor::with_embedded`].

use std::sync::Arc;
use std::time::Duration;

use crate::error::SupervisorResult;

/// Factory for embedded engine instances.
pub trait EmbeddedEngine: Send + Sync {
    /// Build and start an instance from a serialized engine config.
    ///
    /// Traffic counters are kept only for the outbound tags in `stats_outbounds`.
    fn create(
        &self,
        config: &str,
        stats_outbounds: &[String],
    ) -> SupervisorResult<Arc<dyn EmbeddedInstance>>;
}

/// A running embedded engine.
pub trait EmbeddedInstance: Send + Sync {
    /// HTTP client whose connections are dialed through the instance's outbounds.
    fn http_client(&self, timeout: Duration) -> SupervisorResult<reqwest::blocking::Client>;

    /// Current value of a named traffic counter, zero when unknown.
    fn query_stats(&self, name: &str) -> i64;

    /// Cancel the instance's work and release its resources. Must be idempotent.
    fn close(&self);
}

/// Counter name for an outbound's traffic in one direction (`uplink`/`downlink`).
pub fn stats_key(tag: &str, direction: &str) -> String {
    format!("outbound>>>{tag}>>>traffic>>>{direction}")
}
