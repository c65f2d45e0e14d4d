//! Read-only inspection and test augmentation of engine config documents.
//!
//! The engine's config schema is opaque here. The only structure relied upon is
//! a top-level `inbounds` array whose entries carry `type` and `listen_port`.

use serde_json::{json, Value};

use crate::error::{SupervisorError, SupervisorResult};
use crate::net::allocate_loopback_port;

/// Inbound types that expose a dialable local proxy.
pub const PROXY_INBOUND_TYPES: [&str; 3] = ["mixed", "socks", "http"];
/// Tag of the inbound injected by [`ensure_test_inbound`].
pub const TEST_INBOUND_TAG: &str = "mixed-test";

/// Return the port of the first mixed/socks/http inbound with a positive `listen_port`.
pub fn find_local_proxy_port(document: &Value) -> Option<u16> {
    first_proxy_port(document.as_object()?.get("inbounds")?.as_array()?)
}

fn first_proxy_port(inbounds: &[Value]) -> Option<u16> {
    inbounds
        .iter()
        .filter_map(Value::as_object)
        .filter(|inbound| {
            inbound
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|kind| PROXY_INBOUND_TYPES.contains(&kind))
        })
        .find_map(|inbound| inbound.get("listen_port").and_then(port_value))
}

/// Same as [`find_local_proxy_port`] over the serialized document.
pub fn find_local_proxy_port_str(config: &str) -> Option<u16> {
    let document: Value = serde_json::from_str(config).ok()?;
    find_local_proxy_port(&document)
}

/// Guarantee the document exposes a local proxy inbound.
///
/// A document that already has one is returned untouched. Otherwise a free
/// loopback port is reserved and a `mixed` inbound bound to it is appended. The
/// reservation is released before returning, so another process may take the
/// port before the engine binds it.
pub fn ensure_test_inbound(config: &str) -> SupervisorResult<(String, u16)> {
    if config.trim().is_empty() {
        return Err(SupervisorError::invalid_config("empty engine config"));
    }
    let mut document: Value = serde_json::from_str(config)?;
    let root = document
        .as_object_mut()
        .ok_or_else(|| SupervisorError::invalid_config("engine config is not an object"))?;

    let existing = root
        .get("inbounds")
        .and_then(Value::as_array)
        .and_then(|inbounds| first_proxy_port(inbounds));
    if let Some(port) = existing {
        return Ok((config.to_string(), port));
    }

    let port = allocate_loopback_port()?;
    let inbound = json!({
        "tag": TEST_INBOUND_TAG,
        "type": "mixed",
        "listen": "127.0.0.1",
        "listen_port": port,
    });

    match root.get_mut("inbounds") {
        Some(Value::Array(inbounds)) => inbounds.push(inbound),
        _ => {
            root.insert("inbounds".to_string(), Value::Array(vec![inbound]));
        }
    }

    Ok((serde_json::to_string(&document)?, port))
}

// Ports may arrive as floats from loosely typed producers.
fn port_value(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0 && *f > 0.0).map(|f| f as u64))?,
        _ => return None,
    };
    u16::try_from(port).ok().filter(|port| *port > 0)
}
