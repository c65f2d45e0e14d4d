//! Latency and throughput probes over an already-resolved HTTP client.

use std::io::Read;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::Proxy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SupervisorError, SupervisorResult};
use crate::net::elapsed_ms;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Outcome of a full test: latency plus a bulk download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullTestReport {
    pub latency_ms: u64,
    pub downloaded_bytes: u64,
    pub elapsed_ms: u64,
    pub bytes_per_second: u64,
    /// The download stopped early (timeout or read error) after receiving data.
    pub truncated: bool,
}

/// HTTP client tunneled through the SOCKS5 proxy on `127.0.0.1:<port>`.
///
/// Hostnames are resolved by the proxy.
pub fn socks_client(port: u16, timeout: Duration) -> SupervisorResult<Client> {
    let proxy = Proxy::all(format!("socks5h://127.0.0.1:{port}"))?;
    let client = Client::builder()
        .proxy(proxy)
        .connect_timeout(HANDSHAKE_TIMEOUT.min(timeout))
        .timeout(timeout)
        .build()?;
    Ok(client)
}

/// Issue one GET to `url` and return the elapsed wall-clock milliseconds.
///
/// Non-2xx responses are failures.
pub fn url_test(client: &Client, url: &str, timeout: Duration) -> SupervisorResult<u64> {
    let start = Instant::now();
    let response = client.get(url).timeout(timeout).send()?;
    let ms = elapsed_ms(start);
    let status = response.status();
    if !status.is_success() {
        return Err(SupervisorError::probe(format!("{url} answered {status}")));
    }
    debug!(url, ms, "url test finished");
    Ok(ms)
}

/// Measure latency against `latency_url`, then download `download_url` within `timeout`.
pub fn full_test(
    client: &Client,
    latency_url: &str,
    download_url: &str,
    timeout: Duration,
) -> SupervisorResult<FullTestReport> {
    let latency_ms = url_test(client, latency_url, timeout)?;

    let start = Instant::now();
    let deadline = start + timeout;
    let mut response = client.get(download_url).timeout(timeout).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(SupervisorError::probe(format!(
            "{download_url} answered {status}"
        )));
    }

    let mut buffer = vec![0u8; DOWNLOAD_CHUNK];
    let mut downloaded: u64 = 0;
    let mut truncated = false;
    loop {
        if Instant::now() >= deadline {
            truncated = true;
            break;
        }
        match response.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => downloaded += n as u64,
            Err(err) if downloaded > 0 => {
                debug!(url = download_url, error = %err, "download interrupted");
                truncated = true;
                break;
            }
            Err(err) => return Err(SupervisorError::probe(err)),
        }
    }

    let elapsed = start.elapsed();
    let bytes_per_second = if elapsed.is_zero() {
        downloaded
    } else {
        (downloaded as f64 / elapsed.as_secs_f64()) as u64
    };

    Ok(FullTestReport {
        latency_ms,
        downloaded_bytes: downloaded,
        elapsed_ms: elapsed_ms(start),
        bytes_per_second,
        truncated,
    })
}
