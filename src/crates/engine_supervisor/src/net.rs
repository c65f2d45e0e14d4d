use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{SupervisorError, SupervisorResult};

/// Loopback address for a local engine port.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Reserve a free loopback port and release it immediately.
pub fn allocate_loopback_port() -> SupervisorResult<u16> {
    let listener =
        TcpListener::bind(loopback(0)).map_err(SupervisorError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(SupervisorError::PortAllocation)?
        .port();
    if port == 0 {
        return Err(SupervisorError::PortAllocation(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "kernel returned port 0",
        )));
    }
    Ok(port)
}

/// Whether a TCP connect to the loopback port succeeds within `attempt_timeout`.
pub fn port_accepts(port: u16, attempt_timeout: Duration) -> bool {
    TcpStream::connect_timeout(&loopback(port), attempt_timeout).is_ok()
}

/// Poll the loopback port until it accepts a connection or `timeout` elapses.
///
/// `abort` is consulted between attempts so callers can stop waiting on a
/// process that already died.
pub fn wait_port_ready(
    port: u16,
    timeout: Duration,
    attempt_timeout: Duration,
    interval: Duration,
    mut abort: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if port_accepts(port, attempt_timeout) {
            return true;
        }
        if abort() {
            return false;
        }
        thread::sleep(interval);
    }
    false
}

/// Time a raw TCP connect to `address`, in milliseconds.
pub fn tcp_ping(address: &str, timeout: Duration) -> SupervisorResult<u64> {
    let targets: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(|err| SupervisorError::probe(format!("resolve {address}: {err}")))?
        .collect();
    let target = targets
        .first()
        .ok_or_else(|| SupervisorError::probe(format!("{address} resolved to no addresses")))?;

    let start = Instant::now();
    TcpStream::connect_timeout(target, timeout)
        .map_err(|err| SupervisorError::probe(format!("connect {address}: {err}")))?;
    Ok(elapsed_ms(start))
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
