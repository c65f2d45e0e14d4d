//! Stand-in for the external proxy engine used by the integration tests.
//!
//! `fake_engine run -c <config>` binds the config's local proxy inbound and
//! relays SOCKS5 CONNECT traffic. A top-level `"fake"` object tunes startup:
//! `bind_delay_ms`, `never_bind` and `exit_after_ms`.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use engine_supervisor::find_local_proxy_port;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
struct FakeKnobs {
    #[serde(default)]
    bind_delay_ms: u64,
    #[serde(default)]
    never_bind: bool,
    #[serde(default)]
    exit_after_ms: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("version") => {
            println!("fake-engine version 0.1.0-test");
            Ok(())
        }
        Some("run") => {
            let path = args
                .iter()
                .position(|arg| arg == "-c")
                .and_then(|idx| args.get(idx + 1))
                .ok_or("missing -c <config>")?;
            run(path)
        }
        _ => Err("usage: fake_engine run -c <config> | fake_engine version".into()),
    }
}

fn run(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let document: Value = serde_json::from_str(&text)?;
    let knobs: FakeKnobs = match document.get("fake") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => FakeKnobs::default(),
    };
    let port = find_local_proxy_port(&document).ok_or("no local proxy inbound")?;
    eprintln!("loaded config {path}");

    if let Some(delay) = knobs.exit_after_ms {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(delay));
            eprintln!("exiting on request");
            std::process::exit(3);
        });
    }

    thread::sleep(Duration::from_millis(knobs.bind_delay_ms));
    if knobs.never_bind {
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    println!("listening on {}", listener.local_addr()?);

    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        thread::spawn(move || {
            let _ = serve_socks(stream);
        });
    }
    Ok(())
}

fn serve_socks(mut client: TcpStream) -> io::Result<()> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header)?;
    if header[0] != 5 {
        // A plain readiness probe or a non-SOCKS client.
        return Ok(());
    }
    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods)?;
    client.write_all(&[5, 0])?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request)?;
    let host = match request[3] {
        1 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets)?;
            Ipv4Addr::from(octets).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len)?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name)?;
            String::from_utf8_lossy(&name).into_owned()
        }
        4 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets)?;
            Ipv6Addr::from(octets).to_string()
        }
        _ => return reply(&mut client, 8),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port)?;
    let port = u16::from_be_bytes(port);

    if request[1] != 1 {
        return reply(&mut client, 7);
    }
    let upstream = match TcpStream::connect((host.as_str(), port)) {
        Ok(upstream) => upstream,
        Err(_) => return reply(&mut client, 5),
    };
    reply(&mut client, 0)?;
    relay(client, upstream)
}

fn reply(client: &mut TcpStream, code: u8) -> io::Result<()> {
    client.write_all(&[5, code, 0, 1, 0, 0, 0, 0, 0, 0])
}

fn relay(client: TcpStream, upstream: TcpStream) -> io::Result<()> {
    let mut client_read = client.try_clone()?;
    let mut upstream_write = upstream.try_clone()?;
    let forward = thread::spawn(move || {
        let _ = io::copy(&mut client_read, &mut upstream_write);
        let _ = upstream_write.shutdown(Shutdown::Write);
    });

    let mut upstream_read = upstream;
    let mut client_write = client;
    let _ = io::copy(&mut upstream_read, &mut client_write);
    let _ = client_write.shutdown(Shutdown::Write);
    let _ = forward.join();
    Ok(())
}
