use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use engine_supervisor::{
    engine_version, locate_engine, Supervisor, SupervisorConfig, TestTarget, DEFAULT_TEST_TIMEOUT,
};

/// Supervise and measure a proxy engine from the command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Engine binary (overrides ENGINE_SUPERVISOR_ENGINE_PATH)
    #[arg(long, value_name = "FILE", global = true)]
    engine: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved engine binary and its version
    Version,
    /// Start the active runtime and keep it until stdin closes
    Run {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// Keep traffic counters for this outbound tag (repeatable)
        #[arg(long = "stats-outbound", value_name = "TAG")]
        stats_outbounds: Vec<String>,
    },
    /// Time one HTTP GET through an engine
    UrlTest {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Latency plus a bulk download through an engine
    FullTest {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        download_url: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Time a raw TCP connect
    TcpPing {
        address: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(clap::Args, Debug)]
struct TargetArgs {
    /// Engine config to run as a throwaway test runtime
    #[arg(short, long, value_name = "FILE", conflicts_with = "socks_port")]
    config: Option<PathBuf>,

    /// Test through an already running SOCKS5 proxy on this local port
    #[arg(long)]
    socks_port: Option<u16>,
}

impl TargetArgs {
    fn resolve(&self) -> Result<TestTarget> {
        if let Some(port) = self.socks_port {
            return Ok(TestTarget::DirectSocks(port));
        }
        match &self.config {
            Some(path) => Ok(TestTarget::Config(read_config(path)?)),
            None => Ok(TestTarget::Active),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging(args.debug)?;

    let mut config = SupervisorConfig::from_env();
    if let Some(engine) = args.engine {
        config = config.with_engine_binary(engine);
    }
    info!(mode = %config.execution_mode, "engine supervisor");
    let supervisor = Supervisor::new(config);

    match args.command {
        Commands::Version => {
            let binary = locate_engine(supervisor.config())?;
            let version = engine_version(&binary).unwrap_or_else(|| "unknown".to_string());
            println!("{}: {version}", binary.display());
        }
        Commands::Run {
            config,
            stats_outbounds,
        } => {
            let document = read_config(&config)?;
            supervisor.start_with_stats(&document, &stats_outbounds)?;
            info!(mode = ?supervisor.mode(), port = ?supervisor.current_proxy_port(), "runtime started, close stdin to stop");
            let held = hold_until_eof(std::io::stdin().lock());
            supervisor.stop()?;
            held?;
        }
        Commands::UrlTest {
            target,
            url,
            timeout_ms,
        } => {
            let ms = supervisor.run_url_test(&target.resolve()?, url.as_deref(), timeout(timeout_ms))?;
            println!("{ms} ms");
        }
        Commands::FullTest {
            target,
            url,
            download_url,
            timeout_ms,
        } => {
            let report = supervisor.run_full_test(
                &target.resolve()?,
                url.as_deref(),
                download_url.as_deref(),
                timeout(timeout_ms),
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::TcpPing {
            address,
            timeout_ms,
        } => {
            let ms = supervisor.run_tcp_ping(&address, timeout(timeout_ms))?;
            println!("{ms} ms");
        }
    }

    Ok(())
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Block until `input` reaches end of file.
fn hold_until_eof(mut input: impl Read) -> Result<()> {
    std::io::copy(&mut input, &mut std::io::sink()).context("reading stdin")?;
    Ok(())
}

fn timeout(ms: Option<u64>) -> Duration {
    ms.filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TEST_TIMEOUT)
}

fn initialize_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
