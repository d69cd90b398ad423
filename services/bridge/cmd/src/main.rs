//! Socket bridge binary.
//!
//! Drives the stream, datagram and TLS layers through scripted sessions over
//! the in-memory handle primitive, logging every transition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod demo;
mod logging;

use config::{BridgeConfig, TrustPolicy};
use logging::BridgeLogFormatter;

/// Socket bridge state machines over an in-memory primitive
#[derive(Parser, Debug)]
#[command(name = "sockbridge", version, about = "Socket bridge state machines over an in-memory primitive")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file path
    #[arg(long, default_value = "sockbridge.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stream target host
    #[arg(long)]
    host: Option<String>,

    /// Stream target port
    #[arg(long)]
    port: Option<u16>,

    /// Certificate trust policy: reject, trust-all, pinned
    #[arg(long)]
    tls_policy: Option<TrustPolicy>,

    /// Server name checked during the TLS handshake
    #[arg(long)]
    tls_server_name: Option<String>,

    /// Keepalive initial delay, e.g. 30s
    #[arg(long, default_value = "30s")]
    keep_alive: humantime::Duration,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, write during connect, read and half-close
    Stream,
    /// Send before bind and receive a reply
    Datagram,
    /// Handshake, exchange data and close_notify
    Tls,
    /// Print the effective configuration as JSON
    ShowConfig,
}

impl Args {
    fn apply_overrides(&self, config: &mut BridgeConfig) {
        if let Some(host) = &self.host {
            config.stream.host = host.clone();
        }
        if let Some(port) = self.port {
            config.stream.port = port;
        }
        if let Some(policy) = self.tls_policy {
            config.tls.policy = policy;
        }
        if let Some(name) = &self.tls_server_name {
            config.tls.server_name = name.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in ["sockbridge", "bridge_handle", "bridge_stream", "bridge_dgram", "bridge_tls"] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(BridgeLogFormatter::new("sockbridge"))
        .init();

    info!("Starting sockbridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = BridgeConfig::load_from_file(&args.config)?;
    args.apply_overrides(&mut config);

    match args.command {
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Stream => {
            let report = demo::run_stream(&config, args.keep_alive.into()).await?;
            component_info!(
                "stream",
                "Sent {:?}, received {:?}, {} events",
                String::from_utf8_lossy(&report.sent),
                String::from_utf8_lossy(&report.received),
                report.events.len()
            );
        }
        Command::Datagram => {
            let report = demo::run_datagram(&config).await?;
            component_info!(
                "dgram",
                "Listening on {}, {} datagrams out, {} events",
                report.local,
                report.sent.len(),
                report.events.len()
            );
        }
        Command::Tls => {
            let report = demo::run_tls(&config).await?;
            if let Err(e) = &report.write_result {
                component_error!("tls", "Request was not delivered: {}", e);
            }
            component_info!(
                "tls",
                "Secure: {}, handshakes: {}, response {:?}",
                report.secure,
                report.handshakes,
                String::from_utf8_lossy(&report.client_received)
            );
        }
    }

    Ok(())
}
