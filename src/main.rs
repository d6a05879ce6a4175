// src/main.rs v4
//! NMEA Relay - serve live NMEA sentences to TCP and local socket clients

use anyhow::{Context, Result};
use clap::Parser;
use nmea_relay::{
    display::TerminalDisplay, gps::serial, ChannelObserver, LogObserver, NmeaRelay, ProviderId,
    RelayConfig,
};
use std::{net::IpAddr, path::PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Args {
    /// Location provider to start with
    #[arg(long, value_enum)]
    provider: Option<ProviderId>,

    /// Read the provider's fixes from gpsd at HOST:PORT
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "serial")]
    gpsd: Option<String>,

    /// Read the provider's NMEA stream from a serial receiver
    #[arg(long, value_name = "PORT")]
    serial: Option<String>,

    /// Baud rate for --serial
    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Address to accept TCP clients on
    #[arg(long)]
    tcp_bind: Option<IpAddr>,

    /// Port to accept TCP clients on
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Path of the local socket clients connect to
    #[arg(long)]
    local_socket: Option<PathBuf>,

    /// Do not accept TCP clients
    #[arg(long)]
    no_tcp: bool,

    /// Do not accept local socket clients
    #[arg(long)]
    no_local: bool,

    /// Interactive terminal view instead of log output
    #[arg(long)]
    tui: bool,

    /// Write the resulting configuration back to the config file
    #[arg(long)]
    save_config: bool,

    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Args {
    fn apply(&self, config: &mut RelayConfig) -> Result<()> {
        if let Some(provider) = self.provider {
            config.update_provider(provider);
        }
        if let Some(gpsd) = &self.gpsd {
            let (host, port) = gpsd
                .rsplit_once(':')
                .context("--gpsd expects HOST:PORT")?;
            let port = port.parse::<u16>().context("invalid gpsd port")?;
            config.update_gpsd(config.provider, host.to_string(), port);
        }
        if let Some(port) = &self.serial {
            config.update_serial(config.provider, port.clone(), self.baud);
        }
        if let Some(bind) = self.tcp_bind {
            config.tcp_bind = bind;
        }
        if let Some(port) = self.tcp_port {
            config.tcp_port = port;
        }
        if let Some(path) = &self.local_socket {
            config.local_socket = path.clone();
        }
        if self.no_tcp {
            config.tcp_enabled = false;
        }
        if self.no_local {
            config.local_enabled = false;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Log lines would tear the terminal view apart, so it stays quiet unless asked
    let default_filter = if args.tui { "off" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if args.list_ports {
        serial::list_serial_ports()?;
        return Ok(());
    }

    let mut config = match RelayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("{}, using defaults", e);
            RelayConfig::default()
        }
    };
    args.apply(&mut config)?;

    if args.save_config {
        let path = config.save()?;
        info!("Configuration saved to {}", path.display());
    }

    info!("Using {} provider", config.provider);

    if args.tui {
        let (observer, events) = ChannelObserver::new();
        let relay = NmeaRelay::start(&config, Box::new(observer)).await;
        let display = TerminalDisplay::new(relay.handle(), config.provider);
        let shown = display.run(events).await;
        relay.shutdown().await?;
        shown?;
    } else {
        let relay = NmeaRelay::start(&config, Box::new(LogObserver)).await;
        for failure in relay.failed_listeners() {
            warn!("{}", failure);
        }
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for Ctrl+C")?;
        info!("Shutting down");
        relay.shutdown().await?;
    }

    Ok(())
}
