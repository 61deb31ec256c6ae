//! audiorelay CLI Application

use anyhow::Context;
use audiorelay_core::domain::audio::AudioOutput;
use audiorelay_core::domain::config::ServerConfig;
use audiorelay_infra::net::{load_acceptor, remediation_hint};
use audiorelay_infra::{Acceptor, CpalOutput, Security};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "audiorelay")]
#[command(
    about = "Play a remote audio stream on a local output device over secure WebSocket",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8765
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Port to listen on, keeping the configured interface
    #[arg(short, long)]
    port: Option<u16>,

    /// PEM certificate chain
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Print the output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the loaded configuration
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.bind.set_port(port);
        }
        if let Some(cert) = &self.cert {
            config.tls.cert_path = cert.clone();
        }
        if let Some(key) = &self.key {
            config.tls.key_path = key.clone();
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn list_devices(output: Arc<CpalOutput>) -> anyhow::Result<()> {
    let devices = tokio::task::spawn_blocking(move || output.list_output_devices())
        .await
        .context("device enumeration task failed")?
        .context("failed to enumerate output devices")?;

    if devices.is_empty() {
        println!("No output devices found");
    }
    for device in devices {
        println!("{}: {}", device.index, device.name);
    }
    Ok(())
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Server stopped by user"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ServerConfig::load_or_default(cli.config.as_deref())
        .await
        .context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let output = Arc::new(CpalOutput::new(config.audio.sink_queue_buffers));
    if cli.list_devices {
        return list_devices(output).await;
    }

    info!("audiorelay starting...");

    let tls = match load_acceptor(&config.tls.cert_path, &config.tls.key_path).await {
        Ok(tls) => tls,
        Err(e) => {
            error!(error = %e, "Failed to load TLS credentials");
            if e.is_missing_file() {
                eprintln!(
                    "\n{}\n",
                    remediation_hint(&config.tls.cert_path, &config.tls.key_path)
                );
            }
            return Err(e).context("cannot start without TLS credentials");
        }
    };

    let acceptor = Acceptor::bind(config.bind, Security::Tls(tls), output)
        .await
        .context("failed to start listener")?;
    info!(url = %format!("wss://{}", acceptor.local_addr()?), "audiorelay ready");

    acceptor.run_until(wait_for_ctrl_c()).await;
    Ok(())
}
