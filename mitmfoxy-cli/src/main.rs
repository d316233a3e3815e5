mod telemetry;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mitmfoxy::{Config, Proxy};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mitmfoxy")]
#[command(version = "0.1.0")]
#[command(about = "MITM HTTP/HTTPS intercepting proxy", long_about = None)]
struct Cli {
    /// Listen port on all interfaces
    #[arg(short, long, default_value_t = 8989)]
    port: u16,

    /// Root CA certificate PEM path
    #[arg(short, long, default_value = "ca/ca.crt")]
    cert: PathBuf,

    /// Root CA private key PEM path
    #[arg(short, long, default_value = "ca/ca.key")]
    key: PathBuf,

    /// Expose captured flows on the /ws WebSocket endpoint
    #[arg(short, long, default_value_t = false)]
    ws: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default CryptoProvider before any TLS usage.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    telemetry::init_telemetry().expect("failed to initialize telemetry");

    let cli = Cli::parse();
    let proxy = Proxy::new(Config {
        port: cli.port,
        ca_cert_path: cli.cert,
        ca_key_path: cli.key,
        websocket: cli.ws,
        ..Config::default()
    })
    .context("failed to initialize proxy")?;

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = cancel_tx.send(true);
    });

    let run = proxy.run(cancel_rx, ready_tx);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result.context("proxy failed"),
        addr = ready_rx => match addr {
            Ok(addr) => info!("ready to accept proxy connections on {addr}"),
            // Readiness channel gone means startup failed; the run future
            // carries the actual error.
            Err(_) => return run.await.context("proxy failed"),
        }
    }

    run.await.context("proxy failed")?;
    info!("proxy shut down");
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            result = ctrl_c => {
                if let Err(err) = result {
                    error!("failed to listen for SIGINT: {err}");
                }
            }
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!("failed to listen for SIGINT: {err}");
        }
    }
}
