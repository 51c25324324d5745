mod config;
mod gateway;

use std::{net::SocketAddr, path::PathBuf};

use config::Config;

use reqwest::Url;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use log::{debug, info, warn};
use tokio::signal;

#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::gateway::GatewayState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Proxy cookie-gated progressive and HLS video through a range-aware streaming gateway.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLineConf {
    /// TOML config file. Command line flags override values read from it.
    #[clap(short, long, value_name = "/path/to/config.toml")]
    config: Option<PathBuf>,

    /// IP address & port where to bind the gateway.
    #[clap(short, long, value_name = "IP:PORT", value_parser)]
    listen: Option<SocketAddr>,

    /// Public base URL used when rewriting manifests (defaults to the request's Host header).
    #[clap(short = 'u', long, value_name = "URL", value_parser = Url::parse)]
    public_url: Option<Url>,

    /// Upstream connect timeout (up to response headers), in seconds.
    #[clap(long, value_name = "SECONDS")]
    connect_timeout: Option<u64>,

    /// Close a stream after this many seconds without progress.
    #[clap(long, value_name = "SECONDS")]
    stall_timeout: Option<u64>,

    /// Hard wall-clock budget per request, in seconds (serverless deployments).
    #[clap(long, value_name = "SECONDS")]
    request_timeout: Option<u64>,

    /// Largest byte window requested from upstream per call.
    #[clap(long, value_name = "BYTES")]
    max_chunk_size: Option<u64>,

    /// Verbosity level. The more v, the more verbose.
    #[clap(short, long, action=ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommandLineConf::parse();

    let config = Config::try_from(args)?;

    init_logging(config.verbose);

    println!("media-gateway v{}", VERSION);

    debug!(target: "mediagateway", "Chunk size: {} bytes, stall timeout: {}s, request budget: {:?}",
        config.max_chunk_size, config.effective_stall_timeout().as_secs(), config.request_timeout);

    let listen = config.listen;
    let state = GatewayState::new(config).context("Failed to set up gateway")?;
    let app = gateway::router(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Unable to bind gateway address {}", listen))?;

    info!(target: "mediagateway", "Streaming gateway listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_handler())
        .await
        .context("Gateway server failed")?;

    info!(target: "mediagateway", "Exiting!");

    Ok(())
}

fn init_logging(verbosity: log::LevelFilter) -> log::LevelFilter {
    fern::Dispatch::new().
        format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        }).
        // by default only accept warning messages from libraries so we don't spam
        level(log::LevelFilter::Warn).
        // but accept Info and Debug and Trace for our app.
        level_for("mediagateway", verbosity).
        chain(std::io::stdout()).
        apply().
            expect("Failed to configure logging.");

    verbosity
}

/// Waits for a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on Windows)
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = unix_signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        let signal_name = tokio::select! {
            result = signal::ctrl_c() => {
                result.map_err(|e| anyhow::anyhow!("Failed to wait for SIGINT: {}", e))?;
                "SIGINT"
            }
            _ = sigterm.recv() => "SIGTERM",
        };
        Ok(signal_name)
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install Ctrl+C handler: {}", e))?;
        Ok("Ctrl+C")
    }
}

async fn shutdown_handler() {
    match wait_for_shutdown_signal().await {
        Ok(name) => {
            info!(target: "mediagateway", "{} received, draining in-flight streams", name);
        }
        Err(e) => {
            warn!(target: "mediagateway", "Failed to set up signal handler: {}. Shutdown handler disabled.", e);
            // Wait indefinitely since we can't catch signals
            std::future::pending::<()>().await;
        }
    }
}
