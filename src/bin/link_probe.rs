//! Link Probe
//!
//! Connects to an exchange WebSocket endpoint, prints application frames and
//! state changes, and keeps the connection alive with the configured
//! heartbeat profile until Ctrl-C.
//!
//! Usage:
//!   link_probe --endpoint wss://stream.binance.com:9443/ws --subscribe '{"method":"SUBSCRIBE","params":["btcusdt@trade"],"id":1}'
//!
//! Environment:
//!   LINK_CONFIG_PATH - TOML config file (default: link.toml, optional)
//!   LINK_ENDPOINT - Endpoint URL, overrides the config file
//!   RUST_LOG - Log filter (default: info,exchange_link=debug)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use exchange_link::telemetry::{Fanout, LinkMetrics, TracingTelemetry};
use exchange_link::transport::TungsteniteChannel;
use exchange_link::{logging, ConnectionStatus, Frame, Link, LinkConfig, LinkExit, LinkMessage};

#[derive(Parser, Debug)]
#[command(name = "link_probe")]
#[command(about = "Hold an exchange WebSocket connection open and print what arrives")]
struct Args {
    /// TOML config file
    #[arg(long, env = "LINK_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Endpoint URL (overrides the config file)
    #[arg(long, env = "LINK_ENDPOINT")]
    endpoint: Option<String>,

    /// Text frame sent every time the link becomes Open
    #[arg(long)]
    subscribe: Vec<String>,

    /// Stop after this many application frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Seconds between metrics summaries
    #[arg(long, default_value = "30")]
    report_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init("info,exchange_link=debug");

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LinkConfig::from_env(),
    };
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }

    info!("Starting Link Probe");
    info!("  Endpoint: {}", config.endpoint);
    info!("  Heartbeat: {:?}", config.heartbeat.profile);
    info!(
        "  Backoff: {}ms..{}ms, {} attempts",
        config.backoff.base_ms, config.backoff.cap_ms, config.backoff.max_attempts
    );

    let metrics = Arc::new(LinkMetrics::new());
    let telemetry = Fanout::new()
        .with(Arc::new(TracingTelemetry))
        .with(metrics.clone());

    let link = Link::builder(config)
        .transport(Arc::new(TungsteniteChannel::new()))
        .telemetry(Arc::new(telemetry))
        .spawn()?;
    let handle = link.handle;
    let mut messages = link.messages;
    let task = link.task;

    handle.open().await?;

    let mut report = tokio::time::interval(Duration::from_secs(args.report_secs.max(1)));
    report.tick().await;
    let mut frames = 0u64;

    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else { break };
                match message {
                    LinkMessage::Frame(frame) => {
                        frames += 1;
                        println!("{}", frame);
                        if args.max_frames.is_some_and(|max| frames >= max) {
                            info!("Frame limit reached, closing");
                            handle.close().await.ok();
                        }
                    }
                    LinkMessage::StateChanged { from, to } => {
                        info!("{} -> {}", from, to);
                        if to == ConnectionStatus::Open {
                            for body in &args.subscribe {
                                handle.send(Frame::text(body.clone())).await?;
                            }
                        }
                    }
                    LinkMessage::SendFailed { frame, error } => {
                        warn!("Send failed ({}): {}", error, frame);
                    }
                    LinkMessage::Terminated(reason) => {
                        info!("Link terminated: {}", reason);
                    }
                }
            }
            _ = report.tick() => {
                info!("metrics {}", metrics.summary());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                handle.shutdown().await.ok();
            }
        }
    }

    let exit = task.await.context("link task panicked")?;
    info!("metrics {}", metrics.summary());
    match exit {
        Ok(LinkExit::Closed) | Ok(LinkExit::Relinquished) => Ok(()),
        Ok(LinkExit::Failed(err)) => Err(anyhow::anyhow!("link failed: {}", err)),
        Err(err) => Err(err.into()),
    }
}
