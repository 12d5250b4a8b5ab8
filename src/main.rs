use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use valve_engine::clock::SystemClock;
use valve_engine::config::{AppConfig, Cli};
use valve_engine::journal::MemoryJournal;
use valve_engine::transport::UdpTransport;
use valve_engine::{DeliveryReport, Dispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_cli(&cli)?;

    info!("Valve engine starting: {}", config.engine.node_id);
    info!("  listening on {}", config.bind);
    for (alias, addr) in &config.peers {
        info!("  peer {} -> {}", alias, addr);
    }

    let transport = Arc::new(UdpTransport::bind(config.bind, config.peers.clone()).await?);
    // The journal lives in memory and starts empty on every run, so there is
    // nothing to re-arm here; a durable journal would call reload_journal()
    let (dispatcher, mut reports) = Dispatcher::new(
        config.engine.clone(),
        transport.clone(),
        Arc::new(SystemClock),
        Arc::new(MemoryJournal::new()),
    );

    let (events_tx, events_rx) = mpsc::channel(config.engine.queue_capacity);
    let udp = tokio::spawn(transport.run(events_tx, dispatcher.shutdown_token()));
    dispatcher.start(events_rx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            report = reports.recv() => match report {
                Some(report) => log_report(&report),
                None => break,
            },
        }
    }

    dispatcher.shutdown().await;
    if let Err(e) = udp.await {
        error!("UDP task failed: {}", e);
    }
    Ok(())
}

fn log_report(report: &DeliveryReport) {
    match report {
        DeliveryReport::Sent { msg_id, target, description } => {
            info!("SENT      {} -> {}: {}", msg_id, target, description)
        }
        DeliveryReport::Confirmed { msg_id, target, description, valves } => match valves {
            Some(valves) => info!(
                "CONFIRMED {} <- {}: {} valves={:?}",
                msg_id, target, description, valves
            ),
            None => info!("CONFIRMED {} <- {}: {}", msg_id, target, description),
        },
        DeliveryReport::Expired { msg_id, target, description, reason } => {
            warn!("EXPIRED   {} -> {}: {} ({})", msg_id, target, description, reason)
        }
        DeliveryReport::ScheduleMissed { command, at } => {
            warn!("MISSED    {} (was due {})", command, at)
        }
        DeliveryReport::ServiceUp { peer } => info!("UP        {}", peer),
        DeliveryReport::ServiceDown { peer, reason } => warn!("DOWN      {} ({:?})", peer, reason),
        DeliveryReport::TimeSynced { at } => info!("TIME      set to {}", at),
    }
}
