//! pfqd: the pfq packet engine daemon.
//!
//! Loads the YAML configuration, registers the device set, provisions the
//! configured capture endpoints (group join, capture bindings, group
//! computation, ring enable) and serves the metrics endpoint until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use pfq_engine::config::{Config, DeviceKind};
use pfq_engine::dev::{MemDevice, UdpDevice};
use pfq_engine::lang::compile::FunctionDescr;
use pfq_engine::metrics::{self, MetricsState};
use pfq_engine::{Engine, GroupPolicy};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "pfqd",
    about = "Group-based packet capture and transmission engine",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "pfqd.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting pfqd"
    );

    // Load and validate config
    let config = Config::load(&cli.config).context("loading configuration")?;
    info!(
        devices = config.devices.len(),
        endpoints = config.endpoints.len(),
        "configuration loaded"
    );

    // --- Build the engine and register devices ---
    let engine = Engine::new(config.engine.settings());

    for dev in &config.devices {
        match dev.kind {
            DeviceKind::Mem => {
                engine
                    .devices
                    .register(MemDevice::new(dev.name.clone()))
                    .with_context(|| format!("registering device '{}'", dev.name))?;
            }
            DeviceKind::Udp => {
                let peer = dev.peer.expect("validated: udp device has a peer");
                let udp = UdpDevice::open(dev.name.clone(), peer, dev.mtu)
                    .map_err(|e| anyhow::anyhow!("{}", e))
                    .with_context(|| format!("opening udp device '{}'", dev.name))?;
                engine
                    .devices
                    .register(Arc::new(udp))
                    .with_context(|| format!("registering device '{}'", dev.name))?;
            }
        }
    }

    // --- Provision the configured endpoints ---
    let mut endpoint_ids: Vec<(String, usize)> = Vec::new();

    for ep in &config.endpoints {
        let id = provision_endpoint(&engine, ep)
            .with_context(|| format!("provisioning endpoint '{}'", ep.name))?;
        info!(endpoint = %ep.name, id, "endpoint enabled");
        endpoint_ids.push((ep.name.clone(), id));
    }

    // --- Start metrics server ---
    let metrics_handle = if config.metrics.enabled {
        let state = MetricsState {
            engine: engine.clone(),
            endpoints: Arc::new(endpoint_ids.clone()),
        };
        let metrics_config = config.metrics;
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(&metrics_config, state).await {
                error!(error = %e, "metrics server error");
            }
        }))
    } else {
        None
    };

    // --- Wait for shutdown signal ---
    info!("pfqd is running. Press Ctrl+C to stop.");

    shutdown_signal().await;

    info!("shutdown signal received, cleaning up...");

    // --- Graceful shutdown ---

    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    for (name, id) in endpoint_ids {
        if let Err(e) = engine.close(id) {
            warn!(endpoint = %name, error = %e, "error closing endpoint");
        }
    }

    let stats = engine.global_stats();
    info!(
        recv = stats.recv,
        lost = stats.lost,
        drop = stats.drop,
        sent = stats.sent,
        frwd = stats.frwd,
        "pfqd stopped"
    );
    Ok(())
}

/// Open, configure and enable one static endpoint from the config.
fn provision_endpoint(
    engine: &Arc<Engine>,
    ep: &pfq_engine::config::EndpointConfig,
) -> Result<usize> {
    let id = engine
        .open(ep.policy, ep.tx_slots)
        .map_err(|e| anyhow::anyhow!("open: {}", e))?;

    if ep.policy == GroupPolicy::Undefined {
        engine
            .join_group(id, pfq_common::ANY_GROUP, 0, GroupPolicy::Shared)
            .map_err(|e| anyhow::anyhow!("join: {}", e))?;
    }

    if let Some(caplen) = ep.caplen {
        engine
            .set_caplen(id, caplen)
            .map_err(|e| anyhow::anyhow!("caplen: {}", e))?;
    }
    if let Some(slots) = ep.rx_slots {
        engine
            .set_rx_slots(id, slots)
            .map_err(|e| anyhow::anyhow!("rx_slots: {}", e))?;
    }

    for dev in &ep.devices {
        engine
            .bind(id, dev)
            .map_err(|e| anyhow::anyhow!("bind {}: {}", dev, e))?;
    }

    if !ep.computation.is_empty() {
        let gid = engine
            .group_id(id)
            .map_err(|e| anyhow::anyhow!("group_id: {}", e))?;
        let descrs: Vec<FunctionDescr> = ep
            .computation
            .iter()
            .map(|sym| FunctionDescr::fun(sym.clone()))
            .collect();
        engine
            .set_computation(id, gid as usize, &descrs, 0)
            .map_err(|e| anyhow::anyhow!("computation: {}", e))?;
    }

    engine
        .enable(id)
        .map_err(|e| anyhow::anyhow!("enable: {}", e))?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
