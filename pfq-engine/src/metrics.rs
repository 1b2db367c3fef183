//! Prometheus metrics endpoint.
//!
//! Exposes the engine's sparse counters in Prometheus exposition format
//! via a lightweight HTTP server: global data-plane counters, per-endpoint
//! counters (summed across CPUs on read) and skbuff pool memory counters.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use tracing::info;

use crate::config::MetricsConfig;
use crate::engine::Engine;

// ---------------------------------------------------------------------------
// Metrics State
// ---------------------------------------------------------------------------

/// Shared state for the metrics endpoint.
#[derive(Clone)]
pub struct MetricsState {
    pub engine: Arc<Engine>,
    /// `(label, sock id)` pairs for the daemon-provisioned endpoints.
    pub endpoints: Arc<Vec<(String, usize)>>,
}

// ---------------------------------------------------------------------------
// HTTP Server
// ---------------------------------------------------------------------------

/// Start the Prometheus metrics HTTP server.
pub async fn serve_metrics(config: &MetricsConfig, state: MetricsState) -> Result<()> {
    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding metrics server to {}", config.bind))?;

    info!(bind = %config.bind, path = %config.path, "metrics server started");

    axum::serve(listener, app)
        .await
        .context("metrics server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Metrics Handler
// ---------------------------------------------------------------------------

const COUNTER_HELP: &[(&str, &str)] = &[
    ("pfq_packets_recv_total", "Packets delivered into Rx rings"),
    ("pfq_packets_lost_total", "Packets lost to full or absent Rx rings"),
    ("pfq_packets_drop_total", "Packets discarded by group computations"),
    ("pfq_packets_sent_total", "Packets transmitted by the Tx engine"),
    ("pfq_packets_disc_total", "Packets discarded on the Tx path"),
    ("pfq_packets_frwd_total", "Packets lazily forwarded to devices"),
    ("pfq_packets_kern_total", "Packets handed back to the kernel stack"),
];

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let mut output = String::with_capacity(4096);

    for (name, help) in COUNTER_HELP {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} counter\n", name));
    }

    // --- Global counters ---
    let global = state.engine.global_stats();
    write_counter_set(&mut output, "engine", &global);

    // --- Per-endpoint counters ---
    for (name, id) in state.endpoints.iter() {
        if let Ok(stats) = state.engine.stats(*id) {
            write_counter_set(&mut output, name, &stats);
        }
    }

    // --- Pool counters ---
    let pool = state.engine.pool_stats();
    output.push_str("# HELP pfq_pool_os_alloc_total Buffers taken from the OS allocator\n");
    output.push_str("# TYPE pfq_pool_os_alloc_total counter\n");
    output.push_str(&format!("pfq_pool_os_alloc_total {}\n", pool.os_alloc));
    output.push_str("# HELP pfq_pool_os_free_total Buffers released to the OS allocator\n");
    output.push_str("# TYPE pfq_pool_os_free_total counter\n");
    output.push_str(&format!("pfq_pool_os_free_total {}\n", pool.os_free));
    output.push_str("# HELP pfq_pool_recycled_total Buffers recycled through the pools\n");
    output.push_str("# TYPE pfq_pool_recycled_total counter\n");
    output.push_str(&format!("pfq_pool_recycled_total {}\n", pool.pool_pop));

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

fn write_counter_set(output: &mut String, scope: &str, stats: &pfq_common::Statistics) {
    write_metric(output, "pfq_packets_recv_total", scope, stats.recv);
    write_metric(output, "pfq_packets_lost_total", scope, stats.lost);
    write_metric(output, "pfq_packets_drop_total", scope, stats.drop);
    write_metric(output, "pfq_packets_sent_total", scope, stats.sent);
    write_metric(output, "pfq_packets_disc_total", scope, stats.disc);
    write_metric(output, "pfq_packets_frwd_total", scope, stats.frwd);
    write_metric(output, "pfq_packets_kern_total", scope, stats.kern);
}

fn write_metric(output: &mut String, metric: &str, scope: &str, value: u64) {
    output.push_str(&format!("{}{{scope=\"{}\"}} {}\n", metric, scope, value));
}
