//! YAML configuration parsing and validation.
//!
//! Defines the configuration model for the pfq daemon and validates it at
//! load time: engine tunables, the device set, statically provisioned
//! capture endpoints and the metrics endpoint.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::engine::EngineSettings;
use crate::group::GroupPolicy;

// ---------------------------------------------------------------------------
// Top-Level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Devices registered at startup.
    pub devices: Vec<DeviceConfig>,

    /// Capture endpoints the daemon provisions on its own.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ---------------------------------------------------------------------------
// Engine Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Hardware contexts served by the data plane. 0 = auto-detect.
    #[serde(default)]
    pub cpus: usize,

    /// Rx/Tx batch length.
    #[serde(default = "default_batch_len")]
    pub batch_len: usize,

    /// Default capture length for fresh endpoints.
    #[serde(default = "default_caplen")]
    pub default_caplen: usize,

    /// Default Rx ring slots for fresh endpoints (power of two).
    #[serde(default = "default_rx_slots")]
    pub default_rx_slots: usize,

    /// Skbuff pool slots per CPU and direction.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Whether buffer recycling starts enabled.
    #[serde(default = "default_true")]
    pub pool_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cpus: 0,
            batch_len: default_batch_len(),
            default_caplen: default_caplen(),
            default_rx_slots: default_rx_slots(),
            pool_size: default_pool_size(),
            pool_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            cpus: self.cpus,
            batch_len: self.batch_len,
            default_caplen: self.default_caplen,
            default_rx_slots: self.default_rx_slots,
            pool_size: self.pool_size,
            pool_enabled: self.pool_enabled,
        }
    }
}

fn default_batch_len() -> usize {
    pfq_common::DEFAULT_BATCH_LEN
}
fn default_caplen() -> usize {
    pfq_common::DEFAULT_MAXLEN
}
fn default_rx_slots() -> usize {
    1024
}
fn default_pool_size() -> usize {
    1024
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Device Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    /// Interface name (e.g. "eth0").
    pub name: String,

    #[serde(default)]
    pub kind: DeviceKind,

    /// Peer address for `udp` devices.
    #[serde(default)]
    pub peer: Option<SocketAddr>,

    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Frames tunneled as UDP datagrams to `peer`.
    Udp,
    /// In-memory sink (simulation and bring-up).
    #[default]
    Mem,
}

fn default_mtu() -> usize {
    1500
}

// ---------------------------------------------------------------------------
// Endpoint Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    /// Human-readable name (metrics label).
    pub name: String,

    #[serde(default)]
    pub policy: GroupPolicy,

    /// Interfaces this endpoint captures from.
    pub devices: Vec<String>,

    #[serde(default)]
    pub caplen: Option<usize>,

    #[serde(default)]
    pub rx_slots: Option<usize>,

    #[serde(default = "default_tx_slots")]
    pub tx_slots: usize,

    /// Chain of no-argument monadic symbols installed as the group
    /// computation (e.g. `[steer_flow]`).
    #[serde(default)]
    pub computation: Vec<String>,
}

fn default_tx_slots() -> usize {
    64
}

// ---------------------------------------------------------------------------
// Metrics Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            bind: default_metrics_bind(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_bind() -> SocketAddr {
    "0.0.0.0:9090".parse().unwrap()
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

// ---------------------------------------------------------------------------
// Loading & Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load config from a YAML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| "parsing YAML config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            bail!("at least one device is required");
        }
        if self.devices.len() > 63 {
            bail!("at most 63 devices are supported");
        }

        for (i, dev) in self.devices.iter().enumerate() {
            let ctx = format!("devices[{}] '{}'", i, dev.name);

            if dev.name.trim().is_empty() {
                bail!("{}: name must not be empty", ctx);
            }
            if self.devices.iter().filter(|d| d.name == dev.name).count() > 1 {
                bail!("{}: duplicate device name", ctx);
            }
            if dev.kind == DeviceKind::Udp && dev.peer.is_none() {
                bail!("{}: 'peer' is required for udp devices", ctx);
            }
            if dev.mtu == 0 || dev.mtu > 65535 {
                bail!("{}: mtu must be 1..65535, got {}", ctx, dev.mtu);
            }
        }

        if !self.engine.default_rx_slots.is_power_of_two() {
            bail!(
                "engine.default_rx_slots must be a power of two, got {}",
                self.engine.default_rx_slots
            );
        }
        if self.engine.batch_len == 0 {
            bail!("engine.batch_len must be positive");
        }
        if self.engine.pool_size < 2 {
            bail!("engine.pool_size must be at least 2");
        }
        if self.engine.default_caplen == 0
            || self.engine.default_caplen > pfq_common::DEFAULT_MAXLEN
        {
            bail!(
                "engine.default_caplen must be 1..{}, got {}",
                pfq_common::DEFAULT_MAXLEN,
                self.engine.default_caplen
            );
        }

        for (i, ep) in self.endpoints.iter().enumerate() {
            let ctx = format!("endpoints[{}] '{}'", i, ep.name);

            if ep.devices.is_empty() {
                bail!("{}: at least one capture device is required", ctx);
            }
            for dev in &ep.devices {
                if !self.devices.iter().any(|d| &d.name == dev) {
                    bail!("{}: unknown device '{}'", ctx, dev);
                }
            }
            if let Some(slots) = ep.rx_slots {
                if !slots.is_power_of_two() {
                    bail!("{}: rx_slots must be a power of two, got {}", ctx, slots);
                }
            }
            if let Some(caplen) = ep.caplen {
                if caplen == 0 || caplen > pfq_common::DEFAULT_MAXLEN {
                    bail!("{}: caplen must be 1..{}", ctx, pfq_common::DEFAULT_MAXLEN);
                }
            }
            if ep.tx_slots == 0 {
                bail!("{}: tx_slots must be positive", ctx);
            }
            for sym in &ep.computation {
                if sym.trim().is_empty() {
                    bail!("{}: empty computation symbol", ctx);
                }
            }
        }

        Ok(())
    }
}
