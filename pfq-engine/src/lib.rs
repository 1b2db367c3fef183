//! pfq-engine: group-based packet capture and transmission engine.
//!
//! Endpoints (`Sock`) join groups; each group owns a programmable
//! per-packet computation whose fanout decision steers, copies or drops
//! packets across the member endpoints' shared-memory Rx rings. The Tx
//! side drains double-buffered per-endpoint rings in time-scheduled
//! batches, either from user context or from dedicated per-CPU threads.
//!
//! The [`engine::Engine`] facade is the control surface; the data plane
//! enters through [`engine::Engine::receive`].

pub mod config;
pub mod dev;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod group;
pub mod lang;
pub mod metrics;
pub mod pool;
pub mod ring;
pub mod skbuff;
pub mod socket;
pub mod stats;
pub mod tx;

pub use engine::{Engine, EngineSettings, RawPacket};
pub use error::PfqError;
pub use group::GroupPolicy;
