//! nsd-exporter-core: statistics collection for NSD and Unbound.
//!
//! Provides:
//! - `config`: metric mapping (exact keys and labelled patterns), YAML loading
//! - `resolve`: stats key → metric descriptor resolution
//! - `collector`: scrape loop, descriptor cache, transport seam, mock transport
//! - `control`: control-channel client and daemon config autodetection
//! - `exposition`: Prometheus text output and exporter self-metrics

pub mod collector;
pub mod config;
pub mod control;
pub mod exposition;
pub mod resolve;

/// Crate version, reported on the landing page and at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
