//! Statistics collection from a daemon control channel.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      StatsCollector                       │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────┐  │
//! │  │    parser    │──▶│DescriptorCache│──▶│   Resolver    │  │
//! │  │  key=value   │   │ key → Arc<D> │   │ (on a miss)   │  │
//! │  └──────▲───────┘   └──────────────┘   └───────────────┘  │
//! │         │                                                 │
//! │  ┌──────┴───────────┐                                     │
//! │  │ ControlTransport │ (trait)                             │
//! │  └──────┬───────────┘                                     │
//! └─────────┼─────────────────────────────────────────────────┘
//!           │
//!     ┌─────┴──────────┐
//!     │                │
//! ┌───▼──────────┐ ┌───▼──────────┐
//! │ ControlClient│ │ MockTransport│
//! │ (TLS / unix) │ │  (testing)   │
//! └──────────────┘ └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use nsd_exporter_core::collector::{MockTransport, StatsCollector};
//! use nsd_exporter_core::config::MetricConfig;
//! use nsd_exporter_core::resolve::Resolver;
//!
//! let config = Arc::new(MetricConfig::builtin().unwrap());
//! let transport = MockTransport::responding("num.queries=42\nnum.type.A=40\n");
//! let collector = StatsCollector::new(transport, Resolver::new(config, "nsd")).unwrap();
//!
//! let scrape = collector.collect_once();
//! assert!(scrape.is_up());
//! assert_eq!(scrape.samples.len(), 2);
//! ```

pub mod cache;
#[allow(clippy::module_inception)]
mod collector;
pub mod mock;
pub mod parser;
pub mod transport;

pub use cache::{CacheLookup, CacheStats, DescriptorCache};
pub use collector::{CollectorError, STATS_COMMAND, Sample, Scrape, SkipCounts, StatsCollector};
pub use mock::MockTransport;
pub use parser::LineError;
pub use transport::{ControlTransport, TransportError};
