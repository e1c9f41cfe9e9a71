//! scan-orchestrator library crate.
//!
//! Control loops that drive scan configurations, scans, asset scans and scan
//! estimations stored in a backend toward their end state. Each watcher is a
//! [`common::Poller`] discovering active entities and a
//! [`common::Reconciler`] processing them one at a time from a deduplicating
//! [`common::Queue`]. Findings of finished asset scans are written by the
//! [`watcher::AssetScanProcessor`] and the asset inventory is kept in sync
//! with the provider by the [`discoverer::AssetDiscoverer`].

pub mod common;
pub mod config;
pub mod discoverer;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod watcher;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
