//! Provider capability consumed by the scan orchestrator.
//!
//! A [`Provider`] lists the assets that exist on its platform, creates and
//! removes the infrastructure that scans one asset, and estimates what
//! scanning an asset would cost. Failures are classified as
//! fatal (never retried) or retryable after a delay (resource not ready yet),
//! see [`ProviderError`].
//!
//! [`InfraScanner`] implements the VM based scan flow (scanner VM, snapshot of
//! the asset root volume, volume attached to the scanner) on top of any
//! [`ScannerInfra`]. [`NoopProvider`] succeeds immediately.

pub mod error;
pub mod infra;
pub mod job;
pub mod noop;

use async_trait::async_trait;
use scan_api::models::{Asset, AssetInfo, AssetScanTemplate, Estimation};

pub use error::{ProviderError, Result};
pub use infra::{
    InfraScanner, ReadinessDelays, ScannerInfra, ScannerVm, SimulatedInfra, Volume, VolumeSnapshot,
};
pub use job::ScanJobConfig;
pub use noop::NoopProvider;

/// Infrastructure platforms a provider can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ProviderKind {
    Aws,
    Azure,
    Gcp,
    Docker,
    Kubernetes,
    External,
    Simulated,
    Noop,
}

/// Provisioning and teardown of the infrastructure for one asset scan.
///
/// Every operation must be idempotent: the orchestrator calls it again after a
/// retryable error until it succeeds.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Lists every asset currently present on the platform.
    async fn discover_assets(&self) -> Result<Vec<AssetInfo>>;

    /// Creates (or resumes creating) the resources that scan one asset.
    async fn run_asset_scan(&self, config: &ScanJobConfig) -> Result<()>;

    /// Removes every resource created by [`Provider::run_asset_scan`].
    async fn remove_asset_scan(&self, config: &ScanJobConfig) -> Result<()>;

    /// Estimates the cost, size and duration of scanning `asset`.
    async fn estimate(&self, asset: &Asset, template: &AssetScanTemplate) -> Result<Estimation>;
}
