//! Backend entity models.
//!
//! Every entity field is optional: the same types are used for full objects
//! returned by the backend, for `select` projections and for partial-update
//! patches, where an absent field means "leave unchanged".

mod asset;
mod asset_scan;
mod estimation;
mod families;
mod finding;
mod scan;
mod scan_config;
mod status;

pub use asset::{Asset, AssetInfo, ContainerImageInfo, ContainerInfo, RootVolume, VmInfo};
pub use asset_scan::{
    AssetScan, AssetScanReason, AssetScanState, AssetScanStatus, FamilyScan,
    ResourceCleanupReason, ResourceCleanupState, ResourceCleanupStatus, ScannerReason,
    ScannerState, ScannerStatus,
};
pub use estimation::{
    AssetScanEstimation, AssetScanEstimationReason, AssetScanEstimationState,
    AssetScanEstimationStatus, CostBreakdownComponent, Estimation, ScanEstimation,
    ScanEstimationReason, ScanEstimationState, ScanEstimationStatus, ScanEstimationSummary,
};
pub use families::{FamilyConfig, ScanFamiliesConfig, ScanFamily};
pub use finding::{
    AssetFinding, ExploitInfo, Finding, FindingInfo, FindingKind, InfoFinderInfo, MalwareInfo,
    MisconfigurationInfo, PackageInfo, RootkitInfo, SecretInfo, VulnerabilityInfo,
    VulnerabilitySeverity,
};
pub use scan::{
    FindingsSummary, Scan, ScanReason, ScanState, ScanStatus, ScanSummary,
    VulnerabilitySeveritySummary,
};
pub use scan_config::{
    AssetScanTemplate, RuntimeScheduleScanConfig, ScanConfig, ScanTemplate,
    ScannerInstanceCreationConfig,
};
pub use status::Status;

use serde::{Deserialize, Serialize};

/// Relationship to another entity by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
}

impl Reference {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}
