//! Input of a provider run/remove operation.

use scan_api::models::{
    Asset, AssetInfo, ScanFamiliesConfig, ScannerInstanceCreationConfig, VmInfo,
};

use crate::error::{ProviderError, Result};

/// Everything a provider needs to set up or tear down one asset scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanJobConfig {
    pub asset_scan_id: String,
    pub scan_id: Option<String>,
    pub asset: Asset,
    pub scan_families_config: ScanFamiliesConfig,
    pub instance_creation: ScannerInstanceCreationConfig,
    /// Container image the scanner VM runs.
    pub scanner_image: String,
    /// Backend address the scanner reports results to.
    pub backend_address: String,
}

impl ScanJobConfig {
    pub fn asset_info(&self) -> Result<&AssetInfo> {
        self.asset
            .asset_info
            .as_ref()
            .ok_or_else(|| ProviderError::fatal("asset info is missing"))
    }

    /// VM details of the asset. Any other asset type cannot be scanned by a VM scanner.
    pub fn vm_info(&self) -> Result<&VmInfo> {
        match self.asset_info()? {
            AssetInfo::Vm(info) => Ok(info),
            other => Err(ProviderError::fatal(format!(
                "unsupported asset type for VM scanner: {}",
                asset_type_name(other)
            ))),
        }
    }

    pub fn scanner_vm_name(&self) -> String {
        format!("scanner-{}", self.asset_scan_id)
    }

    pub fn snapshot_name(&self) -> String {
        format!("snapshot-{}", self.asset_scan_id)
    }

    pub fn copied_snapshot_name(&self) -> String {
        format!("snapshot-{}-copy", self.asset_scan_id)
    }

    pub fn volume_name(&self) -> String {
        format!("volume-{}", self.asset_scan_id)
    }
}

fn asset_type_name(info: &AssetInfo) -> &'static str {
    match info {
        AssetInfo::Vm(_) => "VMInfo",
        AssetInfo::Container(_) => "ContainerInfo",
        AssetInfo::ContainerImage(_) => "ContainerImageInfo",
    }
}
