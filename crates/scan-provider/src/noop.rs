use async_trait::async_trait;
use scan_api::models::{Asset, AssetInfo, AssetScanTemplate, Estimation};
use tracing::debug;

use crate::error::Result;
use crate::job::ScanJobConfig;
use crate::{Provider, ProviderKind};

/// Provider that provisions nothing and succeeds immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvider;

#[async_trait]
impl Provider for NoopProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Noop
    }

    async fn discover_assets(&self) -> Result<Vec<AssetInfo>> {
        Ok(Vec::new())
    }

    async fn run_asset_scan(&self, config: &ScanJobConfig) -> Result<()> {
        debug!(asset_scan_id = %config.asset_scan_id, "Noop run");
        Ok(())
    }

    async fn remove_asset_scan(&self, config: &ScanJobConfig) -> Result<()> {
        debug!(asset_scan_id = %config.asset_scan_id, "Noop remove");
        Ok(())
    }

    async fn estimate(&self, asset: &Asset, _template: &AssetScanTemplate) -> Result<Estimation> {
        let size = asset
            .vm_info()
            .map(|vm| u64::from(vm.root_volume.size_gb))
            .unwrap_or(0);
        Ok(Estimation {
            cost: Some(0.0),
            size: Some(size),
            duration: Some(0),
            cost_breakdown: None,
        })
    }
}
