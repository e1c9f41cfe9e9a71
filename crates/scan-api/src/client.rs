//! The backend API consumed by the orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::filter::Filter;
use crate::models::{
    Asset, AssetFinding, AssetScan, AssetScanEstimation, Finding, Scan, ScanConfig,
    ScanEstimation,
};

/// Query parameters accepted by every list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub filter: Option<String>,
    pub select: Option<String>,
    pub count: bool,
    pub top: Option<usize>,
    pub skip: Option<usize>,
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_filter(self, filter: Filter) -> Self {
        self.filter(filter)
    }

    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = Some(select.into());
        self
    }

    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// A page of entities, with the total match count when it was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl<T> Default for ListResponse<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            count: None,
        }
    }
}

/// Typed CRUD and query operations on backend entities.
///
/// `post_*` returns [`ApiError::Conflict`](crate::ApiError::Conflict) when the
/// entity already exists for its natural key. `patch_*` only overwrites the
/// fields that are set on the patch object.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn get_scan_configs(&self, params: ListParams) -> Result<ListResponse<ScanConfig>>;
    async fn get_scan_config(&self, id: &str, select: Option<&str>) -> Result<ScanConfig>;
    async fn post_scan_config(&self, config: ScanConfig) -> Result<ScanConfig>;
    async fn patch_scan_config(&self, id: &str, patch: ScanConfig) -> Result<()>;

    async fn get_scans(&self, params: ListParams) -> Result<ListResponse<Scan>>;
    async fn get_scan(&self, id: &str, select: Option<&str>) -> Result<Scan>;
    async fn post_scan(&self, scan: Scan) -> Result<Scan>;
    async fn patch_scan(&self, id: &str, patch: Scan) -> Result<()>;

    async fn get_asset_scans(&self, params: ListParams) -> Result<ListResponse<AssetScan>>;
    async fn get_asset_scan(&self, id: &str, select: Option<&str>) -> Result<AssetScan>;
    async fn post_asset_scan(&self, asset_scan: AssetScan) -> Result<AssetScan>;
    async fn patch_asset_scan(&self, id: &str, patch: AssetScan) -> Result<()>;

    async fn get_scan_estimations(
        &self,
        params: ListParams,
    ) -> Result<ListResponse<ScanEstimation>>;
    async fn get_scan_estimation(&self, id: &str, select: Option<&str>) -> Result<ScanEstimation>;
    async fn post_scan_estimation(&self, estimation: ScanEstimation) -> Result<ScanEstimation>;
    async fn patch_scan_estimation(&self, id: &str, patch: ScanEstimation) -> Result<()>;
    async fn delete_scan_estimation(&self, id: &str) -> Result<()>;

    async fn get_asset_scan_estimations(
        &self,
        params: ListParams,
    ) -> Result<ListResponse<AssetScanEstimation>>;
    async fn get_asset_scan_estimation(
        &self,
        id: &str,
        select: Option<&str>,
    ) -> Result<AssetScanEstimation>;
    async fn post_asset_scan_estimation(
        &self,
        estimation: AssetScanEstimation,
    ) -> Result<AssetScanEstimation>;
    async fn patch_asset_scan_estimation(
        &self,
        id: &str,
        patch: AssetScanEstimation,
    ) -> Result<()>;
    async fn delete_asset_scan_estimation(&self, id: &str) -> Result<()>;

    async fn get_assets(&self, params: ListParams) -> Result<ListResponse<Asset>>;
    async fn get_asset(&self, id: &str) -> Result<Asset>;
    async fn post_asset(&self, asset: Asset) -> Result<Asset>;
    async fn patch_asset(&self, id: &str, patch: Asset) -> Result<()>;

    async fn get_findings(&self, params: ListParams) -> Result<ListResponse<Finding>>;
    async fn post_finding(&self, finding: Finding) -> Result<Finding>;
    async fn patch_finding(&self, id: &str, patch: Finding) -> Result<()>;

    /// Filters may reach into the linked finding, e.g.
    /// `finding/findingInfo/objectType eq 'Secret'`.
    async fn get_asset_findings(&self, params: ListParams) -> Result<ListResponse<AssetFinding>>;
    async fn post_asset_finding(&self, asset_finding: AssetFinding) -> Result<AssetFinding>;
    async fn patch_asset_finding(&self, id: &str, patch: AssetFinding) -> Result<()>;
}
