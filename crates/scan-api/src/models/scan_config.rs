use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ScanFamiliesConfig;

/// Options for creating scanner instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerInstanceCreationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_spot_instances: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max_attempts: Option<u32>,
}

/// Template copied into each AssetScan (or AssetScanEstimation).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetScanTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_families_config: Option<ScanFamiliesConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_instance_creation_config: Option<ScannerInstanceCreationConfig>,
}

/// Template a Scan (or ScanEstimation) is created from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTemplate {
    /// Asset filter selecting what to scan. Empty means every asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_scanners: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_scan_template: Option<AssetScanTemplate>,
}

/// Schedule of a ScanConfig: a cron line, a single operation time, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeScheduleScanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_time: Option<DateTime<Utc>>,
}

/// User-defined recurring or one-shot scan definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<RuntimeScheduleScanConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_template: Option<ScanTemplate>,
}

impl ScanConfig {
    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(false)
    }

    pub fn cron_line(&self) -> Option<&str> {
        self.scheduled
            .as_ref()
            .and_then(|s| s.cron_line.as_deref())
            .filter(|line| !line.trim().is_empty())
    }

    pub fn operation_time(&self) -> Option<DateTime<Utc>> {
        self.scheduled.as_ref().and_then(|s| s.operation_time)
    }
}
