use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AssetScanTemplate, Reference, ScanTemplate, Status};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ScanEstimationState {
    Pending,
    Discovered,
    InProgress,
    Aborted,
    Done,
    Failed,
}

impl ScanEstimationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ScanEstimationReason {
    Created,
    SuccessfulDiscovery,
    NothingToEstimate,
    Running,
    Success,
    Error,
    Aborted,
    Timeout,
}

pub type ScanEstimationStatus = Status<ScanEstimationState, ScanEstimationReason>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum AssetScanEstimationState {
    Pending,
    Aborted,
    Done,
    Failed,
}

impl AssetScanEstimationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum AssetScanEstimationReason {
    Created,
    Aborted,
    Success,
    Error,
}

pub type AssetScanEstimationStatus = Status<AssetScanEstimationState, AssetScanEstimationReason>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdownComponent {
    pub operation: String,
    pub cost: f32,
}

/// Projected cost, size and duration of scanning one asset (or many).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimation {
    /// Estimated cost in dollars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f32>,
    /// Estimated scanned data in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Estimated duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_breakdown: Option<Vec<CostBreakdownComponent>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanEstimationSummary {
    pub jobs_completed: u32,
    pub jobs_left_to_run: u32,
    /// Seconds.
    pub total_scan_time: u64,
    /// GB.
    pub total_scan_size: u64,
    pub total_scan_cost: f32,
}

/// Dry-run cost and time projection for a scan template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEstimation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_template: Option<ScanTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScanEstimationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ScanEstimationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_scan_estimations: Option<Vec<Reference>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<u64>,
}

impl ScanEstimation {
    pub fn state(&self) -> Option<ScanEstimationState> {
        self.status.as_ref().map(|s| s.state)
    }

    pub fn scope(&self) -> Option<&str> {
        self.scan_template.as_ref().and_then(|t| t.scope.as_deref())
    }

    pub fn max_parallel_scanners(&self) -> Option<u32> {
        self.scan_template
            .as_ref()
            .and_then(|t| t.max_parallel_scanners)
    }
}

/// Estimation for one asset within a ScanEstimation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetScanEstimation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_estimation: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_scan_template: Option<AssetScanTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AssetScanEstimationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimation: Option<Estimation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<u64>,
}

impl AssetScanEstimation {
    pub fn state(&self) -> Option<AssetScanEstimationState> {
        self.status.as_ref().map(|s| s.state)
    }
}
