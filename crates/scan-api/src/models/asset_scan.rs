use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    FindingInfo, FindingsSummary, Reference, ScanFamiliesConfig, ScannerInstanceCreationConfig,
    Status,
};

/// Lifecycle states of an AssetScan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum AssetScanState {
    Pending,
    Scheduled,
    ReadyToScan,
    InProgress,
    Aborted,
    Done,
    Failed,
}

impl AssetScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum AssetScanReason {
    Created,
    Provisioning,
    ResourcesReady,
    ScannerIsRunning,
    Cancellation,
    AbortTimeout,
    Error,
    Success,
}

pub type AssetScanStatus = Status<AssetScanState, AssetScanReason>;

/// State of the infrastructure cleanup after an AssetScan finishes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ResourceCleanupState {
    Pending,
    Skipped,
    Done,
    Failed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ResourceCleanupReason {
    AssetScanCreated,
    DeletePolicy,
    ProviderError,
    Success,
}

pub type ResourceCleanupStatus = Status<ResourceCleanupState, ResourceCleanupReason>;

/// State of one scan family within an AssetScan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ScannerState {
    Pending,
    Skipped,
    InProgress,
    Done,
    Failed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ScannerReason {
    Scheduled,
    NotScheduled,
    Scanning,
    Success,
    Error,
}

pub type ScannerStatus = Status<ScannerState, ScannerReason>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyScan {
    pub status: ScannerStatus,
    /// Reported by the scanner once the family is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<FindingInfo>>,
}

impl FamilyScan {
    pub fn new(enabled: bool) -> Self {
        let status = if enabled {
            ScannerStatus::new(ScannerState::Pending, ScannerReason::Scheduled, None)
        } else {
            ScannerStatus::new(ScannerState::Skipped, ScannerReason::NotScheduled, None)
        };
        Self {
            status,
            findings: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.state == ScannerState::Done
    }
}

/// The scan of one asset within one Scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetScan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AssetScanStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_cleanup_status: Option<ResourceCleanupStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_families_config: Option<ScanFamiliesConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_instance_creation_config: Option<ScannerInstanceCreationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom: Option<FamilyScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<FamilyScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploits: Option<FamilyScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malware: Option<FamilyScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misconfigurations: Option<FamilyScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootkits: Option<FamilyScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<FamilyScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_finder: Option<FamilyScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<FindingsSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Set once the reported findings were written to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings_processed: Option<bool>,
}

impl AssetScan {
    pub fn state(&self) -> Option<AssetScanState> {
        self.status.as_ref().map(|s| s.state)
    }

    pub fn scan_id(&self) -> Option<&str> {
        self.scan.as_ref().map(|r| r.id.as_str())
    }

    pub fn asset_id(&self) -> Option<&str> {
        self.asset.as_ref().map(|r| r.id.as_str())
    }
}
