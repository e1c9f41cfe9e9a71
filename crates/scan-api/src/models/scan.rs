use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AssetScanTemplate, Reference, Status};

/// Lifecycle states of a Scan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ScanState {
    Pending,
    Discovered,
    InProgress,
    Aborted,
    Done,
    Failed,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ScanReason {
    Created,
    AssetsDiscovered,
    AssetScansRunning,
    NothingToScan,
    Success,
    Error,
    Cancellation,
    Timeout,
}

pub type ScanStatus = Status<ScanState, ScanReason>;

/// Finding counters by vulnerability severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VulnerabilitySeveritySummary {
    pub total_critical_vulnerabilities: u32,
    pub total_high_vulnerabilities: u32,
    pub total_medium_vulnerabilities: u32,
    pub total_low_vulnerabilities: u32,
    pub total_negligible_vulnerabilities: u32,
}

impl VulnerabilitySeveritySummary {
    pub fn add(&mut self, other: &Self) {
        self.total_critical_vulnerabilities += other.total_critical_vulnerabilities;
        self.total_high_vulnerabilities += other.total_high_vulnerabilities;
        self.total_medium_vulnerabilities += other.total_medium_vulnerabilities;
        self.total_low_vulnerabilities += other.total_low_vulnerabilities;
        self.total_negligible_vulnerabilities += other.total_negligible_vulnerabilities;
    }
}

/// Finding totals reported by one AssetScan, or folded over many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FindingsSummary {
    pub total_packages: u32,
    pub total_exploits: u32,
    pub total_malware: u32,
    pub total_misconfigurations: u32,
    pub total_rootkits: u32,
    pub total_secrets: u32,
    pub total_info_finder: u32,
    pub total_vulnerabilities: VulnerabilitySeveritySummary,
}

impl FindingsSummary {
    pub fn add(&mut self, other: &Self) {
        self.total_packages += other.total_packages;
        self.total_exploits += other.total_exploits;
        self.total_malware += other.total_malware;
        self.total_misconfigurations += other.total_misconfigurations;
        self.total_rootkits += other.total_rootkits;
        self.total_secrets += other.total_secrets;
        self.total_info_finder += other.total_info_finder;
        self.total_vulnerabilities.add(&other.total_vulnerabilities);
    }
}

/// Progress and findings of a Scan, recomputed from its AssetScans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanSummary {
    pub jobs_completed: u32,
    pub jobs_left_to_run: u32,
    #[serde(flatten)]
    pub findings: FindingsSummary,
}

/// One materialized run of a ScanConfig.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_config: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_scanners: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_scan_template: Option<AssetScanTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScanStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ScanSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Scan {
    pub fn state(&self) -> Option<ScanState> {
        self.status.as_ref().map(|s| s.state)
    }
}
