//! Drives Scans from asset discovery to a terminal state.
//!
//! `Pending` discovers the assets in scope, `Discovered` fans out one AssetScan
//! per asset, `InProgress` folds the AssetScans into the Scan summary until
//! none is left to run, and `Aborted` propagates the abort to the AssetScans.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scan_api::filter::Filter;
use scan_api::models::{
    AssetScan, AssetScanReason, AssetScanState, AssetScanStatus, FamilyScan, FindingsSummary,
    Reference, ResourceCleanupReason, ResourceCleanupState, ResourceCleanupStatus, Scan,
    ScanFamily, ScanReason, ScanState, ScanStatus, ScanSummary,
};
use scan_api::{BackendClient, ListParams};
use tracing::{debug, info, warn};

use super::{discover_asset_ids, is_timed_out};
use crate::common::{Discover, Reconcile, fan_out, id_event};
use crate::config::ScanWatcherConfig;
use crate::{Error, Result};

id_event!(
    /// Identifies one Scan.
    ScanEvent,
    scan_id,
    "ScanID"
);

pub struct ScanWatcher {
    backend: Arc<dyn BackendClient>,
    config: ScanWatcherConfig,
}

impl ScanWatcher {
    pub fn new(backend: Arc<dyn BackendClient>, config: ScanWatcherConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ScanWatcherConfig {
        &self.config
    }

    pub async fn reconcile_at(&self, event: &ScanEvent, now: DateTime<Utc>) -> Result<()> {
        let id = event.scan_id.as_str();
        let scan = self.backend.get_scan(id, None).await?;

        let Some(state) = scan.state() else {
            return Err(Error::invalid("Scan", format!("status is missing. ScanID={id}")));
        };

        if !state.is_terminal() && is_timed_out(scan.start_time, self.config.scan_timeout, now) {
            warn!(timeout = ?self.config.scan_timeout, "Scan has timed out");
            let patch = Scan {
                status: Some(ScanStatus::with_message(
                    ScanState::Failed,
                    ScanReason::Timeout,
                    "Scan has timed out",
                )),
                end_time: Some(now),
                ..Default::default()
            };
            self.backend.patch_scan(id, patch).await?;
            return Ok(());
        }

        match state {
            ScanState::Pending => self.reconcile_pending(id, &scan, now).await,
            ScanState::Discovered => self.reconcile_discovered(id, &scan).await,
            ScanState::InProgress => self.reconcile_in_progress(id, now).await,
            ScanState::Aborted => self.reconcile_aborted(id, now).await,
            ScanState::Done | ScanState::Failed => {
                debug!(%state, "Scan is finished");
                Ok(())
            }
        }
    }

    async fn reconcile_pending(&self, id: &str, scan: &Scan, now: DateTime<Utc>) -> Result<()> {
        let asset_ids = discover_asset_ids(self.backend.as_ref(), scan.scope.as_deref()).await?;

        let status = if asset_ids.is_empty() {
            info!("No assets in scope");
            ScanStatus::with_message(
                ScanState::Done,
                ScanReason::NothingToScan,
                "No instances found in scope for Scan",
            )
        } else {
            info!(assets = asset_ids.len(), "Assets discovered");
            ScanStatus::with_message(
                ScanState::Discovered,
                ScanReason::AssetsDiscovered,
                "Assets for Scan are successfully discovered",
            )
        };
        let end_time = (status.state == ScanState::Done).then_some(now);

        let patch = Scan {
            asset_ids: Some(asset_ids),
            status: Some(status),
            end_time,
            ..Default::default()
        };
        self.backend.patch_scan(id, patch).await?;
        Ok(())
    }

    async fn reconcile_discovered(&self, id: &str, scan: &Scan) -> Result<()> {
        let asset_ids = scan.asset_ids.clone().unwrap_or_default();
        let asset_scans = asset_ids
            .iter()
            .map(|asset_id| new_asset_scan_from_scan(id, scan, asset_id))
            .collect::<Result<Vec<_>>>()?;

        let report = fan_out(asset_scans, self.config.max_fanout, |asset_scan| {
            let backend = self.backend.clone();
            async move {
                match backend.post_asset_scan(asset_scan).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_conflict() => {
                        debug!(error = %e, "AssetScan already exists");
                        Ok(())
                    }
                    Err(e) => Err(Error::from(e)),
                }
            }
        })
        .await;
        report.into_result("create", "AssetScan")?;

        let total = u32::try_from(asset_ids.len()).unwrap_or(u32::MAX);
        info!(asset_scans = total, "AssetScans created");
        let patch = Scan {
            status: Some(ScanStatus::new(
                ScanState::InProgress,
                ScanReason::AssetScansRunning,
                None,
            )),
            summary: Some(ScanSummary {
                jobs_left_to_run: total,
                ..Default::default()
            }),
            asset_ids: Some(asset_ids),
            ..Default::default()
        };
        self.backend.patch_scan(id, patch).await?;
        Ok(())
    }

    async fn reconcile_in_progress(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let params = ListParams::new()
            .with_filter(Filter::eq("scan/id", id))
            .select("id,status,summary")
            .count();
        let asset_scans = self.backend.get_asset_scans(params).await?;
        let progress = ScanProgress::from_asset_scans(&asset_scans.items)?;
        let total = asset_scans.count.unwrap_or(asset_scans.items.len());

        let mut patch = Scan {
            summary: Some(progress.summary.clone()),
            ..Default::default()
        };
        if progress.summary.jobs_left_to_run == 0 {
            let message = format!(
                "{} succeeded, {} failed out of {} total asset scans",
                progress.succeeded(),
                progress.failed,
                total
            );
            let status = if progress.failed > 0 {
                ScanStatus::with_message(ScanState::Failed, ScanReason::Error, message)
            } else {
                ScanStatus::with_message(ScanState::Done, ScanReason::Success, message)
            };
            info!(state = %status.state, "Scan finished");
            patch.status = Some(status);
            patch.end_time = Some(now);
        } else {
            debug!(
                left = progress.summary.jobs_left_to_run,
                completed = progress.summary.jobs_completed,
                "Scan still running"
            );
        }
        self.backend.patch_scan(id, patch).await?;
        Ok(())
    }

    async fn reconcile_aborted(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let filter = Filter::eq("scan/id", id).and(Filter::not_in(
            "status/state",
            [
                AssetScanState::Aborted.to_string(),
                AssetScanState::Done.to_string(),
                AssetScanState::Failed.to_string(),
            ],
        ));
        let params = ListParams::new().with_filter(filter).select("id").count();
        let running = self.backend.get_asset_scans(params).await?;
        let ids: Vec<String> = running.items.into_iter().filter_map(|a| a.id).collect();

        let report = fan_out(ids, self.config.max_fanout, |asset_scan_id| {
            let backend = self.backend.clone();
            async move {
                let patch = AssetScan {
                    status: Some(AssetScanStatus::new(
                        AssetScanState::Aborted,
                        AssetScanReason::Cancellation,
                        None,
                    )),
                    ..Default::default()
                };
                backend
                    .patch_asset_scan(&asset_scan_id, patch)
                    .await
                    .map_err(Error::from)
            }
        })
        .await;
        let aborted = report.into_result("abort", "AssetScan")?;
        info!(asset_scans = aborted.len(), "AssetScans aborted");

        let patch = Scan {
            status: Some(ScanStatus::with_message(
                ScanState::Failed,
                ScanReason::Cancellation,
                "Scan has been aborted",
            )),
            end_time: Some(now),
            ..Default::default()
        };
        self.backend.patch_scan(id, patch).await?;
        Ok(())
    }
}

/// Progress of a Scan folded from its AssetScans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanProgress {
    pub summary: ScanSummary,
    pub failed: u32,
}

impl ScanProgress {
    pub fn from_asset_scans(asset_scans: &[AssetScan]) -> Result<Self> {
        let mut progress = Self::default();
        for asset_scan in asset_scans {
            let state = asset_scan.state().ok_or_else(|| {
                Error::invalid(
                    "AssetScan",
                    format!(
                        "status is missing. AssetScanID={}",
                        asset_scan.id.as_deref().unwrap_or("")
                    ),
                )
            })?;

            match state {
                AssetScanState::Pending
                | AssetScanState::Scheduled
                | AssetScanState::ReadyToScan
                | AssetScanState::InProgress
                | AssetScanState::Aborted => progress.summary.jobs_left_to_run += 1,
                AssetScanState::Done | AssetScanState::Failed => {
                    progress.summary.jobs_completed += 1;
                    if let Some(findings) = &asset_scan.summary {
                        progress.summary.findings.add(findings);
                    }
                    if state == AssetScanState::Failed {
                        progress.failed += 1;
                    }
                }
            }
        }
        Ok(progress)
    }

    pub fn succeeded(&self) -> u32 {
        self.summary.jobs_completed - self.failed
    }
}

fn new_asset_scan_from_scan(scan_id: &str, scan: &Scan, asset_id: &str) -> Result<AssetScan> {
    let template = scan.asset_scan_template.clone().unwrap_or_default();
    let families = template.scan_families_config.ok_or_else(|| {
        Error::invalid(
            "Scan",
            format!("asset scan template has no scan families config. ScanID={scan_id}"),
        )
    })?;

    let family = |f: ScanFamily| Some(FamilyScan::new(families.is_enabled(f)));
    Ok(AssetScan {
        scan: Some(Reference::new(scan_id)),
        asset: Some(Reference::new(asset_id)),
        status: Some(AssetScanStatus::new(
            AssetScanState::Pending,
            AssetScanReason::Created,
            None,
        )),
        resource_cleanup_status: Some(ResourceCleanupStatus::new(
            ResourceCleanupState::Pending,
            ResourceCleanupReason::AssetScanCreated,
            None,
        )),
        sbom: Some(FamilyScan::new(families.is_sbom_required())),
        vulnerabilities: family(ScanFamily::Vulnerabilities),
        exploits: family(ScanFamily::Exploits),
        malware: family(ScanFamily::Malware),
        misconfigurations: family(ScanFamily::Misconfigurations),
        rootkits: family(ScanFamily::Rootkits),
        secrets: family(ScanFamily::Secrets),
        info_finder: family(ScanFamily::InfoFinder),
        summary: Some(FindingsSummary::default()),
        scanner_instance_creation_config: template.scanner_instance_creation_config,
        scan_families_config: Some(families),
        ..Default::default()
    })
}

#[async_trait]
impl Discover<ScanEvent> for ScanWatcher {
    async fn get_items(&self) -> Result<Vec<ScanEvent>> {
        let filter = Filter::not_in(
            "status/state",
            [ScanState::Done.to_string(), ScanState::Failed.to_string()],
        );
        let params = ListParams::new().with_filter(filter).select("id").count();
        let scans = self.backend.get_scans(params).await?;

        Ok(scans
            .items
            .into_iter()
            .filter_map(|s| s.id)
            .map(ScanEvent::new)
            .collect())
    }
}

#[async_trait]
impl Reconcile<ScanEvent> for ScanWatcher {
    async fn reconcile(&self, event: ScanEvent) -> Result<()> {
        self.reconcile_at(&event, Utc::now()).await
    }
}
