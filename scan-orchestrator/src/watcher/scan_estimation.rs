//! Drives ScanEstimations, the dry-run counterpart of Scans.
//!
//! The lifecycle mirrors [`ScanWatcher`](super::ScanWatcher): assets are
//! discovered, one AssetScanEstimation is created per asset and their results
//! are folded into the summary. Finished estimations are kept for their TTL
//! and then deleted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scan_api::filter::Filter;
use scan_api::models::{
    AssetScanEstimation, AssetScanEstimationReason, AssetScanEstimationState,
    AssetScanEstimationStatus, Reference, ScanEstimation, ScanEstimationReason,
    ScanEstimationState, ScanEstimationStatus, ScanEstimationSummary,
};
use scan_api::{BackendClient, ListParams};
use tracing::{debug, info, warn};

use super::{Expiry, active_or_expired_filter, deadline_after, discover_asset_ids, is_timed_out};
use crate::common::{Discover, Reconcile, fan_out, id_event};
use crate::config::ScanEstimationWatcherConfig;
use crate::{Error, Result};

id_event!(
    /// Identifies one ScanEstimation.
    ScanEstimationEvent,
    scan_estimation_id,
    "ScanEstimationID"
);

pub struct ScanEstimationWatcher {
    backend: Arc<dyn BackendClient>,
    config: ScanEstimationWatcherConfig,
}

impl ScanEstimationWatcher {
    pub fn new(backend: Arc<dyn BackendClient>, config: ScanEstimationWatcherConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ScanEstimationWatcherConfig {
        &self.config
    }

    fn default_ttl(&self) -> u64 {
        self.config.estimation_ttl.as_secs()
    }

    pub async fn reconcile_at(
        &self,
        event: &ScanEstimationEvent,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = event.scan_estimation_id.as_str();
        let estimation = self.backend.get_scan_estimation(id, None).await?;

        let Some(state) = estimation.state() else {
            debug!("ScanEstimation has no status, moving it to Pending");
            let patch = ScanEstimation {
                status: Some(ScanEstimationStatus::new(
                    ScanEstimationState::Pending,
                    ScanEstimationReason::Created,
                    None,
                )),
                ..Default::default()
            };
            self.backend.patch_scan_estimation(id, patch).await?;
            return Ok(());
        };

        if !state.is_terminal()
            && is_timed_out(
                estimation.start_time,
                self.config.scan_estimation_timeout,
                now,
            )
        {
            warn!(timeout = ?self.config.scan_estimation_timeout, "ScanEstimation has timed out");
            let patch = ScanEstimation {
                status: Some(ScanEstimationStatus::with_message(
                    ScanEstimationState::Failed,
                    ScanEstimationReason::Timeout,
                    "ScanEstimation has been timed out",
                )),
                end_time: Some(now),
                ..Default::default()
            };
            self.backend.patch_scan_estimation(id, patch).await?;
            return Ok(());
        }

        match state {
            ScanEstimationState::Pending => self.reconcile_pending(id, &estimation, now).await,
            ScanEstimationState::Discovered => self.reconcile_discovered(id, &estimation).await,
            ScanEstimationState::InProgress => {
                self.reconcile_in_progress(id, &estimation, now).await
            }
            ScanEstimationState::Aborted => self.reconcile_aborted(id, &estimation, now).await,
            ScanEstimationState::Done | ScanEstimationState::Failed => {
                self.reconcile_expiry(id, &estimation, now).await
            }
        }
    }

    async fn reconcile_pending(
        &self,
        id: &str,
        estimation: &ScanEstimation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let asset_ids =
            discover_asset_ids(self.backend.as_ref(), estimation.scope()).await?;
        let total = u32::try_from(asset_ids.len()).unwrap_or(u32::MAX);

        let mut patch = ScanEstimation {
            start_time: Some(now),
            ttl_seconds_after_finished: Some(
                estimation
                    .ttl_seconds_after_finished
                    .unwrap_or_else(|| self.default_ttl()),
            ),
            summary: Some(ScanEstimationSummary {
                jobs_left_to_run: total,
                ..Default::default()
            }),
            ..Default::default()
        };
        if asset_ids.is_empty() {
            info!("No assets in scope");
            patch.status = Some(ScanEstimationStatus::with_message(
                ScanEstimationState::Done,
                ScanEstimationReason::NothingToEstimate,
                "No instances found in scope for Scan estimation",
            ));
            patch.end_time = Some(now);
        } else {
            info!(assets = total, "Assets discovered");
            patch.status = Some(ScanEstimationStatus::new(
                ScanEstimationState::Discovered,
                ScanEstimationReason::SuccessfulDiscovery,
                None,
            ));
        }
        patch.asset_ids = Some(asset_ids);

        self.backend.patch_scan_estimation(id, patch).await?;
        Ok(())
    }

    async fn reconcile_discovered(&self, id: &str, estimation: &ScanEstimation) -> Result<()> {
        let asset_ids = estimation.asset_ids.clone().unwrap_or_default();
        let template = estimation
            .scan_template
            .as_ref()
            .and_then(|t| t.asset_scan_template.clone());
        let ttl = estimation
            .ttl_seconds_after_finished
            .unwrap_or_else(|| self.default_ttl());

        let children = asset_ids.iter().map(|asset_id| AssetScanEstimation {
            scan_estimation: Some(Reference::new(id)),
            asset: Some(Reference::new(asset_id.as_str())),
            asset_scan_template: template.clone(),
            ttl_seconds_after_finished: Some(ttl),
            status: Some(AssetScanEstimationStatus::new(
                AssetScanEstimationState::Pending,
                AssetScanEstimationReason::Created,
                None,
            )),
            ..Default::default()
        });

        let report = fan_out(children, self.config.max_fanout, |child| {
            let backend = self.backend.clone();
            async move {
                match backend.post_asset_scan_estimation(child).await {
                    Ok(created) => created.id.map(Reference::new).ok_or_else(|| {
                        Error::invalid("AssetScanEstimation", "created entity has no id")
                    }),
                    Err(e) => match e.conflicting_id() {
                        Some(existing) => {
                            debug!(id = existing, "AssetScanEstimation already exists");
                            Ok(Reference::new(existing))
                        }
                        None => Err(Error::from(e)),
                    },
                }
            }
        })
        .await;
        let references = report.into_result("create", "AssetScanEstimation")?;

        let total = u32::try_from(asset_ids.len()).unwrap_or(u32::MAX);
        info!(asset_scan_estimations = total, "AssetScanEstimations created");
        let patch = ScanEstimation {
            status: Some(ScanEstimationStatus::new(
                ScanEstimationState::InProgress,
                ScanEstimationReason::Running,
                None,
            )),
            summary: Some(ScanEstimationSummary {
                jobs_left_to_run: total,
                ..Default::default()
            }),
            asset_ids: Some(asset_ids),
            asset_scan_estimations: Some(references),
            ..Default::default()
        };
        self.backend.patch_scan_estimation(id, patch).await?;
        Ok(())
    }

    async fn reconcile_in_progress(
        &self,
        id: &str,
        estimation: &ScanEstimation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let params = ListParams::new()
            .with_filter(Filter::eq("scanEstimation/id", id))
            .select("id,status,estimation")
            .count();
        let children = self.backend.get_asset_scan_estimations(params).await?;
        let mut progress = EstimationProgress::from_asset_scan_estimations(&children.items)?;
        let total = children.count.unwrap_or(children.items.len());

        let mut patch = ScanEstimation::default();
        if progress.summary.jobs_left_to_run == 0 {
            update_total_scan_time_with_parallel_scans(
                &mut progress.summary,
                estimation.max_parallel_scanners(),
            )?;

            let message = format!(
                "{} succeeded, {} failed out of {} total asset scan estimations",
                progress.succeeded, progress.failed, total
            );
            let status = if progress.failed > 0 {
                ScanEstimationStatus::with_message(
                    ScanEstimationState::Failed,
                    ScanEstimationReason::Error,
                    message,
                )
            } else {
                ScanEstimationStatus::with_message(
                    ScanEstimationState::Done,
                    ScanEstimationReason::Success,
                    message,
                )
            };
            info!(state = %status.state, "ScanEstimation finished");

            let ttl = estimation
                .ttl_seconds_after_finished
                .unwrap_or_else(|| self.default_ttl());
            patch.status = Some(status);
            patch.end_time = Some(now);
            patch.ttl_seconds_after_finished = Some(ttl);
            patch.delete_after = Some(deadline_after(now, ttl));
        }
        patch.summary = Some(progress.summary);

        self.backend.patch_scan_estimation(id, patch).await?;
        Ok(())
    }

    async fn reconcile_aborted(
        &self,
        id: &str,
        estimation: &ScanEstimation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let filter = Filter::eq("scanEstimation/id", id).and(Filter::not_in(
            "status/state",
            [
                AssetScanEstimationState::Aborted.to_string(),
                AssetScanEstimationState::Done.to_string(),
            ],
        ));
        let params = ListParams::new().with_filter(filter).select("id").count();
        let running = self.backend.get_asset_scan_estimations(params).await?;
        let ids: Vec<String> = running.items.into_iter().filter_map(|e| e.id).collect();

        let report = fan_out(ids, self.config.max_fanout, |child_id| {
            let backend = self.backend.clone();
            async move {
                let patch = AssetScanEstimation {
                    status: Some(AssetScanEstimationStatus::new(
                        AssetScanEstimationState::Aborted,
                        AssetScanEstimationReason::Aborted,
                        None,
                    )),
                    ..Default::default()
                };
                backend
                    .patch_asset_scan_estimation(&child_id, patch)
                    .await
                    .map_err(Error::from)
            }
        })
        .await;
        report.into_result("abort", "AssetScanEstimation")?;

        let ttl = estimation
            .ttl_seconds_after_finished
            .unwrap_or_else(|| self.default_ttl());
        let patch = ScanEstimation {
            status: Some(ScanEstimationStatus::with_message(
                ScanEstimationState::Failed,
                ScanEstimationReason::Aborted,
                "ScanEstimation has been aborted",
            )),
            end_time: Some(now),
            ttl_seconds_after_finished: Some(ttl),
            delete_after: Some(deadline_after(now, ttl)),
            ..Default::default()
        };
        self.backend.patch_scan_estimation(id, patch).await?;
        Ok(())
    }

    async fn reconcile_expiry(
        &self,
        id: &str,
        estimation: &ScanEstimation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let expiry = Expiry::evaluate(
            estimation.end_time,
            estimation.ttl_seconds_after_finished,
            estimation.delete_after,
            self.default_ttl(),
            now,
        );
        match expiry {
            Expiry::Stamp {
                end_time,
                ttl_seconds,
                delete_after,
            } => {
                debug!(%delete_after, "Recording ScanEstimation deadline");
                let patch = ScanEstimation {
                    end_time: Some(end_time),
                    ttl_seconds_after_finished: Some(ttl_seconds),
                    delete_after: Some(delete_after),
                    ..Default::default()
                };
                self.backend.patch_scan_estimation(id, patch).await?;
            }
            Expiry::Delete => {
                info!("ScanEstimation expired, deleting it");
                match self.backend.delete_scan_estimation(id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!("ScanEstimation already deleted"),
                    Err(e) => return Err(e.into()),
                }
            }
            Expiry::Keep => debug!("ScanEstimation is not expired yet"),
        }
        Ok(())
    }
}

/// Progress of a ScanEstimation folded from its AssetScanEstimations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstimationProgress {
    pub summary: ScanEstimationSummary,
    pub succeeded: u32,
    pub failed: u32,
}

impl EstimationProgress {
    pub fn from_asset_scan_estimations(children: &[AssetScanEstimation]) -> Result<Self> {
        let mut progress = Self::default();
        for child in children {
            let state = child.state().ok_or_else(|| {
                Error::invalid(
                    "AssetScanEstimation",
                    format!(
                        "status is missing. AssetScanEstimationID={}",
                        child.id.as_deref().unwrap_or("")
                    ),
                )
            })?;

            match state {
                AssetScanEstimationState::Pending => progress.summary.jobs_left_to_run += 1,
                AssetScanEstimationState::Done => {
                    if let Some(estimation) = &child.estimation {
                        let summary = &mut progress.summary;
                        summary.total_scan_time += estimation.duration.unwrap_or(0);
                        summary.total_scan_size += estimation.size.unwrap_or(0);
                        summary.total_scan_cost += estimation.cost.unwrap_or(0.0);
                    }
                    progress.summary.jobs_completed += 1;
                    progress.succeeded += 1;
                }
                AssetScanEstimationState::Aborted | AssetScanEstimationState::Failed => {
                    progress.summary.jobs_completed += 1;
                    progress.failed += 1;
                }
            }
        }
        Ok(progress)
    }
}

/// Approximates wall-clock time when up to `max_parallel` assets are scanned at once.
pub fn update_total_scan_time_with_parallel_scans(
    summary: &mut ScanEstimationSummary,
    max_parallel: Option<u32>,
) -> Result<()> {
    if summary.jobs_completed == 0 {
        return Err(Error::validation(
            "cannot compute parallel scan time without completed jobs",
        ));
    }
    if let Some(max_parallel) = max_parallel
        && max_parallel > 1
    {
        let divisor = max_parallel.min(summary.jobs_completed);
        summary.total_scan_time /= u64::from(divisor);
    }
    Ok(())
}

#[async_trait]
impl Discover<ScanEstimationEvent> for ScanEstimationWatcher {
    async fn get_items(&self) -> Result<Vec<ScanEstimationEvent>> {
        let filter = active_or_expired_filter("status/state", Utc::now());
        let params = ListParams::new().with_filter(filter).select("id").count();
        let estimations = self.backend.get_scan_estimations(params).await?;

        Ok(estimations
            .items
            .into_iter()
            .filter_map(|e| e.id)
            .map(ScanEstimationEvent::new)
            .collect())
    }
}

#[async_trait]
impl Reconcile<ScanEstimationEvent> for ScanEstimationWatcher {
    async fn reconcile(&self, event: ScanEstimationEvent) -> Result<()> {
        self.reconcile_at(&event, Utc::now()).await
    }
}
