//! Provisions and tears down the scanner infrastructure of each AssetScan.
//!
//! The watcher only moves an AssetScan up to `ReadyToScan`; from there the
//! scanner itself reports progress. Once the AssetScan is finished the
//! provider resources are removed according to the [`DeleteJobPolicy`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use scan_api::filter::Filter;
use scan_api::models::{
    Asset, AssetScan, AssetScanReason, AssetScanState, AssetScanStatus, ResourceCleanupReason,
    ResourceCleanupState, ResourceCleanupStatus,
};
use scan_api::{BackendClient, ListParams};
use scan_provider::{Provider, ProviderError, ScanJobConfig};
use tracing::{debug, info, warn};

use crate::common::{Discover, Labels, Reconcile, ReconcileEvent};
use crate::config::{AssetScanWatcherConfig, DeleteJobPolicy};
use crate::{Error, Result};

const SCHEDULED_REQUEUE: Duration = Duration::from_secs(1);

/// Identifies one AssetScan together with its Scan and Asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetScanEvent {
    pub asset_scan_id: String,
    pub scan_id: String,
    pub asset_id: String,
}

impl AssetScanEvent {
    pub fn new(
        asset_scan_id: impl Into<String>,
        scan_id: impl Into<String>,
        asset_id: impl Into<String>,
    ) -> Self {
        Self {
            asset_scan_id: asset_scan_id.into(),
            scan_id: scan_id.into(),
            asset_id: asset_id.into(),
        }
    }
}

impl ReconcileEvent for AssetScanEvent {
    fn hash_key(&self) -> String {
        self.asset_scan_id.clone()
    }

    fn labels(&self) -> Labels {
        Labels::new()
            .with("AssetScanID", self.asset_scan_id.clone())
            .with("ScanID", self.scan_id.clone())
            .with("AssetID", self.asset_id.clone())
    }
}

impl fmt::Display for AssetScanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels())
    }
}

pub struct AssetScanWatcher {
    backend: Arc<dyn BackendClient>,
    provider: Arc<dyn Provider>,
    config: AssetScanWatcherConfig,
}

impl AssetScanWatcher {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        provider: Arc<dyn Provider>,
        config: AssetScanWatcherConfig,
    ) -> Self {
        Self {
            backend,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &AssetScanWatcherConfig {
        &self.config
    }

    pub async fn reconcile_at(&self, event: &AssetScanEvent, now: DateTime<Utc>) -> Result<()> {
        let id = event.asset_scan_id.as_str();
        let asset_scan = self.backend.get_asset_scan(id, None).await?;

        let Some(status) = asset_scan.status.as_ref() else {
            return Err(Error::invalid(
                "AssetScan",
                format!("status is missing. AssetScanID={id}"),
            ));
        };

        match status.state {
            AssetScanState::Pending => self.reconcile_pending(event).await,
            AssetScanState::Scheduled => self.reconcile_scheduled(event, &asset_scan).await,
            AssetScanState::ReadyToScan | AssetScanState::InProgress => {
                debug!(state = %status.state, "AssetScan is handled by the scanner");
                Ok(())
            }
            AssetScanState::Aborted => {
                self.reconcile_aborted(id, status.last_transition_time, now)
                    .await
            }
            AssetScanState::Done | AssetScanState::Failed => {
                self.reconcile_cleanup(event, &asset_scan, status.state)
                    .await
            }
        }
    }

    async fn reconcile_pending(&self, event: &AssetScanEvent) -> Result<()> {
        let scan = self
            .backend
            .get_scan(&event.scan_id, Some("id,maxParallelScanners"))
            .await?;

        if let Some(max_parallel) = scan.max_parallel_scanners
            && max_parallel > 0
        {
            let filter = Filter::eq("scan/id", event.scan_id.as_str())
                .and(Filter::not_in(
                    "status/state",
                    [
                        AssetScanState::Done.to_string(),
                        AssetScanState::Failed.to_string(),
                        AssetScanState::Pending.to_string(),
                    ],
                ))
                .and(Filter::eq(
                    "resourceCleanupStatus/state",
                    ResourceCleanupState::Pending.to_string(),
                ));
            let params = ListParams::new().with_filter(filter).count().top(0);
            let running = self.backend.get_asset_scans(params).await?;
            let running = running.count.unwrap_or(running.items.len());

            if running >= max_parallel as usize {
                info!(
                    running,
                    max_parallel, "Reached the maximum number of parallel scanners"
                );
                return Ok(());
            }
        }

        let patch = AssetScan {
            status: Some(AssetScanStatus::new(
                AssetScanState::Scheduled,
                AssetScanReason::Provisioning,
                None,
            )),
            ..Default::default()
        };
        self.backend
            .patch_asset_scan(&event.asset_scan_id, patch)
            .await?;

        Err(Error::requeue_after(
            SCHEDULED_REQUEUE,
            "AssetScan state moved to Scheduled",
        ))
    }

    async fn reconcile_scheduled(&self, event: &AssetScanEvent, asset_scan: &AssetScan) -> Result<()> {
        let asset = self.backend.get_asset(&event.asset_id).await?;
        let job = self.job_config(event, asset_scan, asset);

        let status = match self.provider.run_asset_scan(&job).await {
            Ok(()) => {
                info!("Scanner resources are ready");
                AssetScanStatus::new(
                    AssetScanState::ReadyToScan,
                    AssetScanReason::ResourcesReady,
                    None,
                )
            }
            Err(e) => {
                if let Some(after) = e.retry_after() {
                    return Err(Error::requeue_after(after, e.to_string()));
                }
                warn!(error = %e, fatal = e.is_fatal(), "Failed to provision scanner resources");
                AssetScanStatus::with_message(
                    AssetScanState::Failed,
                    AssetScanReason::Error,
                    e.to_string(),
                )
            }
        };

        let patch = AssetScan {
            status: Some(status),
            ..Default::default()
        };
        self.backend
            .patch_asset_scan(&event.asset_scan_id, patch)
            .await?;
        Ok(())
    }

    async fn reconcile_aborted(
        &self,
        id: &str,
        aborted_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let timeout = self.config.abort_timeout;
        let deadline = TimeDelta::from_std(timeout)
            .map(|t| aborted_at + t)
            .map_err(|e| Error::config(format!("abort timeout out of range: {e}")))?;
        if now <= deadline {
            debug!(%deadline, "Waiting for the scanner to shut down");
            return Ok(());
        }

        warn!(?timeout, "Scanner did not shut down after abort");
        let patch = AssetScan {
            status: Some(AssetScanStatus::with_message(
                AssetScanState::Failed,
                AssetScanReason::AbortTimeout,
                format!(
                    "failed to wait for scanner to finish graceful shutdown on abort after: {timeout:?}"
                ),
            )),
            ..Default::default()
        };
        self.backend.patch_asset_scan(id, patch).await?;
        Ok(())
    }

    async fn reconcile_cleanup(
        &self,
        event: &AssetScanEvent,
        asset_scan: &AssetScan,
        state: AssetScanState,
    ) -> Result<()> {
        let cleanup = asset_scan.resource_cleanup_status.as_ref().map(|s| s.state);
        if cleanup != Some(ResourceCleanupState::Pending) {
            debug!(?cleanup, "Nothing to clean up");
            return Ok(());
        }

        let skip = match self.config.delete_job_policy {
            DeleteJobPolicy::Always => false,
            DeleteJobPolicy::OnSuccess => state == AssetScanState::Failed,
            DeleteJobPolicy::Never => true,
        };

        let status = if skip {
            debug!(policy = %self.config.delete_job_policy, "Skipping resource cleanup");
            ResourceCleanupStatus::new(
                ResourceCleanupState::Skipped,
                ResourceCleanupReason::DeletePolicy,
                None,
            )
        } else {
            let asset = self.backend.get_asset(&event.asset_id).await?;
            let job = self.job_config(event, asset_scan, asset);
            match self.provider.remove_asset_scan(&job).await {
                Ok(()) => {
                    info!("Scanner resources removed");
                    ResourceCleanupStatus::new(
                        ResourceCleanupState::Done,
                        ResourceCleanupReason::Success,
                        None,
                    )
                }
                Err(e) => cleanup_failure(e)?,
            }
        };

        let patch = AssetScan {
            resource_cleanup_status: Some(status),
            ..Default::default()
        };
        self.backend
            .patch_asset_scan(&event.asset_scan_id, patch)
            .await?;
        Ok(())
    }

    fn job_config(&self, event: &AssetScanEvent, asset_scan: &AssetScan, asset: Asset) -> ScanJobConfig {
        ScanJobConfig {
            asset_scan_id: event.asset_scan_id.clone(),
            scan_id: Some(event.scan_id.clone()).filter(|id| !id.is_empty()),
            asset,
            scan_families_config: asset_scan.scan_families_config.clone().unwrap_or_default(),
            instance_creation: asset_scan
                .scanner_instance_creation_config
                .clone()
                .unwrap_or_default(),
            scanner_image: self.config.scanner_image.clone(),
            backend_address: self.config.backend_address.clone(),
        }
    }
}

/// Retryable failures requeue, anything else marks the cleanup failed.
fn cleanup_failure(e: ProviderError) -> Result<ResourceCleanupStatus> {
    if let Some(after) = e.retry_after() {
        return Err(Error::requeue_after(after, e.to_string()));
    }
    warn!(error = %e, "Failed to remove scanner resources");
    Ok(ResourceCleanupStatus::with_message(
        ResourceCleanupState::Failed,
        ResourceCleanupReason::ProviderError,
        e.to_string(),
    ))
}

#[async_trait]
impl Discover<AssetScanEvent> for AssetScanWatcher {
    async fn get_items(&self) -> Result<Vec<AssetScanEvent>> {
        let running = Filter::not_in(
            "status/state",
            [
                AssetScanState::Done.to_string(),
                AssetScanState::Failed.to_string(),
            ],
        );
        let cleanup = Filter::eq(
            "resourceCleanupStatus/state",
            ResourceCleanupState::Pending.to_string(),
        );
        let params = ListParams::new()
            .with_filter(running.group().or(cleanup))
            .select("id,scan,asset")
            .count();
        let asset_scans = self.backend.get_asset_scans(params).await?;

        Ok(asset_scans
            .items
            .into_iter()
            .filter_map(|a| {
                let scan_id = a.scan_id().unwrap_or_default().to_string();
                let asset_id = a.asset_id().unwrap_or_default().to_string();
                a.id.map(|id| AssetScanEvent::new(id, scan_id, asset_id))
            })
            .collect())
    }
}

#[async_trait]
impl Reconcile<AssetScanEvent> for AssetScanWatcher {
    async fn reconcile(&self, event: AssetScanEvent) -> Result<()> {
        self.reconcile_at(&event, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use scan_api::MemoryBackend;
    use scan_api::models::{AssetInfo, AssetScanTemplate, Estimation, Reference, Scan};
    use scan_provider::ProviderKind;

    /// Provider answering every call with a preset outcome.
    #[derive(Default)]
    struct ScriptedProvider {
        run_error: Mutex<Option<ProviderError>>,
        remove_error: Mutex<Option<ProviderError>>,
        runs: Mutex<Vec<ScanJobConfig>>,
        removals: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::External
        }

        async fn discover_assets(&self) -> scan_provider::Result<Vec<AssetInfo>> {
            Ok(Vec::new())
        }

        async fn run_asset_scan(&self, config: &ScanJobConfig) -> scan_provider::Result<()> {
            self.runs.lock().push(config.clone());
            match self.run_error.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn remove_asset_scan(&self, config: &ScanJobConfig) -> scan_provider::Result<()> {
            self.removals.lock().push(config.asset_scan_id.clone());
            match self.remove_error.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn estimate(
            &self,
            _asset: &Asset,
            _template: &AssetScanTemplate,
        ) -> scan_provider::Result<Estimation> {
            Ok(Estimation::default())
        }
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        provider: Arc<ScriptedProvider>,
        scan_id: String,
    }

    impl Fixture {
        async fn new(max_parallel: Option<u32>) -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let scan = Scan {
                max_parallel_scanners: max_parallel,
                ..Default::default()
            };
            let scan_id = backend.post_scan(scan).await.unwrap().id.unwrap();
            Self {
                backend,
                provider: Arc::new(ScriptedProvider::default()),
                scan_id,
            }
        }

        fn watcher(&self, policy: DeleteJobPolicy) -> AssetScanWatcher {
            AssetScanWatcher::new(
                self.backend.clone(),
                self.provider.clone(),
                AssetScanWatcherConfig {
                    delete_job_policy: policy,
                    abort_timeout: Duration::from_secs(600),
                    ..Default::default()
                },
            )
        }

        async fn insert(&self, asset_id: &str, state: AssetScanState) -> AssetScanEvent {
            self.backend
                .post_asset(Asset {
                    id: Some(asset_id.to_string()),
                    ..Default::default()
                })
                .await
                .unwrap();
            let asset_scan = AssetScan {
                scan: Some(Reference::new(self.scan_id.as_str())),
                asset: Some(Reference::new(asset_id)),
                status: Some(AssetScanStatus::new(state, AssetScanReason::Created, None)),
                resource_cleanup_status: Some(ResourceCleanupStatus::new(
                    ResourceCleanupState::Pending,
                    ResourceCleanupReason::AssetScanCreated,
                    None,
                )),
                ..Default::default()
            };
            let id = self
                .backend
                .post_asset_scan(asset_scan)
                .await
                .unwrap()
                .id
                .unwrap();
            AssetScanEvent::new(id, self.scan_id.as_str(), asset_id)
        }

        async fn get(&self, event: &AssetScanEvent) -> AssetScan {
            self.backend
                .get_asset_scan(&event.asset_scan_id, None)
                .await
                .unwrap()
        }
    }

    #[test]
    fn test_event_labels() {
        let event = AssetScanEvent::new("as-1", "s-1", "a-1");
        assert_eq!(event.hash_key(), "as-1");
        assert_eq!(event.to_string(), "AssetScanID=as-1 ScanID=s-1 AssetID=a-1");
    }

    #[tokio::test]
    async fn test_pending_is_scheduled_and_requeued() {
        let fixture = Fixture::new(None).await;
        let event = fixture.insert("vm-1", AssetScanState::Pending).await;

        let err = fixture
            .watcher(DeleteJobPolicy::Always)
            .reconcile_at(&event, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.requeue_delay(), Some(SCHEDULED_REQUEUE));
        let stored = fixture.get(&event).await;
        assert_eq!(stored.state(), Some(AssetScanState::Scheduled));
    }

    #[tokio::test]
    async fn test_pending_respects_max_parallel_scanners() {
        let fixture = Fixture::new(Some(1)).await;
        fixture.insert("vm-1", AssetScanState::ReadyToScan).await;
        let event = fixture.insert("vm-2", AssetScanState::Pending).await;

        fixture
            .watcher(DeleteJobPolicy::Always)
            .reconcile_at(&event, Utc::now())
            .await
            .unwrap();
        let stored = fixture.get(&event).await;
        assert_eq!(stored.state(), Some(AssetScanState::Pending));
    }

    #[tokio::test]
    async fn test_scheduled_runs_provider() {
        let fixture = Fixture::new(None).await;
        let event = fixture.insert("vm-1", AssetScanState::Scheduled).await;

        fixture
            .watcher(DeleteJobPolicy::Always)
            .reconcile_at(&event, Utc::now())
            .await
            .unwrap();

        let stored = fixture.get(&event).await;
        assert_eq!(stored.state(), Some(AssetScanState::ReadyToScan));
        let runs = fixture.provider.runs.lock();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].asset_scan_id, event.asset_scan_id);
        assert_eq!(runs[0].scan_id.as_deref(), Some(fixture.scan_id.as_str()));
        assert_eq!(runs[0].scanner_image, "scan-cli:latest");
    }

    #[tokio::test]
    async fn test_scheduled_provider_errors() {
        let fixture = Fixture::new(None).await;
        let event = fixture.insert("vm-1", AssetScanState::Scheduled).await;
        let watcher = fixture.watcher(DeleteJobPolicy::Always);

        *fixture.provider.run_error.lock() = Some(ProviderError::retryable(
            Duration::from_secs(30),
            "snapshot not ready",
        ));
        let err = watcher.reconcile_at(&event, Utc::now()).await.unwrap_err();
        assert_eq!(err.requeue_delay(), Some(Duration::from_secs(30)));
        assert_eq!(fixture.get(&event).await.state(), Some(AssetScanState::Scheduled));

        *fixture.provider.run_error.lock() = Some(ProviderError::fatal("unsupported asset"));
        watcher.reconcile_at(&event, Utc::now()).await.unwrap();
        let status = fixture.get(&event).await.status.unwrap();
        assert_eq!(status.state, AssetScanState::Failed);
        assert_eq!(status.reason, AssetScanReason::Error);
        assert_eq!(status.message.as_deref(), Some("unsupported asset"));
    }

    #[tokio::test]
    async fn test_aborted_fails_after_timeout() {
        let fixture = Fixture::new(None).await;
        let event = fixture.insert("vm-1", AssetScanState::Aborted).await;
        let watcher = fixture.watcher(DeleteJobPolicy::Always);
        let aborted_at = fixture.get(&event).await.status.unwrap().last_transition_time;

        watcher
            .reconcile_at(&event, aborted_at + TimeDelta::seconds(60))
            .await
            .unwrap();
        assert_eq!(fixture.get(&event).await.state(), Some(AssetScanState::Aborted));

        watcher
            .reconcile_at(&event, aborted_at + TimeDelta::seconds(601))
            .await
            .unwrap();
        let status = fixture.get(&event).await.status.unwrap();
        assert_eq!(status.state, AssetScanState::Failed);
        assert_eq!(status.reason, AssetScanReason::AbortTimeout);
    }

    #[tokio::test]
    async fn test_cleanup_follows_delete_policy() {
        let cases = [
            (DeleteJobPolicy::Always, AssetScanState::Failed, ResourceCleanupState::Done, 1),
            (DeleteJobPolicy::OnSuccess, AssetScanState::Done, ResourceCleanupState::Done, 1),
            (DeleteJobPolicy::OnSuccess, AssetScanState::Failed, ResourceCleanupState::Skipped, 0),
            (DeleteJobPolicy::Never, AssetScanState::Done, ResourceCleanupState::Skipped, 0),
        ];
        for (policy, state, expected, removals) in cases {
            let fixture = Fixture::new(None).await;
            let event = fixture.insert("vm-1", state).await;

            fixture
                .watcher(policy)
                .reconcile_at(&event, Utc::now())
                .await
                .unwrap();

            let cleanup = fixture.get(&event).await.resource_cleanup_status.unwrap();
            assert_eq!(cleanup.state, expected, "{policy} {state}");
            assert_eq!(fixture.provider.removals.lock().len(), removals);
        }
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_recorded() {
        let fixture = Fixture::new(None).await;
        let event = fixture.insert("vm-1", AssetScanState::Done).await;
        *fixture.provider.remove_error.lock() = Some(ProviderError::other("api down"));

        fixture
            .watcher(DeleteJobPolicy::Always)
            .reconcile_at(&event, Utc::now())
            .await
            .unwrap();
        let cleanup = fixture.get(&event).await.resource_cleanup_status.unwrap();
        assert_eq!(cleanup.state, ResourceCleanupState::Failed);
        assert_eq!(cleanup.reason, ResourceCleanupReason::ProviderError);
    }

    #[tokio::test]
    async fn test_discovery_includes_pending_cleanup() {
        let fixture = Fixture::new(None).await;
        let running = fixture.insert("vm-1", AssetScanState::InProgress).await;
        let finished = fixture.insert("vm-2", AssetScanState::Done).await;
        let cleaned = fixture.insert("vm-3", AssetScanState::Done).await;
        fixture
            .backend
            .patch_asset_scan(
                &cleaned.asset_scan_id,
                AssetScan {
                    resource_cleanup_status: Some(ResourceCleanupStatus::new(
                        ResourceCleanupState::Done,
                        ResourceCleanupReason::Success,
                        None,
                    )),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut items = fixture
            .watcher(DeleteJobPolicy::Always)
            .get_items()
            .await
            .unwrap();
        items.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        assert_eq!(items, vec![running, finished]);
    }
}
