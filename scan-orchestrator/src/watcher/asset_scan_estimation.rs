//! Runs the provider estimate for each AssetScanEstimation and expires
//! finished ones after their TTL.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scan_api::models::{
    AssetScanEstimation, AssetScanEstimationReason, AssetScanEstimationState,
    AssetScanEstimationStatus,
};
use scan_api::{BackendClient, ListParams};
use scan_provider::{Provider, ProviderError};
use tracing::{debug, info, warn};

use super::{Expiry, active_or_expired_filter, deadline_after};
use crate::common::{Discover, Labels, Reconcile, ReconcileEvent};
use crate::config::AssetScanEstimationWatcherConfig;
use crate::{Error, Result};

/// Identifies one AssetScanEstimation together with its parent and Asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetScanEstimationEvent {
    pub asset_scan_estimation_id: String,
    pub scan_estimation_id: Option<String>,
    pub asset_id: String,
}

impl AssetScanEstimationEvent {
    pub fn new(
        asset_scan_estimation_id: impl Into<String>,
        scan_estimation_id: Option<String>,
        asset_id: impl Into<String>,
    ) -> Self {
        Self {
            asset_scan_estimation_id: asset_scan_estimation_id.into(),
            scan_estimation_id,
            asset_id: asset_id.into(),
        }
    }
}

impl ReconcileEvent for AssetScanEstimationEvent {
    fn hash_key(&self) -> String {
        self.asset_scan_estimation_id.clone()
    }

    fn labels(&self) -> Labels {
        let labels = Labels::new().with(
            "AssetScanEstimationID",
            self.asset_scan_estimation_id.clone(),
        );
        let labels = match &self.scan_estimation_id {
            Some(parent) => labels.with("ScanEstimationID", parent.clone()),
            None => labels,
        };
        labels.with("AssetID", self.asset_id.clone())
    }
}

impl fmt::Display for AssetScanEstimationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels())
    }
}

pub struct AssetScanEstimationWatcher {
    backend: Arc<dyn BackendClient>,
    provider: Arc<dyn Provider>,
    config: AssetScanEstimationWatcherConfig,
}

impl AssetScanEstimationWatcher {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        provider: Arc<dyn Provider>,
        config: AssetScanEstimationWatcherConfig,
    ) -> Self {
        Self {
            backend,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &AssetScanEstimationWatcherConfig {
        &self.config
    }

    fn default_ttl(&self) -> u64 {
        self.config.estimation_ttl.as_secs()
    }

    pub async fn reconcile_at(
        &self,
        event: &AssetScanEstimationEvent,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = event.asset_scan_estimation_id.as_str();
        let estimation = self.backend.get_asset_scan_estimation(id, None).await?;

        let Some(state) = estimation.state() else {
            debug!("AssetScanEstimation has no status, moving it to Pending");
            let patch = AssetScanEstimation {
                status: Some(AssetScanEstimationStatus::new(
                    AssetScanEstimationState::Pending,
                    AssetScanEstimationReason::Created,
                    None,
                )),
                ..Default::default()
            };
            self.backend.patch_asset_scan_estimation(id, patch).await?;
            return Ok(());
        };

        match state {
            AssetScanEstimationState::Pending => {
                self.reconcile_pending(event, &estimation).await
            }
            AssetScanEstimationState::Aborted => {
                info!("AssetScanEstimation was aborted");
                let patch = AssetScanEstimation {
                    status: Some(AssetScanEstimationStatus::with_message(
                        AssetScanEstimationState::Failed,
                        AssetScanEstimationReason::Aborted,
                        "asset scan estimation was aborted",
                    )),
                    ..Default::default()
                };
                self.backend.patch_asset_scan_estimation(id, patch).await?;
                Ok(())
            }
            AssetScanEstimationState::Done | AssetScanEstimationState::Failed => {
                self.reconcile_expiry(id, &estimation, now).await
            }
        }
    }

    async fn reconcile_pending(
        &self,
        event: &AssetScanEstimationEvent,
        estimation: &AssetScanEstimation,
    ) -> Result<()> {
        let asset = self.backend.get_asset(&event.asset_id).await?;
        let template = estimation.asset_scan_template.clone().unwrap_or_default();

        let start_time = Utc::now();
        let outcome = self.provider.estimate(&asset, &template).await;
        let end_time = Utc::now();

        let ttl = estimation
            .ttl_seconds_after_finished
            .unwrap_or_else(|| self.default_ttl());
        let mut patch = AssetScanEstimation {
            start_time: Some(start_time),
            end_time: Some(end_time),
            ttl_seconds_after_finished: Some(ttl),
            delete_after: Some(deadline_after(end_time, ttl)),
            ..Default::default()
        };

        match outcome {
            Ok(result) => {
                debug!(
                    duration = ?result.duration,
                    size = ?result.size,
                    cost = ?result.cost,
                    "Estimation finished"
                );
                patch.status = Some(AssetScanEstimationStatus::new(
                    AssetScanEstimationState::Done,
                    AssetScanEstimationReason::Success,
                    None,
                ));
                patch.estimation = Some(result);
            }
            Err(ProviderError::Fatal(message)) => {
                warn!(%message, "Estimation failed");
                patch.status = Some(AssetScanEstimationStatus::with_message(
                    AssetScanEstimationState::Failed,
                    AssetScanEstimationReason::Error,
                    message,
                ));
            }
            Err(ProviderError::Retryable { after, message }) => {
                return Err(Error::requeue_after(after, message));
            }
            Err(e) => return Err(e.into()),
        }

        self.backend
            .patch_asset_scan_estimation(&event.asset_scan_estimation_id, patch)
            .await?;
        Ok(())
    }

    async fn reconcile_expiry(
        &self,
        id: &str,
        estimation: &AssetScanEstimation,
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
                debug!(%delete_after, "Recording AssetScanEstimation deadline");
                let patch = AssetScanEstimation {
                    end_time: Some(end_time),
                    ttl_seconds_after_finished: Some(ttl_seconds),
                    delete_after: Some(delete_after),
                    ..Default::default()
                };
                self.backend.patch_asset_scan_estimation(id, patch).await?;
            }
            Expiry::Delete => {
                info!("AssetScanEstimation expired, deleting it");
                match self.backend.delete_asset_scan_estimation(id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!("AssetScanEstimation already deleted"),
                    Err(e) => return Err(e.into()),
                }
            }
            Expiry::Keep => debug!("AssetScanEstimation is not expired yet"),
        }
        Ok(())
    }
}

#[async_trait]
impl Discover<AssetScanEstimationEvent> for AssetScanEstimationWatcher {
    async fn get_items(&self) -> Result<Vec<AssetScanEstimationEvent>> {
        let filter = active_or_expired_filter("status/state", Utc::now());
        let params = ListParams::new()
            .with_filter(filter)
            .select("id,scanEstimation,asset")
            .count();
        let estimations = self.backend.get_asset_scan_estimations(params).await?;

        Ok(estimations
            .items
            .into_iter()
            .filter_map(|e| {
                let parent = e.scan_estimation.map(|r| r.id);
                let asset_id = e.asset.map(|r| r.id).unwrap_or_default();
                e.id
                    .map(|id| AssetScanEstimationEvent::new(id, parent, asset_id))
            })
            .collect())
    }
}

#[async_trait]
impl Reconcile<AssetScanEstimationEvent> for AssetScanEstimationWatcher {
    async fn reconcile(&self, event: AssetScanEstimationEvent) -> Result<()> {
        self.reconcile_at(&event, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use parking_lot::Mutex;
    use scan_api::MemoryBackend;
    use scan_api::models::{Asset, AssetInfo, AssetScanTemplate, Estimation, Reference};
    use scan_provider::{NoopProvider, ProviderKind, ScanJobConfig};
    use std::time::Duration;

    struct FailingEstimator(Mutex<ProviderError>);

    #[async_trait]
    impl Provider for FailingEstimator {
        fn kind(&self) -> ProviderKind {
            ProviderKind::External
        }

        async fn discover_assets(&self) -> scan_provider::Result<Vec<AssetInfo>> {
            Ok(Vec::new())
        }

        async fn run_asset_scan(&self, _config: &ScanJobConfig) -> scan_provider::Result<()> {
            Ok(())
        }

        async fn remove_asset_scan(&self, _config: &ScanJobConfig) -> scan_provider::Result<()> {
            Ok(())
        }

        async fn estimate(
            &self,
            _asset: &Asset,
            _template: &AssetScanTemplate,
        ) -> scan_provider::Result<Estimation> {
            Err(self.0.lock().clone())
        }
    }

    fn config() -> AssetScanEstimationWatcherConfig {
        AssetScanEstimationWatcherConfig {
            estimation_ttl: Duration::from_secs(120),
            ..Default::default()
        }
    }

    async fn insert(
        backend: &MemoryBackend,
        state: Option<AssetScanEstimationState>,
    ) -> AssetScanEstimationEvent {
        backend
            .post_asset(Asset {
                id: Some("vm-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let estimation = AssetScanEstimation {
            scan_estimation: Some(Reference::new("se-1")),
            asset: Some(Reference::new("vm-1")),
            status: state.map(|s| {
                AssetScanEstimationStatus::new(s, AssetScanEstimationReason::Created, None)
            }),
            ..Default::default()
        };
        let id = backend
            .post_asset_scan_estimation(estimation)
            .await
            .unwrap()
            .id
            .unwrap();
        AssetScanEstimationEvent::new(id, Some("se-1".to_string()), "vm-1")
    }

    #[test]
    fn test_event_labels() {
        let event = AssetScanEstimationEvent::new("ase-1", None, "a-1");
        assert_eq!(event.to_string(), "AssetScanEstimationID=ase-1 AssetID=a-1");
        let event = AssetScanEstimationEvent::new("ase-1", Some("se-1".to_string()), "a-1");
        assert_eq!(event.labels().get("ScanEstimationID"), Some("se-1"));
    }

    #[tokio::test]
    async fn test_pending_records_estimation() {
        let backend = Arc::new(MemoryBackend::new());
        let event = insert(&backend, Some(AssetScanEstimationState::Pending)).await;
        let watcher =
            AssetScanEstimationWatcher::new(backend.clone(), Arc::new(NoopProvider), config());

        watcher.reconcile_at(&event, Utc::now()).await.unwrap();

        let stored = backend
            .get_asset_scan_estimation(&event.asset_scan_estimation_id, None)
            .await
            .unwrap();
        assert_eq!(stored.state(), Some(AssetScanEstimationState::Done));
        assert!(stored.estimation.is_some());
        assert_eq!(stored.ttl_seconds_after_finished, Some(120));
        let end_time = stored.end_time.unwrap();
        assert_eq!(stored.delete_after, Some(end_time + TimeDelta::seconds(120)));
    }

    #[tokio::test]
    async fn test_missing_status_moves_to_pending() {
        let backend = Arc::new(MemoryBackend::new());
        let event = insert(&backend, None).await;
        let watcher =
            AssetScanEstimationWatcher::new(backend.clone(), Arc::new(NoopProvider), config());

        watcher.reconcile_at(&event, Utc::now()).await.unwrap();
        let stored = backend
            .get_asset_scan_estimation(&event.asset_scan_estimation_id, None)
            .await
            .unwrap();
        assert_eq!(stored.state(), Some(AssetScanEstimationState::Pending));
    }

    #[tokio::test]
    async fn test_provider_errors() {
        let backend = Arc::new(MemoryBackend::new());
        let event = insert(&backend, Some(AssetScanEstimationState::Pending)).await;
        let provider = Arc::new(FailingEstimator(Mutex::new(ProviderError::retryable(
            Duration::from_secs(5),
            "pricing unavailable",
        ))));
        let watcher = AssetScanEstimationWatcher::new(backend.clone(), provider.clone(), config());

        let err = watcher.reconcile_at(&event, Utc::now()).await.unwrap_err();
        assert_eq!(err.requeue_delay(), Some(Duration::from_secs(5)));

        *provider.0.lock() = ProviderError::other("boom");
        let err = watcher.reconcile_at(&event, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));

        *provider.0.lock() = ProviderError::fatal("unsupported asset type");
        watcher.reconcile_at(&event, Utc::now()).await.unwrap();
        let stored = backend
            .get_asset_scan_estimation(&event.asset_scan_estimation_id, None)
            .await
            .unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.state, AssetScanEstimationState::Failed);
        assert_eq!(status.message.as_deref(), Some("unsupported asset type"));
    }

    #[tokio::test]
    async fn test_aborted_becomes_failed() {
        let backend = Arc::new(MemoryBackend::new());
        let event = insert(&backend, Some(AssetScanEstimationState::Aborted)).await;
        let watcher =
            AssetScanEstimationWatcher::new(backend.clone(), Arc::new(NoopProvider), config());

        watcher.reconcile_at(&event, Utc::now()).await.unwrap();
        let status = backend
            .get_asset_scan_estimation(&event.asset_scan_estimation_id, None)
            .await
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.state, AssetScanEstimationState::Failed);
        assert_eq!(status.reason, AssetScanEstimationReason::Aborted);
    }

    #[tokio::test]
    async fn test_finished_estimation_is_deleted_after_ttl() {
        let backend = Arc::new(MemoryBackend::new());
        let event = insert(&backend, Some(AssetScanEstimationState::Done)).await;
        let watcher =
            AssetScanEstimationWatcher::new(backend.clone(), Arc::new(NoopProvider), config());
        let now = Utc::now();

        watcher.reconcile_at(&event, now).await.unwrap();
        assert!(watcher.get_items().await.unwrap().is_empty());

        watcher
            .reconcile_at(&event, now + TimeDelta::seconds(121))
            .await
            .unwrap();
        let err = backend
            .get_asset_scan_estimation(&event.asset_scan_estimation_id, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
