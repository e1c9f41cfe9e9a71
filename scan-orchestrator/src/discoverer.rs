//! Keeps the backend asset inventory in sync with the provider.
//!
//! Each run posts every asset the provider reports with `firstSeen` and
//! `lastSeen` set to the run time. Assets that already exist are refreshed
//! instead. Afterwards every asset that was not seen by this run gets
//! `terminatedOn`, which removes it from the scope of new Scans.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use scan_api::filter::Filter;
use scan_api::models::{Asset, AssetInfo, ContainerImageInfo};
use scan_api::{BackendClient, ListParams};
use scan_provider::Provider;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AssetDiscovererConfig;
use crate::{Error, Result};

/// Counts of one discovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub created: usize,
    pub updated: usize,
    pub terminated: usize,
}

pub struct AssetDiscoverer {
    backend: Arc<dyn BackendClient>,
    provider: Arc<dyn Provider>,
    config: AssetDiscovererConfig,
}

impl AssetDiscoverer {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        provider: Arc<dyn Provider>,
        config: AssetDiscovererConfig,
    ) -> Self {
        Self {
            backend,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &AssetDiscovererConfig {
        &self.config
    }

    /// Runs one discovery as if the current time were `now`.
    ///
    /// Failures on single assets do not stop the run; they are reported
    /// together once every asset was handled.
    pub async fn discover_at(&self, now: DateTime<Utc>) -> Result<DiscoveryReport> {
        let discovered = self.provider.discover_assets().await?;
        debug!(count = discovered.len(), "Provider reported assets");

        let mut report = DiscoveryReport::default();
        let mut errors: Vec<Error> = Vec::new();
        // Assets whose refresh failed keep their old lastSeen and must not be terminated.
        let mut failed_refresh = HashSet::new();

        for info in &discovered {
            let asset = Asset {
                asset_info: Some(info.clone()),
                first_seen: Some(now),
                last_seen: Some(now),
                ..Default::default()
            };
            let id = match self.backend.post_asset(asset).await {
                Ok(_) => {
                    report.created += 1;
                    continue;
                }
                Err(e) => match e.conflicting_id() {
                    Some(id) => id.to_string(),
                    None => {
                        errors.push(e.into());
                        continue;
                    }
                },
            };
            match self.refresh(&id, info, now).await {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    warn!(asset_id = %id, error = %e, "Failed to refresh asset");
                    failed_refresh.insert(id);
                    errors.push(e);
                }
            }
        }

        let filter = Filter::is_null("terminatedOn")
            .and(Filter::is_null("lastSeen").or(Filter::lt("lastSeen", now)).group());
        let params = ListParams::new().with_filter(filter).select("id");
        let stale = self.backend.get_assets(params).await?;
        let total = discovered.len() + stale.items.len();

        for id in stale.items.into_iter().filter_map(|a| a.id) {
            if failed_refresh.contains(&id) {
                continue;
            }
            let patch = Asset {
                terminated_on: Some(now),
                ..Default::default()
            };
            match self.backend.patch_asset(&id, patch).await {
                Ok(()) => {
                    debug!(asset_id = %id, "Asset terminated");
                    report.terminated += 1;
                }
                Err(e) => errors.push(e.into()),
            }
        }

        let failed = errors.len();
        match errors.into_iter().next() {
            None => Ok(report),
            Some(first) => Err(Error::FanOut {
                action: "sync",
                kind: "Asset",
                failed,
                total,
                first: Box::new(first),
            }),
        }
    }

    async fn refresh(&self, id: &str, info: &AssetInfo, now: DateTime<Utc>) -> Result<()> {
        let existing = self.backend.get_asset(id).await?;
        let patch = Asset {
            asset_info: Some(merge_asset_info(existing.asset_info, info.clone())),
            last_seen: Some(now),
            ..Default::default()
        };
        self.backend.patch_asset(id, patch).await?;
        Ok(())
    }

    /// Runs discovery every interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.discovery_interval;
        info!(?interval, provider = %self.provider.kind(), "Asset discoverer started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.discover_at(Utc::now()) => match result {
                    Ok(report) => info!(
                        created = report.created,
                        updated = report.updated,
                        terminated = report.terminated,
                        "Asset discovery finished"
                    ),
                    Err(e) => error!(error = %e, "Asset discovery failed"),
                },
            }
        }

        debug!("Asset discoverer stopped");
    }
}

/// Combines the stored description of an asset with a fresh one.
///
/// Container images accumulate every repo tag they were seen with; other
/// assets take the fresh description.
fn merge_asset_info(existing: Option<AssetInfo>, fresh: AssetInfo) -> AssetInfo {
    match (existing, fresh) {
        (Some(AssetInfo::ContainerImage(old)), AssetInfo::ContainerImage(new)) => {
            let mut tags: Vec<String> = old
                .repo_tags
                .into_iter()
                .chain(new.repo_tags)
                .flatten()
                .collect();
            tags.sort();
            tags.dedup();
            AssetInfo::ContainerImage(ContainerImageInfo {
                image_id: new.image_id,
                repo_tags: (!tags.is_empty()).then_some(tags),
                size: new.size.or(old.size),
            })
        }
        (_, fresh) => fresh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scan_api::MemoryBackend;
    use scan_api::models::VmInfo;
    use scan_provider::{InfraScanner, SimulatedInfra};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 17, h, m, 0).unwrap()
    }

    fn vm(instance_id: &str) -> AssetInfo {
        AssetInfo::Vm(VmInfo {
            instance_id: instance_id.to_string(),
            location: "eu-west-1".to_string(),
            ..Default::default()
        })
    }

    fn image(tags: &[&str]) -> AssetInfo {
        AssetInfo::ContainerImage(ContainerImageInfo {
            image_id: "sha256:abc".to_string(),
            repo_tags: Some(tags.iter().map(|t| t.to_string()).collect()),
            size: None,
        })
    }

    fn discoverer(
        backend: Arc<MemoryBackend>,
        infra: SimulatedInfra,
    ) -> (AssetDiscoverer, Arc<InfraScanner<SimulatedInfra>>) {
        let provider = Arc::new(InfraScanner::new(infra));
        let discoverer =
            AssetDiscoverer::new(backend, provider.clone(), AssetDiscovererConfig::default());
        (discoverer, provider)
    }

    #[tokio::test]
    async fn test_discovery_creates_refreshes_and_terminates() {
        let backend = Arc::new(MemoryBackend::new());
        let infra = SimulatedInfra::new("eu-west-1", 0);
        infra.set_inventory(vec![vm("i-1"), vm("i-2")]);
        let (discoverer, provider) = discoverer(backend.clone(), infra);

        let report = discoverer.discover_at(at(11, 0)).await.unwrap();
        assert_eq!(
            report,
            DiscoveryReport {
                created: 2,
                ..Default::default()
            }
        );

        provider.infra().set_inventory(vec![vm("i-1")]);
        let report = discoverer.discover_at(at(11, 2)).await.unwrap();
        assert_eq!(
            report,
            DiscoveryReport {
                created: 0,
                updated: 1,
                terminated: 1,
            }
        );

        let assets = backend.get_assets(ListParams::new()).await.unwrap().items;
        assert_eq!(assets.len(), 2);
        for asset in assets {
            let instance_id = asset.vm_info().map(|v| v.instance_id.clone());
            match instance_id.as_deref() {
                Some("i-1") => {
                    assert_eq!(asset.first_seen, Some(at(11, 0)));
                    assert_eq!(asset.last_seen, Some(at(11, 2)));
                    assert!(asset.terminated_on.is_none());
                }
                Some("i-2") => assert_eq!(asset.terminated_on, Some(at(11, 2))),
                other => panic!("unexpected asset {other:?}"),
            }
        }

        // Already terminated assets are left alone.
        let report = discoverer.discover_at(at(11, 4)).await.unwrap();
        assert_eq!(report.terminated, 0);
    }

    #[test]
    fn test_container_image_tags_accumulate() {
        let merged = merge_asset_info(
            Some(image(&["app:1", "app:latest"])),
            image(&["app:2", "app:latest"]),
        );
        let AssetInfo::ContainerImage(info) = merged else {
            panic!("expected a container image");
        };
        assert_eq!(
            info.repo_tags,
            Some(vec!["app:1".to_string(), "app:2".to_string(), "app:latest".to_string()])
        );

        assert_eq!(merge_asset_info(Some(vm("i-1")), vm("i-2")), vm("i-2"));
        assert_eq!(merge_asset_info(None, image(&[])), image(&[]));
    }

    #[tokio::test]
    async fn test_refreshed_image_keeps_old_tags() {
        let backend = Arc::new(MemoryBackend::new());
        let infra = SimulatedInfra::new("eu-west-1", 0);
        infra.set_inventory(vec![image(&["app:1"])]);
        let (discoverer, provider) = discoverer(backend.clone(), infra);

        discoverer.discover_at(at(11, 0)).await.unwrap();
        provider.infra().set_inventory(vec![image(&["app:2"])]);
        discoverer.discover_at(at(11, 2)).await.unwrap();

        let assets = backend.get_assets(ListParams::new()).await.unwrap().items;
        assert_eq!(assets.len(), 1);
        let Some(AssetInfo::ContainerImage(info)) = &assets[0].asset_info else {
            panic!("expected a container image");
        };
        assert_eq!(
            info.repo_tags.as_deref(),
            Some(&["app:1".to_string(), "app:2".to_string()][..])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_discovers_until_cancelled() {
        let backend = Arc::new(MemoryBackend::new());
        let infra = SimulatedInfra::new("eu-west-1", 0);
        infra.set_inventory(vec![vm("i-1")]);
        let (discoverer, _provider) = discoverer(backend.clone(), infra);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Arc::new(discoverer).run(cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();

        let assets = backend.get_assets(ListParams::new()).await.unwrap().items;
        assert_eq!(assets.len(), 1);
    }
}
