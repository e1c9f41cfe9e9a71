//! VM based asset scanning on top of low level infrastructure operations.
//!
//! # Run sequence
//!
//! 1. Create the scanner VM, concurrently with:
//!    snapshot the asset root volume, then copy the snapshot into the scanner
//!    location when the asset lives elsewhere.
//! 2. Create a volume from the snapshot in the scanner VM zone.
//! 3. Attach the volume to the scanner VM.
//!
//! Every step returns a retryable error until its resource is ready, so the
//! sequence resumes where it stopped on the next call. Resource names are
//! derived from the AssetScan id which makes each create call idempotent.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scan_api::models::{
    Asset, AssetInfo, AssetScanTemplate, CostBreakdownComponent, Estimation, VmInfo,
};
use tracing::{debug, trace};

use crate::error::{ProviderError, Result};
use crate::job::ScanJobConfig;
use crate::{Provider, ProviderKind};

/// How long to wait before checking a resource again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessDelays {
    pub instance: Duration,
    pub snapshot: Duration,
    pub volume: Duration,
    pub attachment: Duration,
}

impl Default for ReadinessDelays {
    fn default() -> Self {
        Self {
            instance: Duration::from_secs(120),
            snapshot: Duration::from_secs(120),
            volume: Duration::from_secs(60),
            attachment: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerVm {
    pub id: String,
    pub zone: String,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSnapshot {
    pub id: String,
    pub location: String,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: String,
    pub zone: String,
    pub ready: bool,
}

/// Low level infrastructure operations of one platform.
///
/// `create_*` calls return the existing resource when one with the same name
/// exists. `delete_*` calls return `true` once the resource is gone.
#[async_trait]
pub trait ScannerInfra: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Location scanner VMs are created in.
    fn scanner_location(&self) -> &str;

    async fn list_assets(&self) -> Result<Vec<AssetInfo>>;

    async fn create_scanner_vm(&self, name: &str, job: &ScanJobConfig) -> Result<ScannerVm>;
    async fn delete_scanner_vm(&self, name: &str) -> Result<bool>;

    async fn create_snapshot(&self, name: &str, asset: &VmInfo) -> Result<VolumeSnapshot>;
    async fn copy_snapshot(
        &self,
        name: &str,
        source: &VolumeSnapshot,
        location: &str,
    ) -> Result<VolumeSnapshot>;
    async fn delete_snapshot(&self, name: &str) -> Result<bool>;

    async fn create_volume(&self, name: &str, snapshot: &VolumeSnapshot, zone: &str)
    -> Result<Volume>;
    /// Attaches the volume and reports whether the attachment completed.
    async fn attach_volume(&self, volume: &Volume, vm: &ScannerVm) -> Result<bool>;
    async fn delete_volume(&self, name: &str) -> Result<bool>;

    async fn estimate(&self, asset: &Asset, template: &AssetScanTemplate) -> Result<Estimation>;
}

/// [`Provider`] driving the VM/snapshot/volume scan flow on a [`ScannerInfra`].
pub struct InfraScanner<I> {
    infra: I,
    delays: ReadinessDelays,
}

impl<I: ScannerInfra> InfraScanner<I> {
    pub fn new(infra: I) -> Self {
        Self {
            infra,
            delays: ReadinessDelays::default(),
        }
    }

    pub fn with_delays(mut self, delays: ReadinessDelays) -> Self {
        self.delays = delays;
        self
    }

    pub fn infra(&self) -> &I {
        &self.infra
    }

    async fn scanner_vm(&self, job: &ScanJobConfig) -> Result<ScannerVm> {
        let vm = self
            .infra
            .create_scanner_vm(&job.scanner_vm_name(), job)
            .await?;
        debug!(scanner_vm = %vm.id, ready = vm.ready, "Scanner VM");
        if !vm.ready {
            return Err(ProviderError::retryable(
                self.delays.instance,
                "scanner VM is not ready",
            ));
        }
        Ok(vm)
    }

    async fn scanner_snapshot(&self, job: &ScanJobConfig, asset: &VmInfo) -> Result<VolumeSnapshot> {
        let snapshot = self
            .infra
            .create_snapshot(&job.snapshot_name(), asset)
            .await?;
        debug!(snapshot = %snapshot.id, ready = snapshot.ready, "Asset volume snapshot");
        if !snapshot.ready {
            return Err(ProviderError::retryable(
                self.delays.snapshot,
                "asset volume snapshot is not ready",
            ));
        }

        let location = self.infra.scanner_location();
        if snapshot.location == location {
            return Ok(snapshot);
        }

        let copied = self
            .infra
            .copy_snapshot(&job.copied_snapshot_name(), &snapshot, location)
            .await?;
        debug!(snapshot = %copied.id, %location, ready = copied.ready, "Scanner volume snapshot");
        if !copied.ready {
            return Err(ProviderError::retryable(
                self.delays.snapshot,
                "scanner volume snapshot is not ready",
            ));
        }
        Ok(copied)
    }
}

#[async_trait]
impl<I: ScannerInfra> Provider for InfraScanner<I> {
    fn kind(&self) -> ProviderKind {
        self.infra.kind()
    }

    async fn discover_assets(&self) -> Result<Vec<AssetInfo>> {
        let assets = self.infra.list_assets().await?;
        debug!(assets = assets.len(), "Assets discovered");
        Ok(assets)
    }

    async fn run_asset_scan(&self, job: &ScanJobConfig) -> Result<()> {
        let asset = job.vm_info()?;

        let (vm, snapshot) = tokio::join!(self.scanner_vm(job), self.scanner_snapshot(job, asset));
        let (vm, snapshot) = match (vm, snapshot) {
            (Ok(vm), Ok(snapshot)) => (vm, snapshot),
            (vm, snapshot) => {
                let errors = [vm.err(), snapshot.err()].into_iter().flatten().collect();
                return Err(ProviderError::join(errors)
                    .unwrap_or_else(|| ProviderError::other("scanner setup failed")));
            }
        };

        let volume = self
            .infra
            .create_volume(&job.volume_name(), &snapshot, &vm.zone)
            .await?;
        debug!(volume = %volume.id, zone = %vm.zone, ready = volume.ready, "Scanner volume");
        if !volume.ready {
            return Err(ProviderError::retryable(
                self.delays.volume,
                format!("scanner volume is not ready: {}", volume.id),
            ));
        }

        let attached = self.infra.attach_volume(&volume, &vm).await?;
        if !attached {
            return Err(ProviderError::retryable(
                self.delays.attachment,
                format!("scanner volume is not attached yet: {}", volume.id),
            ));
        }

        debug!(asset_scan_id = %job.asset_scan_id, scanner_vm = %vm.id, "Scanner is ready");
        Ok(())
    }

    async fn remove_asset_scan(&self, job: &ScanJobConfig) -> Result<()> {
        job.vm_info()?;

        let vm_then_volume = async {
            if !self.infra.delete_scanner_vm(&job.scanner_vm_name()).await? {
                return Err(ProviderError::retryable(
                    self.delays.instance,
                    "deleting scanner VM is in progress",
                ));
            }
            if !self.infra.delete_volume(&job.volume_name()).await? {
                return Err(ProviderError::retryable(
                    self.delays.volume,
                    "deleting scanner volume is in progress",
                ));
            }
            Ok::<(), ProviderError>(())
        };
        let snapshots = async {
            let source = self.infra.delete_snapshot(&job.snapshot_name()).await?;
            let copy = self.infra.delete_snapshot(&job.copied_snapshot_name()).await?;
            if !(source && copy) {
                return Err(ProviderError::retryable(
                    self.delays.snapshot,
                    "deleting volume snapshots is in progress",
                ));
            }
            Ok::<(), ProviderError>(())
        };

        let (first, second) = tokio::join!(vm_then_volume, snapshots);
        let errors: Vec<ProviderError> = [first.err(), second.err()].into_iter().flatten().collect();
        match ProviderError::join(errors) {
            Some(err) => Err(err),
            None => {
                debug!(asset_scan_id = %job.asset_scan_id, "Scanner resources removed");
                Ok(())
            }
        }
    }

    async fn estimate(&self, asset: &Asset, template: &AssetScanTemplate) -> Result<Estimation> {
        self.infra.estimate(asset, template).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Creating(u32),
    Ready,
    Deleting,
}

#[derive(Debug)]
struct SimResource {
    location: String,
    phase: Phase,
    attached: bool,
}

/// In-memory platform where every resource becomes ready after a number of
/// readiness checks and disappears on the second delete call.
#[derive(Debug)]
pub struct SimulatedInfra {
    location: String,
    checks_until_ready: u32,
    resources: Mutex<HashMap<String, SimResource>>,
    inventory: Mutex<Vec<AssetInfo>>,
}

impl SimulatedInfra {
    pub fn new(location: impl Into<String>, checks_until_ready: u32) -> Self {
        Self {
            location: location.into(),
            checks_until_ready,
            resources: Mutex::new(HashMap::new()),
            inventory: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the assets reported by discovery.
    pub fn set_inventory(&self, assets: Vec<AssetInfo>) {
        *self.inventory.lock() = assets;
    }

    /// Names of the resources that currently exist.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Creates the resource or advances its readiness. Returns (location, ready).
    fn create(&self, name: &str, location: &str) -> (String, bool) {
        let mut resources = self.resources.lock();
        let resource = resources
            .entry(name.to_string())
            .or_insert_with(|| SimResource {
                location: location.to_string(),
                phase: Phase::Creating(0),
                attached: false,
            });

        resource.phase = match resource.phase {
            Phase::Creating(checks) if checks >= self.checks_until_ready => Phase::Ready,
            Phase::Creating(checks) => Phase::Creating(checks + 1),
            other => other,
        };
        trace!(name, phase = ?resource.phase, "Simulated resource");
        (resource.location.clone(), resource.phase == Phase::Ready)
    }

    fn delete(&self, name: &str) -> bool {
        let mut resources = self.resources.lock();
        match resources.get_mut(name) {
            None => true,
            Some(resource) if resource.phase == Phase::Deleting => {
                resources.remove(name);
                true
            }
            Some(resource) => {
                resource.phase = Phase::Deleting;
                false
            }
        }
    }
}

#[async_trait]
impl ScannerInfra for SimulatedInfra {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Simulated
    }

    fn scanner_location(&self) -> &str {
        &self.location
    }

    async fn list_assets(&self) -> Result<Vec<AssetInfo>> {
        Ok(self.inventory.lock().clone())
    }

    async fn create_scanner_vm(&self, name: &str, _job: &ScanJobConfig) -> Result<ScannerVm> {
        let (zone, ready) = self.create(name, &self.location);
        Ok(ScannerVm {
            id: name.to_string(),
            zone,
            ready,
        })
    }

    async fn delete_scanner_vm(&self, name: &str) -> Result<bool> {
        Ok(self.delete(name))
    }

    async fn create_snapshot(&self, name: &str, asset: &VmInfo) -> Result<VolumeSnapshot> {
        let (location, ready) = self.create(name, &asset.location);
        Ok(VolumeSnapshot {
            id: name.to_string(),
            location,
            ready,
        })
    }

    async fn copy_snapshot(
        &self,
        name: &str,
        _source: &VolumeSnapshot,
        location: &str,
    ) -> Result<VolumeSnapshot> {
        let (location, ready) = self.create(name, location);
        Ok(VolumeSnapshot {
            id: name.to_string(),
            location,
            ready,
        })
    }

    async fn delete_snapshot(&self, name: &str) -> Result<bool> {
        Ok(self.delete(name))
    }

    async fn create_volume(
        &self,
        name: &str,
        _snapshot: &VolumeSnapshot,
        zone: &str,
    ) -> Result<Volume> {
        let (zone, ready) = self.create(name, zone);
        Ok(Volume {
            id: name.to_string(),
            zone,
            ready,
        })
    }

    async fn attach_volume(&self, volume: &Volume, vm: &ScannerVm) -> Result<bool> {
        let mut resources = self.resources.lock();
        if !resources.contains_key(&vm.id) {
            return Err(ProviderError::other(format!("scanner VM {} does not exist", vm.id)));
        }
        let resource = resources
            .get_mut(&volume.id)
            .ok_or_else(|| ProviderError::other(format!("volume {} does not exist", volume.id)))?;
        // the first call starts the attachment, the second observes it
        let attached = resource.attached;
        resource.attached = true;
        Ok(attached)
    }

    async fn delete_volume(&self, name: &str) -> Result<bool> {
        Ok(self.delete(name))
    }

    async fn estimate(&self, asset: &Asset, template: &AssetScanTemplate) -> Result<Estimation> {
        let vm = asset
            .vm_info()
            .ok_or_else(|| ProviderError::fatal("only VM assets can be estimated"))?;
        let families = template
            .scan_families_config
            .as_ref()
            .map(|config| {
                [
                    config.sbom.as_ref(),
                    config.vulnerabilities.as_ref(),
                    config.exploits.as_ref(),
                    config.malware.as_ref(),
                    config.misconfigurations.as_ref(),
                    config.rootkits.as_ref(),
                    config.secrets.as_ref(),
                    config.info_finder.as_ref(),
                ]
                .into_iter()
                .flatten()
                .filter(|f| f.is_enabled())
                .count()
            })
            .unwrap_or(0) as u64;

        let size = u64::from(vm.root_volume.size_gb);
        // 10 seconds per GB per family plus VM boot time
        let duration = 120 + size * 10 * families.max(1);
        let snapshot_cost = size as f32 * 0.05;
        let compute_cost = duration as f32 / 3600.0 * 0.1;

        Ok(Estimation {
            cost: Some(snapshot_cost + compute_cost),
            size: Some(size),
            duration: Some(duration),
            cost_breakdown: Some(vec![
                CostBreakdownComponent {
                    operation: "Snapshot".to_string(),
                    cost: snapshot_cost,
                },
                CostBreakdownComponent {
                    operation: "ScannerInstance".to_string(),
                    cost: compute_cost,
                },
            ]),
        })
    }
}
