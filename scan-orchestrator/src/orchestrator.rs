//! Wires every watcher to one backend and provider.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scan_api::BackendClient;
use scan_provider::Provider;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::common::spawn_control_loop;
use crate::config::OrchestratorConfig;
use crate::discoverer::AssetDiscoverer;
use crate::watcher::{
    AssetScanEstimationWatcher, AssetScanProcessor, AssetScanWatcher, ScanConfigWatcher,
    ScanEstimationWatcher, ScanWatcher,
};
use crate::{Error, Result};

/// Default time to wait for the watchers to stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct Running {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// Runs the poller and reconciler of every watcher, plus the asset discoverer.
pub struct Orchestrator {
    config: OrchestratorConfig,
    backend: Arc<dyn BackendClient>,
    provider: Arc<dyn Provider>,
    running: Mutex<Option<Running>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn BackendClient>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            config,
            backend,
            provider,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Number of spawned tasks that have not finished yet.
    pub fn task_count(&self) -> usize {
        self.running.lock().as_ref().map_or(0, |r| r.tasks.len())
    }

    /// Spawns every watcher. They stop when `cancel` fires or on [`Orchestrator::shutdown`].
    pub fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::validation("orchestrator is already running"));
        }

        let cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        let config = &self.config;

        let scan_config = ScanConfigWatcher::new(
            self.backend.clone(),
            config.scan_config_watcher.clone(),
        );
        spawn_control_loop(
            "ScanConfigWatcher",
            Arc::new(scan_config),
            config.scan_config_watcher.control_loop(),
            &cancel,
            &mut tasks,
        );

        let scan = ScanWatcher::new(self.backend.clone(), config.scan_watcher.clone());
        spawn_control_loop(
            "ScanWatcher",
            Arc::new(scan),
            config.scan_watcher.control_loop(),
            &cancel,
            &mut tasks,
        );

        let asset_scan = AssetScanWatcher::new(
            self.backend.clone(),
            self.provider.clone(),
            config.asset_scan_watcher.clone(),
        );
        spawn_control_loop(
            "AssetScanWatcher",
            Arc::new(asset_scan),
            config.asset_scan_watcher.control_loop(),
            &cancel,
            &mut tasks,
        );

        let scan_estimation = ScanEstimationWatcher::new(
            self.backend.clone(),
            config.scan_estimation_watcher.clone(),
        );
        spawn_control_loop(
            "ScanEstimationWatcher",
            Arc::new(scan_estimation),
            config.scan_estimation_watcher.control_loop(),
            &cancel,
            &mut tasks,
        );

        let asset_scan_estimation = AssetScanEstimationWatcher::new(
            self.backend.clone(),
            self.provider.clone(),
            config.asset_scan_estimation_watcher.clone(),
        );
        spawn_control_loop(
            "AssetScanEstimationWatcher",
            Arc::new(asset_scan_estimation),
            config.asset_scan_estimation_watcher.control_loop(),
            &cancel,
            &mut tasks,
        );

        let processor = AssetScanProcessor::new(
            self.backend.clone(),
            config.asset_scan_processor.clone(),
        );
        spawn_control_loop(
            "AssetScanProcessor",
            Arc::new(processor),
            config.asset_scan_processor.control_loop(),
            &cancel,
            &mut tasks,
        );

        if config.asset_discoverer.enabled {
            let discoverer = Arc::new(AssetDiscoverer::new(
                self.backend.clone(),
                self.provider.clone(),
                config.asset_discoverer.clone(),
            ));
            tasks.spawn(
                discoverer
                    .run(cancel.clone())
                    .instrument(info_span!("discoverer")),
            );
        }

        info!(provider = %self.provider.kind(), tasks = tasks.len(), "Orchestrator started");
        *running = Some(Running { cancel, tasks });
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Cancels every watcher and waits for them, aborting whatever is left after `timeout`.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        let Some(Running { cancel, mut tasks }) = self.running.lock().take() else {
            return Ok(());
        };
        info!(?timeout, "Shutting down orchestrator");
        cancel.cancel();

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Watcher task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = tasks.len(), "Shutdown timeout reached, aborting watchers");
            tasks.shutdown().await;
        }
        info!("Orchestrator stopped");
        Ok(())
    }
}
