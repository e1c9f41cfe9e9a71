//! Turns ScanConfig schedules into Scans.
//!
//! Every reconciliation evaluates the config against a window of two poll
//! periods centred on now (see [`ScanConfigSchedule`]):
//!
//! - `Due`: a Scan is created unless one is already running for the config,
//!   then the operation time is advanced past the next window. A config
//!   without a cron line is consumed by its run and disabled.
//! - `Overdue`: the missed run is skipped and the operation time advanced.
//! - `Unscheduled`: nothing will ever run, the config is disabled.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use scan_api::filter::Filter;
use scan_api::models::{
    Reference, RuntimeScheduleScanConfig, Scan, ScanConfig, ScanReason, ScanState, ScanStatus,
};
use scan_api::{BackendClient, ListParams};
use tracing::{debug, info, warn};

use super::schedule::{OperationTime, ScanConfigSchedule, ScheduleState, ScheduleWindow};
use crate::common::{Discover, Reconcile, id_event};
use crate::config::ScanConfigWatcherConfig;
use crate::{Error, Result};

id_event!(
    /// Identifies one ScanConfig.
    ScanConfigEvent,
    scan_config_id,
    "ScanConfigID"
);

pub struct ScanConfigWatcher {
    backend: Arc<dyn BackendClient>,
    config: ScanConfigWatcherConfig,
}

impl ScanConfigWatcher {
    pub fn new(backend: Arc<dyn BackendClient>, config: ScanConfigWatcherConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ScanConfigWatcherConfig {
        &self.config
    }

    fn window_at(&self, now: DateTime<Utc>) -> Result<ScheduleWindow> {
        let size = TimeDelta::from_std(self.config.poll_period * 2)
            .map_err(|e| Error::config(format!("poll period out of range: {e}")))?;
        Ok(ScheduleWindow::new(now, size))
    }

    /// Reconciles the config as if the current time were `now`.
    pub async fn reconcile_at(
        &self,
        event: &ScanConfigEvent,
        now: DateTime<Utc>,
    ) -> Result<ScheduleState> {
        let id = event.scan_config_id.as_str();
        let scan_config = self.backend.get_scan_config(id, None).await?;

        let window = self.window_at(now)?;
        let schedule = ScanConfigSchedule::new(&scan_config, window)?;
        debug!(state = %schedule.state, %window, "Evaluated schedule");

        match (schedule.state, schedule.operation_time) {
            (ScheduleState::Disabled, _) => {
                debug!("ScanConfig is disabled");
            }
            (ScheduleState::NotDue, _) => {
                debug!("ScanConfig is not due yet");
            }
            (ScheduleState::Unscheduled, _) => {
                info!("ScanConfig has no future runs, disabling it");
                self.disable(id).await?;
            }
            (ScheduleState::Due, Some(operation_time)) => {
                self.create_scan(id, &scan_config, now).await?;
                if operation_time.is_recurring() {
                    self.reschedule(id, &scan_config, &operation_time, &window)
                        .await?;
                } else {
                    info!("One-off ScanConfig has run, disabling it");
                    self.disable(id).await?;
                }
            }
            (ScheduleState::Overdue, Some(operation_time)) => {
                warn!(
                    operation_time = %operation_time.time(),
                    "ScanConfig missed its schedule, skipping to the next run"
                );
                self.reschedule(id, &scan_config, &operation_time, &window)
                    .await?;
            }
            (state, None) => {
                return Err(Error::invalid(
                    "ScanConfig",
                    format!("schedule state {state} without operation time"),
                ));
            }
        }
        Ok(schedule.state)
    }

    /// Creates a Scan for the config unless an unfinished one already exists.
    async fn create_scan(
        &self,
        id: &str,
        scan_config: &ScanConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let filter = Filter::eq("scanConfig/id", id).and(Filter::not_in(
            "status/state",
            [ScanState::Done.to_string(), ScanState::Failed.to_string()],
        ));
        let params = ListParams::new()
            .with_filter(filter)
            .select("id")
            .count()
            .top(1);
        let running = self.backend.get_scans(params).await?;
        if running.count.unwrap_or(running.items.len()) > 0 {
            warn!("ScanConfig already has a running Scan, skipping");
            return Ok(());
        }

        let scan = new_scan_from_scan_config(id, scan_config, now);
        match self.backend.post_scan(scan).await {
            Ok(scan) => {
                info!(scan_id = scan.id.as_deref().unwrap_or(""), "Scan created");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("Scan already exists for ScanConfig");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn disable(&self, id: &str) -> Result<()> {
        let patch = ScanConfig {
            disabled: Some(true),
            ..Default::default()
        };
        self.backend.patch_scan_config(id, patch).await?;
        Ok(())
    }

    /// Stores the first operation time after the next window.
    async fn reschedule(
        &self,
        id: &str,
        scan_config: &ScanConfig,
        operation_time: &OperationTime,
        window: &ScheduleWindow,
    ) -> Result<()> {
        let next = operation_time.next_after(window.next().start());
        debug!(next = %next.time(), "Rescheduling ScanConfig");

        let patch = ScanConfig {
            scheduled: Some(RuntimeScheduleScanConfig {
                cron_line: scan_config.cron_line().map(str::to_string),
                operation_time: Some(next.time()),
            }),
            ..Default::default()
        };
        self.backend.patch_scan_config(id, patch).await?;
        Ok(())
    }
}

fn new_scan_from_scan_config(id: &str, scan_config: &ScanConfig, now: DateTime<Utc>) -> Scan {
    let template = scan_config.scan_template.clone().unwrap_or_default();
    let name = format!(
        "{}-{}",
        scan_config.name.as_deref().unwrap_or(id),
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    );

    Scan {
        name: Some(name),
        scan_config: Some(Reference::new(id)),
        scope: template.scope,
        max_parallel_scanners: template.max_parallel_scanners,
        asset_scan_template: template.asset_scan_template,
        status: Some(ScanStatus::new(ScanState::Pending, ScanReason::Created, None)),
        start_time: Some(now),
        ..Default::default()
    }
}

#[async_trait]
impl Discover<ScanConfigEvent> for ScanConfigWatcher {
    async fn get_items(&self) -> Result<Vec<ScanConfigEvent>> {
        let filter = Filter::is_null("disabled").or(Filter::eq("disabled", false));
        let params = ListParams::new().with_filter(filter).select("id").count();
        let configs = self.backend.get_scan_configs(params).await?;

        Ok(configs
            .items
            .into_iter()
            .filter_map(|c| c.id)
            .map(ScanConfigEvent::new)
            .collect())
    }
}

#[async_trait]
impl Reconcile<ScanConfigEvent> for ScanConfigWatcher {
    async fn reconcile(&self, event: ScanConfigEvent) -> Result<()> {
        self.reconcile_at(&event, Utc::now()).await.map(|_| ())
    }
}
