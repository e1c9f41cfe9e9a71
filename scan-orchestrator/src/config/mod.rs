//! Orchestrator configuration.
//!
//! Every watcher has its own config struct with a poll period and a reconcile
//! timeout plus the knobs specific to it. [`OrchestratorConfig::from_env_or_default`]
//! overlays `SCAN_ORCHESTRATOR_*` environment variables on the defaults.

use std::time::Duration;

use tracing::warn;

use crate::common::{ControlLoopConfig, DEFAULT_MAX_FANOUT};
use crate::{Error, Result};

const ENV_PREFIX: &str = "SCAN_ORCHESTRATOR_";

/// Default TTL of finished estimations.
pub const DEFAULT_ESTIMATION_TTL_SECONDS: u64 = 3600;

/// What happens to scanner resources once an AssetScan has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum DeleteJobPolicy {
    #[default]
    Always,
    OnSuccess,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfigWatcherConfig {
    pub poll_period: Duration,
    pub reconcile_timeout: Duration,
}

impl Default for ScanConfigWatcherConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(15),
            reconcile_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWatcherConfig {
    pub poll_period: Duration,
    pub reconcile_timeout: Duration,
    /// Scans running longer than this are failed.
    pub scan_timeout: Duration,
    /// Maximum concurrent AssetScan creations / abort patches.
    pub max_fanout: usize,
}

impl Default for ScanWatcherConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(15),
            reconcile_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(48 * 60 * 60),
            max_fanout: DEFAULT_MAX_FANOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetScanWatcherConfig {
    pub poll_period: Duration,
    pub reconcile_timeout: Duration,
    /// Grace period given to a scanner after its AssetScan was aborted.
    pub abort_timeout: Duration,
    pub delete_job_policy: DeleteJobPolicy,
    pub scanner_image: String,
    pub backend_address: String,
}

impl Default for AssetScanWatcherConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(15),
            reconcile_timeout: Duration::from_secs(5),
            abort_timeout: Duration::from_secs(10 * 60),
            delete_job_policy: DeleteJobPolicy::Always,
            scanner_image: "scan-cli:latest".to_string(),
            backend_address: "http://localhost:8888".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEstimationWatcherConfig {
    pub poll_period: Duration,
    pub reconcile_timeout: Duration,
    pub scan_estimation_timeout: Duration,
    /// TTL applied when an estimation carries none.
    pub estimation_ttl: Duration,
    pub max_fanout: usize,
}

impl Default for ScanEstimationWatcherConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(5),
            reconcile_timeout: Duration::from_secs(5),
            scan_estimation_timeout: Duration::from_secs(48 * 60 * 60),
            estimation_ttl: Duration::from_secs(DEFAULT_ESTIMATION_TTL_SECONDS),
            max_fanout: DEFAULT_MAX_FANOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetScanEstimationWatcherConfig {
    pub poll_period: Duration,
    pub reconcile_timeout: Duration,
    pub estimation_ttl: Duration,
}

impl Default for AssetScanEstimationWatcherConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(5),
            reconcile_timeout: Duration::from_secs(5),
            estimation_ttl: Duration::from_secs(DEFAULT_ESTIMATION_TTL_SECONDS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetScanProcessorConfig {
    pub poll_period: Duration,
    pub reconcile_timeout: Duration,
}

impl Default for AssetScanProcessorConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(5),
            reconcile_timeout: Duration::from_secs(60),
        }
    }
}

/// Periodic sync of the backend asset inventory with the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDiscovererConfig {
    pub enabled: bool,
    pub discovery_interval: Duration,
}

impl Default for AssetDiscovererConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discovery_interval: Duration::from_secs(120),
        }
    }
}

macro_rules! control_loop {
    ($($config:ty),+) => {
        $(
            impl $config {
                pub fn control_loop(&self) -> ControlLoopConfig {
                    ControlLoopConfig {
                        poll_period: self.poll_period,
                        reconcile_timeout: self.reconcile_timeout,
                    }
                }
            }
        )+
    };
}

control_loop!(
    ScanConfigWatcherConfig,
    ScanWatcherConfig,
    AssetScanWatcherConfig,
    ScanEstimationWatcherConfig,
    AssetScanEstimationWatcherConfig,
    AssetScanProcessorConfig
);

/// Configuration of every watcher run by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub scan_config_watcher: ScanConfigWatcherConfig,
    pub scan_watcher: ScanWatcherConfig,
    pub asset_scan_watcher: AssetScanWatcherConfig,
    pub scan_estimation_watcher: ScanEstimationWatcherConfig,
    pub asset_scan_estimation_watcher: AssetScanEstimationWatcherConfig,
    pub asset_scan_processor: AssetScanProcessorConfig,
    pub asset_discoverer: AssetDiscovererConfig,
}

impl OrchestratorConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Durations are integer seconds. Supported env vars (all prefixed with
    /// `SCAN_ORCHESTRATOR_`):
    /// - `SCAN_CONFIG_POLL_PERIOD`, `SCAN_CONFIG_RECONCILE_TIMEOUT`
    /// - `SCAN_POLL_PERIOD`, `SCAN_RECONCILE_TIMEOUT`, `SCAN_TIMEOUT`
    /// - `ASSET_SCAN_POLL_PERIOD`, `ASSET_SCAN_RECONCILE_TIMEOUT`, `ABORT_TIMEOUT`,
    ///   `DELETE_JOB_POLICY`, `SCANNER_IMAGE`, `BACKEND_ADDRESS`
    /// - `SCAN_ESTIMATION_POLL_PERIOD`, `SCAN_ESTIMATION_RECONCILE_TIMEOUT`,
    ///   `SCAN_ESTIMATION_TIMEOUT`
    /// - `ASSET_SCAN_ESTIMATION_POLL_PERIOD`, `ASSET_SCAN_ESTIMATION_RECONCILE_TIMEOUT`
    /// - `ASSET_SCAN_PROCESSOR_POLL_PERIOD`, `ASSET_SCAN_PROCESSOR_RECONCILE_TIMEOUT`
    /// - `DISCOVERY_ENABLED`, `DISCOVERY_INTERVAL`
    /// - `ESTIMATION_TTL`, `MAX_FANOUT`
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env_or_default`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        let c = &mut config.scan_config_watcher;
        env.secs("SCAN_CONFIG_POLL_PERIOD", &mut c.poll_period);
        env.secs("SCAN_CONFIG_RECONCILE_TIMEOUT", &mut c.reconcile_timeout);

        let c = &mut config.scan_watcher;
        env.secs("SCAN_POLL_PERIOD", &mut c.poll_period);
        env.secs("SCAN_RECONCILE_TIMEOUT", &mut c.reconcile_timeout);
        env.secs("SCAN_TIMEOUT", &mut c.scan_timeout);

        let c = &mut config.asset_scan_watcher;
        env.secs("ASSET_SCAN_POLL_PERIOD", &mut c.poll_period);
        env.secs("ASSET_SCAN_RECONCILE_TIMEOUT", &mut c.reconcile_timeout);
        env.secs("ABORT_TIMEOUT", &mut c.abort_timeout);
        env.parsed("DELETE_JOB_POLICY", &mut c.delete_job_policy);
        env.string("SCANNER_IMAGE", &mut c.scanner_image);
        env.string("BACKEND_ADDRESS", &mut c.backend_address);

        let c = &mut config.scan_estimation_watcher;
        env.secs("SCAN_ESTIMATION_POLL_PERIOD", &mut c.poll_period);
        env.secs("SCAN_ESTIMATION_RECONCILE_TIMEOUT", &mut c.reconcile_timeout);
        env.secs("SCAN_ESTIMATION_TIMEOUT", &mut c.scan_estimation_timeout);

        let c = &mut config.asset_scan_estimation_watcher;
        env.secs("ASSET_SCAN_ESTIMATION_POLL_PERIOD", &mut c.poll_period);
        env.secs("ASSET_SCAN_ESTIMATION_RECONCILE_TIMEOUT", &mut c.reconcile_timeout);

        let c = &mut config.asset_scan_processor;
        env.secs("ASSET_SCAN_PROCESSOR_POLL_PERIOD", &mut c.poll_period);
        env.secs("ASSET_SCAN_PROCESSOR_RECONCILE_TIMEOUT", &mut c.reconcile_timeout);

        let c = &mut config.asset_discoverer;
        env.parsed("DISCOVERY_ENABLED", &mut c.enabled);
        env.secs("DISCOVERY_INTERVAL", &mut c.discovery_interval);

        let mut ttl = config.scan_estimation_watcher.estimation_ttl;
        env.secs("ESTIMATION_TTL", &mut ttl);
        config.scan_estimation_watcher.estimation_ttl = ttl;
        config.asset_scan_estimation_watcher.estimation_ttl = ttl;

        let mut max_fanout = config.scan_watcher.max_fanout;
        env.parsed("MAX_FANOUT", &mut max_fanout);
        config.scan_watcher.max_fanout = max_fanout;
        config.scan_estimation_watcher.max_fanout = max_fanout;

        config
    }

    /// Rejects zero periods, timeouts and fan-out limits.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("scan config poll period", self.scan_config_watcher.poll_period),
            ("scan config reconcile timeout", self.scan_config_watcher.reconcile_timeout),
            ("scan poll period", self.scan_watcher.poll_period),
            ("scan reconcile timeout", self.scan_watcher.reconcile_timeout),
            ("scan timeout", self.scan_watcher.scan_timeout),
            ("asset scan poll period", self.asset_scan_watcher.poll_period),
            ("asset scan reconcile timeout", self.asset_scan_watcher.reconcile_timeout),
            ("scan estimation poll period", self.scan_estimation_watcher.poll_period),
            (
                "scan estimation reconcile timeout",
                self.scan_estimation_watcher.reconcile_timeout,
            ),
            ("scan estimation timeout", self.scan_estimation_watcher.scan_estimation_timeout),
            (
                "asset scan estimation poll period",
                self.asset_scan_estimation_watcher.poll_period,
            ),
            (
                "asset scan estimation reconcile timeout",
                self.asset_scan_estimation_watcher.reconcile_timeout,
            ),
            ("asset scan processor poll period", self.asset_scan_processor.poll_period),
            (
                "asset scan processor reconcile timeout",
                self.asset_scan_processor.reconcile_timeout,
            ),
            ("discovery interval", self.asset_discoverer.discovery_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }

        if self.scan_watcher.max_fanout == 0 || self.scan_estimation_watcher.max_fanout == 0 {
            return Err(Error::config("max fan-out must be greater than zero"));
        }
        if self.asset_scan_watcher.scanner_image.trim().is_empty() {
            return Err(Error::config("scanner image must not be empty"));
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<(String, String)> {
        let key = format!("{ENV_PREFIX}{name}");
        let value = (self.lookup)(&key)?;
        let value = value.trim().to_string();
        (!value.is_empty()).then_some((key, value))
    }

    fn secs(&self, name: &str, target: &mut Duration) {
        let Some((key, value)) = self.get(name) else {
            return;
        };
        match value.parse::<u64>() {
            Ok(secs) => *target = Duration::from_secs(secs),
            Err(e) => warn!(%key, %value, error = %e, "Ignoring invalid duration"),
        }
    }

    fn parsed<T>(&self, name: &str, target: &mut T)
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some((key, value)) = self.get(name) else {
            return;
        };
        match value.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(e) => warn!(%key, %value, error = %e, "Ignoring invalid value"),
        }
    }

    fn string(&self, name: &str, target: &mut String) {
        if let Some((_, value)) = self.get(name) {
            *target = value;
        }
    }
}
