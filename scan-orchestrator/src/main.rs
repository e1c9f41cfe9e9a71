use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use scan_api::filter::Filter;
use scan_api::models::AssetInfo;
use scan_api::{BackendClient, ListParams, MemoryBackend, Snapshot};
use scan_orchestrator::{Orchestrator, OrchestratorConfig, logging};
use scan_provider::{InfraScanner, NoopProvider, Provider, SimulatedInfra};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderChoice {
    /// Every provider call succeeds immediately, asset discovery is off
    Noop,
    /// In-memory scanner VMs, snapshots and volumes. The inventory starts
    /// with the active assets of the loaded state
    Simulated,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend snapshot (JSON) to load on startup
    #[arg(long, env = "SCAN_ORCHESTRATOR_STATE")]
    state: Option<PathBuf>,

    /// Write the backend snapshot (JSON) here on shutdown
    #[arg(long)]
    dump_state: Option<PathBuf>,

    /// Directory for rotated log files
    #[arg(long, env = "SCAN_ORCHESTRATOR_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log filter directive, overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,

    /// Provider used to provision asset scans
    #[arg(long, value_enum, default_value_t = ProviderChoice::Noop)]
    provider: ProviderChoice,

    /// Location of the simulated scanner VMs
    #[arg(long, default_value = "local-1")]
    scanner_location: String,
}

fn load_state(path: &Path) -> anyhow::Result<MemoryBackend> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid state file {}", path.display()))?;
    Ok(MemoryBackend::from_snapshot(snapshot)?)
}

fn dump_state(backend: &MemoryBackend, path: &Path) -> anyhow::Result<()> {
    let snapshot = backend.snapshot()?;
    let raw = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, raw)
        .with_context(|| format!("Failed to write state file {}", path.display()))?;
    Ok(())
}

/// Descriptions of the assets that are not terminated.
async fn active_inventory(backend: &MemoryBackend) -> anyhow::Result<Vec<AssetInfo>> {
    let params = ListParams::new().with_filter(Filter::is_null("terminatedOn"));
    let assets = backend.get_assets(params).await?;
    Ok(assets.items.into_iter().filter_map(|a| a.asset_info).collect())
}

fn build_provider(
    choice: ProviderChoice,
    location: &str,
    inventory: Vec<AssetInfo>,
) -> Arc<dyn Provider> {
    match choice {
        ProviderChoice::Noop => Arc::new(NoopProvider),
        ProviderChoice::Simulated => {
            let infra = SimulatedInfra::new(location, 2);
            infra.set_inventory(inventory);
            Arc::new(InfraScanner::new(infra))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (log_handle, _guard) =
        logging::init_logging(args.log_dir.as_deref(), args.log_filter.as_deref())?;

    let mut config = OrchestratorConfig::from_env_or_default();
    config.validate()?;
    if args.provider == ProviderChoice::Noop {
        // An empty inventory would terminate every loaded asset.
        config.asset_discoverer.enabled = false;
    }

    let backend = match &args.state {
        Some(path) => {
            let backend = load_state(path)?;
            info!(path = %path.display(), "Loaded backend state");
            Arc::new(backend)
        }
        None => Arc::new(MemoryBackend::new()),
    };
    let inventory = active_inventory(&backend).await?;
    let provider = build_provider(args.provider, &args.scanner_location, inventory);

    let cancel = CancellationToken::new();
    log_handle.start_retention_cleanup(cancel.clone());

    let orchestrator = Orchestrator::new(config, backend.clone(), provider);
    orchestrator.start(&cancel)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    orchestrator.shutdown().await?;
    cancel.cancel();

    if let Some(path) = &args.dump_state {
        dump_state(&backend, path)?;
        info!(path = %path.display(), "Backend state written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_api::models::{Asset, ScanConfig};

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "scan-orchestrator",
            "--state",
            "in.json",
            "--provider",
            "simulated",
        ]);
        assert_eq!(args.state.as_deref(), Some(Path::new("in.json")));
        assert_eq!(args.provider, ProviderChoice::Simulated);
        assert!(args.dump_state.is_none());

        let args = Args::parse_from(["scan-orchestrator"]);
        assert_eq!(args.provider, ProviderChoice::Noop);
    }

    #[test]
    fn test_state_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");

        let snapshot = Snapshot {
            scan_configs: vec![ScanConfig {
                id: Some("sc-1".into()),
                name: Some("nightly".into()),
                ..Default::default()
            }],
            assets: vec![Asset {
                id: Some("vm-1".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        std::fs::write(&input, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let backend = load_state(&input).unwrap();
        dump_state(&backend, &output).unwrap();

        let written: Snapshot =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written.scan_configs.len(), 1);
        assert_eq!(written.scan_configs[0].name.as_deref(), Some("nightly"));
        assert_eq!(written.assets.len(), 1);
    }

    #[test]
    fn test_load_state_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(&dir.path().join("missing.json")).is_err());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(load_state(&bad).is_err());
    }

    #[tokio::test]
    async fn test_build_provider() {
        use scan_api::models::VmInfo;
        use scan_provider::ProviderKind;

        let vm = AssetInfo::Vm(VmInfo {
            instance_id: "i-1".into(),
            location: "x".into(),
            ..Default::default()
        });
        let noop = build_provider(ProviderChoice::Noop, "x", vec![vm.clone()]);
        assert_eq!(noop.kind(), ProviderKind::Noop);
        assert!(noop.discover_assets().await.unwrap().is_empty());

        let simulated = build_provider(ProviderChoice::Simulated, "x", vec![vm.clone()]);
        assert_eq!(simulated.kind(), ProviderKind::Simulated);
        assert_eq!(simulated.discover_assets().await.unwrap(), vec![vm]);
    }

    #[tokio::test]
    async fn test_active_inventory_skips_terminated_assets() {
        use chrono::Utc;
        use scan_api::models::VmInfo;

        let vm = |id: &str| {
            AssetInfo::Vm(VmInfo {
                instance_id: id.into(),
                location: "x".into(),
                ..Default::default()
            })
        };
        let backend = MemoryBackend::new();
        for (id, terminated) in [("i-1", None), ("i-2", Some(Utc::now()))] {
            backend
                .post_asset(Asset {
                    asset_info: Some(vm(id)),
                    terminated_on: terminated,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        assert_eq!(active_inventory(&backend).await.unwrap(), vec![vm("i-1")]);
    }
}
