//! Turns the findings reported by finished AssetScans into Finding and
//! AssetFinding rows and keeps the asset summary current.
//!
//! Every done scan family is processed on its own: its findings are upserted,
//! older asset findings of the same type are invalidated and the asset
//! summary counter for that type is recomputed. `findingsProcessed` is set
//! last, so a failed run is repeated in full on the next poll.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scan_api::filter::Filter;
use scan_api::models::{
    Asset, AssetFinding, AssetScan, AssetScanState, FamilyScan, Finding, FindingInfo,
    FindingKind, FindingsSummary, Reference, VulnerabilitySeverity,
    VulnerabilitySeveritySummary,
};
use scan_api::{BackendClient, ListParams};
use tracing::{debug, info};

use crate::common::{Discover, Reconcile, id_event};
use crate::config::AssetScanProcessorConfig;
use crate::{Error, Result};

id_event!(
    /// Identifies one finished AssetScan whose findings are not yet processed.
    AssetScanResultEvent,
    asset_scan_id,
    "AssetScanID"
);

pub struct AssetScanProcessor {
    backend: Arc<dyn BackendClient>,
    config: AssetScanProcessorConfig,
}

impl AssetScanProcessor {
    pub fn new(backend: Arc<dyn BackendClient>, config: AssetScanProcessorConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &AssetScanProcessorConfig {
        &self.config
    }

    pub async fn process(&self, event: &AssetScanResultEvent) -> Result<()> {
        let id = event.asset_scan_id.as_str();
        let asset_scan = self.backend.get_asset_scan(id, None).await?;

        if asset_scan.findings_processed == Some(true) {
            debug!("Findings already processed");
            return Ok(());
        }
        let Some(status) = asset_scan.status.as_ref() else {
            return Err(Error::invalid("AssetScan", format!("status is missing. AssetScanID={id}")));
        };
        if !status.state.is_terminal() {
            debug!(state = %status.state, "AssetScan is still running");
            return Ok(());
        }
        let Some(asset_id) = asset_scan.asset_id() else {
            return Err(Error::invalid("AssetScan", format!("asset is missing. AssetScanID={id}")));
        };
        let completed = status.last_transition_time;

        let mut processed = 0;
        for (kind, findings) in findings_by_kind(&asset_scan) {
            self.reconcile_findings(id, asset_id, kind, findings, completed)
                .await?;
            processed += 1;
        }

        let patch = AssetScan {
            findings_processed: Some(true),
            ..Default::default()
        };
        self.backend.patch_asset_scan(id, patch).await?;
        info!(families = processed, "AssetScan findings processed");
        Ok(())
    }

    async fn reconcile_findings(
        &self,
        asset_scan_id: &str,
        asset_id: &str,
        kind: FindingKind,
        findings: Vec<FindingInfo>,
        completed: DateTime<Utc>,
    ) -> Result<()> {
        let count = findings.len();
        for info in findings {
            let finding_id = self.upsert_finding(info, asset_scan_id, completed).await?;
            self.upsert_asset_finding(asset_id, &finding_id, completed)
                .await?;
        }
        let invalidated = self
            .invalidate_older_asset_findings(kind, asset_id, completed)
            .await?;
        debug!(%kind, count, invalidated, "Findings reconciled");

        self.update_asset_summary(kind, asset_id).await
    }

    async fn upsert_finding(
        &self,
        info: FindingInfo,
        asset_scan_id: &str,
        completed: DateTime<Utc>,
    ) -> Result<String> {
        let finding = Finding {
            finding_info: Some(info.clone()),
            first_seen: Some(completed),
            last_seen: Some(completed),
            last_seen_by: Some(Reference::new(asset_scan_id)),
            ..Default::default()
        };
        let id = match self.backend.post_finding(finding).await {
            Ok(created) => {
                return created
                    .id
                    .ok_or_else(|| Error::invalid("Finding", "created finding has no id"));
            }
            Err(e) => match e.conflicting_id() {
                Some(id) => id.to_string(),
                None => return Err(e.into()),
            },
        };

        let older = seen_before(&id, completed);
        let stale = self
            .backend
            .get_findings(ListParams::new().with_filter(older).select("id"))
            .await?;
        if !stale.items.is_empty() {
            let patch = Finding {
                finding_info: Some(info),
                last_seen: Some(completed),
                last_seen_by: Some(Reference::new(asset_scan_id)),
                ..Default::default()
            };
            self.backend.patch_finding(&id, patch).await?;
        }
        Ok(id)
    }

    async fn upsert_asset_finding(
        &self,
        asset_id: &str,
        finding_id: &str,
        completed: DateTime<Utc>,
    ) -> Result<()> {
        let asset_finding = AssetFinding {
            asset: Some(Reference::new(asset_id)),
            finding: Some(Reference::new(finding_id)),
            first_seen: Some(completed),
            last_seen: Some(completed),
            ..Default::default()
        };
        let id = match self.backend.post_asset_finding(asset_finding).await {
            Ok(_) => return Ok(()),
            Err(e) => match e.conflicting_id() {
                Some(id) => id.to_string(),
                None => return Err(e.into()),
            },
        };

        let stale = self
            .backend
            .get_asset_findings(
                ListParams::new()
                    .with_filter(seen_before(&id, completed))
                    .select("id"),
            )
            .await?;
        if !stale.items.is_empty() {
            let patch = AssetFinding {
                last_seen: Some(completed),
                ..Default::default()
            };
            self.backend.patch_asset_finding(&id, patch).await?;
        }
        Ok(())
    }

    /// Invalidates the asset findings of `kind` this scan no longer reported,
    /// unless a scan older than this one already invalidated them.
    async fn invalidate_older_asset_findings(
        &self,
        kind: FindingKind,
        asset_id: &str,
        completed: DateTime<Utc>,
    ) -> Result<usize> {
        let filter = of_kind_on_asset(kind, asset_id)
            .and(Filter::lt("lastSeen", completed))
            .and(
                Filter::gt("invalidatedOn", completed)
                    .or(Filter::is_null("invalidatedOn"))
                    .group(),
            );
        let stale = self
            .backend
            .get_asset_findings(ListParams::new().with_filter(filter).select("id"))
            .await?;

        let mut invalidated = 0;
        for id in stale.items.into_iter().filter_map(|af| af.id) {
            let patch = AssetFinding {
                invalidated_on: Some(completed),
                ..Default::default()
            };
            self.backend.patch_asset_finding(&id, patch).await?;
            invalidated += 1;
        }
        Ok(invalidated)
    }

    async fn update_asset_summary(&self, kind: FindingKind, asset_id: &str) -> Result<()> {
        let asset = self.backend.get_asset(asset_id).await?;
        let mut summary = asset.summary.unwrap_or_default();

        if kind == FindingKind::Vulnerability {
            summary.total_vulnerabilities = self.count_active_vulnerabilities(asset_id).await?;
        } else {
            let active = self.count_active(of_kind_on_asset(kind, asset_id)).await?;
            if let Some(counter) = summary_counter(&mut summary, kind) {
                *counter = active;
            }
        }

        let patch = Asset {
            summary: Some(summary),
            ..Default::default()
        };
        self.backend.patch_asset(asset_id, patch).await?;
        Ok(())
    }

    async fn count_active_vulnerabilities(
        &self,
        asset_id: &str,
    ) -> Result<VulnerabilitySeveritySummary> {
        let mut totals = VulnerabilitySeveritySummary::default();
        for severity in [
            VulnerabilitySeverity::Critical,
            VulnerabilitySeverity::High,
            VulnerabilitySeverity::Medium,
            VulnerabilitySeverity::Low,
            VulnerabilitySeverity::Negligible,
        ] {
            let filter = of_kind_on_asset(FindingKind::Vulnerability, asset_id)
                .and(Filter::eq("finding/findingInfo/severity", severity.to_string()));
            let active = self.count_active(filter).await?;
            let counter = match severity {
                VulnerabilitySeverity::Critical => &mut totals.total_critical_vulnerabilities,
                VulnerabilitySeverity::High => &mut totals.total_high_vulnerabilities,
                VulnerabilitySeverity::Medium => &mut totals.total_medium_vulnerabilities,
                VulnerabilitySeverity::Low => &mut totals.total_low_vulnerabilities,
                VulnerabilitySeverity::Negligible => &mut totals.total_negligible_vulnerabilities,
            };
            *counter = active;
        }
        Ok(totals)
    }

    async fn count_active(&self, filter: Filter) -> Result<u32> {
        let params = ListParams::new()
            .with_filter(filter.and(Filter::is_null("invalidatedOn")))
            .select("id")
            .top(1)
            .count();
        let response = self.backend.get_asset_findings(params).await?;
        let count = response.count.unwrap_or(response.items.len());
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

/// `id eq X and (lastSeen eq null or lastSeen lt T)`
fn seen_before(id: &str, completed: DateTime<Utc>) -> Filter {
    Filter::eq("id", id).and(
        Filter::is_null("lastSeen")
            .or(Filter::lt("lastSeen", completed))
            .group(),
    )
}

fn of_kind_on_asset(kind: FindingKind, asset_id: &str) -> Filter {
    Filter::eq("finding/findingInfo/objectType", kind.to_string())
        .and(Filter::eq("asset/id", asset_id))
}

fn summary_counter(summary: &mut FindingsSummary, kind: FindingKind) -> Option<&mut u32> {
    match kind {
        FindingKind::Package => Some(&mut summary.total_packages),
        FindingKind::Exploit => Some(&mut summary.total_exploits),
        FindingKind::Secret => Some(&mut summary.total_secrets),
        FindingKind::Malware => Some(&mut summary.total_malware),
        FindingKind::Rootkit => Some(&mut summary.total_rootkits),
        FindingKind::Misconfiguration => Some(&mut summary.total_misconfigurations),
        FindingKind::InfoFinder => Some(&mut summary.total_info_finder),
        FindingKind::Vulnerability => None,
    }
}

/// Findings of every done family, grouped by the type they are stored as.
///
/// Packages come from the sbom and from the packages named by vulnerabilities.
/// Findings of another type than their family are dropped.
fn findings_by_kind(asset_scan: &AssetScan) -> Vec<(FindingKind, Vec<FindingInfo>)> {
    fn done(family: &Option<FamilyScan>) -> Option<&[FindingInfo]> {
        family
            .as_ref()
            .filter(|f| f.is_done())
            .map(|f| f.findings.as_deref().unwrap_or_default())
    }
    fn of_kind(findings: &[FindingInfo], kind: FindingKind) -> Vec<FindingInfo> {
        findings.iter().filter(|f| f.kind() == kind).cloned().collect()
    }

    let mut grouped = Vec::new();
    let sbom = done(&asset_scan.sbom);
    let vulnerabilities = done(&asset_scan.vulnerabilities);

    if let Some(findings) = vulnerabilities {
        grouped.push((
            FindingKind::Vulnerability,
            of_kind(findings, FindingKind::Vulnerability),
        ));
    }
    if sbom.is_some() || vulnerabilities.is_some() {
        let mut packages = of_kind(sbom.unwrap_or_default(), FindingKind::Package);
        let extracted = vulnerabilities
            .unwrap_or_default()
            .iter()
            .filter_map(|f| match f {
                FindingInfo::Vulnerability(v) => v.package.clone().map(FindingInfo::Package),
                _ => None,
            });
        for package in extracted {
            if !packages.contains(&package) {
                packages.push(package);
            }
        }
        grouped.push((FindingKind::Package, packages));
    }

    let others = [
        (&asset_scan.exploits, FindingKind::Exploit),
        (&asset_scan.secrets, FindingKind::Secret),
        (&asset_scan.malware, FindingKind::Malware),
        (&asset_scan.rootkits, FindingKind::Rootkit),
        (&asset_scan.misconfigurations, FindingKind::Misconfiguration),
        (&asset_scan.info_finder, FindingKind::InfoFinder),
    ];
    for (family, kind) in others {
        if let Some(findings) = done(family) {
            grouped.push((kind, of_kind(findings, kind)));
        }
    }
    grouped
}

#[async_trait]
impl Discover<AssetScanResultEvent> for AssetScanProcessor {
    async fn get_items(&self) -> Result<Vec<AssetScanResultEvent>> {
        let finished = Filter::eq("status/state", AssetScanState::Done.to_string())
            .or(Filter::eq("status/state", AssetScanState::Failed.to_string()));
        let unprocessed =
            Filter::eq("findingsProcessed", false).or(Filter::is_null("findingsProcessed"));
        let params = ListParams::new()
            .with_filter(finished.group().and(unprocessed.group()))
            .select("id")
            .count();
        let asset_scans = self.backend.get_asset_scans(params).await?;

        Ok(asset_scans
            .items
            .into_iter()
            .filter_map(|a| a.id)
            .map(AssetScanResultEvent::new)
            .collect())
    }
}

#[async_trait]
impl Reconcile<AssetScanResultEvent> for AssetScanProcessor {
    async fn reconcile(&self, event: AssetScanResultEvent) -> Result<()> {
        self.process(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use scan_api::MemoryBackend;
    use scan_api::models::{
        AssetScanReason, AssetScanStatus, PackageInfo, ScannerReason, ScannerState,
        ScannerStatus, SecretInfo, VulnerabilityInfo,
    };

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 17, h, m, 0).unwrap()
    }

    fn done_family(findings: Vec<FindingInfo>) -> Option<FamilyScan> {
        Some(FamilyScan {
            status: ScannerStatus::new(ScannerState::Done, ScannerReason::Success, None),
            findings: Some(findings),
        })
    }

    fn secret(fingerprint: &str) -> FindingInfo {
        FindingInfo::Secret(SecretInfo {
            fingerprint: fingerprint.to_string(),
            file_path: Some("/etc/app.env".to_string()),
        })
    }

    fn package(name: &str) -> PackageInfo {
        PackageInfo {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            purl: None,
        }
    }

    fn vulnerability(name: &str, severity: VulnerabilitySeverity, pkg: &str) -> FindingInfo {
        FindingInfo::Vulnerability(VulnerabilityInfo {
            vulnerability_name: name.to_string(),
            severity: Some(severity),
            package: Some(package(pkg)),
        })
    }

    fn finished(state: AssetScanState, completed: DateTime<Utc>) -> AssetScan {
        let mut status = AssetScanStatus::new(state, AssetScanReason::Success, None);
        status.last_transition_time = completed;
        AssetScan {
            asset: Some(Reference::new("a-1")),
            status: Some(status),
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<MemoryBackend>, AssetScanProcessor) {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .post_asset(Asset {
                id: Some("a-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let processor =
            AssetScanProcessor::new(backend.clone(), AssetScanProcessorConfig::default());
        (backend, processor)
    }

    async fn run(
        backend: &MemoryBackend,
        processor: &AssetScanProcessor,
        asset_scan: AssetScan,
    ) -> String {
        let id = backend.post_asset_scan(asset_scan).await.unwrap().id.unwrap();
        processor
            .process(&AssetScanResultEvent::new(id.clone()))
            .await
            .unwrap();
        id
    }

    async fn active_asset_findings(backend: &MemoryBackend) -> Vec<AssetFinding> {
        let params = ListParams::new().with_filter(Filter::is_null("invalidatedOn"));
        backend.get_asset_findings(params).await.unwrap().items
    }

    #[tokio::test]
    async fn test_secrets_become_findings() {
        let (backend, processor) = setup().await;
        let mut asset_scan = finished(AssetScanState::Done, at(11, 0));
        asset_scan.secrets = done_family(vec![secret("fp-1"), secret("fp-2")]);
        let id = run(&backend, &processor, asset_scan).await;

        let findings = backend.get_findings(ListParams::new()).await.unwrap().items;
        assert_eq!(findings.len(), 2);
        for finding in &findings {
            assert_eq!(finding.first_seen, Some(at(11, 0)));
            assert_eq!(finding.last_seen_by, Some(Reference::new(id.clone())));
        }
        assert_eq!(active_asset_findings(&backend).await.len(), 2);

        let asset = backend.get_asset("a-1").await.unwrap();
        assert_eq!(asset.summary.unwrap().total_secrets, 2);

        let processed = backend.get_asset_scan(&id, None).await.unwrap();
        assert_eq!(processed.findings_processed, Some(true));
        assert!(processor.get_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_later_scan_invalidates_missing_findings() {
        let (backend, processor) = setup().await;
        let mut first = finished(AssetScanState::Done, at(11, 0));
        first.secrets = done_family(vec![secret("fp-1"), secret("fp-2")]);
        run(&backend, &processor, first).await;

        let mut second = finished(AssetScanState::Done, at(12, 0));
        second.secrets = done_family(vec![secret("fp-1")]);
        let second_id = run(&backend, &processor, second).await;

        let active = active_asset_findings(&backend).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].first_seen, Some(at(11, 0)));
        assert_eq!(active[0].last_seen, Some(at(12, 0)));

        let all = backend.get_asset_findings(ListParams::new()).await.unwrap().items;
        let invalidated: Vec<_> = all.iter().filter_map(|af| af.invalidated_on).collect();
        assert_eq!(invalidated, vec![at(12, 0)]);

        let findings = backend.get_findings(ListParams::new()).await.unwrap().items;
        let kept = findings
            .iter()
            .find(|f| f.finding_info == Some(secret("fp-1")))
            .unwrap();
        assert_eq!(kept.last_seen, Some(at(12, 0)));
        assert_eq!(kept.last_seen_by, Some(Reference::new(second_id)));

        let asset = backend.get_asset("a-1").await.unwrap();
        assert_eq!(asset.summary.unwrap().total_secrets, 1);
    }

    #[tokio::test]
    async fn test_older_scan_does_not_move_last_seen_back() {
        let (backend, processor) = setup().await;
        let mut newer = finished(AssetScanState::Done, at(12, 0));
        newer.secrets = done_family(vec![secret("fp-1")]);
        let newer_id = run(&backend, &processor, newer).await;

        let mut older = finished(AssetScanState::Done, at(11, 0));
        older.secrets = done_family(vec![secret("fp-1")]);
        run(&backend, &processor, older).await;

        let findings = backend.get_findings(ListParams::new()).await.unwrap().items;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].last_seen, Some(at(12, 0)));
        assert_eq!(findings[0].last_seen_by, Some(Reference::new(newer_id)));
        assert_eq!(active_asset_findings(&backend).await.len(), 1);
    }

    #[tokio::test]
    async fn test_vulnerabilities_count_by_severity_and_yield_packages() {
        let (backend, processor) = setup().await;
        let mut asset_scan = finished(AssetScanState::Done, at(11, 0));
        asset_scan.vulnerabilities = done_family(vec![
            vulnerability("CVE-1", VulnerabilitySeverity::Critical, "openssl"),
            vulnerability("CVE-2", VulnerabilitySeverity::High, "openssl"),
            vulnerability("CVE-3", VulnerabilitySeverity::High, "zlib"),
        ]);
        asset_scan.sbom = done_family(vec![
            FindingInfo::Package(package("openssl")),
            FindingInfo::Package(package("bash")),
        ]);
        run(&backend, &processor, asset_scan).await;

        let summary = backend.get_asset("a-1").await.unwrap().summary.unwrap();
        assert_eq!(summary.total_vulnerabilities.total_critical_vulnerabilities, 1);
        assert_eq!(summary.total_vulnerabilities.total_high_vulnerabilities, 2);
        assert_eq!(summary.total_vulnerabilities.total_low_vulnerabilities, 0);
        // openssl, bash, zlib
        assert_eq!(summary.total_packages, 3);
        assert_eq!(summary.total_secrets, 0);
    }

    #[tokio::test]
    async fn test_failed_families_are_skipped() {
        let (backend, processor) = setup().await;
        let mut asset_scan = finished(AssetScanState::Failed, at(11, 0));
        asset_scan.secrets = Some(FamilyScan {
            status: ScannerStatus::new(ScannerState::Failed, ScannerReason::Error, None),
            findings: Some(vec![secret("fp-1")]),
        });
        let id = run(&backend, &processor, asset_scan).await;

        assert!(backend.get_findings(ListParams::new()).await.unwrap().items.is_empty());
        let processed = backend.get_asset_scan(&id, None).await.unwrap();
        assert_eq!(processed.findings_processed, Some(true));
    }

    #[tokio::test]
    async fn test_only_finished_unprocessed_scans_are_discovered() {
        let (backend, processor) = setup().await;
        let running = AssetScan {
            status: Some(AssetScanStatus::new(
                AssetScanState::InProgress,
                AssetScanReason::ScannerIsRunning,
                None,
            )),
            ..Default::default()
        };
        let running_id = backend.post_asset_scan(running).await.unwrap().id.unwrap();
        let done_id = backend
            .post_asset_scan(finished(AssetScanState::Done, at(11, 0)))
            .await
            .unwrap()
            .id
            .unwrap();

        let items = processor.get_items().await.unwrap();
        assert_eq!(items, vec![AssetScanResultEvent::new(done_id)]);

        // A running scan is left for later.
        processor
            .process(&AssetScanResultEvent::new(running_id.clone()))
            .await
            .unwrap();
        let running = backend.get_asset_scan(&running_id, None).await.unwrap();
        assert!(running.findings_processed.is_none());
    }

    #[test]
    fn test_packages_are_deduplicated() {
        let mut asset_scan = finished(AssetScanState::Done, at(11, 0) + TimeDelta::seconds(1));
        asset_scan.vulnerabilities = done_family(vec![
            vulnerability("CVE-1", VulnerabilitySeverity::Low, "openssl"),
            vulnerability("CVE-2", VulnerabilitySeverity::Low, "openssl"),
        ]);
        asset_scan.secrets = done_family(vec![
            secret("fp-1"),
            FindingInfo::Package(package("misplaced")),
        ]);

        let grouped = findings_by_kind(&asset_scan);
        let kinds: Vec<FindingKind> = grouped.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![FindingKind::Vulnerability, FindingKind::Package, FindingKind::Secret]
        );
        assert_eq!(grouped[1].1, vec![FindingInfo::Package(package("openssl"))]);
        assert_eq!(grouped[2].1, vec![secret("fp-1")]);
    }
}
