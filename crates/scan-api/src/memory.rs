//! In-memory [`BackendClient`] that evaluates filter strings against
//! serialized entities.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::client::{BackendClient, ListParams, ListResponse};
use crate::error::{ApiError, Result};
use crate::filter::{self, Filter, FilterExpr};
use crate::models::{
    Asset, AssetFinding, AssetScan, AssetScanEstimation, Finding, Scan, ScanConfig,
    ScanEstimation, ScanState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum Kind {
    ScanConfig,
    Scan,
    AssetScan,
    ScanEstimation,
    AssetScanEstimation,
    Asset,
    Finding,
    AssetFinding,
}

#[derive(Debug, Default)]
struct Store {
    scan_configs: BTreeMap<String, Value>,
    scans: BTreeMap<String, Value>,
    asset_scans: BTreeMap<String, Value>,
    scan_estimations: BTreeMap<String, Value>,
    asset_scan_estimations: BTreeMap<String, Value>,
    assets: BTreeMap<String, Value>,
    findings: BTreeMap<String, Value>,
    asset_findings: BTreeMap<String, Value>,
}

impl Store {
    fn table(&self, kind: Kind) -> &BTreeMap<String, Value> {
        match kind {
            Kind::ScanConfig => &self.scan_configs,
            Kind::Scan => &self.scans,
            Kind::AssetScan => &self.asset_scans,
            Kind::ScanEstimation => &self.scan_estimations,
            Kind::AssetScanEstimation => &self.asset_scan_estimations,
            Kind::Asset => &self.assets,
            Kind::Finding => &self.findings,
            Kind::AssetFinding => &self.asset_findings,
        }
    }

    fn table_mut(&mut self, kind: Kind) -> &mut BTreeMap<String, Value> {
        match kind {
            Kind::ScanConfig => &mut self.scan_configs,
            Kind::Scan => &mut self.scans,
            Kind::AssetScan => &mut self.asset_scans,
            Kind::ScanEstimation => &mut self.scan_estimations,
            Kind::AssetScanEstimation => &mut self.asset_scan_estimations,
            Kind::Asset => &mut self.assets,
            Kind::Finding => &mut self.findings,
            Kind::AssetFinding => &mut self.asset_findings,
        }
    }

    /// The document filters are evaluated against. AssetFindings see their
    /// finding expanded in place of the reference.
    fn filterable<'a>(&self, kind: Kind, doc: &'a Value) -> Cow<'a, Value> {
        if kind != Kind::AssetFinding {
            return Cow::Borrowed(doc);
        }
        let Some(finding) = reference_id(doc, "finding").and_then(|id| self.findings.get(id))
        else {
            return Cow::Borrowed(doc);
        };
        let mut expanded = doc.clone();
        if let Value::Object(map) = &mut expanded {
            map.insert("finding".to_string(), finding.clone());
        }
        Cow::Owned(expanded)
    }
}

/// Serializable dump of every entity held by a [`MemoryBackend`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Snapshot {
    pub scan_configs: Vec<ScanConfig>,
    pub scans: Vec<Scan>,
    pub asset_scans: Vec<AssetScan>,
    pub scan_estimations: Vec<ScanEstimation>,
    pub asset_scan_estimations: Vec<AssetScanEstimation>,
    pub assets: Vec<Asset>,
    pub findings: Vec<Finding>,
    pub asset_findings: Vec<AssetFinding>,
}

/// Thread-safe in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: RwLock<Store>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a backend pre-populated from a snapshot. Entities without an id get one.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        let backend = Self::new();
        {
            let mut store = backend.store.write();
            load_into(&mut store, Kind::ScanConfig, snapshot.scan_configs)?;
            load_into(&mut store, Kind::Scan, snapshot.scans)?;
            load_into(&mut store, Kind::AssetScan, snapshot.asset_scans)?;
            load_into(&mut store, Kind::ScanEstimation, snapshot.scan_estimations)?;
            load_into(
                &mut store,
                Kind::AssetScanEstimation,
                snapshot.asset_scan_estimations,
            )?;
            load_into(&mut store, Kind::Asset, snapshot.assets)?;
            load_into(&mut store, Kind::Finding, snapshot.findings)?;
            load_into(&mut store, Kind::AssetFinding, snapshot.asset_findings)?;
        }
        Ok(backend)
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        let store = self.store.read();
        Ok(Snapshot {
            scan_configs: dump(&store, Kind::ScanConfig)?,
            scans: dump(&store, Kind::Scan)?,
            asset_scans: dump(&store, Kind::AssetScan)?,
            scan_estimations: dump(&store, Kind::ScanEstimation)?,
            asset_scan_estimations: dump(&store, Kind::AssetScanEstimation)?,
            assets: dump(&store, Kind::Asset)?,
            findings: dump(&store, Kind::Finding)?,
            asset_findings: dump(&store, Kind::AssetFinding)?,
        })
    }

    fn list<T: DeserializeOwned>(&self, kind: Kind, params: &ListParams) -> Result<ListResponse<T>> {
        let expr: Option<FilterExpr> = params
            .filter
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .map(filter::parse)
            .transpose()?;

        let store = self.store.read();
        let matched: Vec<&Value> = store
            .table(kind)
            .values()
            .filter(|doc| {
                expr.as_ref()
                    .is_none_or(|e| e.matches(&store.filterable(kind, doc)))
            })
            .collect();
        let count = params.count.then_some(matched.len());

        let items = matched
            .into_iter()
            .skip(params.skip.unwrap_or(0))
            .take(params.top.unwrap_or(usize::MAX))
            .map(|doc| decode(doc.clone(), params.select.as_deref()))
            .collect::<Result<Vec<T>>>()?;

        trace!(%kind, filter = ?params.filter, matched = items.len(), "List");
        Ok(ListResponse { items, count })
    }

    fn get<T: DeserializeOwned>(&self, kind: Kind, id: &str, select: Option<&str>) -> Result<T> {
        let store = self.store.read();
        let doc = store
            .table(kind)
            .get(id)
            .ok_or_else(|| ApiError::not_found(kind_name(kind), id))?;
        decode(doc.clone(), select)
    }

    /// Inserts a new entity unless `conflict` finds an existing one for its natural key.
    fn insert<T, F>(&self, kind: Kind, entity: &T, conflict: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&Store, &Value) -> Option<String>,
    {
        let mut doc = serde_json::to_value(entity)?;
        let mut store = self.store.write();

        if let Some(existing_id) = conflict(&*store, &doc) {
            return Err(ApiError::conflict(kind_name(kind), existing_id));
        }

        let id = match doc.get("id").and_then(Value::as_str) {
            Some(id) if store.table(kind).contains_key(id) => {
                return Err(ApiError::conflict(kind_name(kind), id));
            }
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        if let Value::Object(map) = &mut doc {
            map.insert("id".to_string(), Value::String(id.clone()));
        }

        debug!(%kind, %id, "Created entity");
        store.table_mut(kind).insert(id, doc.clone());
        Ok(serde_json::from_value(doc)?)
    }

    fn patch<T: Serialize>(&self, kind: Kind, id: &str, patch: &T) -> Result<()> {
        let patch = serde_json::to_value(patch)?;
        let mut store = self.store.write();
        let stored = store
            .table_mut(kind)
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(kind_name(kind), id))?;

        if let (Value::Object(target), Value::Object(fields)) = (stored, patch) {
            for (key, value) in fields {
                if key == "id" {
                    continue;
                }
                target.insert(key, value);
            }
        }
        trace!(%kind, %id, "Patched entity");
        Ok(())
    }

    fn delete(&self, kind: Kind, id: &str) -> Result<()> {
        let mut store = self.store.write();
        store
            .table_mut(kind)
            .remove(id)
            .map(|_| debug!(%kind, %id, "Deleted entity"))
            .ok_or_else(|| ApiError::not_found(kind_name(kind), id))
    }
}

fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::ScanConfig => "ScanConfig",
        Kind::Scan => "Scan",
        Kind::AssetScan => "AssetScan",
        Kind::ScanEstimation => "ScanEstimation",
        Kind::AssetScanEstimation => "AssetScanEstimation",
        Kind::Asset => "Asset",
        Kind::Finding => "Finding",
        Kind::AssetFinding => "AssetFinding",
    }
}

fn decode<T: DeserializeOwned>(doc: Value, select: Option<&str>) -> Result<T> {
    let doc = match select {
        Some(select) => filter::project(doc, select),
        None => doc,
    };
    Ok(serde_json::from_value(doc)?)
}

fn load_into<T: Serialize>(store: &mut Store, kind: Kind, entities: Vec<T>) -> Result<()> {
    for entity in entities {
        let mut doc = serde_json::to_value(&entity)?;
        let id = match doc.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        if let Value::Object(map) = &mut doc {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        store.table_mut(kind).insert(id, doc);
    }
    Ok(())
}

fn dump<T: DeserializeOwned>(store: &Store, kind: Kind) -> Result<Vec<T>> {
    store
        .table(kind)
        .values()
        .map(|doc| Ok(serde_json::from_value(doc.clone())?))
        .collect()
}

/// Finds the first stored entity matching `filter`.
fn find_existing(store: &Store, kind: Kind, filter: &Filter) -> Option<String> {
    let expr = filter::parse(filter.as_str()).ok()?;
    store
        .table(kind)
        .iter()
        .find(|(_, doc)| expr.matches(doc))
        .map(|(id, _)| id.clone())
}

fn reference_id<'a>(doc: &'a Value, field: &str) -> Option<&'a str> {
    doc.get(field)?.get("id")?.as_str()
}

/// A ScanConfig may only have one Scan that is not finished.
fn running_scan_for_config(store: &Store, doc: &Value) -> Option<String> {
    let config_id = reference_id(doc, "scanConfig")?;
    let filter = Filter::eq("scanConfig/id", config_id).and(Filter::not_in(
        "status/state",
        [ScanState::Done.to_string(), ScanState::Failed.to_string()],
    ));
    find_existing(store, Kind::Scan, &filter)
}

/// Assets are unique per provider identity: VM instance and location,
/// container id, or image id.
fn existing_asset(store: &Store, doc: &Value) -> Option<String> {
    let info = doc.get("assetInfo")?;
    let key = |field: &str| info.get(field).and_then(Value::as_str);
    let filter = match info.get("objectType")?.as_str()? {
        "VMInfo" => Filter::eq("assetInfo/objectType", "VMInfo")
            .and(Filter::eq("assetInfo/instanceId", key("instanceId")?))
            .and(Filter::eq("assetInfo/location", key("location")?)),
        "ContainerInfo" => Filter::eq("assetInfo/objectType", "ContainerInfo")
            .and(Filter::eq("assetInfo/containerId", key("containerId")?)),
        "ContainerImageInfo" => Filter::eq("assetInfo/objectType", "ContainerImageInfo")
            .and(Filter::eq("assetInfo/imageId", key("imageId")?)),
        _ => return None,
    };
    find_existing(store, Kind::Asset, &filter)
}

/// Findings are unique per content.
fn existing_finding(store: &Store, doc: &Value) -> Option<String> {
    let info = doc.get("findingInfo")?;
    store
        .findings
        .iter()
        .find(|(_, existing)| existing.get("findingInfo") == Some(info))
        .map(|(id, _)| id.clone())
}

fn existing_child(store: &Store, kind: Kind, parent_field: &str, doc: &Value) -> Option<String> {
    let parent_id = reference_id(doc, parent_field)?;
    let asset_id = reference_id(doc, "asset")?;
    let filter = Filter::eq(&format!("{parent_field}/id"), parent_id)
        .and(Filter::eq("asset/id", asset_id));
    find_existing(store, kind, &filter)
}

#[async_trait]
impl BackendClient for MemoryBackend {
    async fn get_scan_configs(&self, params: ListParams) -> Result<ListResponse<ScanConfig>> {
        self.list(Kind::ScanConfig, &params)
    }

    async fn get_scan_config(&self, id: &str, select: Option<&str>) -> Result<ScanConfig> {
        self.get(Kind::ScanConfig, id, select)
    }

    async fn post_scan_config(&self, config: ScanConfig) -> Result<ScanConfig> {
        self.insert(Kind::ScanConfig, &config, |store, doc| {
            let name = doc.get("name")?.as_str()?;
            find_existing(store, Kind::ScanConfig, &Filter::eq("name", name))
        })
    }

    async fn patch_scan_config(&self, id: &str, patch: ScanConfig) -> Result<()> {
        self.patch(Kind::ScanConfig, id, &patch)
    }

    async fn get_scans(&self, params: ListParams) -> Result<ListResponse<Scan>> {
        self.list(Kind::Scan, &params)
    }

    async fn get_scan(&self, id: &str, select: Option<&str>) -> Result<Scan> {
        self.get(Kind::Scan, id, select)
    }

    async fn post_scan(&self, scan: Scan) -> Result<Scan> {
        self.insert(Kind::Scan, &scan, running_scan_for_config)
    }

    async fn patch_scan(&self, id: &str, patch: Scan) -> Result<()> {
        self.patch(Kind::Scan, id, &patch)
    }

    async fn get_asset_scans(&self, params: ListParams) -> Result<ListResponse<AssetScan>> {
        self.list(Kind::AssetScan, &params)
    }

    async fn get_asset_scan(&self, id: &str, select: Option<&str>) -> Result<AssetScan> {
        self.get(Kind::AssetScan, id, select)
    }

    async fn post_asset_scan(&self, asset_scan: AssetScan) -> Result<AssetScan> {
        self.insert(Kind::AssetScan, &asset_scan, |store, doc| {
            existing_child(store, Kind::AssetScan, "scan", doc)
        })
    }

    async fn patch_asset_scan(&self, id: &str, patch: AssetScan) -> Result<()> {
        self.patch(Kind::AssetScan, id, &patch)
    }

    async fn get_scan_estimations(
        &self,
        params: ListParams,
    ) -> Result<ListResponse<ScanEstimation>> {
        self.list(Kind::ScanEstimation, &params)
    }

    async fn get_scan_estimation(&self, id: &str, select: Option<&str>) -> Result<ScanEstimation> {
        self.get(Kind::ScanEstimation, id, select)
    }

    async fn post_scan_estimation(&self, estimation: ScanEstimation) -> Result<ScanEstimation> {
        self.insert(Kind::ScanEstimation, &estimation, |_, _| None)
    }

    async fn patch_scan_estimation(&self, id: &str, patch: ScanEstimation) -> Result<()> {
        self.patch(Kind::ScanEstimation, id, &patch)
    }

    async fn delete_scan_estimation(&self, id: &str) -> Result<()> {
        self.delete(Kind::ScanEstimation, id)
    }

    async fn get_asset_scan_estimations(
        &self,
        params: ListParams,
    ) -> Result<ListResponse<AssetScanEstimation>> {
        self.list(Kind::AssetScanEstimation, &params)
    }

    async fn get_asset_scan_estimation(
        &self,
        id: &str,
        select: Option<&str>,
    ) -> Result<AssetScanEstimation> {
        self.get(Kind::AssetScanEstimation, id, select)
    }

    async fn post_asset_scan_estimation(
        &self,
        estimation: AssetScanEstimation,
    ) -> Result<AssetScanEstimation> {
        self.insert(Kind::AssetScanEstimation, &estimation, |store, doc| {
            existing_child(store, Kind::AssetScanEstimation, "scanEstimation", doc)
        })
    }

    async fn patch_asset_scan_estimation(
        &self,
        id: &str,
        patch: AssetScanEstimation,
    ) -> Result<()> {
        self.patch(Kind::AssetScanEstimation, id, &patch)
    }

    async fn delete_asset_scan_estimation(&self, id: &str) -> Result<()> {
        self.delete(Kind::AssetScanEstimation, id)
    }

    async fn get_assets(&self, params: ListParams) -> Result<ListResponse<Asset>> {
        self.list(Kind::Asset, &params)
    }

    async fn get_asset(&self, id: &str) -> Result<Asset> {
        self.get(Kind::Asset, id, None)
    }

    async fn post_asset(&self, asset: Asset) -> Result<Asset> {
        self.insert(Kind::Asset, &asset, existing_asset)
    }

    async fn patch_asset(&self, id: &str, patch: Asset) -> Result<()> {
        self.patch(Kind::Asset, id, &patch)
    }

    async fn get_findings(&self, params: ListParams) -> Result<ListResponse<Finding>> {
        self.list(Kind::Finding, &params)
    }

    async fn post_finding(&self, finding: Finding) -> Result<Finding> {
        self.insert(Kind::Finding, &finding, existing_finding)
    }

    async fn patch_finding(&self, id: &str, patch: Finding) -> Result<()> {
        self.patch(Kind::Finding, id, &patch)
    }

    async fn get_asset_findings(&self, params: ListParams) -> Result<ListResponse<AssetFinding>> {
        self.list(Kind::AssetFinding, &params)
    }

    async fn post_asset_finding(&self, asset_finding: AssetFinding) -> Result<AssetFinding> {
        self.insert(Kind::AssetFinding, &asset_finding, |store, doc| {
            existing_child(store, Kind::AssetFinding, "finding", doc)
        })
    }

    async fn patch_asset_finding(&self, id: &str, patch: AssetFinding) -> Result<()> {
        self.patch(Kind::AssetFinding, id, &patch)
    }
}
