use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::FindingsSummary;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootVolume {
    pub size_gb: u32,
    #[serde(default)]
    pub encrypted: bool,
}

/// A virtual machine instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    pub instance_id: String,
    /// Provider location, e.g. `eu-west-1/vpc-1/sg-1`.
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub root_volume: RootVolume,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImageInfo {
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// What kind of asset this is, tagged by `objectType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "objectType")]
pub enum AssetInfo {
    #[serde(rename = "VMInfo")]
    Vm(VmInfo),
    #[serde(rename = "ContainerInfo")]
    Container(ContainerInfo),
    #[serde(rename = "ContainerImageInfo")]
    ContainerImage(ContainerImageInfo),
}

/// A discovered scannable asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_info: Option<AssetInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_on: Option<DateTime<Utc>>,
    /// Active findings on the asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<FindingsSummary>,
}

impl Asset {
    pub fn vm_info(&self) -> Option<&VmInfo> {
        match self.asset_info.as_ref() {
            Some(AssetInfo::Vm(info)) => Some(info),
            _ => None,
        }
    }
}
