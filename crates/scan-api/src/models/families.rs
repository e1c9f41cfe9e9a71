use serde::{Deserialize, Serialize};

/// Scan families an AssetScan can run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ScanFamily {
    Sbom,
    Vulnerabilities,
    Exploits,
    Malware,
    Misconfigurations,
    Rootkits,
    Secrets,
    InfoFinder,
}

/// Per-family configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanners: Option<Vec<String>>,
}

impl FamilyConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            scanners: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

/// Which scan families run, and with which scanners.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFamiliesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom: Option<FamilyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<FamilyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploits: Option<FamilyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malware: Option<FamilyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misconfigurations: Option<FamilyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootkits: Option<FamilyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<FamilyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_finder: Option<FamilyConfig>,
}

impl ScanFamiliesConfig {
    pub fn family(&self, family: ScanFamily) -> Option<&FamilyConfig> {
        match family {
            ScanFamily::Sbom => self.sbom.as_ref(),
            ScanFamily::Vulnerabilities => self.vulnerabilities.as_ref(),
            ScanFamily::Exploits => self.exploits.as_ref(),
            ScanFamily::Malware => self.malware.as_ref(),
            ScanFamily::Misconfigurations => self.misconfigurations.as_ref(),
            ScanFamily::Rootkits => self.rootkits.as_ref(),
            ScanFamily::Secrets => self.secrets.as_ref(),
            ScanFamily::InfoFinder => self.info_finder.as_ref(),
        }
    }

    pub fn is_enabled(&self, family: ScanFamily) -> bool {
        self.family(family).is_some_and(FamilyConfig::is_enabled)
    }

    /// Vulnerability scanning consumes the SBOM, so enabling it implies SBOM.
    pub fn is_sbom_required(&self) -> bool {
        self.is_enabled(ScanFamily::Sbom) || self.is_enabled(ScanFamily::Vulnerabilities)
    }
}
