//
// config.rs
// Pacs-Bridge-rs
//
// Loads the TOML configuration describing the local AE and the registry of routable PACS.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{PacsError, Result};
use crate::models::{validate_ae_title, PacsConfig, PacsEndpoint};

pub const DEFAULT_AE_TITLE: &str = "DICOM_VIEWER";
pub const DEFAULT_MAX_PDU: u32 = 16384;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 30000;

/// Our own Application Entity: the calling AE title and connection defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalAe {
    pub ae_title: String,
    pub max_pdu: u32,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for LocalAe {
    fn default() -> Self {
        Self {
            ae_title: DEFAULT_AE_TITLE.to_string(),
            max_pdu: DEFAULT_MAX_PDU,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl LocalAe {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)?;
        if self.max_pdu < 4096 {
            return Err(PacsError::configuration(format!(
                "max_pdu must be at least 4096, got {}",
                self.max_pdu
            )));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub local: LocalAe,
    #[serde(default)]
    pub pacs: Vec<PacsConfig>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PacsError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(
            "Loaded {} PACS definition(s) from {}",
            config.pacs.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)
            .map_err(|e| PacsError::configuration(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.local.validate()?;
        let mut seen = HashSet::new();
        for pacs in &self.pacs {
            if pacs.id.trim().is_empty() {
                return Err(PacsError::configuration("PACS id must not be empty"));
            }
            if !seen.insert(pacs.id.as_str()) {
                return Err(PacsError::configuration(format!(
                    "duplicate PACS id {:?}",
                    pacs.id
                )));
            }
            validate_endpoint(pacs)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> PacsRegistry {
        PacsRegistry::new(self.pacs.clone())
    }
}

fn validate_endpoint(pacs: &PacsConfig) -> Result<()> {
    match &pacs.endpoint {
        PacsEndpoint::Legacy(node) => node.validate(),
        PacsEndpoint::DicomWeb(web) => {
            if let Some(ae) = &web.ae_title {
                validate_ae_title(ae)?;
            }
            // Absent URLs are reported when an operation needs them.
            for url in [&web.qido_rs_url, &web.wado_rs_url, &web.stow_rs_url]
                .into_iter()
                .flatten()
                .filter(|u| !u.trim().is_empty())
            {
                Url::parse(url).map_err(|e| {
                    PacsError::configuration(format!(
                        "PACS {}: invalid URL {:?}: {}",
                        pacs.id, url, e
                    ))
                })?;
            }
            Ok(())
        }
    }
}

/// Read-only lookup of configured PACS by id.
#[derive(Debug, Clone, Default)]
pub struct PacsRegistry {
    entries: Vec<PacsConfig>,
}

impl PacsRegistry {
    pub fn new(entries: Vec<PacsConfig>) -> Self {
        Self { entries }
    }

    /// Resolves a routable PACS; inactive entries are treated as unknown.
    pub fn lookup(&self, id: &str) -> Result<&PacsConfig> {
        match self.entries.iter().find(|p| p.id == id) {
            Some(pacs) if pacs.active => Ok(pacs),
            Some(_) => {
                debug!("PACS {} is configured but inactive", id);
                Err(PacsError::UnknownPacs(id.to_string()))
            }
            None => Err(PacsError::UnknownPacs(id.to_string())),
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &PacsConfig> {
        self.entries.iter().filter(|p| p.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[local]
ae_title = "VIEWER"

[[pacs]]
id = "orthanc"
name = "Orthanc"
protocol = "legacy"
ae_title = "ORTHANC"
host = "localhost"
port = 4242
read_timeout_ms = 1000

[[pacs]]
id = "web"
protocol = "dicomweb"
qido_rs_url = "http://localhost:8042/dicom-web"
wado_rs_url = "http://localhost:8042/dicom-web"

[[pacs]]
id = "old"
protocol = "legacy"
active = false
ae_title = "OLD"
host = "10.0.0.9"
port = 104
"#;

    #[test]
    fn parses_both_protocol_families() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.local.ae_title, "VIEWER");
        assert_eq!(config.local.max_pdu, DEFAULT_MAX_PDU);
        assert_eq!(config.pacs.len(), 3);

        match &config.pacs[0].endpoint {
            PacsEndpoint::Legacy(node) => {
                assert_eq!(node.port, 4242);
                assert_eq!(node.read_timeout_ms, Some(1000));
            }
            other => panic!("unexpected endpoint {:?}", other),
        }
        assert_eq!(config.pacs[1].endpoint.protocol_name(), "DICOMWEB");
    }

    #[test]
    fn inactive_pacs_is_not_routable() {
        let registry = AppConfig::from_toml_str(SAMPLE).unwrap().registry();
        assert!(registry.lookup("orthanc").is_ok());
        assert!(matches!(registry.lookup("old"), Err(PacsError::UnknownPacs(_))));
        assert!(matches!(registry.lookup("nope"), Err(PacsError::UnknownPacs(_))));
        assert_eq!(registry.active().count(), 2);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let text = r#"
[[pacs]]
id = "a"
protocol = "dicomweb"

[[pacs]]
id = "a"
protocol = "dicomweb"
"#;
        let err = AppConfig::from_toml_str(text).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn malformed_url_is_a_configuration_error() {
        let text = r#"
[[pacs]]
id = "web"
protocol = "dicomweb"
qido_rs_url = "not a url"
"#;
        assert!(AppConfig::from_toml_str(text).unwrap_err().is_configuration());
    }

    #[test]
    fn defaults_apply_without_local_section() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.local, LocalAe::default());
        assert_eq!(config.local.connect_timeout(), Duration::from_millis(5000));
    }
}
