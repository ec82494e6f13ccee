//
// dicomweb.rs
// Pacs-Bridge-rs
//
// QIDO-RS queries and WADO-RS retrieval against PACS that expose DICOMweb endpoints.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::attributes::Attributes;
use crate::error::{PacsError, Result};
use crate::models::DicomWebEndpoint;
use crate::query::QueryFilters;

const DICOM_JSON: &str = "application/dicom+json, application/json";
const DICOM_PART10: &str = "application/dicom";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Representation requested from the WADO-RS `rendered` resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderedMediaType {
    #[default]
    Jpeg,
    Png,
}

impl RenderedMediaType {
    pub fn mime(&self) -> &'static str {
        match self {
            RenderedMediaType::Jpeg => "image/jpeg",
            RenderedMediaType::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            RenderedMediaType::Jpeg => "jpg",
            RenderedMediaType::Png => "png",
        }
    }
}

impl fmt::Display for RenderedMediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

impl FromStr for RenderedMediaType {
    type Err = PacsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" | "image/jpeg" => Ok(RenderedMediaType::Jpeg),
            "png" | "image/png" => Ok(RenderedMediaType::Png),
            other => Err(PacsError::configuration(format!(
                "unsupported rendered media type {:?}",
                other
            ))),
        }
    }
}

/// Blocking HTTP client for QIDO-RS and WADO-RS.
#[derive(Debug, Clone)]
pub struct DicomWebClient {
    http: Client,
}

impl DicomWebClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("pacs-bridge/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PacsError::configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// `GET {qido}/studies?{params}`.
    pub fn query_studies(&self, endpoint: &DicomWebEndpoint, params: &QueryFilters) -> Result<Vec<Attributes>> {
        let mut url = service_url(endpoint.qido_rs_url.as_deref(), "QIDO-RS", &["studies"])?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params.iter() {
                query.append_pair(key, value);
            }
        }
        // An empty query string leaves a dangling '?'.
        if url.query() == Some("") {
            url.set_query(None);
        }
        self.qido(endpoint, url)
    }

    /// `GET {qido}/studies/{study}/series`.
    pub fn query_series(&self, endpoint: &DicomWebEndpoint, study_uid: &str) -> Result<Vec<Attributes>> {
        let url = service_url(
            endpoint.qido_rs_url.as_deref(),
            "QIDO-RS",
            &["studies", study_uid, "series"],
        )?;
        self.qido(endpoint, url)
    }

    /// `GET {qido}/studies/{study}/series/{series}/instances`.
    pub fn query_instances(
        &self,
        endpoint: &DicomWebEndpoint,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<Vec<Attributes>> {
        let url = service_url(
            endpoint.qido_rs_url.as_deref(),
            "QIDO-RS",
            &["studies", study_uid, "series", series_uid, "instances"],
        )?;
        self.qido(endpoint, url)
    }

    /// `GET {wado}/studies/{study}/series/{series}/instances/{instance}` as `application/dicom`.
    pub fn retrieve_instance(
        &self,
        endpoint: &DicomWebEndpoint,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
    ) -> Result<Vec<u8>> {
        let url = service_url(
            endpoint.wado_rs_url.as_deref(),
            "WADO-RS",
            &["studies", study_uid, "series", series_uid, "instances", sop_uid],
        )?;
        self.fetch(endpoint, url, DICOM_PART10)
    }

    /// `GET .../instances/{instance}/rendered` as JPEG or PNG.
    pub fn retrieve_rendered(
        &self,
        endpoint: &DicomWebEndpoint,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        media_type: RenderedMediaType,
    ) -> Result<Vec<u8>> {
        let url = service_url(
            endpoint.wado_rs_url.as_deref(),
            "WADO-RS",
            &["studies", study_uid, "series", series_uid, "instances", sop_uid, "rendered"],
        )?;
        self.fetch(endpoint, url, media_type.mime())
    }

    fn qido(&self, endpoint: &DicomWebEndpoint, url: Url) -> Result<Vec<Attributes>> {
        let body = self.fetch(endpoint, url.clone(), DICOM_JSON)?;
        let results = decode_qido_body(&body)?;
        info!("QIDO-RS {} returned {} result(s)", url, results.len());
        Ok(results)
    }

    fn fetch(&self, endpoint: &DicomWebEndpoint, url: Url, accept: &str) -> Result<Vec<u8>> {
        let timeout = endpoint
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        debug!("GET {} (Accept: {})", url, accept);

        let response = self
            .http
            .get(url.clone())
            .header(ACCEPT, accept)
            .timeout(timeout)
            .send()
            .map_err(|e| {
                warn!("Request to {} failed: {}", url, e);
                PacsError::from(e)
            })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            warn!("{} answered HTTP {}", url, status);
            return Err(PacsError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes()?;
        debug!("Received {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}

/// Resolves `{base}/{segments...}`; a missing base is a configuration problem.
fn service_url(base: Option<&str>, service: &str, segments: &[&str]) -> Result<Url> {
    let base = base
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| PacsError::configuration(format!("{} URL not configured", service)))?;
    let mut url = Url::parse(base)
        .map_err(|e| PacsError::configuration(format!("invalid {} URL {:?}: {}", service, base, e)))?;
    url.path_segments_mut()
        .map_err(|_| PacsError::configuration(format!("{} URL {:?} cannot be a base", service, base)))?
        .pop_if_empty()
        .extend(segments.iter().map(|s| s.trim()));
    Ok(url)
}

/// Decodes a QIDO-RS body; an empty body means no matches.
pub fn decode_qido_body(body: &[u8]) -> Result<Vec<Attributes>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| PacsError::Decode(format!("invalid DICOM JSON: {}", e)))?;
    match value {
        Value::Array(items) => items.iter().map(Attributes::from_dicom_json).collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(PacsError::Decode("expected a DICOM JSON array".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_url_joins_segments() {
        let url = service_url(Some("http://pacs:8042/dicom-web/"), "QIDO-RS", &["studies", "1.2.3", "series"]).unwrap();
        assert_eq!(url.as_str(), "http://pacs:8042/dicom-web/studies/1.2.3/series");
    }

    #[test]
    fn missing_base_is_configuration_error() {
        assert!(service_url(None, "QIDO-RS", &["studies"]).unwrap_err().is_configuration());
        assert!(service_url(Some("  "), "WADO-RS", &["studies"]).unwrap_err().is_configuration());
    }

    #[test]
    fn empty_bodies_decode_to_no_results() {
        assert!(decode_qido_body(b"").unwrap().is_empty());
        assert!(decode_qido_body(b"  \n").unwrap().is_empty());
        assert!(decode_qido_body(b"[]").unwrap().is_empty());
    }

    #[test]
    fn non_array_body_is_a_decode_error() {
        assert!(matches!(decode_qido_body(b"{}"), Err(PacsError::Decode(_))));
    }

    #[test]
    fn rendered_media_types() {
        assert_eq!("png".parse::<RenderedMediaType>().unwrap(), RenderedMediaType::Png);
        assert_eq!(RenderedMediaType::Jpeg.mime(), "image/jpeg");
        assert!("gif".parse::<RenderedMediaType>().is_err());
    }
}
