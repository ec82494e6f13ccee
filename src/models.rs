//
// models.rs
// Pacs-Bridge-rs
//
// Defines serializable data structures for PACS descriptors, echo/move outcomes, and retrieval progress.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PacsError, Result};

/// A legacy DICOM Application Entity reachable over the Upper Layer protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    /// Overrides the local connect timeout for this node.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Overrides the local read timeout for this node.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_pdu: Option<u32>,
}

impl RemoteNode {
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            max_pdu: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_read_timeout(mut self, timeout_ms: u64) -> Self {
        self.read_timeout_ms = Some(timeout_ms);
        self
    }

    /// `host:port`, resolved before dialing.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)?;
        if self.host.trim().is_empty() {
            return Err(PacsError::configuration(format!(
                "host is empty for AE {}",
                self.ae_title
            )));
        }
        if self.port == 0 {
            return Err(PacsError::configuration(format!(
                "port must be greater than 0 for AE {}",
                self.ae_title
            )));
        }
        Ok(())
    }
}

impl fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

/// AE titles are 1-16 characters of the default character repertoire, no backslash.
pub fn validate_ae_title(ae_title: &str) -> Result<()> {
    let trimmed = ae_title.trim();
    if trimmed.is_empty() || trimmed.len() > 16 {
        return Err(PacsError::configuration(format!(
            "AE title must be 1-16 characters: {:?}",
            ae_title
        )));
    }
    if trimmed.contains('\\') || trimmed.chars().any(|c| c.is_control()) {
        return Err(PacsError::configuration(format!(
            "AE title contains invalid characters: {:?}",
            ae_title
        )));
    }
    Ok(())
}

/// A PACS exposing DICOMweb services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomWebEndpoint {
    #[serde(default)]
    pub ae_title: Option<String>,
    #[serde(default)]
    pub qido_rs_url: Option<String>,
    #[serde(default)]
    pub wado_rs_url: Option<String>,
    #[serde(default)]
    pub stow_rs_url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Protocol family of a configured PACS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum PacsEndpoint {
    Legacy(RemoteNode),
    #[serde(rename = "dicomweb")]
    DicomWeb(DicomWebEndpoint),
}

impl PacsEndpoint {
    pub fn protocol_name(&self) -> &'static str {
        match self {
            PacsEndpoint::Legacy(_) => "LEGACY",
            PacsEndpoint::DicomWeb(_) => "DICOMWEB",
        }
    }
}

/// A routable PACS entry from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacsConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(flatten)]
    pub endpoint: PacsEndpoint,
}

fn default_active() -> bool {
    true
}

impl PacsConfig {
    pub fn legacy(id: impl Into<String>, node: RemoteNode) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            active: true,
            endpoint: PacsEndpoint::Legacy(node),
        }
    }

    pub fn dicom_web(id: impl Into<String>, endpoint: DicomWebEndpoint) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            active: true,
            endpoint: PacsEndpoint::DicomWeb(endpoint),
        }
    }
}

/// Query/Retrieve information model level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryLevel {
    Study,
    Series,
    Image,
}

impl QueryLevel {
    /// Value of the QueryRetrieveLevel (0008,0052) attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLevel::Study => "STUDY",
            QueryLevel::Series => "SERIES",
            QueryLevel::Image => "IMAGE",
        }
    }
}

impl fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResult {
    pub success: bool,
    pub response_time_ms: u64,
    pub message: String,
}

impl EchoResult {
    pub fn success(response_time_ms: u64) -> Self {
        Self {
            success: true,
            response_time_ms,
            message: "Connection successful".to_string(),
        }
    }

    pub fn failure(response_time_ms: u64, message: impl Into<String>) -> Self {
        Self {
            success: false,
            response_time_ms,
            message: message.into(),
        }
    }
}

/// Sub-operation counters carried by C-MOVE responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOperationCounts {
    pub remaining: Option<u32>,
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
}

/// Lifecycle of a retrieval job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetrievalStatus {
    Pending,
    InProgress,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl RetrievalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetrievalStatus::Completed
                | RetrievalStatus::CompletedWithErrors
                | RetrievalStatus::Failed
                | RetrievalStatus::Cancelled
        )
    }
}

/// Point-in-time copy of a retrieval job, safe to hand to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalProgress {
    pub retrieval_id: String,
    pub status: RetrievalStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub warnings: u32,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RetrievalProgress {
    pub fn percent_complete(&self) -> u32 {
        if self.total == 0 {
            0
        } else {
            ((self.completed as u64 * 100) / self.total as u64) as u32
        }
    }

    pub fn remaining(&self) -> u32 {
        self.total
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
            .saturating_sub(self.warnings)
    }
}

/// Final report of a C-MOVE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveResult {
    pub retrieval_id: String,
    pub success: bool,
    pub status: RetrievalStatus,
    pub completed_suboperations: u32,
    pub failed_suboperations: u32,
    pub warning_suboperations: u32,
    pub remaining_suboperations: u32,
    pub error_message: Option<String>,
}

impl MoveResult {
    pub fn from_progress(progress: &RetrievalProgress) -> Self {
        Self {
            retrieval_id: progress.retrieval_id.clone(),
            success: matches!(
                progress.status,
                RetrievalStatus::Completed | RetrievalStatus::CompletedWithErrors
            ) && progress.error_message.is_none(),
            status: progress.status,
            completed_suboperations: progress.completed,
            failed_suboperations: progress.failed,
            warning_suboperations: progress.warnings,
            remaining_suboperations: progress.remaining(),
            error_message: progress.error_message.clone(),
        }
    }
}
