//
// error.rs
// Pacs-Bridge-rs
//
// Error taxonomy shared by the association client, the DIMSE operations, the DICOMweb client and the router.
//
// Thales Matheus Mendonça Santos - November 2025

use thiserror::Error;

/// Result type alias for PACS operations.
pub type Result<T> = std::result::Result<T, PacsError>;

/// Everything that can stop an operation from being attempted or completed.
///
/// Expected protocol outcomes (a failed C-ECHO status, a C-MOVE that ends in
/// failure) are *not* errors: they are reported through `EchoResult` and
/// `MoveResult`.
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("PACS not found: {0}")]
    UnknownPacs(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Missing query key: {0}")]
    MissingQueryKey(&'static str),

    #[error("Failed to connect to {peer}: {reason}")]
    ConnectFailed { peer: String, reason: String },

    #[error("Incompatible connection to {peer}: {reason}")]
    IncompatibleConnection { peer: String, reason: String },

    #[error("Association rejected by {peer}: {reason}")]
    SecurityFailure { peer: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("DIMSE protocol error: {0}")]
    Protocol(String),

    #[error("HTTP request failed with status {status}: {url}")]
    Http { status: u16, url: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Retrieval {0} already finished")]
    RetrievalFinalized(String),

    #[error("Retrieval not found: {0}")]
    UnknownRetrieval(String),
}

impl PacsError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Caller mistakes that must never be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PacsError::Configuration(_)
                | PacsError::UnknownPacs(_)
                | PacsError::Unsupported(_)
                | PacsError::MissingQueryKey(_)
        )
    }

    /// Failures to establish an association.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            PacsError::ConnectFailed { .. }
                | PacsError::IncompatibleConnection { .. }
                | PacsError::SecurityFailure { .. }
        )
    }
}

impl From<reqwest::Error> for PacsError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => PacsError::Http {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => PacsError::Transport(err.to_string()),
        }
    }
}

impl From<std::io::Error> for PacsError {
    fn from(err: std::io::Error) -> Self {
        PacsError::Transport(err.to_string())
    }
}
