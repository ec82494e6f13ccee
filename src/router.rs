//
// router.rs
// Pacs-Bridge-rs
//
// Facade routing each logical PACS operation to the legacy DIMSE backend or the DICOMweb backend.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::association::{Connector, UlConnector};
use crate::attributes::Attributes;
use crate::config::{AppConfig, PacsRegistry};
use crate::dicomweb::{DicomWebClient, RenderedMediaType};
use crate::error::{PacsError, Result};
use crate::models::{
    validate_ae_title, DicomWebEndpoint, EchoResult, MoveResult, PacsConfig, PacsEndpoint, QueryLevel, RemoteNode,
};
use crate::progress::{RetrievalHandle, RetrievalId, RetrievalTracker};
use crate::query::{MoveScope, QueryFilters, SERIES_INSTANCE_UID, STUDY_INSTANCE_UID};
use crate::scu::{DimseScu, StoreOutcome};
use crate::sweep;

/// Association-based operations (C-ECHO, C-FIND, C-MOVE, C-STORE).
pub trait LegacyBackend: Send + Sync {
    fn echo(&self, node: &RemoteNode) -> EchoResult;
    fn find(&self, node: &RemoteNode, level: QueryLevel, filters: &QueryFilters) -> Result<Vec<Attributes>>;
    fn move_to(
        &self,
        node: &RemoteNode,
        scope: &MoveScope,
        destination: &str,
        handle: &RetrievalHandle,
    ) -> Result<MoveResult>;
    fn store_file(&self, node: &RemoteNode, file: &Path) -> Result<StoreOutcome>;
}

impl<C: Connector> LegacyBackend for DimseScu<C> {
    fn echo(&self, node: &RemoteNode) -> EchoResult {
        DimseScu::echo(self, node)
    }

    fn find(&self, node: &RemoteNode, level: QueryLevel, filters: &QueryFilters) -> Result<Vec<Attributes>> {
        DimseScu::find(self, node, level, filters)
    }

    fn move_to(
        &self,
        node: &RemoteNode,
        scope: &MoveScope,
        destination: &str,
        handle: &RetrievalHandle,
    ) -> Result<MoveResult> {
        DimseScu::move_to(self, node, scope, destination, handle)
    }

    fn store_file(&self, node: &RemoteNode, file: &Path) -> Result<StoreOutcome> {
        DimseScu::store_file(self, node, file)
    }
}

/// HTTP-based operations (QIDO-RS, WADO-RS).
pub trait DicomWebBackend: Send + Sync {
    fn query_studies(&self, endpoint: &DicomWebEndpoint, params: &QueryFilters) -> Result<Vec<Attributes>>;
    fn query_series(&self, endpoint: &DicomWebEndpoint, study_uid: &str) -> Result<Vec<Attributes>>;
    fn query_instances(&self, endpoint: &DicomWebEndpoint, study_uid: &str, series_uid: &str)
        -> Result<Vec<Attributes>>;
    fn retrieve_instance(
        &self,
        endpoint: &DicomWebEndpoint,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
    ) -> Result<Vec<u8>>;
    fn retrieve_rendered(
        &self,
        endpoint: &DicomWebEndpoint,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        media_type: RenderedMediaType,
    ) -> Result<Vec<u8>>;
}

impl DicomWebBackend for DicomWebClient {
    fn query_studies(&self, endpoint: &DicomWebEndpoint, params: &QueryFilters) -> Result<Vec<Attributes>> {
        DicomWebClient::query_studies(self, endpoint, params)
    }

    fn query_series(&self, endpoint: &DicomWebEndpoint, study_uid: &str) -> Result<Vec<Attributes>> {
        DicomWebClient::query_series(self, endpoint, study_uid)
    }

    fn query_instances(
        &self,
        endpoint: &DicomWebEndpoint,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<Vec<Attributes>> {
        DicomWebClient::query_instances(self, endpoint, study_uid, series_uid)
    }

    fn retrieve_instance(
        &self,
        endpoint: &DicomWebEndpoint,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
    ) -> Result<Vec<u8>> {
        DicomWebClient::retrieve_instance(self, endpoint, study_uid, series_uid, sop_uid)
    }

    fn retrieve_rendered(
        &self,
        endpoint: &DicomWebEndpoint,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        media_type: RenderedMediaType,
    ) -> Result<Vec<u8>> {
        DicomWebClient::retrieve_rendered(self, endpoint, study_uid, series_uid, sop_uid, media_type)
    }
}

/// A validated C-MOVE waiting to run; holds the job's writer handle.
pub struct RetrievalTicket {
    node: RemoteNode,
    scope: MoveScope,
    destination: String,
    handle: RetrievalHandle,
}

impl RetrievalTicket {
    pub fn id(&self) -> RetrievalId {
        self.handle.id()
    }
}

/// Result of verifying one PACS in a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct PacsEcho {
    pub pacs_id: String,
    #[serde(flatten)]
    pub result: EchoResult,
}

/// Entry point for every PACS operation, keyed by configured PACS id.
pub struct PacsRouter<L: LegacyBackend, W: DicomWebBackend> {
    registry: PacsRegistry,
    legacy: L,
    web: W,
    tracker: RetrievalTracker,
    default_destination: String,
}

impl<L: LegacyBackend, W: DicomWebBackend> PacsRouter<L, W> {
    pub fn new(registry: PacsRegistry, legacy: L, web: W, default_destination: impl Into<String>) -> Self {
        Self {
            registry,
            legacy,
            web,
            tracker: RetrievalTracker::new(),
            default_destination: default_destination.into(),
        }
    }

    pub fn legacy(&self) -> &L {
        &self.legacy
    }

    pub fn web(&self) -> &W {
        &self.web
    }

    pub fn tracker(&self) -> &RetrievalTracker {
        &self.tracker
    }

    pub fn default_destination(&self) -> &str {
        &self.default_destination
    }

    pub fn list_pacs(&self) -> Vec<PacsConfig> {
        self.registry.active().cloned().collect()
    }

    fn lookup(&self, pacs_id: &str) -> Result<&PacsConfig> {
        self.registry.lookup(pacs_id)
    }

    /// C-ECHO for legacy PACS, a one-result QIDO-RS query for DICOMweb.
    pub fn test_connection(&self, pacs_id: &str) -> Result<EchoResult> {
        let pacs = self.lookup(pacs_id)?;
        info!("Testing connection to {} ({})", pacs.id, pacs.endpoint.protocol_name());
        match &pacs.endpoint {
            PacsEndpoint::Legacy(node) => Ok(self.legacy.echo(node)),
            PacsEndpoint::DicomWeb(endpoint) => {
                let params = QueryFilters::new().with("limit", "1");
                let started = Instant::now();
                let outcome = self.web.query_studies(endpoint, &params);
                let elapsed = started.elapsed().as_millis() as u64;
                Ok(match outcome {
                    Ok(_) => EchoResult::success(elapsed),
                    Err(e) if e.is_configuration() => EchoResult::failure(0, e.to_string()),
                    Err(e) => {
                        warn!("DICOMweb connection test for {} failed: {}", pacs.id, e);
                        EchoResult::failure(elapsed, e.to_string())
                    }
                })
            }
        }
    }

    /// Legacy filters become STUDY level query keys; DICOMweb filters become QIDO-RS parameters.
    pub fn query_studies(&self, pacs_id: &str, filters: &QueryFilters) -> Result<Vec<Attributes>> {
        match &self.lookup(pacs_id)?.endpoint {
            PacsEndpoint::Legacy(node) => self.legacy.find(node, QueryLevel::Study, filters),
            PacsEndpoint::DicomWeb(endpoint) => self.web.query_studies(endpoint, filters),
        }
    }

    pub fn query_series(&self, pacs_id: &str, study_uid: &str) -> Result<Vec<Attributes>> {
        require_uid(STUDY_INSTANCE_UID, study_uid)?;
        match &self.lookup(pacs_id)?.endpoint {
            PacsEndpoint::Legacy(node) => {
                let filters = QueryFilters::new().with(STUDY_INSTANCE_UID, study_uid);
                self.legacy.find(node, QueryLevel::Series, &filters)
            }
            PacsEndpoint::DicomWeb(endpoint) => self.web.query_series(endpoint, study_uid),
        }
    }

    pub fn query_instances(&self, pacs_id: &str, study_uid: &str, series_uid: &str) -> Result<Vec<Attributes>> {
        require_uid(STUDY_INSTANCE_UID, study_uid)?;
        require_uid(SERIES_INSTANCE_UID, series_uid)?;
        match &self.lookup(pacs_id)?.endpoint {
            PacsEndpoint::Legacy(node) => {
                let filters = QueryFilters::new()
                    .with(STUDY_INSTANCE_UID, study_uid)
                    .with(SERIES_INSTANCE_UID, series_uid);
                self.legacy.find(node, QueryLevel::Image, &filters)
            }
            PacsEndpoint::DicomWeb(endpoint) => self.web.query_instances(endpoint, study_uid, series_uid),
        }
    }

    pub fn retrieve_study(&self, pacs_id: &str, study_uid: &str, destination: Option<&str>) -> Result<MoveResult> {
        self.retrieve(pacs_id, MoveScope::study(study_uid), destination)
    }

    pub fn retrieve_series(
        &self,
        pacs_id: &str,
        study_uid: &str,
        series_uid: &str,
        destination: Option<&str>,
    ) -> Result<MoveResult> {
        self.retrieve(pacs_id, MoveScope::series(study_uid, series_uid), destination)
    }

    pub fn retrieve_instance(
        &self,
        pacs_id: &str,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        destination: Option<&str>,
    ) -> Result<MoveResult> {
        self.retrieve(pacs_id, MoveScope::image(study_uid, series_uid, sop_uid), destination)
    }

    /// Validates and runs a C-MOVE to completion.
    pub fn retrieve(&self, pacs_id: &str, scope: MoveScope, destination: Option<&str>) -> Result<MoveResult> {
        let ticket = self.begin_retrieval(pacs_id, scope, destination)?;
        self.run_retrieval(ticket)
    }

    /// Validates a C-MOVE and registers its job without touching the network.
    ///
    /// Usage errors (DICOMweb PACS, blank UIDs, bad destination) fail here.
    pub fn begin_retrieval(
        &self,
        pacs_id: &str,
        scope: MoveScope,
        destination: Option<&str>,
    ) -> Result<RetrievalTicket> {
        let pacs = self.lookup(pacs_id)?;
        let node = match &pacs.endpoint {
            PacsEndpoint::Legacy(node) => node.clone(),
            PacsEndpoint::DicomWeb(_) => {
                return Err(PacsError::Unsupported(format!(
                    "C-MOVE is only supported for legacy PACS; {} uses DICOMweb (retrieve with WADO-RS instead)",
                    pacs.id
                )))
            }
        };
        scope.validate()?;
        let destination = destination
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(self.default_destination.as_str())
            .to_string();
        validate_ae_title(&destination)?;

        let handle = self.tracker.register();
        debug!("Retrieval {} registered for {} on {}", handle.id(), scope.study_instance_uid(), pacs.id);
        Ok(RetrievalTicket {
            node,
            scope,
            destination,
            handle,
        })
    }

    pub fn run_retrieval(&self, ticket: RetrievalTicket) -> Result<MoveResult> {
        self.legacy
            .move_to(&ticket.node, &ticket.scope, &ticket.destination, &ticket.handle)
    }

    pub fn cancel_retrieval(&self, retrieval_id: &RetrievalId) -> Result<()> {
        self.tracker.cancel(retrieval_id).map(|_| ())
    }

    /// WADO-RS retrieval of one instance as DICOM Part 10 bytes.
    pub fn fetch_instance(&self, pacs_id: &str, study_uid: &str, series_uid: &str, sop_uid: &str) -> Result<Vec<u8>> {
        let endpoint = self.dicom_web_endpoint(pacs_id, "WADO-RS retrieval")?;
        self.web.retrieve_instance(endpoint, study_uid, series_uid, sop_uid)
    }

    pub fn fetch_rendered(
        &self,
        pacs_id: &str,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        media_type: RenderedMediaType,
    ) -> Result<Vec<u8>> {
        let endpoint = self.dicom_web_endpoint(pacs_id, "WADO-RS rendered retrieval")?;
        self.web
            .retrieve_rendered(endpoint, study_uid, series_uid, sop_uid, media_type)
    }

    /// C-STORE of a local file to a legacy PACS.
    pub fn store(&self, pacs_id: &str, file: &Path) -> Result<StoreOutcome> {
        let pacs = self.lookup(pacs_id)?;
        match &pacs.endpoint {
            PacsEndpoint::Legacy(node) => self.legacy.store_file(node, file),
            PacsEndpoint::DicomWeb(_) => Err(PacsError::Unsupported(format!(
                "C-STORE is only supported for legacy PACS; {} uses DICOMweb",
                pacs.id
            ))),
        }
    }

    /// Verifies every active legacy PACS in parallel.
    pub fn echo_all(&self) -> Vec<PacsEcho> {
        let targets: Vec<(String, RemoteNode)> = self
            .registry
            .active()
            .filter_map(|pacs| match &pacs.endpoint {
                PacsEndpoint::Legacy(node) => Some((pacs.id.clone(), node.clone())),
                PacsEndpoint::DicomWeb(_) => None,
            })
            .collect();
        sweep::echo_all(&self.legacy, targets)
    }

    fn dicom_web_endpoint(&self, pacs_id: &str, operation: &str) -> Result<&DicomWebEndpoint> {
        let pacs = self.lookup(pacs_id)?;
        match &pacs.endpoint {
            PacsEndpoint::DicomWeb(endpoint) => Ok(endpoint),
            PacsEndpoint::Legacy(_) => Err(PacsError::Unsupported(format!(
                "{} requires a DICOMweb PACS; {} is legacy (use C-MOVE instead)",
                operation, pacs.id
            ))),
        }
    }
}

/// The production router: `dicom-ul` associations and a blocking `reqwest` client.
pub type Bridge = PacsRouter<DimseScu<UlConnector>, DicomWebClient>;

impl PacsRouter<DimseScu<UlConnector>, DicomWebClient> {
    /// Retrievals default to moving into our own AE.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(PacsRouter::new(
            config.registry(),
            DimseScu::new(UlConnector::new(config.local.clone())),
            DicomWebClient::new()?,
            config.local.ae_title.clone(),
        ))
    }
}

fn require_uid(keyword: &'static str, uid: &str) -> Result<()> {
    if uid.trim().is_empty() {
        return Err(PacsError::MissingQueryKey(keyword));
    }
    Ok(())
}
