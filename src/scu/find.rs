//
// find.rs
// Pacs-Bridge-rs
//
// Hierarchical C-FIND: builds level-specific keys and drains the pending response stream.
//
// Thales Matheus Mendonça Santos - November 2025

use tracing::{debug, info, warn};

use super::{response_status, DimseScu};
use crate::association::Connector;
use crate::attributes::Attributes;
use crate::dimse::{command_field, find_request, Service, StatusClass, STUDY_ROOT_FIND};
use crate::error::Result;
use crate::models::{QueryLevel, RemoteNode};
use crate::query::{QueryFilters, QueryKeys};

impl<C: Connector> DimseScu<C> {
    /// Runs a Study Root C-FIND and returns every matching entity.
    ///
    /// The association stays open until the final response arrives, so the
    /// results are collected before returning.
    pub fn find(&self, node: &RemoteNode, level: QueryLevel, filters: &QueryFilters) -> Result<Vec<Attributes>> {
        let keys = QueryKeys::for_level(level, filters)?;
        node.validate()?;

        let mut association = self.associate(node, &Service::Find)?;
        let message_id = association.next_message_id();
        debug!("C-FIND {} level to {} (message {})", level, node, message_id);
        association.send(
            STUDY_ROOT_FIND,
            &find_request(STUDY_ROOT_FIND, message_id, keys.to_object()),
        )?;

        let mut results = Vec::new();
        loop {
            let response = association.receive()?;
            let status = response_status(&response, command_field::C_FIND_RSP, message_id)?;
            let class = StatusClass::of(status);
            if !class.is_final() {
                match &response.dataset {
                    Some(identifier) => results.push(Attributes::from_object(identifier)),
                    None => debug!("Pending C-FIND response from {} without identifier", node),
                }
                continue;
            }
            if class != StatusClass::Success {
                warn!(
                    "C-FIND to {} ended with {:?} status 0x{:04X}{}; keeping {} result(s)",
                    node,
                    class,
                    status,
                    response
                        .error_comment()
                        .map(|c| format!(" ({})", c))
                        .unwrap_or_default(),
                    results.len()
                );
            }
            break;
        }

        if let Err(e) = association.release() {
            warn!("Release after C-FIND to {} failed: {}", node, e);
        }
        info!("C-FIND {} level on {} returned {} result(s)", level, node, results.len());
        Ok(results)
    }
}
