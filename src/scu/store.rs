//
// store.rs
// Pacs-Bridge-rs
//
// C-STORE push of a local DICOM file to a legacy PACS.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::Path;

use dicom::object::open_file;
use serde::Serialize;
use tracing::{info, warn};

use super::{response_status, DimseScu};
use crate::association::Connector;
use crate::dimse::{
    command_field, is_known_storage_class, is_uncompressed, store_request, Service, StatusClass,
};
use crate::error::{PacsError, Result};
use crate::models::RemoteNode;

/// What the peer answered to one C-STORE-RQ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreOutcome {
    pub sop_instance_uid: String,
    pub status: u16,
    pub success: bool,
    pub message: String,
}

fn clean_uid(uid: &str) -> String {
    uid.trim_end_matches('\0').trim().to_string()
}

/// Native encodings convert freely; anything else goes out exactly as stored.
fn can_send_as(file_syntax: &str, accepted: &str) -> bool {
    file_syntax == accepted || (is_uncompressed(file_syntax) && is_uncompressed(accepted))
}

impl<C: Connector> DimseScu<C> {
    /// Sends the instance stored in `file` to `node`.
    pub fn store_file(&self, node: &RemoteNode, file: &Path) -> Result<StoreOutcome> {
        let obj = open_file(file)
            .map_err(|e| PacsError::Decode(format!("failed to open {}: {}", file.display(), e)))?;

        let sop_class = clean_uid(obj.meta().media_storage_sop_class_uid());
        let sop_instance = clean_uid(obj.meta().media_storage_sop_instance_uid());
        let transfer_syntax = clean_uid(obj.meta().transfer_syntax());
        if !is_known_storage_class(&sop_class) {
            warn!("SOP class {} is not in the default storage list; offering it anyway", sop_class);
        }

        let service = Service::Storage {
            sop_class_uid: sop_class.clone(),
            transfer_syntax: Some(transfer_syntax.clone()),
        };
        let mut association = self.associate(node, &service)?;
        let accepted = association
            .transfer_syntax(&sop_class)
            .map(|ts| clean_uid(&ts))
            .ok_or_else(|| PacsError::IncompatibleConnection {
                peer: node.to_string(),
                reason: format!("no accepted presentation context for {}", sop_class),
            })?;
        if !can_send_as(&transfer_syntax, &accepted) {
            return Err(PacsError::IncompatibleConnection {
                peer: node.to_string(),
                reason: format!(
                    "peer accepted {} for a file encoded in {}",
                    accepted, transfer_syntax
                ),
            });
        }
        let message_id = association.next_message_id();
        let request = store_request(&sop_class, &sop_instance, message_id, obj.into_inner());
        association.send(&sop_class, &request)?;

        let response = association.receive()?;
        let status = response_status(&response, command_field::C_STORE_RSP, message_id)?;
        if let Err(e) = association.release() {
            warn!("Release after C-STORE to {} failed: {}", node, e);
        }

        let class = StatusClass::of(status);
        let success = matches!(class, StatusClass::Success | StatusClass::Warning);
        let message = match (class, response.error_comment()) {
            (StatusClass::Success, _) => "Stored".to_string(),
            (_, Some(comment)) => format!("Status 0x{:04X}: {}", status, comment),
            (_, None) => format!("Status 0x{:04X}", status),
        };
        info!("C-STORE {} to {}: {}", sop_instance, node, message);

        Ok(StoreOutcome {
            sop_instance_uid: sop_instance,
            status,
            success,
            message,
        })
    }
}
