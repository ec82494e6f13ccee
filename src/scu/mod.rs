//
// mod.rs
// Pacs-Bridge-rs
//
// Service class user for legacy PACS: C-ECHO, C-FIND, C-MOVE and C-STORE over scoped associations.
//
// Thales Matheus Mendonça Santos - November 2025

mod echo;
mod find;
mod retrieve;
mod store;

pub use store::StoreOutcome;

use crate::association::{Connector, ScopedAssociation};
use crate::dimse::{DimseMessage, Service};
use crate::error::{PacsError, Result};
use crate::models::RemoteNode;

/// Runs DIMSE operations; every call opens its own association.
pub struct DimseScu<C: Connector> {
    connector: C,
}

impl<C: Connector> DimseScu<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    fn associate(&self, node: &RemoteNode, service: &Service) -> Result<ScopedAssociation<C::Link>> {
        ScopedAssociation::open(&self.connector, node, service)
    }
}

/// Checks the response type and the request it answers, then extracts its status.
fn response_status(response: &DimseMessage, expected_command: u16, message_id: u16) -> Result<u16> {
    match response.command_field() {
        Some(field) if field == expected_command => {}
        Some(field) => {
            return Err(PacsError::protocol(format!(
                "expected command 0x{:04X}, received 0x{:04X}",
                expected_command, field
            )))
        }
        None => return Err(PacsError::protocol("response carries no command field")),
    }
    match response.message_id_responded_to() {
        Some(id) if id != message_id => {
            return Err(PacsError::protocol(format!(
                "response answers message {}, expected {}",
                id, message_id
            )))
        }
        Some(_) => {}
        None => return Err(PacsError::protocol("response carries no message ID being responded to")),
    }
    response
        .status()
        .ok_or_else(|| PacsError::protocol("response carries no status"))
}
