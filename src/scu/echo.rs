//
// echo.rs
// Pacs-Bridge-rs
//
// C-ECHO verification with round-trip timing.
//
// Thales Matheus Mendonça Santos - November 2025

use std::time::Instant;

use tracing::{info, warn};

use super::{response_status, DimseScu};
use crate::association::Connector;
use crate::dimse::{command_field, echo_request, Service, VERIFICATION};
use crate::error::Result;
use crate::models::{EchoResult, RemoteNode};

impl<C: Connector> DimseScu<C> {
    /// Verifies that `node` answers C-ECHO.
    ///
    /// Never fails: every problem becomes an unsuccessful [`EchoResult`]. The
    /// response time runs from dial start to response receipt, or to the point
    /// of failure; a descriptor rejected before dialing reports 0 ms.
    pub fn echo(&self, node: &RemoteNode) -> EchoResult {
        if let Err(e) = node.validate() {
            return EchoResult::failure(0, e.to_string());
        }

        let started = Instant::now();
        let outcome = self.echo_exchange(node);
        let elapsed_ms = |at: Instant| at.duration_since(started).as_millis() as u64;

        match outcome {
            Ok((0x0000, received)) => {
                let ms = elapsed_ms(received);
                info!("C-ECHO to {} succeeded in {} ms", node, ms);
                EchoResult::success(ms)
            }
            Ok((status, received)) => {
                warn!("C-ECHO to {} returned status 0x{:04X}", node, status);
                EchoResult::failure(elapsed_ms(received), format!("Unexpected status: 0x{:04X}", status))
            }
            Err(e) => {
                warn!("C-ECHO to {} failed: {}", node, e);
                EchoResult::failure(elapsed_ms(Instant::now()), e.to_string())
            }
        }
    }

    fn echo_exchange(&self, node: &RemoteNode) -> Result<(u16, Instant)> {
        let mut association = self.associate(node, &Service::Verification)?;
        let message_id = association.next_message_id();
        association.send(VERIFICATION, &echo_request(message_id))?;
        let response = association.receive()?;
        let received = Instant::now();
        let status = response_status(&response, command_field::C_ECHO_RSP, message_id)?;

        if let Err(e) = association.release() {
            warn!("Release after C-ECHO to {} failed: {}", node, e);
        }
        Ok((status, received))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{node, response, Script, Step};
    use super::*;
    use crate::models::RemoteNode;

    #[test]
    fn success_status_reports_success() {
        let script = Script::new(vec![Step::Reply(response(command_field::C_ECHO_RSP, 0, None))]);
        let scu = DimseScu::new(script.clone());

        let result = scu.echo(&node());
        assert!(result.success);
        assert_eq!(result.message, "Connection successful");

        let log = script.log();
        assert_eq!(log.opened, 1);
        assert_eq!(log.released, 1);
        assert_eq!(log.contexts.len(), 1);
        assert_eq!(log.contexts[0].abstract_syntax, VERIFICATION);
    }

    #[test]
    fn non_zero_status_is_reported_in_message() {
        let script = Script::new(vec![Step::Reply(response(command_field::C_ECHO_RSP, 0x0211, None))]);
        let result = DimseScu::new(script).echo(&node());
        assert!(!result.success);
        assert!(result.message.contains("0x0211"));
    }

    #[test]
    fn transport_failure_still_releases() {
        let script = Script::new(vec![Step::Fail("connection reset")]);
        let result = DimseScu::new(script.clone()).echo(&node());
        assert!(!result.success);
        assert!(result.message.contains("connection reset"));
        assert_eq!(script.log().released, 1);
    }

    #[test]
    fn refused_connection_is_a_failed_result() {
        let result = DimseScu::new(Script::refusing("connection refused")).echo(&node());
        assert!(!result.success);
        assert!(result.message.contains("connection refused"));
    }

    #[test]
    fn invalid_descriptor_reports_zero_time_without_dialing() {
        let script = Script::new(Vec::new());
        let result = DimseScu::new(script.clone()).echo(&RemoteNode::new("", "pacs.local", 104));
        assert!(!result.success);
        assert_eq!(result.response_time_ms, 0);
        assert_eq!(script.log().opened, 0);
    }
}
