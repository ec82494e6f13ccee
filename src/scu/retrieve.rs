//
// retrieve.rs
// Pacs-Bridge-rs
//
// C-MOVE retrieval: streams sub-operation progress into the retrieval tracker until a terminal status.
//
// Thales Matheus Mendonça Santos - November 2025

use tracing::{debug, info, warn};

use super::{response_status, DimseScu};
use crate::association::{Connector, ScopedAssociation};
use crate::dimse::{cancel_request, command_field, move_request, DimseMessage, Service, StatusClass, STUDY_ROOT_MOVE};
use crate::error::Result;
use crate::models::{validate_ae_title, MoveResult, RemoteNode, RetrievalStatus, SubOperationCounts};
use crate::progress::RetrievalHandle;
use crate::query::MoveScope;

/// Status a peer uses for "sub-operations complete, one or more failures or warnings".
const SUBOPERATIONS_COMPLETE_WITH_FAILURES: u16 = 0xB000;

fn counts_of(response: &DimseMessage) -> SubOperationCounts {
    let fields = response.sub_operations();
    SubOperationCounts {
        remaining: fields.remaining.map(u32::from),
        completed: fields.completed.map(u32::from).unwrap_or(0),
        failed: fields.failed.map(u32::from).unwrap_or(0),
        warning: fields.warning.map(u32::from).unwrap_or(0),
    }
}

/// Terminal status reached while consuming the response stream.
struct Outcome {
    status: RetrievalStatus,
    error_message: Option<String>,
}

impl Outcome {
    fn new(status: RetrievalStatus, error_message: Option<String>) -> Self {
        Self { status, error_message }
    }
}

impl<C: Connector> DimseScu<C> {
    /// Asks `node` to push everything in `scope` to `destination`.
    ///
    /// The job behind `handle` is driven from PENDING to a terminal status.
    /// Protocol failures are reported through the returned [`MoveResult`];
    /// `Err` means the request was invalid or the job was already finished.
    pub fn move_to(
        &self,
        node: &RemoteNode,
        scope: &MoveScope,
        destination: &str,
        handle: &RetrievalHandle,
    ) -> Result<MoveResult> {
        if let Err(e) = scope
            .validate()
            .and_then(|_| validate_ae_title(destination))
            .and_then(|_| node.validate())
        {
            handle.finish(RetrievalStatus::Failed, Some(e.to_string()))?;
            return Err(e);
        }

        handle.start()?;
        info!(
            "C-MOVE {} {} from {} to {} (retrieval {})",
            scope.level(),
            scope.study_instance_uid(),
            node,
            destination,
            handle.id()
        );

        let outcome = if handle.is_cancel_requested() {
            Outcome::new(RetrievalStatus::Cancelled, None)
        } else {
            match self.associate(node, &Service::Move) {
                Ok(mut association) => self.run_move(&mut association, scope, destination, handle),
                Err(e) => Outcome::new(RetrievalStatus::Failed, Some(e.to_string())),
            }
        };

        let progress = match handle.finish(outcome.status, outcome.error_message) {
            Ok(progress) => progress,
            Err(e) => {
                warn!("Retrieval {} finalized twice: {}", handle.id(), e);
                handle.snapshot()
            }
        };
        Ok(MoveResult::from_progress(&progress))
    }

    fn run_move(
        &self,
        association: &mut ScopedAssociation<C::Link>,
        scope: &MoveScope,
        destination: &str,
        handle: &RetrievalHandle,
    ) -> Outcome {
        match association.interrupter() {
            Some(interrupter) => handle.set_interrupter(interrupter),
            None => debug!("Retrieval {} can only be cancelled between responses", handle.id()),
        }

        let message_id = association.next_message_id();
        let request = move_request(STUDY_ROOT_MOVE, message_id, destination, scope.to_object());
        if let Err(e) = association.send(STUDY_ROOT_MOVE, &request) {
            association.abort();
            return Outcome::new(RetrievalStatus::Failed, Some(e.to_string()));
        }

        let outcome = loop {
            if handle.is_cancel_requested() {
                info!("Cancelling retrieval {}", handle.id());
                if let Err(e) = association.send(STUDY_ROOT_MOVE, &cancel_request(message_id)) {
                    debug!("C-CANCEL for retrieval {} not delivered: {}", handle.id(), e);
                }
                association.abort();
                break Outcome::new(RetrievalStatus::Cancelled, None);
            }

            let response = match association.receive() {
                Ok(response) => response,
                Err(e) => {
                    association.abort();
                    if handle.is_cancel_requested() {
                        break Outcome::new(RetrievalStatus::Cancelled, None);
                    }
                    break Outcome::new(RetrievalStatus::Failed, Some(e.to_string()));
                }
            };

            let status = match response_status(&response, command_field::C_MOVE_RSP, message_id) {
                Ok(status) => status,
                Err(e) => {
                    association.abort();
                    break Outcome::new(RetrievalStatus::Failed, Some(e.to_string()));
                }
            };

            let counts = counts_of(&response);
            let progress = match handle.record_progress(counts) {
                Ok(progress) => progress,
                Err(e) => break Outcome::new(RetrievalStatus::Failed, Some(e.to_string())),
            };

            match StatusClass::of(status) {
                StatusClass::Pending => continue,
                StatusClass::Success => {
                    if progress.failed > 0 || progress.warnings > 0 {
                        break Outcome::new(RetrievalStatus::CompletedWithErrors, None);
                    }
                    break Outcome::new(RetrievalStatus::Completed, None);
                }
                StatusClass::Warning if status == SUBOPERATIONS_COMPLETE_WITH_FAILURES => {
                    break Outcome::new(
                        RetrievalStatus::CompletedWithErrors,
                        Some(format!(
                            "C-MOVE completed with {} failed sub-operation(s), status: 0x{:04X}",
                            progress.failed, status
                        )),
                    );
                }
                StatusClass::Cancel if handle.is_cancel_requested() => {
                    break Outcome::new(RetrievalStatus::Cancelled, None);
                }
                _ => {
                    let mut message = format!("C-MOVE failed with status: 0x{:04X}", status);
                    if let Some(comment) = response.error_comment() {
                        message.push_str(&format!(" ({})", comment));
                    }
                    break Outcome::new(RetrievalStatus::Failed, Some(message));
                }
            }
        };

        if association.is_open() {
            if let Err(e) = association.release() {
                warn!("Release after C-MOVE from {} failed: {}", association.peer(), e);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use dicom::dictionary_std::tags;

    use super::super::testing::{node, response, with_counts, Script, Step};
    use super::*;
    use crate::progress::RetrievalTracker;

    fn move_rsp(status: u16, remaining: Option<u16>, completed: u16, failed: u16, warning: u16) -> Step {
        Step::Reply(with_counts(
            response(command_field::C_MOVE_RSP, status, None),
            remaining,
            completed,
            failed,
            warning,
        ))
    }

    #[test]
    fn pending_then_success_reports_final_counts() {
        let script = Script::new(vec![
            move_rsp(0xFF00, Some(2), 3, 0, 0),
            move_rsp(0x0000, None, 5, 0, 0),
        ]);
        let tracker = RetrievalTracker::new();
        let handle = tracker.register();

        let result = DimseScu::new(script.clone())
            .move_to(&node(), &MoveScope::study("1.2.3"), "VIEWER", &handle)
            .unwrap();

        assert!(result.success);
        assert_eq!(result.status, RetrievalStatus::Completed);
        assert_eq!(result.completed_suboperations, 5);
        assert_eq!(result.failed_suboperations, 0);
        assert_eq!(result.remaining_suboperations, 0);

        let log = script.log();
        assert_eq!(log.released, 1);
        let request = &log.sent[0].1;
        let destination = request.command.element(tags::MOVE_DESTINATION).unwrap().to_str().unwrap();
        assert_eq!(destination.trim(), "VIEWER");

        let snapshot = tracker.snapshot(&handle.id()).unwrap();
        assert_eq!(snapshot.total, 5);
        assert!(snapshot.end_time.is_some());
    }

    #[test]
    fn success_with_failed_suboperations_completes_with_errors() {
        let script = Script::new(vec![
            move_rsp(0xFF00, Some(3), 1, 1, 0),
            move_rsp(0x0000, None, 3, 1, 0),
        ]);
        let handle = RetrievalTracker::new().register();
        let result = DimseScu::new(script)
            .move_to(&node(), &MoveScope::study("1.2.3"), "VIEWER", &handle)
            .unwrap();
        assert_eq!(result.status, RetrievalStatus::CompletedWithErrors);
        assert!(result.success);
        assert_eq!(result.failed_suboperations, 1);
    }

    #[test]
    fn failure_status_is_reported_with_code() {
        let script = Script::new(vec![move_rsp(0xA801, None, 0, 0, 0)]);
        let handle = RetrievalTracker::new().register();
        let result = DimseScu::new(script)
            .move_to(&node(), &MoveScope::study("1.2.3"), "UNKNOWN", &handle)
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.status, RetrievalStatus::Failed);
        assert!(result.error_message.unwrap().contains("0xA801"));
    }

    #[test]
    fn transport_error_keeps_last_counts() {
        let script = Script::new(vec![
            move_rsp(0xFF00, Some(6), 4, 0, 0),
            Step::Fail("connection reset by peer"),
        ]);
        let handle = RetrievalTracker::new().register();
        let result = DimseScu::new(script.clone())
            .move_to(&node(), &MoveScope::series("1.2.3", "1.2.3.4"), "VIEWER", &handle)
            .unwrap();
        assert_eq!(result.status, RetrievalStatus::Failed);
        assert_eq!(result.completed_suboperations, 4);
        assert!(result.error_message.unwrap().contains("connection reset"));

        let log = script.log();
        assert_eq!(log.aborted + log.released, 1);
    }

    #[test]
    fn cancellation_sends_cancel_and_aborts() {
        let script = Script::new(vec![move_rsp(0xFF00, Some(8), 1, 0, 0)]);
        let tracker = RetrievalTracker::new();
        let handle = tracker.register();
        tracker.cancel(&handle.id()).unwrap();

        let result = DimseScu::new(script.clone())
            .move_to(&node(), &MoveScope::study("1.2.3"), "VIEWER", &handle)
            .unwrap();
        assert_eq!(result.status, RetrievalStatus::Cancelled);
        assert!(!result.success);
        // Cancelled before dialing.
        assert_eq!(script.log().opened, 0);
    }

    #[test]
    fn cancellation_mid_stream_emits_c_cancel() {
        let tracker = RetrievalTracker::new();
        let handle = tracker.register();
        let poller = tracker.clone();
        let id = handle.id();
        let script = Script::new(vec![
            Step::ReplyThen(
                with_counts(response(command_field::C_MOVE_RSP, 0xFF00, None), Some(8), 1, 0, 0),
                Box::new(move || {
                    poller.cancel(&id).unwrap();
                }),
            ),
            move_rsp(0xFF00, Some(7), 2, 0, 0),
        ]);

        let result = DimseScu::new(script.clone())
            .move_to(&node(), &MoveScope::study("1.2.3"), "VIEWER", &handle)
            .unwrap();

        assert_eq!(result.status, RetrievalStatus::Cancelled);
        assert_eq!(result.completed_suboperations, 1);
        let log = script.log();
        assert_eq!(log.sent.len(), 2);
        let (syntax, cancel) = &log.sent[1];
        assert_eq!(syntax, STUDY_ROOT_MOVE);
        assert_eq!(cancel.command_field(), Some(command_field::C_CANCEL_RQ));
        assert_eq!(log.aborted, 1);
        assert_eq!(log.released, 0);
    }

    #[test]
    fn cancel_unblocks_a_silent_peer() {
        use std::time::{Duration, Instant};

        let script = Script::new(vec![move_rsp(0xFF00, Some(8), 1, 0, 0), Step::Block]);
        let tracker = RetrievalTracker::new();
        let handle = tracker.register();
        let id = handle.id();

        let scu = DimseScu::new(script.clone());
        let worker = std::thread::spawn(move || {
            scu.move_to(&node(), &MoveScope::study("1.2.3"), "VIEWER", &handle)
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !script.log().blocked {
            assert!(Instant::now() < deadline, "move never reached the blocking read");
            std::thread::sleep(Duration::from_millis(5));
        }
        let started = Instant::now();
        tracker.cancel(&id).unwrap();
        let result = worker.join().unwrap().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, RetrievalStatus::Cancelled);
        assert_eq!(result.completed_suboperations, 1);
        let log = script.log();
        assert_eq!(log.interrupted, 1);
        assert_eq!(log.aborted, 1);
        assert_eq!(tracker.snapshot(&id).unwrap().status, RetrievalStatus::Cancelled);
    }

    #[test]
    fn invalid_destination_fails_without_connecting() {
        let script = Script::new(Vec::new());
        let handle = RetrievalTracker::new().register();
        let err = DimseScu::new(script.clone())
            .move_to(&node(), &MoveScope::study("1.2.3"), "", &handle)
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(script.log().opened, 0);
        assert_eq!(handle.snapshot().status, RetrievalStatus::Failed);
    }
}
