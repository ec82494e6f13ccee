//
// association.rs
// Pacs-Bridge-rs
//
// Association client: opens one Upper Layer association per operation and guarantees it is released exactly once.
//
// Thales Matheus Mendonça Santos - November 2025

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::{TransferSyntax, TransferSyntaxRegistry};
use dicom_ul::association::client::{ClientAssociation, ClientAssociationOptions};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu, PresentationContextResultReason};
use tracing::{debug, info, warn};

use crate::config::LocalAe;
use crate::dimse::{DimseMessage, PresentationContextSpec, Service, IMPLICIT_VR_LITTLE_ENDIAN};
use crate::error::{PacsError, Result};
use crate::models::RemoteNode;

/// Closes a link's transport from another thread, failing any read blocked on it.
pub type Interrupter = Box<dyn Fn() + Send + Sync>;

/// The protocol engine contract: a live association able to exchange whole DIMSE messages.
pub trait DimseLink {
    /// Transfer syntax the peer accepted for `abstract_syntax`, if it accepted it at all.
    fn transfer_syntax(&self, abstract_syntax: &str) -> Option<String>;

    /// Sends `message` on the accepted presentation context for `abstract_syntax`.
    fn send(&mut self, abstract_syntax: &str, message: &DimseMessage) -> Result<()>;

    /// Blocks until one complete message (command set plus data set, if any) arrives.
    fn receive(&mut self) -> Result<DimseMessage>;

    /// Orderly A-RELEASE.
    fn release(&mut self) -> Result<()>;

    /// A-ABORT; closes the connection without negotiation.
    fn abort(&mut self);

    /// A handle that unblocks a pending `receive`, when the transport supports one.
    fn interrupter(&mut self) -> Option<Interrupter> {
        None
    }
}

/// Opens associations to remote nodes.
pub trait Connector: Send + Sync {
    type Link: DimseLink;

    fn open(&self, node: &RemoteNode, contexts: &[PresentationContextSpec]) -> Result<Self::Link>;
}

/// An open association whose release is tied to its scope.
///
/// `release` and `abort` are idempotent; whichever runs first (explicitly or
/// from `Drop`) is the only one that reaches the link.
pub struct ScopedAssociation<L: DimseLink> {
    link: L,
    peer: String,
    open: bool,
    next_message_id: u16,
}

impl<L: DimseLink> ScopedAssociation<L> {
    /// Opens an association offering exactly the contexts `service` needs.
    pub fn open<C>(connector: &C, node: &RemoteNode, service: &Service) -> Result<Self>
    where
        C: Connector<Link = L>,
    {
        let contexts = service.presentation_contexts();
        debug!(
            "Opening association to {} with {} presentation context(s)",
            node,
            contexts.len()
        );
        let link = connector.open(node, &contexts)?;
        info!("Association established with {}", node);
        Ok(Self {
            link,
            peer: node.to_string(),
            open: true,
            next_message_id: 1,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Message IDs are unique within the association.
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    pub fn transfer_syntax(&self, abstract_syntax: &str) -> Option<String> {
        self.link.transfer_syntax(abstract_syntax)
    }

    pub fn send(&mut self, abstract_syntax: &str, message: &DimseMessage) -> Result<()> {
        if !self.open {
            return Err(PacsError::transport(format!(
                "association with {} is closed",
                self.peer
            )));
        }
        self.link.send(abstract_syntax, message)
    }

    pub fn receive(&mut self) -> Result<DimseMessage> {
        if !self.open {
            return Err(PacsError::transport(format!(
                "association with {} is closed",
                self.peer
            )));
        }
        self.link.receive()
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        debug!("Releasing association with {}", self.peer);
        self.link.release()
    }

    pub fn abort(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        warn!("Aborting association with {}", self.peer);
        self.link.abort();
    }

    pub fn interrupter(&mut self) -> Option<Interrupter> {
        if !self.open {
            return None;
        }
        self.link.interrupter()
    }
}

impl<L: DimseLink> Drop for ScopedAssociation<L> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release association with {}: {}", self.peer, e);
        }
    }
}

/// Production connector backed by `dicom-ul`.
#[derive(Debug, Clone)]
pub struct UlConnector {
    local: LocalAe,
}

impl UlConnector {
    pub fn new(local: LocalAe) -> Self {
        Self { local }
    }
}

impl Connector for UlConnector {
    type Link = UlLink;

    fn open(&self, node: &RemoteNode, contexts: &[PresentationContextSpec]) -> Result<UlLink> {
        node.validate()?;
        if contexts.is_empty() {
            return Err(PacsError::configuration("no presentation contexts requested"));
        }

        let connect_timeout = node
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.local.connect_timeout());
        let read_timeout = node
            .read_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.local.read_timeout());
        let max_pdu = node.max_pdu.unwrap_or(self.local.max_pdu);

        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.local.ae_title.clone())
            .called_ae_title(node.ae_title.clone())
            .max_pdu_length(max_pdu)
            .read_timeout(read_timeout)
            .write_timeout(read_timeout);
        for ctx in contexts {
            options =
                options.with_presentation_context(ctx.abstract_syntax.clone(), ctx.transfer_syntaxes.clone());
        }

        let peer = node.to_string();
        let address = reachable_address(node, connect_timeout)?;
        let association = options
            .establish(address)
            .map_err(|e| classify_establish_error(&peer, e))?;

        // Context IDs are assigned 1, 3, 5, ... in the order they were proposed.
        let accepted: Vec<AcceptedContext> = association
            .presentation_contexts()
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .filter_map(|pc| {
                let index = (pc.id as usize).checked_sub(1)? / 2;
                let requested = contexts.get(index)?;
                Some(AcceptedContext {
                    id: pc.id,
                    abstract_syntax: requested.abstract_syntax.clone(),
                    transfer_syntax: pc.transfer_syntax.trim_end_matches('\0').trim().to_string(),
                })
            })
            .collect();

        if accepted.is_empty() {
            let _ = association.abort();
            return Err(PacsError::IncompatibleConnection {
                peer,
                reason: "no presentation context accepted".to_string(),
            });
        }

        let max_send = match association.acceptor_max_pdu_length() {
            0 => max_pdu,
            n => n,
        };

        Ok(UlLink {
            association: Some(association),
            accepted,
            max_send,
            peer,
        })
    }
}

/// Dials `node` within `timeout` and returns the first address that accepts a TCP connection.
///
/// `establish` connects without a deadline, so an unreachable host has to be caught here.
pub fn reachable_address(node: &RemoteNode, timeout: Duration) -> Result<SocketAddr> {
    let peer = node.to_string();
    let addresses = node
        .socket_addr()
        .to_socket_addrs()
        .map_err(|e| PacsError::ConnectFailed {
            peer: peer.clone(),
            reason: format!("cannot resolve {}: {}", node.host, e),
        })?;
    // A zero duration is rejected by `connect_timeout`.
    let timeout = timeout.max(Duration::from_millis(1));

    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(_) => return Ok(address),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {
                last_error = Some(format!(
                    "connect to {} timed out after {} ms",
                    address,
                    timeout.as_millis()
                ));
            }
            Err(e) => last_error = Some(format!("connect to {} failed: {}", address, e)),
        }
    }
    Err(PacsError::ConnectFailed {
        peer,
        reason: last_error.unwrap_or_else(|| format!("{} resolved to no address", node.host)),
    })
}

fn classify_establish_error(peer: &str, err: dicom_ul::association::client::Error) -> PacsError {
    use dicom_ul::association::client::Error as UlError;
    match err {
        UlError::Rejected { .. } => PacsError::SecurityFailure {
            peer: peer.to_string(),
            reason: err.to_string(),
        },
        UlError::NoAcceptedPresentationContexts { .. } => PacsError::IncompatibleConnection {
            peer: peer.to_string(),
            reason: err.to_string(),
        },
        other => PacsError::ConnectFailed {
            peer: peer.to_string(),
            reason: other.to_string(),
        },
    }
}

#[derive(Debug, Clone)]
struct AcceptedContext {
    id: u8,
    abstract_syntax: String,
    transfer_syntax: String,
}

/// A `dicom-ul` client association speaking whole DIMSE messages.
pub struct UlLink {
    association: Option<ClientAssociation>,
    accepted: Vec<AcceptedContext>,
    max_send: u32,
    peer: String,
}

impl UlLink {
    fn association(&mut self) -> Result<&mut ClientAssociation> {
        self.association
            .as_mut()
            .ok_or_else(|| PacsError::transport(format!("association with {} is closed", self.peer)))
    }

    fn context_for(&self, abstract_syntax: &str) -> Result<AcceptedContext> {
        self.accepted
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
            .cloned()
            .ok_or_else(|| PacsError::IncompatibleConnection {
                peer: self.peer.clone(),
                reason: format!("no accepted presentation context for {}", abstract_syntax),
            })
    }

    fn send_fragments(&mut self, pc_id: u8, value_type: PDataValueType, bytes: Vec<u8>) -> Result<()> {
        // PDV item header is 6 bytes (length + context id + control header).
        let chunk_size = (self.max_send as usize).saturating_sub(6).max(1024);
        let chunks: Vec<Vec<u8>> = if bytes.is_empty() {
            vec![Vec::new()]
        } else {
            bytes.chunks(chunk_size).map(|c| c.to_vec()).collect()
        };
        let last = chunks.len() - 1;
        let peer = self.peer.clone();
        let association = self.association()?;
        for (i, data) in chunks.into_iter().enumerate() {
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc_id,
                    value_type: value_type.clone(),
                    is_last: i == last,
                    data,
                }],
            };
            association
                .send(&pdu)
                .map_err(|e| PacsError::transport(format!("send to {} failed: {}", peer, e)))?;
        }
        Ok(())
    }

    fn transfer_syntax_for(&self, pc_id: u8) -> Result<&'static TransferSyntax> {
        let uid = self
            .accepted
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| pc.transfer_syntax.clone())
            .ok_or_else(|| PacsError::protocol(format!("data on unknown presentation context {}", pc_id)))?;
        lookup_transfer_syntax(&uid)
    }
}

impl DimseLink for UlLink {
    fn transfer_syntax(&self, abstract_syntax: &str) -> Option<String> {
        self.accepted
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
            .map(|pc| pc.transfer_syntax.clone())
    }

    fn send(&mut self, abstract_syntax: &str, message: &DimseMessage) -> Result<()> {
        let pc = self.context_for(abstract_syntax)?;
        let command_bytes = encode_command(&message.command)?;
        self.send_fragments(pc.id, PDataValueType::Command, command_bytes)?;

        if let Some(dataset) = &message.dataset {
            let ts = lookup_transfer_syntax(&pc.transfer_syntax)?;
            let mut data_bytes = Vec::new();
            dataset
                .write_dataset_with_ts(&mut data_bytes, ts)
                .map_err(|e| PacsError::protocol(format!("failed to encode data set: {}", e)))?;
            self.send_fragments(pc.id, PDataValueType::Data, data_bytes)?;
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<DimseMessage> {
        let mut command_bytes: Vec<u8> = Vec::new();
        let mut data_bytes: Vec<u8> = Vec::new();
        let mut command: Option<DimseMessage> = None;
        let peer = self.peer.clone();

        loop {
            let pdu = self
                .association()?
                .receive()
                .map_err(|e| PacsError::transport(format!("receive from {} failed: {}", peer, e)))?;

            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        match pdv.value_type {
                            PDataValueType::Command => {
                                command_bytes.extend_from_slice(&pdv.data);
                                if pdv.is_last {
                                    let cmd = decode_command(&command_bytes)?;
                                    let message = DimseMessage::new(cmd, None);
                                    if !message.expects_dataset() {
                                        return Ok(message);
                                    }
                                    command = Some(message);
                                }
                            }
                            PDataValueType::Data => {
                                data_bytes.extend_from_slice(&pdv.data);
                                if pdv.is_last {
                                    let Some(mut message) = command.take() else {
                                        return Err(PacsError::protocol(
                                            "data set received before its command set",
                                        ));
                                    };
                                    let ts = self.transfer_syntax_for(pdv.presentation_context_id)?;
                                    let dataset =
                                        InMemDicomObject::read_dataset_with_ts(data_bytes.as_slice(), ts)
                                            .map_err(|e| {
                                                PacsError::protocol(format!(
                                                    "failed to decode data set: {}",
                                                    e
                                                ))
                                            })?;
                                    message.dataset = Some(dataset);
                                    return Ok(message);
                                }
                            }
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    let association = self.association()?;
                    let _ = association.send(&Pdu::ReleaseRP);
                    self.association = None;
                    return Err(PacsError::transport(format!(
                        "{} released the association mid-exchange",
                        peer
                    )));
                }
                Pdu::AbortRQ { source } => {
                    self.association = None;
                    return Err(PacsError::transport(format!(
                        "{} aborted the association: {:?}",
                        peer, source
                    )));
                }
                other => {
                    debug!("Ignoring unexpected PDU from {}: {:?}", peer, other);
                }
            }
        }
    }

    fn release(&mut self) -> Result<()> {
        match self.association.take() {
            Some(association) => association
                .release()
                .map_err(|e| PacsError::transport(format!("release of {} failed: {}", self.peer, e))),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        if let Some(association) = self.association.take() {
            let _ = association.abort();
        }
    }

    fn interrupter(&mut self) -> Option<Interrupter> {
        let stream = self.association.as_mut()?.inner_stream().try_clone().ok()?;
        let peer = self.peer.clone();
        Some(Box::new(move || {
            debug!("Shutting down the connection to {}", peer);
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }
}

fn lookup_transfer_syntax(uid: &str) -> Result<&'static TransferSyntax> {
    let uid = uid.trim_end_matches('\0').trim();
    TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| PacsError::protocol(format!("transfer syntax {} not supported", uid)))
}

/// Command sets are always Implicit VR Little Endian and start with their group length.
pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let ts = lookup_transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN)?;

    let mut cmd = command.clone();
    cmd.remove_element(tags::COMMAND_GROUP_LENGTH);
    let mut body = Vec::new();
    cmd.write_dataset_with_ts(&mut body, ts)
        .map_err(|e| PacsError::protocol(format!("failed to encode command set: {}", e)))?;

    cmd.put(DataElement::new(
        tags::COMMAND_GROUP_LENGTH,
        VR::UL,
        PrimitiveValue::from(body.len() as u32),
    ));
    let mut bytes = Vec::with_capacity(body.len() + 12);
    cmd.write_dataset_with_ts(&mut bytes, ts)
        .map_err(|e| PacsError::protocol(format!("failed to encode command set: {}", e)))?;
    Ok(bytes)
}

pub fn decode_command(bytes: &[u8]) -> Result<InMemDicomObject> {
    let ts = lookup_transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN)?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts)
        .map_err(|e| PacsError::protocol(format!("failed to decode command set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::{echo_request, VERIFICATION};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        releases: AtomicUsize,
        aborts: AtomicUsize,
    }

    struct CountingLink(Arc<Counters>);

    impl DimseLink for CountingLink {
        fn transfer_syntax(&self, _: &str) -> Option<String> {
            Some(IMPLICIT_VR_LITTLE_ENDIAN.to_string())
        }

        fn send(&mut self, _: &str, _: &DimseMessage) -> Result<()> {
            Ok(())
        }

        fn receive(&mut self) -> Result<DimseMessage> {
            Err(PacsError::transport("connection reset"))
        }

        fn release(&mut self) -> Result<()> {
            self.0.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn abort(&mut self) {
            self.0.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingConnector(Arc<Counters>);

    impl Connector for CountingConnector {
        type Link = CountingLink;

        fn open(&self, _: &RemoteNode, _: &[PresentationContextSpec]) -> Result<CountingLink> {
            Ok(CountingLink(self.0.clone()))
        }
    }

    fn node() -> RemoteNode {
        RemoteNode::new("PACS", "localhost", 11112)
    }

    #[test]
    fn release_runs_once_on_drop_after_error() {
        let counters = Arc::new(Counters::default());
        let connector = CountingConnector(counters.clone());
        {
            let mut assoc =
                ScopedAssociation::open(&connector, &node(), &Service::Verification).unwrap();
            assoc.send(VERIFICATION, &echo_request(1)).unwrap();
            assert!(assoc.receive().is_err());
        }
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_release_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let connector = CountingConnector(counters.clone());
        let mut assoc = ScopedAssociation::open(&connector, &node(), &Service::Find).unwrap();
        assoc.release().unwrap();
        assoc.release().unwrap();
        assert!(assoc.send(VERIFICATION, &echo_request(2)).is_err());
        drop(assoc);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_replaces_release() {
        let counters = Arc::new(Counters::default());
        let connector = CountingConnector(counters.clone());
        let mut assoc = ScopedAssociation::open(&connector, &node(), &Service::Move).unwrap();
        assoc.abort();
        drop(assoc);
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn message_ids_increase() {
        let connector = CountingConnector(Arc::default());
        let mut assoc =
            ScopedAssociation::open(&connector, &node(), &Service::Verification).unwrap();
        assert_eq!(assoc.next_message_id(), 1);
        assert_eq!(assoc.next_message_id(), 2);
    }

    #[test]
    fn unroutable_host_fails_within_the_connect_timeout() {
        // TEST-NET-1 is never routed, so the SYN goes unanswered.
        let node = RemoteNode::new("PACS", "192.0.2.1", 104);
        let started = std::time::Instant::now();
        let err = reachable_address(&node, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, PacsError::ConnectFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn listening_host_is_reachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = RemoteNode::new("PACS", "127.0.0.1", port);
        let address = reachable_address(&node, Duration::from_millis(500)).unwrap();
        assert_eq!(address.port(), port);
    }

    #[test]
    fn command_round_trip_includes_group_length() {
        let bytes = encode_command(&echo_request(5).command).unwrap();
        let decoded = decode_command(&bytes).unwrap();
        let group_length = decoded
            .element(tags::COMMAND_GROUP_LENGTH)
            .unwrap()
            .to_int::<u32>()
            .unwrap();
        // Group length covers everything after the 12-byte group length element.
        assert_eq!(group_length as usize, bytes.len() - 12);
        let message = DimseMessage::new(decoded, None);
        assert_eq!(message.affected_sop_class().as_deref(), Some(VERIFICATION));
    }
}
