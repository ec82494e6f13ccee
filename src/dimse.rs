//
// dimse.rs
// Pacs-Bridge-rs
//
// DIMSE message vocabulary: SOP class and transfer syntax UIDs, command set construction, and status classification.
//
// Thales Matheus Mendonça Santos - November 2025

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub const VERIFICATION: &str = "1.2.840.10008.1.1";
pub const PATIENT_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// Native encodings; a data set in one of them can be rewritten in any other.
pub const UNCOMPRESSED_TRANSFER_SYNTAXES: &[&str] = &[
    IMPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
];

pub fn is_uncompressed(transfer_syntax: &str) -> bool {
    UNCOMPRESSED_TRANSFER_SYNTAXES.contains(&transfer_syntax.trim_end_matches('\0').trim())
}

pub const STORAGE_SOP_CLASSES: &[&str] = &[
    "1.2.840.10008.5.1.4.1.1.2",    // CT Image Storage
    "1.2.840.10008.5.1.4.1.1.4",    // MR Image Storage
    "1.2.840.10008.5.1.4.1.1.1",    // CR Image Storage
    "1.2.840.10008.5.1.4.1.1.1.1",  // Digital X-Ray Image Storage
    "1.2.840.10008.5.1.4.1.1.7",    // Secondary Capture Image Storage
    "1.2.840.10008.5.1.4.1.1.6.1",  // US Image Storage
    "1.2.840.10008.5.1.4.1.1.12.1", // XA Image Storage
    "1.2.840.10008.5.1.4.1.1.20",   // NM Image Storage
];

/// One abstract syntax offered during association negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextSpec {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

impl PresentationContextSpec {
    pub fn new(abstract_syntax: &str, transfer_syntaxes: &[&str]) -> Self {
        Self {
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// The DIMSE service an association is opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Service {
    Verification,
    Find,
    Move,
    /// Storage of the given SOP class, in the given transfer syntax when known.
    ///
    /// A compressed file is only offered in its own syntax: its pixel data cannot
    /// be re-encoded on the way out.
    Storage {
        sop_class_uid: String,
        transfer_syntax: Option<String>,
    },
}

impl Service {
    /// Exactly the presentation contexts this service needs.
    pub fn presentation_contexts(&self) -> Vec<PresentationContextSpec> {
        match self {
            Service::Verification => {
                vec![PresentationContextSpec::new(VERIFICATION, UNCOMPRESSED_TRANSFER_SYNTAXES)]
            }
            Service::Find => vec![
                PresentationContextSpec::new(STUDY_ROOT_FIND, UNCOMPRESSED_TRANSFER_SYNTAXES),
                PresentationContextSpec::new(PATIENT_ROOT_FIND, UNCOMPRESSED_TRANSFER_SYNTAXES),
            ],
            Service::Move => {
                vec![PresentationContextSpec::new(STUDY_ROOT_MOVE, UNCOMPRESSED_TRANSFER_SYNTAXES)]
            }
            Service::Storage {
                sop_class_uid,
                transfer_syntax,
            } => {
                let mut syntaxes: Vec<String> = Vec::new();
                if let Some(ts) = transfer_syntax {
                    syntaxes.push(ts.clone());
                }
                if transfer_syntax.as_deref().map_or(true, is_uncompressed) {
                    for ts in UNCOMPRESSED_TRANSFER_SYNTAXES {
                        if !syntaxes.iter().any(|s| s == ts) {
                            syntaxes.push(ts.to_string());
                        }
                    }
                }
                vec![PresentationContextSpec {
                    abstract_syntax: sop_class_uid.clone(),
                    transfer_syntaxes: syntaxes,
                }]
            }
        }
    }
}

pub fn is_known_storage_class(sop_class_uid: &str) -> bool {
    STORAGE_SOP_CLASSES.contains(&sop_class_uid)
}

/// Command Field (0000,0100) values.
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_FIND_RQ: u16 = 0x0020;
    pub const C_FIND_RSP: u16 = 0x8020;
    pub const C_MOVE_RQ: u16 = 0x0021;
    pub const C_MOVE_RSP: u16 = 0x8021;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
    pub const C_CANCEL_RQ: u16 = 0x0FFF;
}

/// Command Data Set Type (0000,0800) meaning "no data set follows".
pub const NO_DATA_SET: u16 = 0x0101;
/// Any other value means a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0000;

const PRIORITY_MEDIUM: u16 = 0x0000;

/// A complete DIMSE message: command set plus optional data set.
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub command: InMemDicomObject,
    pub dataset: Option<InMemDicomObject>,
}

impl DimseMessage {
    pub fn new(command: InMemDicomObject, dataset: Option<InMemDicomObject>) -> Self {
        Self { command, dataset }
    }

    pub fn command_field(&self) -> Option<u16> {
        read_u16(&self.command, tags::COMMAND_FIELD)
    }

    pub fn affected_sop_class(&self) -> Option<String> {
        self.command
            .element(tags::AFFECTED_SOP_CLASS_UID)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches('\0').trim().to_string())
    }

    /// Status (0000,0900); a response without one is unusable.
    pub fn status(&self) -> Option<u16> {
        read_u16(&self.command, tags::STATUS)
    }

    pub fn message_id_responded_to(&self) -> Option<u16> {
        read_u16(&self.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn error_comment(&self) -> Option<String> {
        self.command
            .element(tags::ERROR_COMMENT)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Sub-operation counters of a C-MOVE response; absent fields read as `None`.
    pub fn sub_operations(&self) -> SubOperationFields {
        SubOperationFields {
            remaining: read_u16(&self.command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: read_u16(&self.command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: read_u16(&self.command, tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: read_u16(&self.command, tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        }
    }

    /// Whether the command set announces a data set.
    pub fn expects_dataset(&self) -> bool {
        read_u16(&self.command, tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != NO_DATA_SET)
            .unwrap_or(false)
    }
}

/// Raw sub-operation fields as they appear in a C-MOVE-RSP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperationFields {
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

fn read_u16(obj: &InMemDicomObject, tag: Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

fn base_command(sop_class: &str, field: u16, message_id: u16, has_dataset: bool) -> InMemDicomObject {
    let mut cmd = InMemDicomObject::new_empty();
    cmd.put(DataElement::new(
        tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(sop_class),
    ));
    cmd.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        PrimitiveValue::from(field),
    ));
    cmd.put(DataElement::new(
        tags::MESSAGE_ID,
        VR::US,
        PrimitiveValue::from(message_id),
    ));
    let data_set_type = if has_dataset { DATA_SET_PRESENT } else { NO_DATA_SET };
    cmd.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        PrimitiveValue::from(data_set_type),
    ));
    cmd
}

/// C-ECHO-RQ command set.
pub fn echo_request(message_id: u16) -> DimseMessage {
    DimseMessage::new(
        base_command(VERIFICATION, command_field::C_ECHO_RQ, message_id, false),
        None,
    )
}

/// C-FIND-RQ with its identifier.
pub fn find_request(sop_class: &str, message_id: u16, identifier: InMemDicomObject) -> DimseMessage {
    let mut cmd = base_command(sop_class, command_field::C_FIND_RQ, message_id, true);
    cmd.put(DataElement::new(
        tags::PRIORITY,
        VR::US,
        PrimitiveValue::from(PRIORITY_MEDIUM),
    ));
    DimseMessage::new(cmd, Some(identifier))
}

/// C-MOVE-RQ naming `destination` as the storage receiver.
pub fn move_request(
    sop_class: &str,
    message_id: u16,
    destination: &str,
    identifier: InMemDicomObject,
) -> DimseMessage {
    let mut cmd = base_command(sop_class, command_field::C_MOVE_RQ, message_id, true);
    cmd.put(DataElement::new(
        tags::PRIORITY,
        VR::US,
        PrimitiveValue::from(PRIORITY_MEDIUM),
    ));
    cmd.put(DataElement::new(
        tags::MOVE_DESTINATION,
        VR::AE,
        PrimitiveValue::from(destination),
    ));
    DimseMessage::new(cmd, Some(identifier))
}

/// C-STORE-RQ for one instance.
pub fn store_request(
    sop_class: &str,
    sop_instance: &str,
    message_id: u16,
    dataset: InMemDicomObject,
) -> DimseMessage {
    let mut cmd = base_command(sop_class, command_field::C_STORE_RQ, message_id, true);
    cmd.put(DataElement::new(
        tags::PRIORITY,
        VR::US,
        PrimitiveValue::from(PRIORITY_MEDIUM),
    ));
    cmd.put(DataElement::new(
        tags::AFFECTED_SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(sop_instance),
    ));
    DimseMessage::new(cmd, Some(dataset))
}

/// C-CANCEL-RQ for an outstanding request, sent on the context of that request.
pub fn cancel_request(message_id_being_cancelled: u16) -> DimseMessage {
    let mut cmd = InMemDicomObject::new_empty();
    cmd.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        PrimitiveValue::from(command_field::C_CANCEL_RQ),
    ));
    cmd.put(DataElement::new(
        tags::MESSAGE_ID_BEING_RESPONDED_TO,
        VR::US,
        PrimitiveValue::from(message_id_being_cancelled),
    ));
    cmd.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        PrimitiveValue::from(NO_DATA_SET),
    ));
    DimseMessage::new(cmd, None)
}

/// Response status classes of PS3.7 Annex C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            0x0000 => StatusClass::Success,
            0xFF00 | 0xFF01 => StatusClass::Pending,
            0xFE00 => StatusClass::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusClass::Warning,
            _ => StatusClass::Failure,
        }
    }

    /// Every non-pending response ends the exchange.
    pub fn is_final(&self) -> bool {
        !matches!(self, StatusClass::Pending)
    }
}
