//
// attributes.rs
// Pacs-Bridge-rs
//
// Protocol-agnostic attribute model: legacy C-FIND data sets and QIDO-RS DICOM JSON both land here.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::BTreeMap;

use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

use crate::error::{PacsError, Result};

/// Keywords exposed to callers, in the order viewers usually display them.
pub const NORMALIZED_KEYS: &[(&str, Tag)] = &[
    // Patient
    ("PatientID", tags::PATIENT_ID),
    ("PatientName", tags::PATIENT_NAME),
    ("PatientBirthDate", tags::PATIENT_BIRTH_DATE),
    ("PatientSex", tags::PATIENT_SEX),
    // Study
    ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
    ("StudyDate", tags::STUDY_DATE),
    ("StudyTime", tags::STUDY_TIME),
    ("StudyDescription", tags::STUDY_DESCRIPTION),
    ("AccessionNumber", tags::ACCESSION_NUMBER),
    ("ModalitiesInStudy", tags::MODALITIES_IN_STUDY),
    ("NumberOfStudyRelatedSeries", tags::NUMBER_OF_STUDY_RELATED_SERIES),
    ("NumberOfStudyRelatedInstances", tags::NUMBER_OF_STUDY_RELATED_INSTANCES),
    ("ReferringPhysicianName", tags::REFERRING_PHYSICIAN_NAME),
    // Series
    ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
    ("SeriesNumber", tags::SERIES_NUMBER),
    ("SeriesDescription", tags::SERIES_DESCRIPTION),
    ("Modality", tags::MODALITY),
    ("NumberOfSeriesRelatedInstances", tags::NUMBER_OF_SERIES_RELATED_INSTANCES),
    ("BodyPartExamined", tags::BODY_PART_EXAMINED),
    // Instance
    ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
    ("SOPClassUID", tags::SOP_CLASS_UID),
    ("InstanceNumber", tags::INSTANCE_NUMBER),
    ("Rows", tags::ROWS),
    ("Columns", tags::COLUMNS),
];

/// Looks up the tag of a normalized keyword.
pub fn tag_for_keyword(keyword: &str) -> Option<Tag> {
    NORMALIZED_KEYS
        .iter()
        .find(|(name, _)| *name == keyword)
        .map(|(_, tag)| *tag)
}

/// One matching entity (study, series or instance) as a tag → text map.
///
/// Multi-valued elements are joined with `\`, values are trimmed, and empty
/// values are not stored. Sequences and bulk data are not represented.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    elements: BTreeMap<Tag, String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the model from a data set received in a C-FIND response.
    pub fn from_object(obj: &InMemDicomObject) -> Self {
        let mut attrs = Attributes::new();
        for element in obj.iter() {
            let tag = element.header().tag;
            // Group length elements carry no information for callers.
            if tag.element() == 0x0000 {
                continue;
            }
            if let Ok(text) = element.to_str() {
                attrs.insert(tag, text.as_ref());
            }
        }
        attrs
    }

    /// Builds the model from one object of a QIDO-RS `application/dicom+json` array.
    pub fn from_dicom_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| PacsError::Decode("expected a DICOM JSON object".to_string()))?;

        let mut attrs = Attributes::new();
        for (key, element) in object {
            let tag = parse_tag(key)?;
            let vr = element.get("vr").and_then(Value::as_str).unwrap_or("");
            if vr == "SQ" {
                continue;
            }
            let Some(values) = element.get("Value").and_then(Value::as_array) else {
                continue;
            };
            let parts: Vec<String> = values.iter().filter_map(json_value_text).collect();
            attrs.insert(tag, &parts.join("\\"));
        }
        Ok(attrs)
    }

    pub fn insert(&mut self, tag: Tag, value: &str) {
        let value = value.trim_end_matches('\0').trim();
        if value.is_empty() {
            self.elements.remove(&tag);
        } else {
            self.elements.insert(tag, value.to_string());
        }
    }

    pub fn get(&self, tag: Tag) -> Option<&str> {
        self.elements.get(&tag).map(String::as_str)
    }

    pub fn get_keyword(&self, keyword: &str) -> Option<&str> {
        tag_for_keyword(keyword).and_then(|tag| self.get(tag))
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &str)> {
        self.elements.iter().map(|(tag, value)| (tag, value.as_str()))
    }

    /// The keyword view handed to callers: only [`NORMALIZED_KEYS`] that are present.
    pub fn normalized(&self) -> BTreeMap<&'static str, &str> {
        NORMALIZED_KEYS
            .iter()
            .filter_map(|(keyword, tag)| self.get(*tag).map(|value| (*keyword, value)))
            .collect()
    }
}

impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let normalized = self.normalized();
        let mut map = serializer.serialize_map(Some(normalized.len()))?;
        for (keyword, value) in normalized {
            map.serialize_entry(keyword, value)?;
        }
        map.end()
    }
}

fn parse_tag(key: &str) -> Result<Tag> {
    if key.len() != 8 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PacsError::Decode(format!("invalid DICOM JSON tag key {:?}", key)));
    }
    let group = u16::from_str_radix(&key[0..4], 16);
    let element = u16::from_str_radix(&key[4..8], 16);
    match (group, element) {
        (Ok(group), Ok(element)) => Ok(Tag(group, element)),
        _ => Err(PacsError::Decode(format!("invalid DICOM JSON tag key {:?}", key))),
    }
}

fn json_value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        // Person names: only the alphabetic group is comparable with legacy PN text.
        Value::Object(pn) => pn
            .get("Alphabetic")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
