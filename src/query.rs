//
// query.rs
// Pacs-Bridge-rs
//
// Builds level-specific C-FIND identifiers and C-MOVE scopes from caller filters.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::BTreeMap;

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use serde::{Deserialize, Serialize};

use crate::error::{PacsError, Result};
use crate::models::QueryLevel;

/// Return keys every STUDY level query asks for.
pub const STUDY_RETURN_KEYS: &[(Tag, VR)] = &[
    (tags::STUDY_INSTANCE_UID, VR::UI),
    (tags::PATIENT_ID, VR::LO),
    (tags::PATIENT_NAME, VR::PN),
    (tags::PATIENT_BIRTH_DATE, VR::DA),
    (tags::PATIENT_SEX, VR::CS),
    (tags::STUDY_DATE, VR::DA),
    (tags::STUDY_TIME, VR::TM),
    (tags::STUDY_DESCRIPTION, VR::LO),
    (tags::ACCESSION_NUMBER, VR::SH),
    (tags::MODALITIES_IN_STUDY, VR::CS),
    (tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS),
    (tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS),
    (tags::REFERRING_PHYSICIAN_NAME, VR::PN),
];

/// Return keys every SERIES level query asks for.
pub const SERIES_RETURN_KEYS: &[(Tag, VR)] = &[
    (tags::SERIES_INSTANCE_UID, VR::UI),
    (tags::SERIES_NUMBER, VR::IS),
    (tags::SERIES_DESCRIPTION, VR::LO),
    (tags::MODALITY, VR::CS),
    (tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS),
    (tags::BODY_PART_EXAMINED, VR::CS),
];

/// Return keys every IMAGE level query asks for.
pub const IMAGE_RETURN_KEYS: &[(Tag, VR)] = &[
    (tags::SOP_INSTANCE_UID, VR::UI),
    (tags::SOP_CLASS_UID, VR::UI),
    (tags::INSTANCE_NUMBER, VR::IS),
    (tags::ROWS, VR::US),
    (tags::COLUMNS, VR::US),
];

/// STUDY level matching keys accepted from callers, keyed by DICOM keyword.
const STUDY_FILTER_KEYS: &[(&str, Tag, VR)] = &[
    ("PatientID", tags::PATIENT_ID, VR::LO),
    ("PatientName", tags::PATIENT_NAME, VR::PN),
    ("StudyDate", tags::STUDY_DATE, VR::DA),
    ("ModalitiesInStudy", tags::MODALITIES_IN_STUDY, VR::CS),
    ("AccessionNumber", tags::ACCESSION_NUMBER, VR::SH),
];

pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
pub const SERIES_INSTANCE_UID: &str = "SeriesInstanceUID";
pub const SOP_INSTANCE_UID: &str = "SOPInstanceUID";

/// Caller-supplied filters keyed by DICOM keyword (`PatientID`, `StudyDate`, ...).
///
/// Legacy queries pick out the keys they understand; QIDO-RS queries pass every
/// non-empty entry through as a query parameter, so DICOMweb-specific keys such
/// as `limit` or `includefield` are allowed here too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFilters(BTreeMap<String, String>);

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value for `key`, treating blank values as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Non-empty entries, in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.trim()))
            .filter(|(_, v)| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<&str> {
        self.get(key).ok_or(PacsError::MissingQueryKey(key))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryFilters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A C-FIND identifier: return keys (null values) plus matching keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKeys {
    level: QueryLevel,
    keys: BTreeMap<Tag, (VR, Option<String>)>,
}

impl QueryKeys {
    /// Builds the identifier for `level`. The required return key set is always
    /// present; filters only turn some of those keys into matching keys.
    pub fn for_level(level: QueryLevel, filters: &QueryFilters) -> Result<Self> {
        let mut keys = QueryKeys {
            level,
            keys: BTreeMap::new(),
        };

        match level {
            QueryLevel::Study => {
                keys.return_keys(STUDY_RETURN_KEYS);
                for (keyword, tag, vr) in STUDY_FILTER_KEYS {
                    if let Some(value) = filters.get(keyword) {
                        keys.matching(*tag, *vr, value);
                    }
                }
                if let Some(uid) = filters.get(STUDY_INSTANCE_UID) {
                    keys.matching(tags::STUDY_INSTANCE_UID, VR::UI, uid);
                }
            }
            QueryLevel::Series => {
                let study = filters.require(STUDY_INSTANCE_UID)?;
                keys.matching(tags::STUDY_INSTANCE_UID, VR::UI, study);
                keys.return_keys(SERIES_RETURN_KEYS);
                if let Some(modality) = filters.get("Modality") {
                    keys.matching(tags::MODALITY, VR::CS, modality);
                }
            }
            QueryLevel::Image => {
                let study = filters.require(STUDY_INSTANCE_UID)?;
                let series = filters.require(SERIES_INSTANCE_UID)?;
                keys.matching(tags::STUDY_INSTANCE_UID, VR::UI, study);
                keys.matching(tags::SERIES_INSTANCE_UID, VR::UI, series);
                keys.return_keys(IMAGE_RETURN_KEYS);
            }
        }

        Ok(keys)
    }

    pub fn level(&self) -> QueryLevel {
        self.level
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.keys.contains_key(&tag)
    }

    /// Matching value for `tag`, `None` for return keys and absent tags.
    pub fn value(&self, tag: Tag) -> Option<&str> {
        self.keys.get(&tag).and_then(|(_, v)| v.as_deref())
    }

    pub fn is_return_key(&self, tag: Tag) -> bool {
        matches!(self.keys.get(&tag), Some((_, None)))
    }

    /// Encodes the identifier as a data set, QueryRetrieveLevel included.
    pub fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.level.as_str()),
        ));
        for (tag, (vr, value)) in &self.keys {
            let value = match value {
                Some(v) => PrimitiveValue::from(v.as_str()),
                None => PrimitiveValue::Empty,
            };
            obj.put(DataElement::new(*tag, *vr, value));
        }
        obj
    }

    fn return_keys(&mut self, set: &[(Tag, VR)]) {
        for (tag, vr) in set {
            self.keys.entry(*tag).or_insert((*vr, None));
        }
    }

    fn matching(&mut self, tag: Tag, vr: VR, value: &str) {
        self.keys.insert(tag, (vr, Some(value.to_string())));
    }
}

/// What a C-MOVE should transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "UPPERCASE")]
pub enum MoveScope {
    Study {
        study_instance_uid: String,
    },
    Series {
        study_instance_uid: String,
        series_instance_uid: String,
    },
    Image {
        study_instance_uid: String,
        series_instance_uid: String,
        sop_instance_uid: String,
    },
}

impl MoveScope {
    pub fn study(study: impl Into<String>) -> Self {
        MoveScope::Study {
            study_instance_uid: study.into(),
        }
    }

    pub fn series(study: impl Into<String>, series: impl Into<String>) -> Self {
        MoveScope::Series {
            study_instance_uid: study.into(),
            series_instance_uid: series.into(),
        }
    }

    pub fn image(
        study: impl Into<String>,
        series: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        MoveScope::Image {
            study_instance_uid: study.into(),
            series_instance_uid: series.into(),
            sop_instance_uid: instance.into(),
        }
    }

    pub fn level(&self) -> QueryLevel {
        match self {
            MoveScope::Study { .. } => QueryLevel::Study,
            MoveScope::Series { .. } => QueryLevel::Series,
            MoveScope::Image { .. } => QueryLevel::Image,
        }
    }

    pub fn study_instance_uid(&self) -> &str {
        match self {
            MoveScope::Study { study_instance_uid }
            | MoveScope::Series {
                study_instance_uid, ..
            }
            | MoveScope::Image {
                study_instance_uid, ..
            } => study_instance_uid,
        }
    }

    /// Rejects blank UIDs before any association is opened.
    pub fn validate(&self) -> Result<()> {
        let uids: Vec<(&'static str, &str)> = match self {
            MoveScope::Study { study_instance_uid } => {
                vec![(STUDY_INSTANCE_UID, study_instance_uid)]
            }
            MoveScope::Series {
                study_instance_uid,
                series_instance_uid,
            } => vec![
                (STUDY_INSTANCE_UID, study_instance_uid),
                (SERIES_INSTANCE_UID, series_instance_uid),
            ],
            MoveScope::Image {
                study_instance_uid,
                series_instance_uid,
                sop_instance_uid,
            } => vec![
                (STUDY_INSTANCE_UID, study_instance_uid),
                (SERIES_INSTANCE_UID, series_instance_uid),
                (SOP_INSTANCE_UID, sop_instance_uid),
            ],
        };
        for (keyword, uid) in uids {
            if uid.trim().is_empty() {
                return Err(PacsError::MissingQueryKey(keyword));
            }
        }
        Ok(())
    }

    /// Identifier sent with the C-MOVE-RQ.
    pub fn to_object(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.level().as_str()),
        ));
        let mut put_uid = |tag: Tag, uid: &str| {
            obj.put(DataElement::new(tag, VR::UI, PrimitiveValue::from(uid.trim())));
        };
        match self {
            MoveScope::Study { study_instance_uid } => {
                put_uid(tags::STUDY_INSTANCE_UID, study_instance_uid);
            }
            MoveScope::Series {
                study_instance_uid,
                series_instance_uid,
            } => {
                put_uid(tags::STUDY_INSTANCE_UID, study_instance_uid);
                put_uid(tags::SERIES_INSTANCE_UID, series_instance_uid);
            }
            MoveScope::Image {
                study_instance_uid,
                series_instance_uid,
                sop_instance_uid,
            } => {
                put_uid(tags::STUDY_INSTANCE_UID, study_instance_uid);
                put_uid(tags::SERIES_INSTANCE_UID, series_instance_uid);
                put_uid(tags::SOP_INSTANCE_UID, sop_instance_uid);
            }
        }
        obj
    }
}
