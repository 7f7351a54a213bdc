//! The anonymizer script: an ordered mapping from tags to rewrite
//! operators, loadable from a TOML file or built in as the default
//! de-identification profile.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use dicom_core::dictionary::DataDictionary;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::StandardDataDictionary;
use lazy_static::lazy_static;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

lazy_static! {
    /// The built-in profile, shared by every engine without a script file.
    pub static ref DEFAULT_PROFILE: AnonymizerScript = AnonymizerScript::default_profile();
}

/// What to do with one element's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Retain as-is, even inside a purged group range.
    Keep,
    /// Delete the element.
    Remove,
    /// Clear the value, retain the element.
    Empty,
    /// Shift the date by the patient's date delta.
    HashDate,
    /// Round an age string to the nearest multiple of `width`.
    Round { width: u32 },
    /// Replace with the anonymous patient id.
    PatientId,
    /// Replace with the anonymous accession number.
    Accession,
    /// Replace with the anonymous UID.
    Uid,
}

#[derive(Debug, Clone)]
pub struct AnonymizerScript {
    ops: BTreeMap<Tag, Operator>,
}

#[derive(Debug, Default, Deserialize)]
struct ScriptFile {
    keep: Option<TagList>,
    remove: Option<TagList>,
    empty: Option<TagList>,
    hashdate: Option<TagList>,
    round: Option<RoundSection>,
}

#[derive(Debug, Default, Deserialize)]
struct TagList {
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RoundSection {
    tags: Vec<String>,
    #[serde(default = "default_round_width")]
    width: u32,
}

fn default_round_width() -> u32 {
    5
}

/// Resolve a tag given by dictionary name or `GGGG,EEEE` hex form.
fn resolve_tag(name: &str) -> Option<Tag> {
    if let Some(entry) = StandardDataDictionary.by_name(name) {
        return Some(entry.tag.inner());
    }
    name.parse::<Tag>().ok()
}

impl AnonymizerScript {
    /// The identifier operators every script carries: without them the
    /// output would leak PHI ids and collide with the storage layout.
    fn identifier_ops() -> BTreeMap<Tag, Operator> {
        let mut ops = BTreeMap::new();
        ops.insert(tags::PATIENT_ID, Operator::PatientId);
        ops.insert(tags::PATIENT_NAME, Operator::PatientId);
        ops.insert(tags::ACCESSION_NUMBER, Operator::Accession);
        for tag in [
            tags::STUDY_INSTANCE_UID,
            tags::SERIES_INSTANCE_UID,
            tags::SOP_INSTANCE_UID,
            tags::FRAME_OF_REFERENCE_UID,
        ] {
            ops.insert(tag, Operator::Uid);
        }
        ops
    }

    /// The built-in de-identification profile.
    pub fn default_profile() -> AnonymizerScript {
        let mut ops = Self::identifier_ops();
        for tag in [
            tags::STUDY_DATE,
            tags::SERIES_DATE,
            tags::ACQUISITION_DATE,
            tags::CONTENT_DATE,
        ] {
            ops.insert(tag, Operator::HashDate);
        }
        ops.insert(tags::PATIENT_AGE, Operator::Round { width: 5 });
        for tag in [
            tags::PATIENT_BIRTH_DATE,
            tags::INSTITUTION_NAME,
            tags::STATION_NAME,
            tags::DEVICE_SERIAL_NUMBER,
            tags::STUDY_ID,
        ] {
            ops.insert(tag, Operator::Empty);
        }
        for tag in [
            tags::REFERRING_PHYSICIAN_NAME,
            tags::PERFORMING_PHYSICIAN_NAME,
            tags::NAME_OF_PHYSICIANS_READING_STUDY,
            tags::OPERATORS_NAME,
            tags::INSTITUTION_ADDRESS,
            tags::OTHER_PATIENT_I_DS,
            tags::OTHER_PATIENT_NAMES,
            tags::PATIENT_ADDRESS,
            tags::PATIENT_TELEPHONE_NUMBERS,
            tags::PATIENT_COMMENTS,
        ] {
            ops.insert(tag, Operator::Remove);
        }
        for tag in [
            tags::PATIENT_SEX,
            tags::ETHNIC_GROUP,
            tags::MODALITY,
            tags::STUDY_DESCRIPTION,
            tags::SERIES_DESCRIPTION,
            tags::BODY_PART_EXAMINED,
        ] {
            ops.insert(tag, Operator::Keep);
        }
        AnonymizerScript { ops }
    }

    /// Parse a script file. The identifier operators are always present;
    /// the file contributes everything else. Unknown tag names are skipped
    /// with a warning.
    pub fn from_toml_str(raw: &str) -> Result<AnonymizerScript> {
        let file: ScriptFile = toml::from_str(raw).map_err(|e| Error::Config {
            detail: format!("anonymizer script: {e}"),
        })?;
        let mut ops = Self::identifier_ops();
        let mut apply = |list: &Option<TagList>, op: Operator| {
            if let Some(list) = list {
                for name in &list.tags {
                    match resolve_tag(name) {
                        Some(tag) => {
                            ops.insert(tag, op);
                        }
                        None => warn!("script tag {name:?} is not a known attribute"),
                    }
                }
            }
        };
        apply(&file.keep, Operator::Keep);
        apply(&file.remove, Operator::Remove);
        apply(&file.empty, Operator::Empty);
        apply(&file.hashdate, Operator::HashDate);
        if let Some(round) = &file.round {
            for name in &round.tags {
                match resolve_tag(name) {
                    Some(tag) => {
                        ops.insert(tag, Operator::Round { width: round.width });
                    }
                    None => warn!("script tag {name:?} is not a known attribute"),
                }
            }
        }
        Ok(AnonymizerScript { ops })
    }

    pub fn load(path: &Path) -> Result<AnonymizerScript> {
        let raw = fs::read_to_string(path).map_err(|e| Error::Config {
            detail: format!("cannot read script {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn operator_for(&self, tag: Tag) -> Option<Operator> {
        self.ops.get(&tag).copied()
    }

    /// Tags whose values are replaced by anonymous UIDs.
    pub fn uid_tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.ops
            .iter()
            .filter(|(_, op)| matches!(op, Operator::Uid))
            .map(|(tag, _)| *tag)
    }

    // Retention options, driving the de-identification method codes.

    /// Longitudinal temporal information is retained in modified form.
    pub fn retains_modified_dates(&self) -> bool {
        self.ops.values().any(|op| matches!(op, Operator::HashDate))
    }

    /// Patient characteristics (sex, age, ethnicity) survive.
    pub fn retains_patient_characteristics(&self) -> bool {
        self.ops.iter().any(|(tag, op)| {
            matches!(op, Operator::Round { .. })
                || (matches!(op, Operator::Keep)
                    && (*tag == tags::PATIENT_SEX || *tag == tags::ETHNIC_GROUP))
        })
    }

    /// Device identity is deliberately kept.
    pub fn retains_device_identity(&self) -> bool {
        self.ops.iter().any(|(tag, op)| {
            matches!(op, Operator::Keep)
                && (*tag == tags::DEVICE_SERIAL_NUMBER || *tag == tags::STATION_NAME)
        })
    }
}

impl Default for AnonymizerScript {
    fn default() -> Self {
        Self::default_profile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_covers_the_identifier_tags() {
        let script = AnonymizerScript::default_profile();
        assert_eq!(script.operator_for(tags::PATIENT_ID), Some(Operator::PatientId));
        assert_eq!(script.operator_for(tags::PATIENT_NAME), Some(Operator::PatientId));
        assert_eq!(script.operator_for(tags::ACCESSION_NUMBER), Some(Operator::Accession));
        assert_eq!(script.operator_for(tags::STUDY_INSTANCE_UID), Some(Operator::Uid));
        assert_eq!(script.operator_for(tags::STUDY_DATE), Some(Operator::HashDate));
        assert_eq!(
            script.operator_for(tags::PATIENT_AGE),
            Some(Operator::Round { width: 5 })
        );
        assert_eq!(script.operator_for(tags::PIXEL_DATA), None);
        assert!(script.retains_modified_dates());
        assert!(script.retains_patient_characteristics());
        assert!(!script.retains_device_identity());
    }

    #[test]
    fn toml_script_overrides_and_extends() {
        let script = AnonymizerScript::from_toml_str(
            r#"
            [keep]
            tags = ["DeviceSerialNumber", "0008,0080"]

            [remove]
            tags = ["PatientComments", "NotARealTagName"]

            [hashdate]
            tags = ["StudyDate"]

            [round]
            tags = ["PatientAge"]
            width = 10
            "#,
        )
        .unwrap();
        assert_eq!(
            script.operator_for(tags::DEVICE_SERIAL_NUMBER),
            Some(Operator::Keep)
        );
        // hex form resolves to InstitutionName
        assert_eq!(script.operator_for(tags::INSTITUTION_NAME), Some(Operator::Keep));
        assert_eq!(
            script.operator_for(tags::PATIENT_COMMENTS),
            Some(Operator::Remove)
        );
        assert_eq!(
            script.operator_for(tags::PATIENT_AGE),
            Some(Operator::Round { width: 10 })
        );
        // identifier operators cannot be dropped by a file
        assert_eq!(script.operator_for(tags::PATIENT_ID), Some(Operator::PatientId));
        assert!(script.retains_device_identity());
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(AnonymizerScript::from_toml_str("keep = 7").is_err());
    }
}
