//! The anonymizer engine: a scripted, tag-by-tag dataset rewrite that
//! replaces every PHI identifier with its deterministic pseudonym and
//! writes the result into the content-addressed storage tree.

pub mod dates;
pub mod script;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use dicom_core::header::Header;
use dicom_core::value::{DataSetSequence, Value};
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{AnonymizerModel, CaptureStatus, InstanceAttrs};
use crate::storage::StorageLayout;
use dates::{date_delta_for, round_age, shift_date};
use script::{AnonymizerScript, Operator};

pub const DEIDENTIFICATION_METHOD: &str = "RSNA DICOM ANONYMIZER";
const PRIVATE_CREATOR: &str = "RSNA";
const PRIVATE_GROUP: u16 = 0x0013;

/// De-identification method codes, appended in numeric order.
const CODE_BASIC_PROFILE: (&str, &str) = ("113100", "Basic Application Confidentiality Profile");
const CODE_MODIFIED_DATES: (&str, &str) = (
    "113107",
    "Retain Longitudinal Temporal Information Modified Dates Option",
);
const CODE_PATIENT_CHARACTERISTICS: (&str, &str) =
    ("113108", "Retain Patient Characteristics Option");
const CODE_DEVICE_IDENTITY: (&str, &str) = ("113109", "Retain Device Identity Option");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnonymizeOutcome {
    /// The instance was anonymized and written to this path.
    Stored(PathBuf),
    /// The instance had been processed before; nothing was written.
    AlreadyPresent(PathBuf),
}

impl AnonymizeOutcome {
    pub fn path(&self) -> &PathBuf {
        match self {
            AnonymizeOutcome::Stored(p) | AnonymizeOutcome::AlreadyPresent(p) => p,
        }
    }
}

pub struct AnonymizerEngine {
    model: Arc<RwLock<AnonymizerModel>>,
    layout: StorageLayout,
    script: AnonymizerScript,
    project_name: String,
    site_id: String,
    allowed_storage_classes: HashSet<String>,
}

enum Action {
    Remove,
    Replace(DataElement<InMemDicomObject>),
}

impl AnonymizerEngine {
    pub fn new(
        model: Arc<RwLock<AnonymizerModel>>,
        layout: StorageLayout,
        script: AnonymizerScript,
        project_name: &str,
        site_id: &str,
        allowed_storage_classes: impl IntoIterator<Item = String>,
    ) -> AnonymizerEngine {
        AnonymizerEngine {
            model,
            layout,
            script,
            project_name: project_name.to_string(),
            site_id: site_id.to_string(),
            allowed_storage_classes: allowed_storage_classes.into_iter().collect(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Anonymize one dataset arriving from `source`.
    ///
    /// `original` holds the as-received bytes; on any failure after parse
    /// they are copied into the matching quarantine bucket and the error
    /// is returned to the caller.
    pub async fn anonymize(
        &self,
        source: &str,
        obj: InMemDicomObject,
        ts_uid: &str,
        original: &[u8],
    ) -> Result<AnonymizeOutcome> {
        match self.run(source, obj, ts_uid).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Some(category) = e.quarantine_category() {
                    let name = format!("{}.dcm", Uuid::new_v4());
                    self.layout.quarantine(category, &name, original);
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        source: &str,
        mut obj: InMemDicomObject,
        ts_uid: &str,
    ) -> Result<AnonymizeOutcome> {
        // 1. validate
        let attrs = InstanceAttrs::from_object(&obj)?;
        if !self.allowed_storage_classes.contains(&attrs.sop_class_uid) {
            return Err(Error::InvalidStorageClass {
                uid: attrs.sop_class_uid,
            });
        }

        let date_delta = date_delta_for(&attrs.patient_id);

        // PHI UIDs whose pseudonyms the rewrite will need, hierarchy first
        // so study/series/instance counters read naturally in the output
        let mut phi_uids: Vec<String> = vec![
            attrs.study_uid.clone(),
            attrs.series_uid.clone(),
            attrs.sop_uid.clone(),
        ];
        for tag in self.script.uid_tags() {
            if let Some(value) = obj
                .element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
            {
                if !value.is_empty() && !phi_uids.contains(&value) {
                    phi_uids.push(value);
                }
            }
        }

        // 2. capture PHI and allocate every pseudonym under the writer lock
        let (status, anon_pt_id, uid_map, anon_acc) = {
            let mut model = self.model.write().await;
            let status = model.capture_phi(source, &attrs, date_delta)?;
            let anon_pt_id = model.get_next_anon_patient_id(&attrs.patient_id)?;
            let mut uid_map = BTreeMap::new();
            for phi_uid in &phi_uids {
                uid_map.insert(phi_uid.clone(), model.get_next_anon_uid(phi_uid));
            }
            let anon_acc = if attrs.accession_number.is_empty() {
                None
            } else {
                Some(model.get_next_anon_acc_no(&attrs.accession_number))
            };
            (status, anon_pt_id, uid_map, anon_acc)
        };

        let out_path = self.layout.instance_path(
            &anon_pt_id,
            &uid_map[&attrs.study_uid],
            &uid_map[&attrs.series_uid],
            &uid_map[&attrs.sop_uid],
        );

        if status == CaptureStatus::AlreadyPresent {
            debug!("instance {} already stored", attrs.sop_uid);
            return Ok(AnonymizeOutcome::AlreadyPresent(out_path));
        }

        // 3. single rewrite pass over the (now private) dataset
        let actions = self.plan_rewrite(&obj, date_delta, &anon_pt_id, &uid_map, &anon_acc);
        for (tag, action) in actions {
            match action {
                Action::Remove => {
                    obj.remove_element(tag);
                }
                Action::Replace(element) => {
                    obj.put(element);
                }
            }
        }

        // 4. de-identification markers
        self.put_deidentification_markers(&mut obj);

        // 5. private block
        obj.put(DataElement::new(
            Tag(PRIVATE_GROUP, 0x0010),
            VR::LO,
            PrimitiveValue::from(PRIVATE_CREATOR),
        ));
        obj.put(DataElement::new(
            Tag(PRIVATE_GROUP, 0x1010),
            VR::LO,
            PrimitiveValue::from(self.project_name.as_str()),
        ));
        obj.put(DataElement::new(
            Tag(PRIVATE_GROUP, 0x1011),
            VR::LO,
            PrimitiveValue::from(self.site_id.as_str()),
        ));

        // 6. rebuild file meta around the anonymized identifiers
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(&attrs.sop_class_uid)
            .media_storage_sop_instance_uid(&uid_map[&attrs.sop_uid])
            .transfer_syntax(ts_uid)
            .build()
            .map_err(|e| Error::InvalidDicom {
                detail: format!("cannot build file meta: {e}"),
            })?;
        let file_obj = obj.with_exact_meta(meta);

        let mut bytes = Vec::with_capacity(4096);
        file_obj.write_all(&mut bytes).map_err(|e| Error::Storage {
            path: out_path.display().to_string(),
            source: std::io::Error::other(e),
        })?;
        self.layout.write_atomic(&out_path, &bytes)?;
        debug!("stored {}", out_path.display());
        Ok(AnonymizeOutcome::Stored(out_path))
    }

    /// Decide the fate of every element. Scripted tags follow their
    /// operator; curve/overlay groups, private groups and the
    /// scheduling/comment group range are dropped; the rest is kept.
    fn plan_rewrite(
        &self,
        obj: &InMemDicomObject,
        date_delta: i64,
        anon_pt_id: &str,
        uid_map: &BTreeMap<String, String>,
        anon_acc: &Option<String>,
    ) -> Vec<(Tag, Action)> {
        let mut actions = Vec::new();
        for el in obj.into_iter() {
            let tag = el.tag();
            let vr = el.vr();
            let current = || {
                el.to_str()
                    .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
                    .unwrap_or_default()
            };
            if let Some(op) = self.script.operator_for(tag) {
                match op {
                    Operator::Keep => {}
                    Operator::Remove => actions.push((tag, Action::Remove)),
                    Operator::Empty => actions.push((tag, empty(tag, vr))),
                    Operator::HashDate => {
                        let replaced = shift_date(&current(), date_delta)
                            .map(|d| replace(tag, vr, &d))
                            .unwrap_or_else(|| empty(tag, vr));
                        actions.push((tag, replaced));
                    }
                    Operator::Round { width } => {
                        let replaced = round_age(&current(), width)
                            .map(|a| replace(tag, vr, &a))
                            .unwrap_or_else(|| empty(tag, vr));
                        actions.push((tag, replaced));
                    }
                    Operator::PatientId => actions.push((tag, replace(tag, vr, anon_pt_id))),
                    Operator::Accession => {
                        let action = match anon_acc {
                            Some(acc) => replace(tag, vr, acc),
                            None => empty(tag, vr),
                        };
                        actions.push((tag, action));
                    }
                    Operator::Uid => {
                        let action = match uid_map.get(&current()) {
                            Some(anon) => replace(tag, vr, anon),
                            None => empty(tag, vr),
                        };
                        actions.push((tag, action));
                    }
                }
                continue;
            }
            let group = tag.group();
            let purge = (0x5000..=0x5FFF).contains(&group)   // curves
                || (0x6000..=0x6FFF).contains(&group)        // overlays
                || group % 2 == 1                            // private
                || (0x0032..=0x4008).contains(&group);
            if purge {
                actions.push((tag, Action::Remove));
            }
        }
        actions
    }

    fn put_deidentification_markers(&self, obj: &mut InMemDicomObject) {
        obj.put(DataElement::new(
            tags::PATIENT_IDENTITY_REMOVED,
            VR::CS,
            PrimitiveValue::from("YES"),
        ));
        obj.put(DataElement::new(
            tags::DEIDENTIFICATION_METHOD,
            VR::LO,
            PrimitiveValue::from(DEIDENTIFICATION_METHOD),
        ));

        let mut codes = vec![CODE_BASIC_PROFILE];
        if self.script.retains_modified_dates() {
            codes.push(CODE_MODIFIED_DATES);
        }
        if self.script.retains_patient_characteristics() {
            codes.push(CODE_PATIENT_CHARACTERISTICS);
        }
        if self.script.retains_device_identity() {
            codes.push(CODE_DEVICE_IDENTITY);
        }

        // append to any sequence already present, without duplicating codes
        let mut items: Vec<InMemDicomObject> = obj
            .element(tags::DEIDENTIFICATION_METHOD_CODE_SEQUENCE)
            .ok()
            .and_then(|e| e.items().map(|i| i.to_vec()))
            .unwrap_or_default();
        let existing: HashSet<String> = items
            .iter()
            .filter_map(|item| {
                item.element(tags::CODE_VALUE)
                    .ok()
                    .and_then(|e| e.to_str().ok())
                    .map(|s| s.trim().to_string())
            })
            .collect();
        for (value, meaning) in codes {
            if existing.contains(value) {
                continue;
            }
            items.push(InMemDicomObject::from_element_iter([
                DataElement::new(tags::CODE_VALUE, VR::SH, PrimitiveValue::from(value)),
                DataElement::new(
                    tags::CODING_SCHEME_DESIGNATOR,
                    VR::SH,
                    PrimitiveValue::from("DCM"),
                ),
                DataElement::new(tags::CODE_MEANING, VR::LO, PrimitiveValue::from(meaning)),
            ]));
        }
        obj.put(DataElement::new(
            tags::DEIDENTIFICATION_METHOD_CODE_SEQUENCE,
            VR::SQ,
            Value::Sequence(DataSetSequence::from(items)),
        ));
    }
}

fn empty(tag: Tag, vr: VR) -> Action {
    Action::Replace(DataElement::new(tag, vr, PrimitiveValue::Empty))
}

fn replace(tag: Tag, vr: VR, value: &str) -> Action {
    Action::Replace(DataElement::new(tag, vr, PrimitiveValue::from(value)))
}
