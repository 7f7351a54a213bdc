//! The PHI index store.
//!
//! Owns the bijective PHI ↔ pseudonym lookup tables, the aggregate PHI
//! tree, and the allocation counters behind every generated identifier.
//! All mutation happens under the single writer lock held by the
//! anonymizer engine; reads are concurrent.

pub mod java_index;
pub mod phi;
pub mod phi_csv;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};

use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use phi::{Phi, PhiSeries, PhiStudy};

/// Upper bound on distinct patients per project.
pub const MAX_PATIENTS: usize = 1_000_000;

/// Result of a `capture_phi` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Captured,
    /// The instance UID was already indexed; nothing was changed.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub patients: usize,
    pub studies: usize,
    pub series: usize,
    pub instances: usize,
}

/// Attributes the pipeline reads out of one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceAttrs {
    pub sop_class_uid: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub patient_id: String,
    pub patient_name: String,
    pub patient_sex: String,
    pub patient_dob: String,
    pub ethnic_group: String,
    pub study_date: String,
    pub study_desc: String,
    pub accession_number: String,
    pub series_desc: String,
    pub modality: String,
}

fn get_str_tag(obj: &InMemDicomObject, tag: dicom_core::Tag) -> String {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .unwrap_or_default()
}

impl InstanceAttrs {
    /// Extract the attribute set, failing when a required attribute is
    /// absent or empty.
    pub fn from_object(obj: &InMemDicomObject) -> Result<InstanceAttrs> {
        let attrs = InstanceAttrs {
            sop_class_uid: get_str_tag(obj, tags::SOP_CLASS_UID),
            study_uid: get_str_tag(obj, tags::STUDY_INSTANCE_UID),
            series_uid: get_str_tag(obj, tags::SERIES_INSTANCE_UID),
            sop_uid: get_str_tag(obj, tags::SOP_INSTANCE_UID),
            patient_id: get_str_tag(obj, tags::PATIENT_ID),
            patient_name: get_str_tag(obj, tags::PATIENT_NAME),
            patient_sex: get_str_tag(obj, tags::PATIENT_SEX),
            patient_dob: get_str_tag(obj, tags::PATIENT_BIRTH_DATE),
            ethnic_group: get_str_tag(obj, tags::ETHNIC_GROUP),
            study_date: get_str_tag(obj, tags::STUDY_DATE),
            study_desc: get_str_tag(obj, tags::STUDY_DESCRIPTION),
            accession_number: get_str_tag(obj, tags::ACCESSION_NUMBER),
            series_desc: get_str_tag(obj, tags::SERIES_DESCRIPTION),
            modality: get_str_tag(obj, tags::MODALITY),
        };
        attrs.ensure_required()?;
        Ok(attrs)
    }

    pub fn ensure_required(&self) -> Result<()> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("SOPClassUID", &self.sop_class_uid),
            ("StudyInstanceUID", &self.study_uid),
            ("SeriesInstanceUID", &self.series_uid),
            ("SOPInstanceUID", &self.sop_uid),
        ] {
            if value.is_empty() {
                missing.push(name.to_string());
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingAttributes { missing })
        }
    }
}

/// The serialized heart of a project: three bijective lookup tables, the
/// PHI tree keyed by anonymous patient id, and the allocation counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizerModel {
    site_id: String,
    uid_root: String,

    /// Next N for each identifier family; all start at 1.
    patient_id_seq: u64,
    uid_seq: u64,
    acc_no_seq: u64,

    patient_id_lookup: BTreeMap<String, String>,
    patient_id_reverse: BTreeMap<String, String>,
    uid_lookup: BTreeMap<String, String>,
    uid_reverse: BTreeMap<String, String>,
    acc_no_lookup: BTreeMap<String, String>,
    acc_no_reverse: BTreeMap<String, String>,

    /// Reverse index: anonymous patient id → PHI record.
    phi_by_anon_id: BTreeMap<String, Phi>,

    study_count: usize,
    series_count: usize,
    instance_count: usize,

    #[serde(skip)]
    dirty: bool,
}

impl AnonymizerModel {
    pub fn new(site_id: &str, uid_root: &str) -> AnonymizerModel {
        AnonymizerModel {
            site_id: site_id.to_string(),
            uid_root: uid_root.to_string(),
            patient_id_seq: 1,
            uid_seq: 1,
            acc_no_seq: 1,
            patient_id_lookup: BTreeMap::new(),
            patient_id_reverse: BTreeMap::new(),
            uid_lookup: BTreeMap::new(),
            uid_reverse: BTreeMap::new(),
            acc_no_lookup: BTreeMap::new(),
            acc_no_reverse: BTreeMap::new(),
            phi_by_anon_id: BTreeMap::new(),
            study_count: 0,
            series_count: 0,
            instance_count: 0,
            dirty: false,
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn uid_root(&self) -> &str {
        &self.uid_root
    }

    /// Anonymous patient id for patients with an empty or missing PatientID.
    pub fn default_anon_patient_id(&self) -> String {
        format!("{}-000000", self.site_id)
    }

    // -- dirty flag -------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    // -- identifier allocation -------------------------------------------

    pub fn get_anon_patient_id(&self, phi_patient_id: &str) -> Option<&str> {
        self.patient_id_lookup
            .get(phi_patient_id)
            .map(String::as_str)
    }

    pub fn get_phi_patient_id(&self, anon_patient_id: &str) -> Option<&str> {
        self.patient_id_reverse
            .get(anon_patient_id)
            .map(String::as_str)
    }

    /// Anonymous patient id for `phi_patient_id`, allocating when absent.
    ///
    /// The empty id collapses into the reserved `-000000` patient without
    /// consuming the counter.
    pub fn get_next_anon_patient_id(&mut self, phi_patient_id: &str) -> Result<String> {
        if let Some(anon) = self.patient_id_lookup.get(phi_patient_id) {
            return Ok(anon.clone());
        }
        let anon = if phi_patient_id.is_empty() {
            self.default_anon_patient_id()
        } else {
            if self.patient_id_lookup.len() >= MAX_PATIENTS {
                return Err(Error::CapacityExceeded {
                    limit: MAX_PATIENTS,
                });
            }
            let n = self.patient_id_seq;
            self.patient_id_seq += 1;
            format!("{}-{:06}", self.site_id, n)
        };
        self.patient_id_lookup
            .insert(phi_patient_id.to_string(), anon.clone());
        self.patient_id_reverse
            .insert(anon.clone(), phi_patient_id.to_string());
        self.mark_dirty();
        debug!("new anon patient id {anon}");
        Ok(anon)
    }

    pub fn get_anon_uid(&self, phi_uid: &str) -> Option<&str> {
        self.uid_lookup.get(phi_uid).map(String::as_str)
    }

    /// Anonymous UID for `phi_uid`, allocating from the global UID counter
    /// when absent.
    pub fn get_next_anon_uid(&mut self, phi_uid: &str) -> String {
        if let Some(anon) = self.uid_lookup.get(phi_uid) {
            return anon.clone();
        }
        let n = self.uid_seq;
        self.uid_seq += 1;
        let anon = format!("{}.{}.{}", self.uid_root, self.site_id, n);
        self.uid_lookup.insert(phi_uid.to_string(), anon.clone());
        self.uid_reverse.insert(anon.clone(), phi_uid.to_string());
        self.mark_dirty();
        anon
    }

    pub fn get_anon_acc_no(&self, phi_acc_no: &str) -> Option<&str> {
        self.acc_no_lookup.get(phi_acc_no).map(String::as_str)
    }

    pub fn get_next_anon_acc_no(&mut self, phi_acc_no: &str) -> String {
        if let Some(anon) = self.acc_no_lookup.get(phi_acc_no) {
            return anon.clone();
        }
        let n = self.acc_no_seq;
        self.acc_no_seq += 1;
        let anon = n.to_string();
        self.acc_no_lookup
            .insert(phi_acc_no.to_string(), anon.clone());
        self.acc_no_reverse
            .insert(anon.clone(), phi_acc_no.to_string());
        self.mark_dirty();
        anon
    }

    /// Whether a (PHI) SOP instance UID has already been indexed.
    pub fn uid_received(&self, phi_sop_uid: &str) -> bool {
        self.phi_by_anon_id
            .values()
            .any(|phi| phi.studies.iter().any(|s| s.contains_instance(phi_sop_uid)))
    }

    // -- PHI capture ------------------------------------------------------

    /// Walk one dataset's attributes and upsert the
    /// patient → study → series → instance path.
    ///
    /// A UID that is not dotted-numeric ASCII, or an instance UID that is
    /// already indexed under another study or series, fails the capture;
    /// the caller quarantines the source bytes.
    pub fn capture_phi(
        &mut self,
        source: &str,
        attrs: &InstanceAttrs,
        date_delta: i64,
    ) -> Result<CaptureStatus> {
        attrs.ensure_required()?;
        for (name, uid) in [
            ("StudyInstanceUID", &attrs.study_uid),
            ("SeriesInstanceUID", &attrs.series_uid),
            ("SOPInstanceUID", &attrs.sop_uid),
        ] {
            if !valid_uid(uid) {
                return Err(Error::CapturePhi {
                    detail: format!("{name} {uid:?} is not a valid UID"),
                });
            }
        }

        // an instance UID the index already holds is either a re-send of
        // the same instance or a hierarchy conflict from a non-compliant
        // sender
        if self.uid_received(&attrs.sop_uid) {
            let same_place = self
                .phi_by_anon_id
                .values()
                .filter_map(|phi| phi.study_by_uid(&attrs.study_uid))
                .filter_map(|study| study.series_by_uid(&attrs.series_uid))
                .any(|series| series.instances.contains(&attrs.sop_uid));
            if same_place {
                return Ok(CaptureStatus::AlreadyPresent);
            }
            return Err(Error::CapturePhi {
                detail: format!(
                    "instance {} is already indexed under another study or series",
                    attrs.sop_uid
                ),
            });
        }

        let anon_pt_id = self.get_next_anon_patient_id(&attrs.patient_id)?;
        let phi = self
            .phi_by_anon_id
            .entry(anon_pt_id.clone())
            .or_insert_with(|| Phi {
                patient_name: attrs.patient_name.clone(),
                patient_id: attrs.patient_id.clone(),
                sex: attrs.patient_sex.clone(),
                dob: attrs.patient_dob.clone(),
                ethnic_group: attrs.ethnic_group.clone(),
                studies: Vec::new(),
            });

        let mut new_study = false;
        let study_idx = match phi
            .studies
            .iter()
            .position(|s| s.study_uid == attrs.study_uid)
        {
            Some(idx) => idx,
            None => {
                new_study = true;
                phi.studies.push(PhiStudy {
                    source: source.to_string(),
                    study_uid: attrs.study_uid.clone(),
                    study_date: attrs.study_date.clone(),
                    anon_date_delta: date_delta,
                    accession_number: attrs.accession_number.clone(),
                    study_desc: attrs.study_desc.clone(),
                    target_instance_count: 0,
                    series: Vec::new(),
                });
                phi.studies.len() - 1
            }
        };
        let study = &mut phi.studies[study_idx];

        let mut new_series = false;
        let series_idx = match study
            .series
            .iter()
            .position(|s| s.series_uid == attrs.series_uid)
        {
            Some(idx) => idx,
            None => {
                new_series = true;
                study.series.push(PhiSeries {
                    series_uid: attrs.series_uid.clone(),
                    series_desc: attrs.series_desc.clone(),
                    modality: attrs.modality.clone(),
                    instances: BTreeSet::new(),
                });
                study.series.len() - 1
            }
        };
        let series = &mut study.series[series_idx];

        // the membership probe above guarantees a fresh UID here
        series.instances.insert(attrs.sop_uid.clone());

        self.instance_count += 1;
        if new_series {
            self.series_count += 1;
        }
        if new_study {
            self.study_count += 1;
        }
        self.mark_dirty();
        Ok(CaptureStatus::Captured)
    }

    /// Record the instance count the remote reported for a study.
    pub fn set_study_target(&mut self, phi_study_uid: &str, target: usize) {
        for phi in self.phi_by_anon_id.values_mut() {
            if let Some(study) = phi.study_mut(phi_study_uid) {
                if study.target_instance_count != target {
                    study.target_instance_count = target;
                    self.dirty = true;
                }
                return;
            }
        }
    }

    // -- totals and reconciliation queries -------------------------------

    pub fn get_totals(&self) -> Totals {
        Totals {
            patients: self.phi_by_anon_id.len(),
            studies: self.study_count,
            series: self.series_count,
            instances: self.instance_count,
        }
    }

    fn find_study(&self, anon_pt_id: &str, phi_study_uid: &str) -> Option<&PhiStudy> {
        self.phi_by_anon_id
            .get(anon_pt_id)
            .and_then(|phi| phi.study_by_uid(phi_study_uid))
    }

    /// Whether the study is present and has reached its target count.
    pub fn study_imported(&self, anon_pt_id: &str, phi_study_uid: &str) -> bool {
        match self.find_study(anon_pt_id, phi_study_uid) {
            Some(study) => {
                study.target_instance_count > 0
                    && study.instance_count() >= study.target_instance_count
            }
            None => false,
        }
    }

    pub fn series_complete(
        &self,
        anon_pt_id: &str,
        phi_study_uid: &str,
        phi_series_uid: &str,
        target: usize,
    ) -> bool {
        self.find_study(anon_pt_id, phi_study_uid)
            .and_then(|study| study.series_by_uid(phi_series_uid))
            .map(|series| series.instance_count() >= target)
            .unwrap_or(false)
    }

    pub fn get_stored_instance_count(&self, anon_pt_id: &str, phi_study_uid: &str) -> usize {
        self.find_study(anon_pt_id, phi_study_uid)
            .map(PhiStudy::instance_count)
            .unwrap_or(0)
    }

    /// Instances the remote reported but that have not arrived yet.
    pub fn get_pending_instance_count(&self, anon_pt_id: &str, phi_study_uid: &str) -> usize {
        self.find_study(anon_pt_id, phi_study_uid)
            .map(|study| {
                study
                    .target_instance_count
                    .saturating_sub(study.instance_count())
            })
            .unwrap_or(0)
    }

    /// All (PHI) SOP instance UIDs stored for a study, across patients.
    pub fn get_stored_instance_uids(&self, phi_study_uid: &str) -> BTreeSet<String> {
        self.phi_by_anon_id
            .values()
            .filter_map(|phi| phi.study_by_uid(phi_study_uid))
            .flat_map(|study| {
                study
                    .series
                    .iter()
                    .flat_map(|s| s.instances.iter().cloned())
            })
            .collect()
    }

    pub fn anon_patient_ids(&self) -> Vec<String> {
        self.phi_by_anon_id.keys().cloned().collect()
    }

    pub fn patients(&self) -> impl Iterator<Item = (&String, &Phi)> {
        self.phi_by_anon_id.iter()
    }

    // -- prior-site index import -----------------------------------------

    /// Seed the lookup tables from a prior installation's index, then
    /// advance each counter past the largest imported N.
    pub fn process_java_phi_studies(&mut self, rows: Vec<java_index::JavaPhiStudy>) -> Result<()> {
        let imported = rows.len();
        for row in rows {
            if !row.phi_patient_id.is_empty() {
                self.patient_id_lookup
                    .insert(row.phi_patient_id.clone(), row.anon_patient_id.clone());
                self.patient_id_reverse
                    .insert(row.anon_patient_id.clone(), row.phi_patient_id.clone());
                if let Some(n) = parse_trailing_number(&row.anon_patient_id, '-') {
                    self.patient_id_seq = self.patient_id_seq.max(n + 1);
                }
            }
            if !row.phi_study_uid.is_empty() {
                self.uid_lookup
                    .insert(row.phi_study_uid.clone(), row.anon_study_uid.clone());
                self.uid_reverse
                    .insert(row.anon_study_uid.clone(), row.phi_study_uid.clone());
                if let Some(n) = parse_trailing_number(&row.anon_study_uid, '.') {
                    self.uid_seq = self.uid_seq.max(n + 1);
                }
            }
            if !row.phi_accession.is_empty() {
                self.acc_no_lookup
                    .insert(row.phi_accession.clone(), row.anon_accession.clone());
                self.acc_no_reverse
                    .insert(row.anon_accession.clone(), row.phi_accession.clone());
                if let Ok(n) = row.anon_accession.parse::<u64>() {
                    self.acc_no_seq = self.acc_no_seq.max(n + 1);
                }
            }

            let phi = self
                .phi_by_anon_id
                .entry(row.anon_patient_id.clone())
                .or_insert_with(|| Phi {
                    patient_name: row.phi_patient_name.clone(),
                    patient_id: row.phi_patient_id.clone(),
                    ..Phi::default()
                });
            if phi.study_by_uid(&row.phi_study_uid).is_none() {
                phi.studies.push(PhiStudy {
                    source: "JAVA_INDEX".to_string(),
                    study_uid: row.phi_study_uid.clone(),
                    study_date: row.phi_study_date.clone(),
                    anon_date_delta: row.date_offset,
                    accession_number: row.phi_accession.clone(),
                    study_desc: String::new(),
                    target_instance_count: 0,
                    series: Vec::new(),
                });
                self.study_count += 1;
            }
        }
        self.mark_dirty();
        info!(
            "imported {imported} prior-index studies; counters now pt={} uid={} acc={}",
            self.patient_id_seq, self.uid_seq, self.acc_no_seq
        );
        Ok(())
    }
}

fn parse_trailing_number(s: &str, sep: char) -> Option<u64> {
    s.rsplit(sep).next()?.parse().ok()
}

/// DICOM UIDs are dotted numeric ASCII, at most 64 characters.
fn valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> AnonymizerModel {
        AnonymizerModel::new("RSNA-0001", "1.2.826.0.1.3680043.10.474")
    }

    fn attrs(pt: &str, study: &str, series: &str, sop: &str) -> InstanceAttrs {
        InstanceAttrs {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            study_uid: study.into(),
            series_uid: series.into(),
            sop_uid: sop.into(),
            patient_id: pt.into(),
            patient_name: format!("{pt}^TEST"),
            study_date: "20200115".into(),
            accession_number: format!("ACC-{pt}"),
            modality: "CT".into(),
            ..InstanceAttrs::default()
        }
    }

    #[test]
    fn patient_ids_are_sequential_and_bijective() {
        let mut m = model();
        let a = m.get_next_anon_patient_id("X123").unwrap();
        let b = m.get_next_anon_patient_id("Y999").unwrap();
        assert_eq!(a, "RSNA-0001-000001");
        assert_eq!(b, "RSNA-0001-000002");
        // stable on re-lookup
        assert_eq!(m.get_next_anon_patient_id("X123").unwrap(), a);
        // round trip
        assert_eq!(m.get_phi_patient_id(&a), Some("X123"));
        assert_eq!(m.get_anon_patient_id("Y999"), Some(b.as_str()));
    }

    #[test]
    fn empty_patient_id_collapses_to_sentinel() {
        let mut m = model();
        let sentinel = m.get_next_anon_patient_id("").unwrap();
        assert_eq!(sentinel, "RSNA-0001-000000");
        // the sentinel does not consume the counter
        assert_eq!(
            m.get_next_anon_patient_id("X123").unwrap(),
            "RSNA-0001-000001"
        );
        assert_eq!(m.get_next_anon_patient_id("").unwrap(), sentinel);
    }

    #[test]
    fn uid_counter_is_global() {
        let mut m = model();
        let u1 = m.get_next_anon_uid("1.2.3.4");
        let u2 = m.get_next_anon_uid("9.8.7.6");
        assert_eq!(u1, "1.2.826.0.1.3680043.10.474.RSNA-0001.1");
        assert_eq!(u2, "1.2.826.0.1.3680043.10.474.RSNA-0001.2");
        assert_eq!(m.get_next_anon_uid("1.2.3.4"), u1);
        assert!(u1.len() <= 64);
    }

    #[test]
    fn accessions_are_sequential_decimal_strings() {
        let mut m = model();
        assert_eq!(m.get_next_anon_acc_no("A77"), "1");
        assert_eq!(m.get_next_anon_acc_no("B88"), "2");
        assert_eq!(m.get_next_anon_acc_no("A77"), "1");
    }

    #[test]
    fn capture_phi_builds_the_tree_and_totals() {
        let mut m = model();
        assert_eq!(
            m.capture_phi("PACS", &attrs("X123", "1.2.3", "1.2.3.1", "1.2.3.1.1"), 154)
                .unwrap(),
            CaptureStatus::Captured
        );
        assert_eq!(
            m.capture_phi("PACS", &attrs("X123", "1.2.3", "1.2.3.1", "1.2.3.1.2"), 154)
                .unwrap(),
            CaptureStatus::Captured
        );
        assert_eq!(
            m.capture_phi("PACS", &attrs("X123", "1.2.3", "1.2.3.2", "1.2.3.2.1"), 154)
                .unwrap(),
            CaptureStatus::Captured
        );
        let totals = m.get_totals();
        assert_eq!(totals, Totals { patients: 1, studies: 1, series: 2, instances: 3 });
        assert!(m.uid_received("1.2.3.1.2"));
        assert!(!m.uid_received("1.2.3.9.9"));
    }

    #[test]
    fn capture_phi_is_idempotent_per_instance() {
        let mut m = model();
        let a = attrs("X123", "1.2.3", "1.2.3.1", "1.2.3.1.1");
        m.capture_phi("PACS", &a, 154).unwrap();
        let before = m.get_totals();
        assert_eq!(
            m.capture_phi("PACS", &a, 154).unwrap(),
            CaptureStatus::AlreadyPresent
        );
        assert_eq!(m.get_totals(), before);
    }

    #[test]
    fn capture_phi_reports_all_missing_attributes() {
        let mut m = model();
        let mut a = attrs("X123", "", "1.2.3.1", "");
        a.sop_class_uid.clear();
        match m.capture_phi("PACS", &a, 0).unwrap_err() {
            Error::MissingAttributes { missing } => {
                assert_eq!(
                    missing,
                    vec!["SOPClassUID", "StudyInstanceUID", "SOPInstanceUID"]
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn malformed_uid_is_a_capture_error() {
        let mut m = model();
        let mut a = attrs("X123", "1.2.3", "1.2.3.1", "1.2.3.1.1");
        a.sop_uid = "1.2.3.not-a-uid".into();
        assert!(matches!(
            m.capture_phi("PACS", &a, 154),
            Err(Error::CapturePhi { .. })
        ));
        let mut b = attrs("X123", "1.2.3", "1.2.3.1", "1.2.3.1.1");
        b.study_uid = format!("1.{}", "2.".repeat(40));
        assert!(matches!(
            m.capture_phi("PACS", &b, 154),
            Err(Error::CapturePhi { .. })
        ));
        // nothing was indexed or allocated
        assert_eq!(m.get_totals(), Totals::default());
        assert_eq!(m.get_anon_patient_id("X123"), None);
    }

    #[test]
    fn conflicting_hierarchy_is_a_capture_error() {
        let mut m = model();
        m.capture_phi("PACS", &attrs("X123", "1.2.3", "1.2.3.1", "1.2.3.1.1"), 154)
            .unwrap();
        // the same instance UID shows up under a different study
        let moved = attrs("X123", "9.9.9", "9.9.9.1", "1.2.3.1.1");
        assert!(matches!(
            m.capture_phi("PACS", &moved, 154),
            Err(Error::CapturePhi { .. })
        ));
        // and under a different series of the same study
        let shuffled = attrs("X123", "1.2.3", "1.2.3.7", "1.2.3.1.1");
        assert!(matches!(
            m.capture_phi("PACS", &shuffled, 154),
            Err(Error::CapturePhi { .. })
        ));
        let totals = m.get_totals();
        assert_eq!(totals.studies, 1);
        assert_eq!(totals.instances, 1);
    }

    #[test]
    fn reconciliation_queries() {
        let mut m = model();
        m.capture_phi("PACS", &attrs("X123", "1.2.3", "1.2.3.1", "1.2.3.1.1"), 154)
            .unwrap();
        m.capture_phi("PACS", &attrs("X123", "1.2.3", "1.2.3.1", "1.2.3.1.2"), 154)
            .unwrap();
        m.set_study_target("1.2.3", 3);
        assert!(!m.study_imported("RSNA-0001-000001", "1.2.3"));
        assert_eq!(m.get_stored_instance_count("RSNA-0001-000001", "1.2.3"), 2);
        assert_eq!(m.get_pending_instance_count("RSNA-0001-000001", "1.2.3"), 1);
        assert!(m.series_complete("RSNA-0001-000001", "1.2.3", "1.2.3.1", 2));
        assert!(!m.series_complete("RSNA-0001-000001", "1.2.3", "1.2.3.1", 3));
        let stored = m.get_stored_instance_uids("1.2.3");
        assert_eq!(stored.len(), 2);
        assert!(stored.contains("1.2.3.1.1"));

        m.capture_phi("PACS", &attrs("X123", "1.2.3", "1.2.3.9", "1.2.3.9.1"), 154)
            .unwrap();
        assert!(m.study_imported("RSNA-0001-000001", "1.2.3"));
    }

    #[test]
    fn java_index_import_advances_counters() {
        let mut m = model();
        let rows = vec![java_index::JavaPhiStudy {
            anon_patient_id: "RSNA-0001-000017".into(),
            anon_patient_name: "RSNA-0001-000017".into(),
            phi_patient_id: "LEGACY-9".into(),
            phi_patient_name: "OLD^NAME".into(),
            date_offset: 42,
            anon_accession: "31".into(),
            phi_accession: "ACC-OLD".into(),
            anon_study_uid: "1.2.826.0.1.3680043.10.474.RSNA-0001.55".into(),
            phi_study_uid: "7.7.7.1".into(),
            anon_study_date: "20200301".into(),
            phi_study_date: "20200118".into(),
        }];
        m.process_java_phi_studies(rows).unwrap();
        assert_eq!(m.get_anon_patient_id("LEGACY-9"), Some("RSNA-0001-000017"));
        assert!(m.get_anon_uid("7.7.7.1").unwrap().ends_with(".55"));
        assert_eq!(m.get_anon_acc_no("ACC-OLD"), Some("31"));
        // counters advanced past imports
        assert_eq!(
            m.get_next_anon_patient_id("NEW-PT").unwrap(),
            "RSNA-0001-000018"
        );
        assert!(m.get_next_anon_uid("7.7.7.2").ends_with(".56"));
        assert_eq!(m.get_next_anon_acc_no("ACC-NEW"), "32");
    }

    #[test]
    fn capacity_is_enforced() {
        let mut m = model();
        // emulate a full table rather than allocating a million ids
        while m.patient_id_lookup.len() < MAX_PATIENTS {
            let k = format!("bulk-{}", m.patient_id_lookup.len());
            m.patient_id_lookup.insert(k.clone(), k);
        }
        assert!(matches!(
            m.get_next_anon_patient_id("one-too-many"),
            Err(Error::CapacityExceeded { .. })
        ));
    }
}
