//! The PHI tree: patients own studies, studies own series, series own
//! instance UID sets. Ordered collections keep snapshot serialization
//! deterministic.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiSeries {
    pub series_uid: String,
    pub series_desc: String,
    pub modality: String,
    /// SOP instance UIDs received for this series (PHI values).
    pub instances: BTreeSet<String>,
}

impl PhiSeries {
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhiStudy {
    /// AE title or import label the study arrived from.
    pub source: String,
    pub study_uid: String,
    pub study_date: String,
    /// Days added to every date of this patient. Same value for all of a
    /// patient's studies.
    pub anon_date_delta: i64,
    pub accession_number: String,
    pub study_desc: String,
    /// Instance count reported by the remote at query time; 0 if unknown.
    pub target_instance_count: usize,
    pub series: Vec<PhiSeries>,
}

impl PhiStudy {
    pub fn series_mut(&mut self, series_uid: &str) -> Option<&mut PhiSeries> {
        self.series.iter_mut().find(|s| s.series_uid == series_uid)
    }

    pub fn series_by_uid(&self, series_uid: &str) -> Option<&PhiSeries> {
        self.series.iter().find(|s| s.series_uid == series_uid)
    }

    pub fn instance_count(&self) -> usize {
        self.series.iter().map(PhiSeries::instance_count).sum()
    }

    pub fn contains_instance(&self, sop_uid: &str) -> bool {
        self.series.iter().any(|s| s.instances.contains(sop_uid))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phi {
    pub patient_name: String,
    pub patient_id: String,
    pub sex: String,
    pub dob: String,
    pub ethnic_group: String,
    pub studies: Vec<PhiStudy>,
}

impl Phi {
    pub fn study_mut(&mut self, study_uid: &str) -> Option<&mut PhiStudy> {
        self.studies.iter_mut().find(|s| s.study_uid == study_uid)
    }

    pub fn study_by_uid(&self, study_uid: &str) -> Option<&PhiStudy> {
        self.studies.iter().find(|s| s.study_uid == study_uid)
    }
}
