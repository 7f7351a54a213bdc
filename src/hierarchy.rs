//! In-memory study → series → instance UID tree used by the retrieval
//! orchestrator to reconcile what a peer promised against what arrived.

use std::collections::BTreeMap;

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUidHierarchy {
    pub uid: String,
    pub instance_number: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesUidHierarchy {
    pub uid: String,
    pub modality: String,
    /// Instance count the peer reported at series level; 0 if unknown.
    pub reported_instance_count: usize,
    pub instances: BTreeMap<String, InstanceUidHierarchy>,
}

/// Aggregate DIMSE sub-operation counters for one study's C-MOVE sequence.
///
/// Asynchronous peers may report counts out of order; the progress
/// counters only ever move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveSubOps {
    pub completed: usize,
    pub failed: usize,
    pub warning: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default)]
pub struct StudyUidHierarchy {
    pub uid: String,
    pub patient_id: String,
    pub last_error_msg: Option<String>,
    /// Instances still expected from the peer.
    pub pending_instances: usize,
    /// Totals committed from finished C-MOVE sequences.
    sub_ops: MoveSubOps,
    /// Counters of the C-MOVE currently in flight.
    current_move: MoveSubOps,
    pub series: BTreeMap<String, SeriesUidHierarchy>,
}

fn read_sub_op(status: &InMemDicomObject, tag: dicom_core::Tag) -> Option<usize> {
    status
        .element(tag)
        .ok()
        .and_then(|e| e.uint16().ok())
        .map(usize::from)
}

impl StudyUidHierarchy {
    pub fn new(uid: &str, patient_id: &str) -> StudyUidHierarchy {
        StudyUidHierarchy {
            uid: uid.to_string(),
            patient_id: patient_id.to_string(),
            ..StudyUidHierarchy::default()
        }
    }

    pub fn instance_uids(&self) -> Vec<String> {
        self.series
            .values()
            .flat_map(|s| s.instances.keys().cloned())
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.series.values().map(|s| s.instances.len()).sum()
    }

    /// O(series) lookup of an instance leaf.
    pub fn find_instance(&self, uid: &str) -> Option<&InstanceUidHierarchy> {
        self.series.values().find_map(|s| s.instances.get(uid))
    }

    /// Fold one C-MOVE status dataset into the in-flight counters.
    ///
    /// Sub-operation numbers are Unsigned Short and may regress when the
    /// peer answers asynchronously; completed/failed/warning take the
    /// maximum of observed vs current, and `remaining` never underflows.
    pub fn update_move_states(&mut self, status: &InMemDicomObject) {
        if let Some(n) = read_sub_op(status, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS) {
            self.current_move.completed = self.current_move.completed.max(n);
        }
        if let Some(n) = read_sub_op(status, tags::NUMBER_OF_FAILED_SUBOPERATIONS) {
            self.current_move.failed = self.current_move.failed.max(n);
        }
        if let Some(n) = read_sub_op(status, tags::NUMBER_OF_WARNING_SUBOPERATIONS) {
            self.current_move.warning = self.current_move.warning.max(n);
        }
        if let Some(n) = read_sub_op(status, tags::NUMBER_OF_REMAINING_SUBOPERATIONS) {
            // remaining counts down; keep the lowest seen so a stale
            // larger value cannot resurrect finished work
            self.current_move.remaining = if self.current_move.remaining == 0 {
                n
            } else {
                self.current_move.remaining.min(n)
            };
        }
    }

    /// Commit the finished C-MOVE's counters into the study totals.
    /// Successive retries at a lower level keep adding to the same totals.
    pub fn commit_move(&mut self) {
        self.sub_ops.completed += self.current_move.completed;
        self.sub_ops.failed += self.current_move.failed;
        self.sub_ops.warning += self.current_move.warning;
        self.sub_ops.remaining = self.current_move.remaining;
        self.current_move = MoveSubOps::default();
    }

    /// Committed totals plus whatever the in-flight move has reported.
    pub fn sub_ops(&self) -> MoveSubOps {
        MoveSubOps {
            completed: self.sub_ops.completed + self.current_move.completed,
            failed: self.sub_ops.failed + self.current_move.failed,
            warning: self.sub_ops.warning + self.current_move.warning,
            remaining: if self.current_move.remaining > 0 {
                self.current_move.remaining
            } else {
                self.sub_ops.remaining
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn status_ds(completed: u16, failed: u16, warning: u16, remaining: u16) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [completed]),
            ),
            DataElement::new(
                tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [failed]),
            ),
            DataElement::new(
                tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [warning]),
            ),
            DataElement::new(
                tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [remaining]),
            ),
        ])
    }

    fn study_with_instances() -> StudyUidHierarchy {
        let mut study = StudyUidHierarchy::new("1.2.3", "PT-1");
        let mut series = SeriesUidHierarchy {
            uid: "1.2.3.1".into(),
            modality: "CT".into(),
            reported_instance_count: 2,
            instances: BTreeMap::new(),
        };
        for uid in ["1.2.3.1.1", "1.2.3.1.2"] {
            series.instances.insert(
                uid.to_string(),
                InstanceUidHierarchy {
                    uid: uid.to_string(),
                    instance_number: None,
                },
            );
        }
        study.series.insert(series.uid.clone(), series);
        study
    }

    #[test]
    fn counters_only_move_forward() {
        let mut study = study_with_instances();
        study.update_move_states(&status_ds(10, 0, 0, 90));
        study.update_move_states(&status_ds(30, 1, 0, 70));
        // regressed report from an asynchronous peer
        study.update_move_states(&status_ds(20, 0, 0, 80));
        assert_eq!(
            study.sub_ops(),
            MoveSubOps {
                completed: 30,
                failed: 1,
                warning: 0,
                remaining: 70
            }
        );
    }

    #[test]
    fn missing_sub_op_attributes_leave_counters_untouched() {
        let mut study = study_with_instances();
        study.update_move_states(&status_ds(5, 0, 0, 5));
        study.update_move_states(&InMemDicomObject::from_element_iter([]));
        assert_eq!(study.sub_ops().completed, 5);
        assert_eq!(study.sub_ops().remaining, 5);
    }

    #[test]
    fn retries_accumulate_across_committed_moves() {
        let mut study = study_with_instances();
        // study-level move delivers 97 of 100
        study.update_move_states(&status_ds(97, 0, 0, 0));
        study.commit_move();
        // three instance-level retries deliver one each
        for _ in 0..3 {
            study.update_move_states(&status_ds(1, 0, 0, 0));
            study.commit_move();
        }
        assert_eq!(study.sub_ops().completed, 100);
        assert_eq!(study.sub_ops().remaining, 0);
    }

    #[test]
    fn find_instance_searches_across_series() {
        let study = study_with_instances();
        assert!(study.find_instance("1.2.3.1.2").is_some());
        assert!(study.find_instance("9.9.9").is_none());
        assert_eq!(study.instance_count(), 2);
        assert_eq!(study.instance_uids().len(), 2);
    }
}
