//! Study-root C-FIND service user: study, series and instance level
//! queries against a remote peer.

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use tracing::{debug, warn};

use crate::config::{DicomNode, NetworkTimeouts};
use crate::error::{Error, Result};
use crate::qr::{accepted_context, connect, is_pending, read_response, send_request};

/// One series as reported by a series-level C-FIND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSeries {
    pub series_uid: String,
    pub modality: String,
    pub instance_count: usize,
}

/// Study attributes from a study-level C-FIND result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStudy {
    pub study_uid: String,
    pub patient_id: String,
    pub patient_name: String,
    pub study_date: String,
    pub modalities_in_study: String,
    pub instance_count: usize,
}

fn find_req_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0020])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
    ])
}

fn get_str(obj: &InMemDicomObject, tag: dicom_core::Tag) -> String {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .unwrap_or_default()
}

fn get_count(obj: &InMemDicomObject, tag: dicom_core::Tag) -> usize {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_int::<i64>().ok())
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(0)
}

/// Run one C-FIND and collect every pending identifier.
async fn find(
    node: &DicomNode,
    calling_ae_title: &str,
    timeouts: &NetworkTimeouts,
    max_pdu_length: u32,
    identifier: InMemDicomObject,
) -> Result<Vec<InMemDicomObject>> {
    let mut scu = connect(
        node,
        calling_ae_title,
        STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        timeouts,
        max_pdu_length,
    )
    .await?;
    let (pc_id, ts_uid) = accepted_context(&scu)?;

    send_request(&mut scu, pc_id, &ts_uid, find_req_command(1), Some(&identifier)).await?;

    let mut results = Vec::new();
    loop {
        let rsp = read_response(&mut scu, &ts_uid).await?;
        if is_pending(rsp.status) {
            if let Some(identifier) = rsp.identifier {
                results.push(identifier);
            }
            continue;
        }
        if rsp.status != super::STATUS_SUCCESS {
            warn!(
                "C-FIND to {} ended with status {:04X}H",
                node.ae_title, rsp.status
            );
        }
        break;
    }
    let _ = scu.release().await;
    debug!("C-FIND returned {} matches", results.len());
    Ok(results)
}

/// Study-level query for the attributes a conforming peer must return.
pub async fn find_study(
    node: &DicomNode,
    calling_ae_title: &str,
    timeouts: &NetworkTimeouts,
    max_pdu_length: u32,
    study_uid: &str,
) -> Result<Option<RemoteStudy>> {
    let identifier = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("STUDY"),
        ),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_uid)),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::Empty),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::Empty),
        DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::Empty),
        DataElement::new(tags::MODALITIES_IN_STUDY, VR::CS, PrimitiveValue::Empty),
        DataElement::new(
            tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
            VR::IS,
            PrimitiveValue::Empty,
        ),
    ]);
    let results = find(node, calling_ae_title, timeouts, max_pdu_length, identifier).await?;
    let Some(obj) = results.into_iter().next() else {
        return Ok(None);
    };
    let study = RemoteStudy {
        study_uid: get_str(&obj, tags::STUDY_INSTANCE_UID),
        patient_id: get_str(&obj, tags::PATIENT_ID),
        patient_name: get_str(&obj, tags::PATIENT_NAME),
        study_date: get_str(&obj, tags::STUDY_DATE),
        modalities_in_study: get_str(&obj, tags::MODALITIES_IN_STUDY),
        instance_count: get_count(&obj, tags::NUMBER_OF_STUDY_RELATED_INSTANCES),
    };
    let mut missing = Vec::new();
    for (name, value) in [
        ("PatientID", &study.patient_id),
        ("PatientName", &study.patient_name),
        ("StudyDate", &study.study_date),
        ("ModalitiesInStudy", &study.modalities_in_study),
    ] {
        if value.is_empty() {
            missing.push(name.to_string());
        }
    }
    if study.instance_count == 0 {
        missing.push("NumberOfStudyRelatedInstances".to_string());
    }
    if !missing.is_empty() {
        return Err(Error::MissingAttributes { missing });
    }
    Ok(Some(study))
}

/// Series-level query below one study.
pub async fn find_series(
    node: &DicomNode,
    calling_ae_title: &str,
    timeouts: &NetworkTimeouts,
    max_pdu_length: u32,
    study_uid: &str,
) -> Result<Vec<RemoteSeries>> {
    let identifier = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("SERIES"),
        ),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_uid)),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::Empty),
        DataElement::new(
            tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
            VR::IS,
            PrimitiveValue::Empty,
        ),
    ]);
    let results = find(node, calling_ae_title, timeouts, max_pdu_length, identifier).await?;
    Ok(results
        .into_iter()
        .map(|obj| RemoteSeries {
            series_uid: get_str(&obj, tags::SERIES_INSTANCE_UID),
            modality: get_str(&obj, tags::MODALITY),
            instance_count: get_count(&obj, tags::NUMBER_OF_SERIES_RELATED_INSTANCES),
        })
        .filter(|s| !s.series_uid.is_empty())
        .collect())
}

/// Instance-level query: SOP instance UIDs below a study, optionally
/// restricted to one series.
pub async fn find_instances(
    node: &DicomNode,
    calling_ae_title: &str,
    timeouts: &NetworkTimeouts,
    max_pdu_length: u32,
    study_uid: &str,
    series_uid: Option<&str>,
) -> Result<Vec<String>> {
    let mut elements = vec![
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("IMAGE"),
        ),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_uid)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::Empty),
    ];
    match series_uid {
        Some(series_uid) => elements.push(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_uid),
        )),
        None => elements.push(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::Empty,
        )),
    }
    let identifier = InMemDicomObject::from_element_iter(elements);
    let results = find(node, calling_ae_title, timeouts, max_pdu_length, identifier).await?;
    Ok(results
        .into_iter()
        .map(|obj| get_str(&obj, tags::SOP_INSTANCE_UID))
        .filter(|uid| !uid.is_empty())
        .collect())
}
