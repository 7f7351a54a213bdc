//! Study-root C-MOVE service user: one retrieval request per call, with
//! every pending status folded into the caller's counters.

use std::sync::atomic::{AtomicBool, Ordering};

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use tracing::{debug, warn};

use crate::config::{DicomNode, NetworkTimeouts};
use crate::error::{Error, Result};
use crate::qr::{accepted_context, connect, is_pending, read_response, send_request};

fn move_req_command(
    message_id: u16,
    destination_ae: &str,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0021])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, destination_ae),
        ),
    ])
}

/// Identifier for one C-MOVE at the given retrieve level.
pub fn move_identifier(
    level: &str,
    study_uid: &str,
    series_uid: Option<&str>,
    sop_uid: Option<&str>,
) -> InMemDicomObject {
    let mut elements = vec![
        DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, PrimitiveValue::from(level)),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_uid)),
    ];
    if let Some(series_uid) = series_uid {
        elements.push(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_uid),
        ));
    }
    if let Some(sop_uid) = sop_uid {
        elements.push(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_uid),
        ));
    }
    InMemDicomObject::from_element_iter(elements)
}

/// Issue one C-MOVE and drive its response sequence to completion.
///
/// Every status dataset (pending or final) is handed to `on_status`
/// before the final DIMSE status is returned. When `abort` is raised the
/// association is A-ABORTed and the call ends with `CANCELLED`.
pub async fn move_once(
    node: &DicomNode,
    calling_ae_title: &str,
    destination_ae: &str,
    timeouts: &NetworkTimeouts,
    max_pdu_length: u32,
    identifier: &InMemDicomObject,
    abort: &AtomicBool,
    mut on_status: impl FnMut(&InMemDicomObject),
) -> Result<u16> {
    let mut scu = connect(
        node,
        calling_ae_title,
        STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        timeouts,
        max_pdu_length,
    )
    .await?;
    let (pc_id, ts_uid) = accepted_context(&scu)?;

    send_request(
        &mut scu,
        pc_id,
        &ts_uid,
        move_req_command(1, destination_ae),
        Some(identifier),
    )
    .await?;

    loop {
        if abort.load(Ordering::SeqCst) {
            let _ = scu.abort().await;
            return Err(Error::Cancelled);
        }
        let rsp = read_response(&mut scu, &ts_uid).await?;
        on_status(&rsp.command);
        if is_pending(rsp.status) {
            debug!("C-MOVE pending (status {:04X}H)", rsp.status);
            continue;
        }
        if rsp.status == super::STATUS_CANCEL {
            let _ = scu.release().await;
            return Err(Error::Cancelled);
        }
        if rsp.status != super::STATUS_SUCCESS {
            warn!(
                "C-MOVE to {} ended with status {:04X}H",
                node.ae_title, rsp.status
            );
        }
        let _ = scu.release().await;
        return Ok(rsp.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_carries_only_the_requested_levels() {
        let study_only = move_identifier("STUDY", "1.2.3", None, None);
        assert!(study_only.element(tags::SERIES_INSTANCE_UID).is_err());
        assert!(study_only.element(tags::SOP_INSTANCE_UID).is_err());
        assert_eq!(
            study_only
                .element(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap(),
            "STUDY"
        );

        let instance = move_identifier("IMAGE", "1.2.3", Some("1.2.3.1"), Some("1.2.3.1.7"));
        assert_eq!(
            instance
                .element(tags::SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            "1.2.3.1.7"
        );
    }
}
