//! Query/retrieve against remote peers: C-FIND and C-MOVE service users
//! plus the study retrieval orchestrator.

pub mod find_scu;
pub mod move_scu;
pub mod orchestrator;

use std::time::Duration;

use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_dictionary_std::tags;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::association::AsyncClientAssociation;
use dicom_ul::Pdu;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{DicomNode, NetworkTimeouts};
use crate::error::{Error, Result};

pub use orchestrator::{
    MoveLevel, MoveOrchestrator, MoveStudiesRequest, MoveStudyUpdate, StudySpec,
};

/// DIMSE status predicates.
pub(crate) fn is_pending(status: u16) -> bool {
    status == 0xFF00 || status == 0xFF01
}

pub(crate) const STATUS_SUCCESS: u16 = 0x0000;
pub(crate) const STATUS_CANCEL: u16 = 0xFE00;

/// One parsed DIMSE response: the command set plus the identifier dataset
/// when one follows.
pub(crate) struct DimseResponse {
    pub status: u16,
    pub command: InMemDicomObject,
    pub identifier: Option<InMemDicomObject>,
}

/// Open an association negotiating exactly one abstract syntax, bounded by
/// the configured connect/ACSE/DIMSE timeouts.
pub(crate) async fn connect(
    node: &DicomNode,
    calling_ae_title: &str,
    abstract_syntax: &str,
    timeouts: &NetworkTimeouts,
    max_pdu_length: u32,
) -> Result<AsyncClientAssociation<TcpStream>> {
    let options = dicom_ul::association::ClientAssociationOptions::new()
        .with_abstract_syntax(abstract_syntax.to_string())
        .calling_ae_title(calling_ae_title.to_string())
        .called_ae_title(node.ae_title.clone())
        .max_pdu_length(max_pdu_length)
        .connection_timeout(Duration::from_secs(timeouts.tcp_connect))
        .read_timeout(Duration::from_secs(timeouts.dimse))
        .write_timeout(Duration::from_secs(timeouts.dimse));
    match timeout(
        Duration::from_secs(timeouts.acse),
        options.establish_with_async(&node.socket_addr()),
    )
    .await
    {
        Ok(Ok(assoc)) => Ok(assoc),
        Ok(Err(source)) => Err(Error::AssociationRejected {
            ae_title: node.ae_title.clone(),
            source: Box::new(source),
        }),
        Err(_) => Err(Error::NetworkTimeout {
            seconds: timeouts.acse,
        }),
    }
}

/// Send one DIMSE request: the command set, and the identifier encoded in
/// the accepted presentation context's transfer syntax.
pub(crate) async fn send_request(
    scu: &mut AsyncClientAssociation<TcpStream>,
    pc_id: u8,
    ts_uid: &str,
    command: InMemDicomObject<StandardDataDictionary>,
    identifier: Option<&InMemDicomObject>,
) -> Result<()> {
    let ivrle = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut cmd_data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut cmd_data, &ivrle)
        .map_err(|e| Error::CreateCommand { source: Box::new(e) })?;

    let mut data = vec![PDataValue {
        presentation_context_id: pc_id,
        value_type: PDataValueType::Command,
        is_last: true,
        data: cmd_data,
    }];
    if let Some(identifier) = identifier {
        let ts = TransferSyntaxRegistry
            .get(ts_uid)
            .ok_or_else(|| Error::NoPresentationContext {
                uid: ts_uid.to_string(),
            })?;
        let mut iod_data = Vec::with_capacity(256);
        identifier
            .write_dataset_with_ts(&mut iod_data, ts)
            .map_err(|e| Error::WriteDataset { source: Box::new(e) })?;
        data.push(PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Data,
            is_last: true,
            data: iod_data,
        });
    }
    scu.send(&Pdu::PData { data })
        .await
        .map_err(|e| Error::Scu { source: Box::new(e) })
}

/// Read one full DIMSE response (command set plus optional dataset).
pub(crate) async fn read_response(
    scu: &mut AsyncClientAssociation<TcpStream>,
    ts_uid: &str,
) -> Result<DimseResponse> {
    let ivrle = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut command: Option<InMemDicomObject> = None;
    let mut expects_dataset = false;
    let mut cmd_buffer: Vec<u8> = Vec::new();
    let mut data_buffer: Vec<u8> = Vec::new();

    loop {
        let pdu = scu
            .receive()
            .await
            .map_err(|e| Error::Scu { source: Box::new(e) })?;
        match pdu {
            Pdu::PData { data } => {
                for dv in data {
                    match dv.value_type {
                        PDataValueType::Command => {
                            cmd_buffer.extend_from_slice(&dv.data);
                            if dv.is_last {
                                let obj = InMemDicomObject::read_dataset_with_ts(
                                    cmd_buffer.as_slice(),
                                    &ivrle,
                                )
                                .map_err(|e| Error::ReadDataset { source: Box::new(e) })?;
                                let data_set_type = obj
                                    .element(tags::COMMAND_DATA_SET_TYPE)
                                    .ok()
                                    .and_then(|e| e.uint16().ok())
                                    .unwrap_or(0x0101);
                                expects_dataset = data_set_type != 0x0101;
                                command = Some(obj);
                                cmd_buffer.clear();
                            }
                        }
                        PDataValueType::Data => {
                            data_buffer.extend_from_slice(&dv.data);
                            if dv.is_last {
                                let command = command.ok_or_else(|| Error::InvalidDicom {
                                    detail: "dataset PDV before command set".to_string(),
                                })?;
                                let ts = TransferSyntaxRegistry.get(ts_uid).ok_or_else(|| {
                                    Error::NoPresentationContext {
                                        uid: ts_uid.to_string(),
                                    }
                                })?;
                                let identifier = InMemDicomObject::read_dataset_with_ts(
                                    data_buffer.as_slice(),
                                    ts,
                                )
                                .map_err(|e| Error::ReadDataset { source: Box::new(e) })?;
                                let status = read_status(&command)?;
                                return Ok(DimseResponse {
                                    status,
                                    command,
                                    identifier: Some(identifier),
                                });
                            }
                        }
                    }
                }
                if let Some(cmd) = command.take() {
                    if !expects_dataset {
                        let status = read_status(&cmd)?;
                        return Ok(DimseResponse {
                            status,
                            command: cmd,
                            identifier: None,
                        });
                    }
                    command = Some(cmd);
                }
            }
            Pdu::AbortRQ { .. } => return Err(Error::PeerAbort),
            Pdu::ReleaseRQ => {
                let _ = scu.send(&Pdu::ReleaseRP).await;
                return Err(Error::PeerAbort);
            }
            other => {
                return Err(Error::InvalidDicom {
                    detail: format!("unexpected PDU during DIMSE exchange: {other:?}"),
                })
            }
        }
    }
}

fn read_status(command: &InMemDicomObject) -> Result<u16> {
    command
        .element(tags::STATUS)
        .map_err(|e| Error::MissingDimseAttribute {
            tag: tags::STATUS,
            source: e,
        })?
        .uint16()
        .map_err(|e| Error::ConvertField {
            tag: tags::STATUS,
            source: Box::new(e),
        })
}

/// The single accepted presentation context of an association negotiated
/// with one abstract syntax.
pub(crate) fn accepted_context(
    scu: &AsyncClientAssociation<TcpStream>,
) -> Result<(u8, String)> {
    scu.presentation_contexts()
        .first()
        .map(|pc| (pc.id, pc.transfer_syntax.to_string()))
        .ok_or_else(|| Error::NoPresentationContext {
            uid: "no presentation context accepted".to_string(),
        })
}
