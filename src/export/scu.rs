//! C-STORE service user for export: sends anonymized files from storage
//! to a remote SCP over one association per batch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{open_file, InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::association::AsyncClientAssociation;
use dicom_ul::Pdu;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{DicomNode, NetworkTimeouts};
use crate::error::{Error, Result};

/// One file staged for sending, with its negotiation-relevant UIDs.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub path: PathBuf,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
}

/// Read the file meta of an anonymized file on disk.
pub fn scan_file(path: &Path) -> Result<OutboundFile> {
    let obj = open_file(path).map_err(|e| Error::DicomRead { source: Box::new(e) })?;
    let meta = obj.meta();
    Ok(OutboundFile {
        path: path.to_path_buf(),
        sop_class_uid: meta
            .media_storage_sop_class_uid
            .trim_end_matches(['\0', ' '])
            .to_string(),
        sop_instance_uid: meta
            .media_storage_sop_instance_uid
            .trim_end_matches(['\0', ' '])
            .to_string(),
        transfer_syntax: meta.transfer_syntax.trim_end_matches(['\0', ' ']).to_string(),
    })
}

fn store_req_command(
    storage_sop_class_uid: &str,
    storage_sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, storage_sop_instance_uid),
        ),
    ])
}

/// Select the accepted presentation context for a file: exact transfer
/// syntax match first, then any codec-free pair.
fn select_context(
    file: &OutboundFile,
    pcs: &[dicom_ul::pdu::PresentationContextNegotiated],
) -> Result<(dicom_ul::pdu::PresentationContextNegotiated, String)> {
    let file_ts = TransferSyntaxRegistry
        .get(&file.transfer_syntax)
        .ok_or_else(|| Error::NoPresentationContext {
            uid: file.transfer_syntax.clone(),
        })?;

    if let Some(pc) = pcs.iter().find(|pc| pc.transfer_syntax == file_ts.uid()) {
        return Ok((pc.clone(), pc.transfer_syntax.clone()));
    }
    pcs.iter()
        .find(|pc| {
            TransferSyntaxRegistry
                .get(&pc.transfer_syntax)
                .filter(|ts| file_ts.is_codec_free() && ts.is_codec_free())
                .is_some()
        })
        .map(|pc| (pc.clone(), pc.transfer_syntax.clone()))
        .ok_or_else(|| Error::NoPresentationContext {
            uid: file.sop_class_uid.clone(),
        })
}

/// Outcome of one batch send.
#[derive(Debug, Default)]
pub struct SendReport {
    pub sent: Vec<String>,
    /// (sop_instance_uid, human-readable reason)
    pub failed: Vec<(String, String)>,
}

/// Send a batch of files over one association.
///
/// Per-file failures are recorded in the report and do not abort the
/// batch; association-level failures propagate.
pub async fn send_files(
    node: &DicomNode,
    calling_ae_title: &str,
    timeouts: &NetworkTimeouts,
    max_pdu_length: u32,
    files: &[OutboundFile],
    abort: &AtomicBool,
) -> Result<SendReport> {
    let mut report = SendReport::default();
    if files.is_empty() {
        return Ok(report);
    }

    let mut options = dicom_ul::association::ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title.to_string())
        .called_ae_title(node.ae_title.clone())
        .max_pdu_length(max_pdu_length)
        .connection_timeout(Duration::from_secs(timeouts.tcp_connect))
        .read_timeout(Duration::from_secs(timeouts.dimse))
        .write_timeout(Duration::from_secs(timeouts.dimse));
    let mut seen = std::collections::HashSet::new();
    for file in files {
        if seen.insert(file.sop_class_uid.clone()) {
            options = options.with_abstract_syntax(file.sop_class_uid.clone());
        }
    }

    let mut scu = match timeout(
        Duration::from_secs(timeouts.acse),
        options.establish_with_async(&node.socket_addr()),
    )
    .await
    {
        Ok(Ok(scu)) => scu,
        Ok(Err(source)) => {
            return Err(Error::AssociationRejected {
                ae_title: node.ae_title.clone(),
                source: Box::new(source),
            })
        }
        Err(_) => {
            return Err(Error::NetworkTimeout {
                seconds: timeouts.acse,
            })
        }
    };

    let mut message_id = 1u16;
    for file in files {
        if abort.load(Ordering::SeqCst) {
            let _ = scu.abort().await;
            return Err(Error::Cancelled);
        }
        match send_one(&mut scu, file, message_id).await {
            Ok(()) => report.sent.push(file.sop_instance_uid.clone()),
            Err(e @ Error::Scu { .. }) | Err(e @ Error::PeerAbort) => {
                // the association is gone; everything unsent failed
                report
                    .failed
                    .push((file.sop_instance_uid.clone(), e.to_string()));
                return Ok(report);
            }
            Err(e) => {
                warn!("failed to send {}: {e}", file.path.display());
                report
                    .failed
                    .push((file.sop_instance_uid.clone(), e.to_string()));
            }
        }
        message_id += 1;
    }
    let _ = scu.release().await;
    Ok(report)
}

async fn send_one(
    scu: &mut AsyncClientAssociation<TcpStream>,
    file: &OutboundFile,
    message_id: u16,
) -> Result<()> {
    let (pc_selected, ts_uid_selected) = select_context(file, scu.presentation_contexts())?;

    let cmd = store_req_command(&file.sop_class_uid, &file.sop_instance_uid, message_id);
    let mut cmd_data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(
        &mut cmd_data,
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .map_err(|e| Error::CreateCommand { source: Box::new(e) })?;

    let dicom_file = open_file(&file.path).map_err(|e| Error::DicomRead { source: Box::new(e) })?;
    let ts_selected =
        TransferSyntaxRegistry
            .get(&ts_uid_selected)
            .ok_or_else(|| Error::NoPresentationContext {
                uid: ts_uid_selected.clone(),
            })?;
    let mut object_data = Vec::with_capacity(2048);
    dicom_file
        .write_dataset_with_ts(&mut object_data, ts_selected)
        .map_err(|e| Error::WriteDataset { source: Box::new(e) })?;

    let nbytes = cmd_data.len() + object_data.len();
    debug!(
        "sending {} (~{} kB) sop={} ts={}",
        file.path.display(),
        nbytes / 1_000,
        file.sop_instance_uid,
        ts_uid_selected
    );

    if nbytes < scu.acceptor_max_pdu_length().saturating_sub(100) as usize {
        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: pc_selected.id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: cmd_data,
                },
                PDataValue {
                    presentation_context_id: pc_selected.id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: object_data,
                },
            ],
        };
        scu.send(&pdu)
            .await
            .map_err(|e| Error::Scu { source: Box::new(e) })?;
    } else {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_selected.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            }],
        };
        scu.send(&pdu)
            .await
            .map_err(|e| Error::Scu { source: Box::new(e) })?;
        let mut pdata = scu.send_pdata(pc_selected.id);
        pdata
            .write_all(&object_data)
            .await
            .map_err(|e| Error::Storage {
                path: file.path.display().to_string(),
                source: e,
            })?;
    }

    let rsp_pdu = scu
        .receive()
        .await
        .map_err(|e| Error::Scu { source: Box::new(e) })?;
    match rsp_pdu {
        Pdu::PData { data } => {
            let data_value = &data[0];
            let cmd_obj = InMemDicomObject::read_dataset_with_ts(
                &data_value.data[..],
                &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .map_err(|e| Error::ReadDataset { source: Box::new(e) })?;
            let status = cmd_obj
                .element(tags::STATUS)
                .map_err(|e| Error::MissingDimseAttribute {
                    tag: tags::STATUS,
                    source: e,
                })?
                .to_int::<u16>()
                .map_err(|e| Error::ConvertField {
                    tag: tags::STATUS,
                    source: Box::new(e),
                })?;
            match status {
                0 => Ok(()),
                1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => {
                    warn!(
                        "possible issue storing instance `{}` (status {status:04X}H)",
                        file.sop_instance_uid
                    );
                    Ok(())
                }
                0xFE00 => Err(Error::Cancelled),
                _ => Err(Error::InvalidDicom {
                    detail: format!("C-STORE rejected with status {status:04X}H"),
                }),
            }
        }
        Pdu::AbortRQ { .. } => Err(Error::PeerAbort),
        other => Err(Error::InvalidDicom {
            detail: format!("unexpected SCP response: {other:?}"),
        }),
    }
}
