//! The storage SCP: one task per association, admitting C-STORE datasets
//! into the ingest queue under memory backpressure and answering C-ECHO.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids::*};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{pdu::PDataValueType, Pdu};
use snafu::{OptionExt, Report, ResultExt, Whatever};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{IngestSettings, ProjectModel};
use crate::storage::{QuarantineCategory, StorageLayout};

/// DIMSE status: out of resources.
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;
/// DIMSE status: success.
pub const STATUS_SUCCESS: u16 = 0x0000;

/// Storage SOP classes accepted when the project does not configure its own.
#[allow(deprecated)]
pub static DEFAULT_STORAGE_CLASSES: &[&str] = &[
    CT_IMAGE_STORAGE,
    ENHANCED_CT_IMAGE_STORAGE,
    SECONDARY_CAPTURE_IMAGE_STORAGE,
    ULTRASOUND_IMAGE_STORAGE_RETIRED,
    ULTRASOUND_IMAGE_STORAGE,
    NUCLEAR_MEDICINE_IMAGE_STORAGE_RETIRED,
    MR_IMAGE_STORAGE,
    ENHANCED_MR_IMAGE_STORAGE,
    ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE_RETIRED,
    ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    BREAST_TOMOSYNTHESIS_IMAGE_STORAGE,
    POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    ENHANCED_PET_IMAGE_STORAGE,
    NUCLEAR_MEDICINE_IMAGE_STORAGE,
    MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
    MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
];

/// One dataset admitted off the wire, awaiting anonymization.
pub struct WorkItem {
    /// Calling AE title the dataset arrived from.
    pub source: String,
    pub obj: InMemDicomObject,
    pub ts_uid: String,
    /// As-received dataset bytes, kept for quarantine.
    pub bytes: Vec<u8>,
}

/// Shared state of the listening SCP.
pub struct ScpContext {
    pub ae_title: String,
    pub max_pdu_length: u32,
    pub transfer_syntaxes: Vec<String>,
    pub storage_classes: Vec<String>,
    pub settings: IngestSettings,
    pub layout: StorageLayout,
    pub queue: mpsc::Sender<WorkItem>,
    pub queue_len: Arc<AtomicUsize>,
    pub active: Arc<AtomicBool>,
    /// Raised on `CAPACITY_EXCEEDED`/`MODEL_VERSION_MISMATCH`; every
    /// further store is refused with OutOfResources.
    pub fatal: Arc<AtomicBool>,
}

impl ScpContext {
    pub fn from_config(
        config: &ProjectModel,
        layout: StorageLayout,
        queue: mpsc::Sender<WorkItem>,
        queue_len: Arc<AtomicUsize>,
        active: Arc<AtomicBool>,
        fatal: Arc<AtomicBool>,
    ) -> ScpContext {
        ScpContext {
            ae_title: config.local.ae_title.clone(),
            max_pdu_length: config.max_pdu_length,
            transfer_syntaxes: config.transfer_syntaxes.clone(),
            storage_classes: config.accepted_storage_classes(),
            settings: config.ingest,
            layout,
            queue,
            queue_len,
            active,
            fatal,
        }
    }
}

/// Available memory as reported by the OS, in bytes.
pub fn available_memory_bytes() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.available_memory()
}

/// Admission gate: wait out low-memory spells in small slices, give up
/// after the configured retry budget or when the queue stays full.
async fn try_admit(ctx: &ScpContext, item: WorkItem) -> bool {
    let mut item = Some(item);
    for _ in 0..=ctx.settings.backoff_max_retries {
        if available_memory_bytes() < ctx.settings.memory_threshold_bytes {
            sleep(Duration::from_millis(ctx.settings.backoff_slice_ms)).await;
            continue;
        }
        match ctx.queue.try_send(item.take().unwrap()) {
            Ok(()) => {
                ctx.queue_len.fetch_add(1, Ordering::SeqCst);
                return true;
            }
            Err(mpsc::error::TrySendError::Full(returned)) => {
                item = Some(returned);
                sleep(Duration::from_millis(ctx.settings.backoff_slice_ms)).await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
    false
}

/// A C-STORE-RQ whose dataset has not fully arrived yet.
struct PendingStore {
    message_id: u16,
    affected_class_uid: String,
    affected_instance_uid: String,
}

/// The DIMSE command sets this SCP reacts to.
enum DimseCommand {
    EchoRq { message_id: u16 },
    StoreRq(PendingStore),
    Other(u16),
}

fn command_uid(cmd: &InMemDicomObject, tag: dicom_core::Tag) -> Result<String, Whatever> {
    Ok(cmd
        .element(tag)
        .whatever_context(format!("C-STORE command set lacks {tag}"))?
        .to_str()
        .whatever_context(format!("value of {tag} is not a UID string"))?
        .trim_end_matches(['\0', ' '])
        .to_string())
}

/// Decode one reassembled command set. Command sets always travel in
/// implicit VR little endian.
fn parse_command_set(bytes: &[u8]) -> Result<DimseCommand, Whatever> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let cmd = InMemDicomObject::read_dataset_with_ts(bytes, &ts)
        .whatever_context("unreadable DIMSE command set")?;
    let field = cmd
        .element(tags::COMMAND_FIELD)
        .whatever_context("command set without CommandField")?
        .uint16()
        .whatever_context("CommandField is not an unsigned short")?;
    let message_id = cmd
        .element(tags::MESSAGE_ID)
        .ok()
        .and_then(|e| e.to_int().ok())
        .unwrap_or(0);
    match field {
        0x0030 => Ok(DimseCommand::EchoRq { message_id }),
        0x0001 => Ok(DimseCommand::StoreRq(PendingStore {
            message_id,
            affected_class_uid: command_uid(&cmd, tags::AFFECTED_SOP_CLASS_UID)?,
            affected_instance_uid: command_uid(&cmd, tags::AFFECTED_SOP_INSTANCE_UID)?,
        })),
        other => Ok(DimseCommand::Other(other)),
    }
}

/// Wrap a response command set into a single-PDV P-DATA PDU.
fn command_pdu(
    pc_id: u8,
    rsp: &InMemDicomObject<StandardDataDictionary>,
) -> Result<Pdu, Whatever> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut buf = Vec::with_capacity(128);
    rsp.write_dataset_with_ts(&mut buf, &ts)
        .whatever_context("cannot encode DIMSE response")?;
    Ok(Pdu::PData {
        data: vec![dicom_ul::pdu::PDataValue {
            presentation_context_id: pc_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: buf,
        }],
    })
}

/// Serve one association: C-ECHO inline, C-STORE through the admission
/// gate into the worker queue.
pub async fn run_association(
    scu_stream: tokio::net::TcpStream,
    ctx: Arc<ScpContext>,
) -> Result<(), Whatever> {
    let mut options = dicom_ul::association::ServerAssociationOptions::new()
        .accept_any()
        .ae_title(&ctx.ae_title)
        .max_pdu_length(ctx.max_pdu_length);

    if ctx.transfer_syntaxes.is_empty() {
        for ts in TransferSyntaxRegistry.iter() {
            if !ts.is_unsupported() {
                options = options.with_transfer_syntax(ts.uid());
            }
        }
    } else {
        for ts in &ctx.transfer_syntaxes {
            options = options.with_transfer_syntax(ts.clone());
        }
    }

    options = options.with_abstract_syntax(VERIFICATION);
    options = options.with_abstract_syntax(STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);
    options = options.with_abstract_syntax(STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE);
    for uid in &ctx.storage_classes {
        options = options.with_abstract_syntax(uid.clone());
    }

    let mut association = options
        .establish_async(scu_stream)
        .await
        .whatever_context("could not establish association")?;

    let source_ae = association.client_ae_title().to_string();
    info!("Association accepted from {source_ae}");
    debug!(
        "> negotiated contexts: {:?}",
        association.presentation_contexts()
    );

    // command sets and datasets may each span several PDVs; a C-STORE
    // stays pending from its command set until its dataset completes
    let mut command_buf: Vec<u8> = Vec::new();
    let mut dataset_buf: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut pending_store: Option<PendingStore> = None;

    loop {
        let pdu = match association.receive().await {
            Ok(pdu) => pdu,
            Err(e) => {
                info!("association with {source_ae} ended: {}", Report::from_error(e));
                break;
            }
        };
        match pdu {
            Pdu::PData { data } => {
                for mut pdv in data {
                    let pc_id = pdv.presentation_context_id;
                    match pdv.value_type {
                        PDataValueType::Command => {
                            command_buf.append(&mut pdv.data);
                            if !pdv.is_last {
                                continue;
                            }
                            let command = parse_command_set(&command_buf);
                            command_buf.clear();
                            let command = command?;
                            match command {
                                DimseCommand::EchoRq { message_id } => {
                                    let pdu = command_pdu(pc_id, &echo_rsp_command(message_id))?;
                                    association
                                        .send(&pdu)
                                        .await
                                        .whatever_context("cannot send C-ECHO response")?;
                                }
                                DimseCommand::StoreRq(store) => {
                                    pending_store = Some(store);
                                    dataset_buf.clear();
                                }
                                DimseCommand::Other(field) => {
                                    debug!("ignoring DIMSE command {field:04X}H");
                                }
                            }
                        }
                        PDataValueType::Data => {
                            dataset_buf.append(&mut pdv.data);
                            if !pdv.is_last {
                                continue;
                            }
                            let store = pending_store
                                .take()
                                .whatever_context("dataset arrived without a C-STORE command")?;
                            let ts_uid = association
                                .presentation_contexts()
                                .iter()
                                .find(|pc| pc.id == pc_id)
                                .map(|pc| pc.transfer_syntax.clone())
                                .whatever_context(
                                    "peer used an unnegotiated presentation context",
                                )?;
                            let status = handle_incoming_store(
                                &ctx,
                                &source_ae,
                                &ts_uid,
                                std::mem::take(&mut dataset_buf),
                            )
                            .await;
                            let pdu = command_pdu(pc_id, &store_rsp_command(&store, status))?;
                            association
                                .send(&pdu)
                                .await
                                .whatever_context("cannot send C-STORE response")?;
                        }
                    }
                }
            }
            Pdu::ReleaseRQ => {
                if let Err(e) = association.send(&Pdu::ReleaseRP).await {
                    warn!(
                        "release handshake with {source_ae} failed: {}",
                        Report::from_error(e)
                    );
                }
                info!("Association with {source_ae} released");
                break;
            }
            Pdu::AbortRQ { source } => {
                warn!("association aborted by {source_ae} ({source:?})");
                break;
            }
            other => debug!("ignoring unexpected PDU: {}", other.short_description()),
        }
    }

    debug!("connection with {source_ae} closed");
    Ok(())
}

/// Parse the received dataset and push it through the admission gate.
/// Returns the DIMSE status for the C-STORE response.
async fn handle_incoming_store(
    ctx: &ScpContext,
    source_ae: &str,
    ts_uid: &str,
    bytes: Vec<u8>,
) -> u16 {
    if ctx.fatal.load(Ordering::SeqCst) || !ctx.active.load(Ordering::SeqCst) {
        return STATUS_OUT_OF_RESOURCES;
    }

    let ts = match TransferSyntaxRegistry.get(ts_uid) {
        Some(ts) => ts,
        None => {
            ctx.layout.quarantine(
                QuarantineCategory::InvalidDicom,
                &format!("{}.dcm", uuid::Uuid::new_v4()),
                &bytes,
            );
            return STATUS_SUCCESS;
        }
    };
    let obj = match InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts) {
        Ok(obj) => obj,
        Err(e) => {
            // source bytes are preserved in quarantine
            warn!("failed to read DICOM data object: {e}");
            ctx.layout.quarantine(
                QuarantineCategory::DicomReadError,
                &format!("{}.dcm", uuid::Uuid::new_v4()),
                &bytes,
            );
            return STATUS_SUCCESS;
        }
    };

    let item = WorkItem {
        source: source_ae.to_string(),
        obj,
        ts_uid: ts_uid.to_string(),
        bytes,
    };
    if try_admit(ctx, item).await {
        STATUS_SUCCESS
    } else {
        STATUS_OUT_OF_RESOURCES
    }
}

/// C-ECHO-RSP command set. No dataset follows a verification response.
fn echo_rsp_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [STATUS_SUCCESS])),
    ])
}

/// C-STORE-RSP command set echoing the request's affected UIDs.
fn store_rsp_command(
    store: &PendingStore,
    status: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, store.affected_class_uid.as_str()),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [store.message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, store.affected_instance_uid.as_str()),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_ctx(
        queue_size: usize,
        threshold: u64,
    ) -> (Arc<ScpContext>, mpsc::Receiver<WorkItem>, TempDir) {
        let (tx, rx) = mpsc::channel(queue_size);
        let tmp = TempDir::new().unwrap();
        let settings = IngestSettings {
            queue_size,
            memory_threshold_bytes: threshold,
            backoff_slice_ms: 1,
            backoff_max_retries: 2,
            ..IngestSettings::default()
        };
        let ctx = ScpContext {
            ae_title: "ANONSCP".into(),
            max_pdu_length: 16384,
            transfer_syntaxes: vec![],
            storage_classes: DEFAULT_STORAGE_CLASSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            settings,
            layout: StorageLayout::new(tmp.path()),
            queue: tx,
            queue_len: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicBool::new(true)),
            fatal: Arc::new(AtomicBool::new(false)),
        };
        (Arc::new(ctx), rx, tmp)
    }

    fn dummy_item() -> WorkItem {
        WorkItem {
            source: "PEER".into(),
            obj: InMemDicomObject::from_element_iter([]),
            ts_uid: "1.2.840.10008.1.2.1".into(),
            bytes: vec![0u8; 16],
        }
    }

    fn encode_command(cmd: &InMemDicomObject<StandardDataDictionary>) -> Vec<u8> {
        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut buf = Vec::new();
        cmd.write_dataset_with_ts(&mut buf, &ts).unwrap();
        buf
    }

    #[test]
    fn store_command_sets_parse_into_pending_stores() {
        let cmd = InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.2"),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [7])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [0x0000]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4.5.6"),
            ),
        ]);
        match parse_command_set(&encode_command(&cmd)).unwrap() {
            DimseCommand::StoreRq(store) => {
                assert_eq!(store.message_id, 7);
                assert_eq!(store.affected_class_uid, "1.2.840.10008.5.1.4.1.1.2");
                assert_eq!(store.affected_instance_uid, "1.2.3.4.5.6");
            }
            _ => panic!("expected a C-STORE-RQ"),
        }
    }

    #[test]
    fn echo_and_unknown_commands_parse() {
        let echo = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0030])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [3])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [0x0101]),
            ),
        ]);
        assert!(matches!(
            parse_command_set(&encode_command(&echo)).unwrap(),
            DimseCommand::EchoRq { message_id: 3 }
        ));

        let find = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0020])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [0x0000]),
            ),
        ]);
        assert!(matches!(
            parse_command_set(&encode_command(&find)).unwrap(),
            DimseCommand::Other(0x0020)
        ));
        assert!(parse_command_set(b"junk").is_err());
    }

    #[tokio::test]
    async fn admission_succeeds_with_memory_headroom() {
        let (ctx, mut rx, _tmp) = test_ctx(4, 0);
        assert!(try_admit(&ctx, dummy_item()).await);
        assert_eq!(ctx.queue_len.load(Ordering::SeqCst), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn admission_gives_up_after_the_retry_budget() {
        // a threshold no machine reaches forces the backoff path
        let (ctx, _rx, _tmp) = test_ctx(4, u64::MAX);
        assert!(!try_admit(&ctx, dummy_item()).await);
        assert_eq!(ctx.queue_len.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn full_queue_is_out_of_resources() {
        let (ctx, _rx, _tmp) = test_ctx(1, 0);
        assert!(try_admit(&ctx, dummy_item()).await);
        assert!(!try_admit(&ctx, dummy_item()).await);
    }

    #[tokio::test]
    async fn fatal_flag_refuses_stores() {
        let (ctx, _rx, _tmp) = test_ctx(4, 0);
        ctx.fatal.store(true, Ordering::SeqCst);
        let status = handle_incoming_store(&ctx, "PEER", "1.2.840.10008.1.2.1", vec![]).await;
        assert_eq!(status, STATUS_OUT_OF_RESOURCES);
    }
}
