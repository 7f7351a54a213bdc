//! End-to-end loopback: a C-STORE sent over the wire lands anonymized in
//! the storage tree, and a re-send changes nothing.

use std::time::Duration;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use tempfile::TempDir;

use dicom_anonymizer::config::{DicomNode, ProjectModel};
use dicom_anonymizer::export::scu::{scan_file, send_files};
use dicom_anonymizer::AnonymizerController;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

fn project_config(dir: &TempDir) -> ProjectModel {
    serde_json::from_value(serde_json::json!({
        "project_name": "TRIAL-42",
        "site_id": "RSNA-0001",
        "uid_root": "1.2.826.0.1.3680043.10.474",
        "storage_dir": dir.path().join("storage"),
        "local": { "ae_title": "ANONSCP", "host": "127.0.0.1", "port": 0 },
        "query": { "ae_title": "PACS", "host": "127.0.0.1", "port": 10104 },
        "export": { "ae_title": "EXPORT", "host": "127.0.0.1", "port": 10105 },
        "ingest": { "memory_threshold_bytes": 0 }
    }))
    .unwrap()
}

/// Write a small CT instance to disk the way a modality would hand it over.
fn write_source_file(dir: &TempDir) -> std::path::PathBuf {
    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(CT_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4.5.6")),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4.5")),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("X123")),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("DOE^JOHN")),
        DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::from("20200115")),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
    ]);
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid("1.2.3.4.5.6")
        .transfer_syntax(EXPLICIT_VR_LE)
        .build()
        .unwrap();
    let path = dir.path().join("source.dcm");
    let mut file = std::fs::File::create(&path).unwrap();
    obj.with_exact_meta(meta).write_all(&mut file).unwrap();
    path
}

async fn wait_for_instances(
    controller: &AnonymizerController,
    expected: usize,
) -> dicom_anonymizer::model::Totals {
    for _ in 0..100 {
        let totals = controller.totals().await;
        if totals.instances >= expected && controller.ingest_queue_len() == 0 {
            return totals;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    controller.totals().await
}

#[tokio::test]
async fn store_over_the_wire_is_anonymized_and_idempotent() {
    let tmp = TempDir::new().unwrap();
    let mut controller = AnonymizerController::open(project_config(&tmp)).unwrap();
    controller.start_scp().await.unwrap();
    let addr = controller.scp_addr().unwrap();
    let node = DicomNode {
        ae_title: "ANONSCP".to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
    };

    let source = write_source_file(&tmp);
    let outbound = vec![scan_file(&source).unwrap()];
    let timeouts = controller.config().timeouts;
    let abort = std::sync::atomic::AtomicBool::new(false);

    let report = send_files(&node, "TEST-SCU", &timeouts, 16384, &outbound, &abort)
        .await
        .unwrap();
    assert_eq!(report.sent.len(), 1, "failed: {:?}", report.failed);

    let totals = wait_for_instances(&controller, 1).await;
    assert_eq!(totals.patients, 1);
    assert_eq!(totals.instances, 1);

    // the anonymized instance is on disk under pseudonymous path components
    let stored = tmp
        .path()
        .join("storage/RSNA-0001-000001")
        .join("1.2.826.0.1.3680043.10.474.RSNA-0001.1")
        .join("1.2.826.0.1.3680043.10.474.RSNA-0001.2")
        .join("1.2.826.0.1.3680043.10.474.RSNA-0001.3.dcm");
    assert!(stored.is_file(), "expected {stored:?}");
    let anon = dicom_object::open_file(&stored).unwrap();
    assert_eq!(
        anon.element(tags::PATIENT_ID)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches([' ', '\0']),
        "RSNA-0001-000001"
    );
    assert_eq!(
        anon.element(tags::PATIENT_IDENTITY_REMOVED)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches([' ', '\0']),
        "YES"
    );

    // sending the same instance again is accepted but changes nothing
    let report = send_files(&node, "TEST-SCU", &timeouts, 16384, &outbound, &abort)
        .await
        .unwrap();
    assert_eq!(report.sent.len(), 1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let totals = wait_for_instances(&controller, 1).await;
    assert_eq!(totals.instances, 1);

    controller.shutdown().await.unwrap();
    // clean shutdown leaves a model snapshot behind
    assert!(tmp
        .path()
        .join("storage/private/AnonymizerModel.bin")
        .is_file());
}
