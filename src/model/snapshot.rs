//! Versioned on-disk snapshot of the PHI index store.
//!
//! Layout: a fixed bincode header `{ magic, version }` followed by the
//! bincode-encoded model. Reads of a different version fail with
//! `MODEL_VERSION_MISMATCH` rather than guessing.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::AnonymizerModel;

const MAGIC: u32 = 0x414E_4F4E; // "ANON"
pub const MODEL_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    magic: u32,
    version: u32,
}

pub fn encode(model: &AnonymizerModel) -> Result<Vec<u8>> {
    let header = SnapshotHeader {
        magic: MAGIC,
        version: MODEL_VERSION,
    };
    let mut buf = bincode::serialize(&header).map_err(|e| Error::ModelSnapshot {
        detail: format!("header encode: {e}"),
    })?;
    let body = bincode::serialize(model).map_err(|e| Error::ModelSnapshot {
        detail: format!("model encode: {e}"),
    })?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<AnonymizerModel> {
    let header_len = bincode::serialized_size(&SnapshotHeader {
        magic: MAGIC,
        version: MODEL_VERSION,
    })
    .map_err(|e| Error::ModelSnapshot {
        detail: format!("header size: {e}"),
    })? as usize;
    if bytes.len() < header_len {
        return Err(Error::ModelSnapshot {
            detail: "file shorter than snapshot header".to_string(),
        });
    }
    let header: SnapshotHeader =
        bincode::deserialize(&bytes[..header_len]).map_err(|e| Error::ModelSnapshot {
            detail: format!("header decode: {e}"),
        })?;
    if header.magic != MAGIC {
        return Err(Error::ModelSnapshot {
            detail: "not an anonymizer model snapshot".to_string(),
        });
    }
    if header.version != MODEL_VERSION {
        return Err(Error::ModelVersionMismatch {
            found: header.version,
            expected: MODEL_VERSION,
        });
    }
    bincode::deserialize(&bytes[header_len..]).map_err(|e| Error::ModelSnapshot {
        detail: format!("model decode: {e}"),
    })
}

/// Persist the model, replacing any prior snapshot atomically.
pub fn save(model: &AnonymizerModel, path: &Path) -> Result<()> {
    let bytes = encode(model)?;
    let parent = path.parent().ok_or_else(|| Error::Storage {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
    })?;
    fs::create_dir_all(parent).map_err(|source| Error::Storage {
        path: parent.display().to_string(),
        source,
    })?;
    let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let write = || -> std::io::Result<()> {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|source| {
        let _ = fs::remove_file(&tmp);
        Error::Storage {
            path: path.display().to_string(),
            source,
        }
    })?;
    info!("saved model snapshot ({} bytes) to {}", bytes.len(), path.display());
    Ok(())
}

pub fn load(path: &Path) -> Result<AnonymizerModel> {
    let bytes = fs::read(path).map_err(|source| Error::Storage {
        path: path.display().to_string(),
        source,
    })?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceAttrs;
    use tempfile::TempDir;

    fn populated_model() -> AnonymizerModel {
        let mut m = AnonymizerModel::new("RSNA-0001", "1.2.826.0.1.3680043.10.474");
        let attrs = InstanceAttrs {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            study_uid: "1.2.3".into(),
            series_uid: "1.2.3.1".into(),
            sop_uid: "1.2.3.1.1".into(),
            patient_id: "X123".into(),
            patient_name: "DOE^JOHN".into(),
            study_date: "20200115".into(),
            accession_number: "A1".into(),
            modality: "CT".into(),
            ..InstanceAttrs::default()
        };
        m.capture_phi("PACS", &attrs, 154).unwrap();
        m.get_next_anon_uid("1.2.3");
        m.get_next_anon_acc_no("A1");
        m
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let m = populated_model();
        let first = encode(&m).unwrap();
        let reloaded = decode(&first).unwrap();
        let second = encode(&reloaded).unwrap();
        assert_eq!(first, second);
        assert_eq!(reloaded.get_totals(), m.get_totals());
        assert_eq!(reloaded.get_anon_patient_id("X123"), Some("RSNA-0001-000001"));
    }

    #[test]
    fn save_load_via_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("private").join("AnonymizerModel.bin");
        let m = populated_model();
        save(&m, &path).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.get_totals(), m.get_totals());
        // second save replaces in place
        save(&loaded, &path).unwrap();
    }

    #[test]
    fn version_mismatch_is_detected() {
        let m = populated_model();
        let mut bytes = encode(&m).unwrap();
        // header is { magic: u32, version: u32 }, little-endian
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        match decode(&bytes).unwrap_err() {
            Error::ModelVersionMismatch { found, expected } => {
                assert_eq!(found, 99);
                assert_eq!(expected, MODEL_VERSION);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn garbage_is_not_a_snapshot() {
        assert!(matches!(
            decode(b"DICM....not a snapshot"),
            Err(Error::ModelSnapshot { .. })
        ));
    }
}
