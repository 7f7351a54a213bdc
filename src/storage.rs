//! On-disk layout for anonymized instances.
//!
//! Output paths are a pure function of anonymized identifiers:
//! `{storage_dir}/{anon_pt_id}/{anon_study_uid}/{anon_series_uid}/{anon_sop_uid}.dcm`.
//! A `private/` sibling holds the model snapshot, PHI CSV exports and the
//! quarantine tree. PHI never appears in any path component.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const SNAPSHOT_FILE: &str = "AnonymizerModel.bin";

/// Failure buckets under `private/quarantine/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineCategory {
    InvalidDicom,
    DicomReadError,
    MissingAttributes,
    InvalidStorageClass,
    CapturePhiError,
    StorageError,
}

impl QuarantineCategory {
    pub fn dir_name(&self) -> &'static str {
        match self {
            QuarantineCategory::InvalidDicom => "Invalid_DICOM",
            QuarantineCategory::DicomReadError => "DICOM_Read_Error",
            QuarantineCategory::MissingAttributes => "Missing_Attributes",
            QuarantineCategory::InvalidStorageClass => "Invalid_Storage_Class",
            QuarantineCategory::CapturePhiError => "Capture_PHI_Error",
            QuarantineCategory::StorageError => "Storage_Error",
        }
    }
}

impl fmt::Display for QuarantineCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone)]
pub struct StorageLayout {
    storage_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(storage_dir: impl Into<PathBuf>) -> StorageLayout {
        StorageLayout {
            storage_dir: storage_dir.into(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn private_dir(&self) -> PathBuf {
        self.storage_dir.join("private")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.private_dir().join(SNAPSHOT_FILE)
    }

    pub fn phi_export_dir(&self) -> PathBuf {
        self.private_dir().join("phi_export")
    }

    pub fn quarantine_dir(&self, category: QuarantineCategory) -> PathBuf {
        self.private_dir().join("quarantine").join(category.dir_name())
    }

    pub fn patient_dir(&self, anon_pt_id: &str) -> PathBuf {
        self.storage_dir.join(anon_pt_id)
    }

    /// Instance path from anonymized identifiers only.
    pub fn instance_path(
        &self,
        anon_pt_id: &str,
        anon_study_uid: &str,
        anon_series_uid: &str,
        anon_sop_uid: &str,
    ) -> PathBuf {
        self.storage_dir
            .join(anon_pt_id)
            .join(anon_study_uid)
            .join(anon_series_uid)
            .join(format!("{anon_sop_uid}.dcm"))
    }

    /// Object key for S3 export, mirroring the on-disk layout under a prefix.
    pub fn object_key(
        prefix: &str,
        user_directory: &str,
        anon_pt_id: &str,
        anon_study_uid: &str,
        anon_series_uid: &str,
        anon_sop_uid: &str,
    ) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(6);
        if !prefix.is_empty() {
            parts.push(prefix);
        }
        if !user_directory.is_empty() {
            parts.push(user_directory);
        }
        parts.extend([anon_pt_id, anon_study_uid, anon_series_uid]);
        format!("{}/{anon_sop_uid}.dcm", parts.join("/"))
    }

    /// Create the project directory skeleton.
    pub fn prepare(&self) -> Result<()> {
        for dir in [
            self.storage_dir.clone(),
            self.private_dir(),
            self.phi_export_dir(),
            self.private_dir().join("quarantine"),
        ] {
            fs::create_dir_all(&dir).map_err(|source| Error::Storage {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Atomically write `bytes` to `path`: temp name in the same directory,
    /// then rename. The parent directory is created on demand.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path.parent().ok_or_else(|| Error::Storage {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
        })?;
        fs::create_dir_all(parent).map_err(|source| Error::Storage {
            path: parent.display().to_string(),
            source,
        })?;
        if path.exists() {
            // Invariant: anonymized paths are unique; a collision means the
            // index and the disk disagree.
            return Err(Error::Storage {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "path collision"),
            });
        }
        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
            fs::rename(&tmp, path)
        };
        write().map_err(|source| {
            let _ = fs::remove_file(&tmp);
            Error::Storage {
                path: path.display().to_string(),
                source,
            }
        })
    }

    /// Copy original source bytes into the quarantine bucket for `category`.
    ///
    /// Quarantine never fails the caller; secondary errors are logged.
    pub fn quarantine(&self, category: QuarantineCategory, file_name: &str, bytes: &[u8]) {
        let dir = self.quarantine_dir(category);
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("cannot create quarantine dir {}: {e}", dir.display());
            return;
        }
        let mut path = dir.join(file_name);
        // keep every offending copy
        while path.exists() {
            path = dir.join(format!("{}.{}", file_name, Uuid::new_v4()));
        }
        if let Err(e) = fs::write(&path, bytes) {
            error!("cannot quarantine {}: {e}", path.display());
        } else {
            warn!("quarantined {} under {}", file_name, category);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn instance_path_uses_only_anonymized_ids() {
        let layout = StorageLayout::new("/data/store");
        let path = layout.instance_path(
            "RSNA-0001-000001",
            "1.2.826.0.1.3680043.10.474.RSNA-0001.1",
            "1.2.826.0.1.3680043.10.474.RSNA-0001.2",
            "1.2.826.0.1.3680043.10.474.RSNA-0001.3",
        );
        assert_eq!(
            path,
            PathBuf::from(
                "/data/store/RSNA-0001-000001/1.2.826.0.1.3680043.10.474.RSNA-0001.1/\
                 1.2.826.0.1.3680043.10.474.RSNA-0001.2/1.2.826.0.1.3680043.10.474.RSNA-0001.3.dcm"
            )
        );
    }

    #[test]
    fn object_key_skips_empty_segments() {
        let key = StorageLayout::object_key("inbox", "", "P", "S", "SE", "I");
        assert_eq!(key, "inbox/P/S/SE/I.dcm");
        let key = StorageLayout::object_key("inbox", "site-a", "P", "S", "SE", "I");
        assert_eq!(key, "inbox/site-a/P/S/SE/I.dcm");
    }

    #[test]
    fn write_atomic_refuses_collisions() {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path());
        let path = tmp.path().join("a/b/c.dcm");
        layout.write_atomic(&path, b"one").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"one");
        let err = layout.write_atomic(&path, b"two").unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        // no temp litter
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn quarantine_writes_under_category_dir() {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path());
        layout.quarantine(QuarantineCategory::MissingAttributes, "bad.dcm", b"xx");
        let stored = layout
            .quarantine_dir(QuarantineCategory::MissingAttributes)
            .join("bad.dcm");
        assert_eq!(std::fs::read(stored).unwrap(), b"xx");
    }
}
