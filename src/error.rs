use dicom_core::Tag;
use snafu::Snafu;

use crate::storage::QuarantineCategory;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// File is not valid DICOM: {detail}
    InvalidDicom { detail: String },

    /// Error reading DICOM dataset
    DicomRead {
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("Required attributes missing: {}", missing.join(", ")))]
    MissingAttributes { missing: Vec<String> },

    /// Storage class {uid} is not in the configured allow-list
    InvalidStorageClass { uid: String },

    /// Failed to capture PHI: {detail}
    CapturePhi { detail: String },

    /// Storage error at {path}
    Storage {
        path: String,
        source: std::io::Error,
    },

    /// Instance is already present in the index
    AlreadyPresent,

    /// Patient capacity exceeded (limit {limit})
    CapacityExceeded { limit: usize },

    /// Model snapshot version {found} is not readable (expected {expected})
    ModelVersionMismatch { found: u32, expected: u32 },

    /// Model snapshot is corrupt or not a snapshot file
    ModelSnapshot { detail: String },

    /// Network operation timed out after {seconds}s
    NetworkTimeout { seconds: u64 },

    /// Association rejected by {ae_title}
    AssociationRejected {
        ae_title: String,
        source: Box<dicom_ul::association::Error>,
    },

    /// Peer aborted the association
    PeerAbort,

    /// Operation cancelled
    Cancelled,

    /// AWS credentials expired or could not be refreshed: {detail}
    CredentialsExpired { detail: String },

    /// Could not initialize SCU
    Scu {
        source: Box<dicom_ul::association::Error>,
    },

    /// Could not construct DICOM command
    CreateCommand {
        source: Box<dicom_object::WriteError>,
    },

    /// Error writing dataset to buffer
    WriteDataset {
        source: Box<dicom_object::WriteError>,
    },

    /// Error reading dataset from buffer
    ReadDataset {
        source: Box<dicom_object::ReadError>,
    },

    /// Missing attribute {tag} in DIMSE message
    MissingDimseAttribute {
        tag: Tag,
        source: dicom_object::AccessError,
    },

    /// Could not convert value of {tag}
    ConvertField {
        tag: Tag,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// No matching presentation context for {uid}
    NoPresentationContext { uid: String },

    /// Configuration error: {detail}
    Config { detail: String },

    /// Object store error: {detail}
    ObjectStore { detail: String },
}

impl Error {
    /// Quarantine destination for ingest-stage failures, if any.
    ///
    /// Network and bulk-operation errors have no quarantine bucket; they
    /// propagate to the originating request instead.
    pub fn quarantine_category(&self) -> Option<QuarantineCategory> {
        match self {
            Error::InvalidDicom { .. } => Some(QuarantineCategory::InvalidDicom),
            Error::DicomRead { .. } | Error::ReadDataset { .. } => {
                Some(QuarantineCategory::DicomReadError)
            }
            Error::MissingAttributes { .. } => Some(QuarantineCategory::MissingAttributes),
            Error::InvalidStorageClass { .. } => Some(QuarantineCategory::InvalidStorageClass),
            Error::CapturePhi { .. } => Some(QuarantineCategory::CapturePhiError),
            Error::Storage { .. } => Some(QuarantineCategory::StorageError),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::ModelVersionMismatch { .. }
        )
    }
}
