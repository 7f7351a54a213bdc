//! Project configuration (`ProjectModel.json`).
//!
//! The project file is the single source of runtime settings: identifiers
//! used to namespace generated pseudonyms, the local/remote AE endpoints,
//! the accepted modality/storage-class/transfer-syntax sets, timeouts and
//! pool sizes, and the optional AWS export settings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigSnafu, Error, Result};

/// One DICOM Application Entity endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomNode {
    pub ae_title: String,
    pub host: String,
    pub port: u16,
}

impl DicomNode {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The four network timeouts, all in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkTimeouts {
    #[serde(default = "default_tcp_connect")]
    pub tcp_connect: u64,
    #[serde(default = "default_acse")]
    pub acse: u64,
    #[serde(default = "default_dimse")]
    pub dimse: u64,
    #[serde(default = "default_network")]
    pub network: u64,
}

fn default_tcp_connect() -> u64 {
    5
}
fn default_acse() -> u64 {
    30
}
fn default_dimse() -> u64 {
    60
}
fn default_network() -> u64 {
    120
}

impl Default for NetworkTimeouts {
    fn default() -> Self {
        NetworkTimeouts {
            tcp_connect: default_tcp_connect(),
            acse: default_acse(),
            dimse: default_dimse(),
            network: default_network(),
        }
    }
}

/// AWS Cognito identity-pool settings for S3 export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsCognitoConfig {
    pub account_id: String,
    pub region: String,
    pub app_client_id: String,
    pub user_pool_id: String,
    pub identity_pool_id: String,
    pub username: String,
    pub password: String,
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_prefix: String,
    /// Per-user sub-directory under the prefix.
    #[serde(default)]
    pub user_directory: String,
}

/// Ingest pipeline tuning knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestSettings {
    /// Upper bound of in-flight datasets awaiting anonymization.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Free-memory floor in bytes below which the SCP backs off.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_bytes: u64,
    /// Sleep slice while backing off, in milliseconds.
    #[serde(default = "default_backoff_slice_ms")]
    pub backoff_slice_ms: u64,
    #[serde(default = "default_backoff_retries")]
    pub backoff_max_retries: u32,
    /// Worker dequeue wait, in milliseconds.
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    /// Worker sleep when the queue is empty, in milliseconds.
    #[serde(default = "default_worker_sleep_ms")]
    pub worker_sleep_ms: u64,
    /// Model autosave interval, in seconds.
    #[serde(default = "default_autosave_secs")]
    pub autosave_interval_secs: u64,
}

fn default_queue_size() -> usize {
    1024
}
fn default_worker_count() -> usize {
    4
}
fn default_memory_threshold() -> u64 {
    512 * 1024 * 1024
}
fn default_backoff_slice_ms() -> u64 {
    100
}
fn default_backoff_retries() -> u32 {
    50
}
fn default_dequeue_timeout_ms() -> u64 {
    500
}
fn default_worker_sleep_ms() -> u64 {
    250
}
fn default_autosave_secs() -> u64 {
    30
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings {
            queue_size: default_queue_size(),
            worker_count: default_worker_count(),
            memory_threshold_bytes: default_memory_threshold(),
            backoff_slice_ms: default_backoff_slice_ms(),
            backoff_max_retries: default_backoff_retries(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            worker_sleep_ms: default_worker_sleep_ms(),
            autosave_interval_secs: default_autosave_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectModel {
    pub project_name: String,
    /// Namespace for anonymous patient ids, e.g. `RSNA-0001`.
    pub site_id: String,
    /// Root of every generated UID, e.g. `1.2.826.0.1.3680043.10.474`.
    pub uid_root: String,
    pub storage_dir: PathBuf,

    /// Accepted modalities for query result filtering.
    #[serde(default)]
    pub modalities: Vec<String>,
    /// Allow-list of storage SOP class UIDs; empty accepts the built-in set.
    #[serde(default)]
    pub storage_classes: Vec<String>,
    /// Accepted transfer syntax UIDs; empty accepts all supported.
    #[serde(default)]
    pub transfer_syntaxes: Vec<String>,

    pub local: DicomNode,
    pub query: DicomNode,
    pub export: DicomNode,

    #[serde(default)]
    pub timeouts: NetworkTimeouts,
    #[serde(default)]
    pub ingest: IngestSettings,

    /// Maximum PDU length negotiated on associations.
    #[serde(default = "default_max_pdu_length")]
    pub max_pdu_length: u32,

    /// Tracing filter, e.g. `info` or `dicom_anonymizer=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to an anonymizer script in TOML form; built-in profile if unset.
    #[serde(default)]
    pub anonymizer_script: Option<PathBuf>,

    #[serde(default)]
    pub export_to_aws: bool,
    #[serde(default)]
    pub aws: Option<AwsCognitoConfig>,

    /// Concurrent study moves per request.
    #[serde(default = "default_move_concurrency")]
    pub move_concurrency: usize,
    /// Concurrent patient exports per request.
    #[serde(default = "default_export_concurrency")]
    pub export_concurrency: usize,
    /// Files per export batch.
    #[serde(default = "default_export_batch_size")]
    pub export_batch_size: usize,
}

fn default_max_pdu_length() -> u32 {
    16384
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_move_concurrency() -> usize {
    2
}
fn default_export_concurrency() -> usize {
    4
}
fn default_export_batch_size() -> usize {
    20
}

impl ProjectModel {
    pub fn load(path: &Path) -> Result<ProjectModel> {
        let raw = fs::read_to_string(path).map_err(|e| Error::Config {
            detail: format!("cannot read {}: {e}", path.display()),
        })?;
        let model: ProjectModel = serde_json::from_str(&raw).map_err(|e| Error::Config {
            detail: format!("cannot parse {}: {e}", path.display()),
        })?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        snafu::ensure!(
            !self.site_id.is_empty(),
            ConfigSnafu {
                detail: "site_id must not be empty".to_string(),
            }
        );
        snafu::ensure!(
            !self.uid_root.is_empty() && self.uid_root.chars().all(|c| c.is_ascii_digit() || c == '.'),
            ConfigSnafu {
                detail: format!("uid_root {:?} is not a dotted numeric UID root", self.uid_root),
            }
        );
        // Generated UIDs must stay within the DICOM 64-char limit with
        // room for "{site_id}.{counter}".
        snafu::ensure!(
            self.uid_root.len() + self.site_id.len() + 12 <= 64,
            ConfigSnafu {
                detail: "uid_root plus site_id leaves no room for UID counters".to_string(),
            }
        );
        snafu::ensure!(
            !self.local.ae_title.is_empty() && self.local.ae_title.len() <= 16,
            ConfigSnafu {
                detail: format!("local AE title {:?} is not a valid AET", self.local.ae_title),
            }
        );
        if self.export_to_aws {
            snafu::ensure!(
                self.aws.is_some(),
                ConfigSnafu {
                    detail: "export_to_aws is set but no aws section is present".to_string(),
                }
            );
        }
        Ok(())
    }

    /// Storage SOP classes this project admits.
    pub fn accepted_storage_classes(&self) -> Vec<String> {
        if self.storage_classes.is_empty() {
            crate::ingest::scp::DEFAULT_STORAGE_CLASSES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.storage_classes.clone()
        }
    }

    pub fn private_dir(&self) -> PathBuf {
        self.storage_dir.join("private")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "project_name": "TRIAL-42",
            "site_id": "RSNA-0001",
            "uid_root": "1.2.826.0.1.3680043.10.474",
            "storage_dir": "/tmp/anon-storage",
            "local": { "ae_title": "ANONSCP", "host": "0.0.0.0", "port": 11112 },
            "query": { "ae_title": "PACS", "host": "pacs.example.org", "port": 104 },
            "export": { "ae_title": "EXPORT", "host": "export.example.org", "port": 104 }
        })
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let model: ProjectModel = serde_json::from_value(minimal_json()).unwrap();
        model.validate().unwrap();
        assert_eq!(model.ingest.worker_count, 4);
        assert_eq!(model.move_concurrency, 2);
        assert_eq!(model.export_concurrency, 4);
        assert_eq!(model.timeouts.dimse, 60);
        assert!(!model.export_to_aws);
        assert_eq!(model.private_dir(), PathBuf::from("/tmp/anon-storage/private"));
    }

    #[test]
    fn rejects_bad_uid_root() {
        let mut raw = minimal_json();
        raw["uid_root"] = serde_json::json!("not-a-uid");
        let model: ProjectModel = serde_json::from_value(raw).unwrap();
        assert!(model.validate().is_err());
    }

    #[test]
    fn export_to_aws_requires_aws_section() {
        let mut raw = minimal_json();
        raw["export_to_aws"] = serde_json::json!(true);
        let model: ProjectModel = serde_json::from_value(raw).unwrap();
        assert!(model.validate().is_err());
    }
}
