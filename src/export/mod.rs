//! The export orchestrator: per-patient send of anonymized files to a
//! remote SCP or an S3 bucket, with pre-flight duplicate checks,
//! progress events and cooperative abort.

pub mod cognito;
pub mod s3;
pub mod scu;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{AwsCognitoConfig, DicomNode, NetworkTimeouts, ProjectModel};
use crate::error::{Error, Result};
use crate::qr::find_scu;
use crate::storage::StorageLayout;
use cognito::CognitoAuthenticator;

#[derive(Debug, Clone)]
pub enum ExportDestination {
    /// Remote storage SCP.
    Scp(DicomNode),
    /// The project's configured S3 bucket.
    S3,
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub patient_ids: Vec<String>,
    pub destination: ExportDestination,
}

/// Progress event published per patient on the request's response channel.
#[derive(Debug, Clone)]
pub struct ExportPatientResponse {
    pub patient_id: String,
    pub files_sent: usize,
    pub error: Option<String>,
    pub complete: bool,
}

/// One file under a patient directory, addressed by its anonymized path
/// components.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PatientFile {
    path: PathBuf,
    anon_study_uid: String,
    anon_series_uid: String,
    anon_sop_uid: String,
}

struct Inner {
    layout: StorageLayout,
    calling_ae_title: String,
    timeouts: NetworkTimeouts,
    max_pdu_length: u32,
    concurrency: usize,
    batch_size: usize,
    aws: Option<AwsCognitoConfig>,
    authenticator: Option<CognitoAuthenticator>,
    abort: AtomicBool,
}

pub struct ExportOrchestrator {
    inner: Arc<Inner>,
}

impl ExportOrchestrator {
    pub fn new(config: &ProjectModel) -> ExportOrchestrator {
        ExportOrchestrator {
            inner: Arc::new(Inner {
                layout: StorageLayout::new(&config.storage_dir),
                calling_ae_title: config.local.ae_title.clone(),
                timeouts: config.timeouts,
                max_pdu_length: config.max_pdu_length,
                concurrency: config.export_concurrency,
                batch_size: config.export_batch_size.max(1),
                aws: config.aws.clone(),
                authenticator: config.aws.clone().map(CognitoAuthenticator::new),
                abort: AtomicBool::new(false),
            }),
        }
    }

    /// Halt new batches; in-flight batches finish before tasks return.
    pub fn abort_export(&self) {
        self.inner.abort.store(true, Ordering::SeqCst);
    }

    /// Obtain temporary object-store credentials, refreshing the cached
    /// set when it is close to expiry.
    pub async fn aws_authenticate(&self) -> Result<cognito::CognitoCredentials> {
        match &self.inner.authenticator {
            Some(authenticator) => authenticator.credentials().await,
            None => Err(Error::Config {
                detail: "project has no aws section".to_string(),
            }),
        }
    }

    /// Export the listed patients concurrently up to the configured pool
    /// size, publishing one final event per patient.
    pub async fn export_patients(
        &self,
        request: ExportRequest,
        responses: mpsc::Sender<ExportPatientResponse>,
    ) -> Result<()> {
        self.inner.abort.store(false, Ordering::SeqCst);
        if matches!(request.destination, ExportDestination::S3) && self.inner.aws.is_none() {
            return Err(Error::Config {
                detail: "S3 export requested but the project has no aws section".to_string(),
            });
        }
        let semaphore = Arc::new(Semaphore::new(self.inner.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for patient_id in request.patient_ids {
            let inner = self.inner.clone();
            let destination = request.destination.clone();
            let responses = responses.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let response = export_patient(&inner, &patient_id, &destination).await;
                let _ = responses.send(response).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        if self.inner.abort.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Enumerate a patient's anonymized files from the storage tree.
fn patient_files(layout: &StorageLayout, patient_id: &str) -> Vec<PatientFile> {
    let root = layout.patient_dir(patient_id);
    let mut files = Vec::new();
    for entry in WalkDir::new(&root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Some(file) = classify(&root, entry.path()) else {
            continue;
        };
        files.push(file);
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

fn classify(patient_root: &Path, path: &Path) -> Option<PatientFile> {
    if path.extension().and_then(|e| e.to_str()) != Some("dcm") {
        return None;
    }
    let rel = path.strip_prefix(patient_root).ok()?;
    let mut components = rel.components().map(|c| c.as_os_str().to_string_lossy());
    let anon_study_uid = components.next()?.to_string();
    let anon_series_uid = components.next()?.to_string();
    let file_name = components.next()?.to_string();
    if components.next().is_some() {
        return None;
    }
    let anon_sop_uid = file_name.strip_suffix(".dcm")?.to_string();
    Some(PatientFile {
        path: path.to_path_buf(),
        anon_study_uid,
        anon_series_uid,
        anon_sop_uid,
    })
}

async fn export_patient(
    inner: &Arc<Inner>,
    patient_id: &str,
    destination: &ExportDestination,
) -> ExportPatientResponse {
    match export_patient_inner(inner, patient_id, destination).await {
        Ok(files_sent) => ExportPatientResponse {
            patient_id: patient_id.to_string(),
            files_sent,
            error: None,
            complete: true,
        },
        Err((files_sent, e)) => ExportPatientResponse {
            patient_id: patient_id.to_string(),
            files_sent,
            error: Some(e),
            complete: false,
        },
    }
}

async fn export_patient_inner(
    inner: &Arc<Inner>,
    patient_id: &str,
    destination: &ExportDestination,
) -> std::result::Result<usize, (usize, String)> {
    let files = patient_files(&inner.layout, patient_id);
    if files.is_empty() {
        return Err((0, format!("no stored files for patient {patient_id}")));
    }
    info!("exporting {} files for {patient_id}", files.len());

    match destination {
        ExportDestination::Scp(node) => export_to_scp(inner, patient_id, node, files).await,
        ExportDestination::S3 => export_to_s3(inner, patient_id, files).await,
    }
}

async fn export_to_scp(
    inner: &Arc<Inner>,
    patient_id: &str,
    node: &DicomNode,
    files: Vec<PatientFile>,
) -> std::result::Result<usize, (usize, String)> {
    // pre-flight: instance-level query per study at the destination
    let studies: BTreeSet<String> = files.iter().map(|f| f.anon_study_uid.clone()).collect();
    let mut present = BTreeSet::new();
    for study_uid in &studies {
        match find_scu::find_instances(
            node,
            &inner.calling_ae_title,
            &inner.timeouts,
            inner.max_pdu_length,
            study_uid,
            None,
        )
        .await
        {
            Ok(uids) => present.extend(uids),
            // a peer that cannot answer the query gets everything resent
            Err(e) => warn!("pre-flight query for {study_uid} failed: {e}"),
        }
    }

    let to_send: Vec<PatientFile> = files
        .into_iter()
        .filter(|f| !present.contains(&f.anon_sop_uid))
        .collect();

    let mut sent = 0usize;
    let mut first_error: Option<String> = None;
    for batch in to_send.chunks(inner.batch_size) {
        if inner.abort.load(Ordering::SeqCst) {
            return Err((sent, "cancelled".to_string()));
        }
        let mut outbound = Vec::with_capacity(batch.len());
        for file in batch {
            match scu::scan_file(&file.path) {
                Ok(out) => outbound.push(out),
                Err(e) => {
                    warn!("skipping unreadable file {}: {e}", file.path.display());
                    first_error.get_or_insert(e.to_string());
                }
            }
        }
        match scu::send_files(
            node,
            &inner.calling_ae_title,
            &inner.timeouts,
            inner.max_pdu_length,
            &outbound,
            &inner.abort,
        )
        .await
        {
            Ok(report) => {
                sent += report.sent.len();
                if let Some((uid, reason)) = report.failed.first() {
                    first_error.get_or_insert(format!("{uid}: {reason}"));
                }
            }
            Err(Error::Cancelled) => return Err((sent, "cancelled".to_string())),
            Err(e) => {
                first_error.get_or_insert(e.to_string());
            }
        }
    }
    match first_error {
        None => Ok(sent),
        Some(e) => Err((sent, e)),
    }
}

async fn export_to_s3(
    inner: &Arc<Inner>,
    patient_id: &str,
    files: Vec<PatientFile>,
) -> std::result::Result<usize, (usize, String)> {
    let aws = inner.aws.as_ref().expect("checked by export_patients");
    let authenticator = inner
        .authenticator
        .as_ref()
        .expect("present whenever aws is configured");
    let credentials = authenticator
        .credentials()
        .await
        .map_err(|e| (0, e.to_string()))?;
    let bucket = s3::build_bucket(&s3::S3Settings {
        bucket: aws.s3_bucket.clone(),
        region: aws.region.clone(),
        access_key: credentials.access_key_id.clone(),
        secret_key: credentials.secret_key.clone(),
        session_token: Some(credentials.session_token.clone()),
        endpoint: None,
    })
    .map_err(|e| (0, e.to_string()))?;

    let mut sent = 0usize;
    let mut first_error: Option<String> = None;
    for batch in files.chunks(inner.batch_size) {
        if inner.abort.load(Ordering::SeqCst) {
            return Err((sent, "cancelled".to_string()));
        }
        for file in batch {
            let key = StorageLayout::object_key(
                &aws.s3_prefix,
                &aws.user_directory,
                patient_id,
                &file.anon_study_uid,
                &file.anon_series_uid,
                &file.anon_sop_uid,
            );
            // pre-flight head: skip objects already uploaded
            match s3::object_exists(&bucket, &key).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e.to_string());
                    continue;
                }
            }
            let bytes = match std::fs::read(&file.path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    first_error.get_or_insert(format!("{}: {e}", file.path.display()));
                    continue;
                }
            };
            match s3::put_object(&bucket, &key, &bytes).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("upload failed for {key}: {e}");
                    first_error.get_or_insert(e.to_string());
                }
            }
        }
    }
    match first_error {
        None => Ok(sent),
        Some(e) => Err((sent, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn classify_reads_anonymized_path_components() {
        let root = Path::new("/data/RSNA-0001-000001");
        let file = classify(
            root,
            Path::new("/data/RSNA-0001-000001/1.2.0.1/1.2.0.2/1.2.0.3.dcm"),
        )
        .unwrap();
        assert_eq!(file.anon_study_uid, "1.2.0.1");
        assert_eq!(file.anon_series_uid, "1.2.0.2");
        assert_eq!(file.anon_sop_uid, "1.2.0.3");

        // stray files are ignored
        assert!(classify(root, Path::new("/data/RSNA-0001-000001/readme.txt")).is_none());
        assert!(classify(
            root,
            Path::new("/data/RSNA-0001-000001/a/b/c/d/e.dcm")
        )
        .is_none());
    }

    #[test]
    fn patient_files_walks_the_storage_tree() {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path());
        let path = layout.instance_path("P1", "S1", "SE1", "I1");
        layout.write_atomic(&path, b"dcm").unwrap();
        let other = layout.instance_path("P2", "S2", "SE2", "I2");
        layout.write_atomic(&other, b"dcm").unwrap();

        let files = patient_files(&layout, "P1");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].anon_sop_uid, "I1");
    }
}
