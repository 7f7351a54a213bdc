//! The retrieval orchestrator: reconciles a remote peer's study structure
//! against local storage and drives C-MOVE at study, series or instance
//! level until every reported instance has arrived or retries run out.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{DicomNode, NetworkTimeouts, ProjectModel};
use crate::error::{Error, Result};
use crate::hierarchy::{InstanceUidHierarchy, MoveSubOps, SeriesUidHierarchy, StudyUidHierarchy};
use crate::model::AnonymizerModel;
use crate::qr::{find_scu, move_scu};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveLevel {
    Study,
    Series,
    Instance,
}

impl MoveLevel {
    /// The QueryRetrieveLevel value used on the wire.
    pub fn as_qr_level(&self) -> &'static str {
        match self {
            MoveLevel::Study => "STUDY",
            MoveLevel::Series => "SERIES",
            MoveLevel::Instance => "IMAGE",
        }
    }
}

impl fmt::Display for MoveLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_qr_level())
    }
}

impl FromStr for MoveLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "STUDY" => Ok(MoveLevel::Study),
            "SERIES" => Ok(MoveLevel::Series),
            "INSTANCE" | "IMAGE" => Ok(MoveLevel::Instance),
            other => Err(Error::Config {
                detail: format!("invalid move level: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudySpec {
    pub study_uid: String,
    /// PHI patient id as known to the remote peer.
    pub patient_id: String,
}

#[derive(Debug, Clone)]
pub struct MoveStudiesRequest {
    pub scp: DicomNode,
    /// AE title the peer should move instances to (our storage SCP).
    pub destination_ae: String,
    pub level: MoveLevel,
    pub studies: Vec<StudySpec>,
}

/// Progress event published per study on the request's response channel.
#[derive(Debug, Clone)]
pub struct MoveStudyUpdate {
    pub study_uid: String,
    pub sub_ops: MoveSubOps,
    pub pending_instances: usize,
    pub error: Option<String>,
    pub complete: bool,
}

struct Inner {
    calling_ae_title: String,
    timeouts: NetworkTimeouts,
    max_pdu_length: u32,
    concurrency: usize,
    model: Arc<RwLock<AnonymizerModel>>,
    /// Length of the ingest queue, polled while waiting for moved
    /// instances to drain through the anonymizer.
    ingest_queue_len: Arc<AtomicUsize>,
    abort: AtomicBool,
}

pub struct MoveOrchestrator {
    inner: Arc<Inner>,
}

impl MoveOrchestrator {
    pub fn new(
        config: &ProjectModel,
        model: Arc<RwLock<AnonymizerModel>>,
        ingest_queue_len: Arc<AtomicUsize>,
    ) -> MoveOrchestrator {
        MoveOrchestrator {
            inner: Arc::new(Inner {
                calling_ae_title: config.local.ae_title.clone(),
                timeouts: config.timeouts,
                max_pdu_length: config.max_pdu_length,
                concurrency: config.move_concurrency,
                model,
                ingest_queue_len,
                abort: AtomicBool::new(false),
            }),
        }
    }

    /// Cooperative cancellation: pending studies are not dispatched and
    /// in-flight associations are A-ABORTed.
    pub fn abort_move(&self) {
        self.inner.abort.store(true, Ordering::SeqCst);
    }

    /// Move the requested studies from the peer, concurrently up to the
    /// configured pool size. Returns one hierarchy per requested study;
    /// per-study failures are recorded there, not propagated.
    pub async fn move_studies(
        &self,
        request: MoveStudiesRequest,
        updates: mpsc::Sender<MoveStudyUpdate>,
    ) -> Result<Vec<StudyUidHierarchy>> {
        self.inner.abort.store(false, Ordering::SeqCst);
        let semaphore = Arc::new(Semaphore::new(self.inner.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for spec in request.studies.clone() {
            let inner = self.inner.clone();
            let scp = request.scp.clone();
            let destination_ae = request.destination_ae.clone();
            let level = request.level;
            let updates = updates.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                retrieve_study(inner, scp, destination_ae, level, spec, updates).await
            });
        }
        let mut hierarchies = Vec::with_capacity(request.studies.len());
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(hierarchy) => hierarchies.push(hierarchy),
                Err(e) => warn!("study move task failed: {e}"),
            }
        }
        if self.inner.abort.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(hierarchies)
    }
}

fn snapshot(hierarchy: &StudyUidHierarchy, complete: bool) -> MoveStudyUpdate {
    MoveStudyUpdate {
        study_uid: hierarchy.uid.clone(),
        sub_ops: hierarchy.sub_ops(),
        pending_instances: hierarchy.pending_instances,
        error: hierarchy.last_error_msg.clone(),
        complete,
    }
}

async fn retrieve_study(
    inner: Arc<Inner>,
    scp: DicomNode,
    destination_ae: String,
    level: MoveLevel,
    spec: StudySpec,
    updates: mpsc::Sender<MoveStudyUpdate>,
) -> StudyUidHierarchy {
    let mut hierarchy = StudyUidHierarchy::new(&spec.study_uid, &spec.patient_id);
    if inner.abort.load(Ordering::SeqCst) {
        hierarchy.last_error_msg = Some("cancelled".to_string());
        let _ = updates.send(snapshot(&hierarchy, false)).await;
        return hierarchy;
    }
    match retrieve_study_inner(&inner, &scp, &destination_ae, level, &spec, &updates, &mut hierarchy)
        .await
    {
        Ok(()) => {}
        Err(e) => {
            warn!("study {} retrieval failed: {e}", spec.study_uid);
            hierarchy.last_error_msg = Some(e.to_string());
        }
    }
    let complete = hierarchy.pending_instances == 0 && hierarchy.last_error_msg.is_none();
    let _ = updates.send(snapshot(&hierarchy, complete)).await;
    hierarchy
}

#[allow(clippy::too_many_arguments)]
async fn retrieve_study_inner(
    inner: &Arc<Inner>,
    scp: &DicomNode,
    destination_ae: &str,
    level: MoveLevel,
    spec: &StudySpec,
    updates: &mpsc::Sender<MoveStudyUpdate>,
    hierarchy: &mut StudyUidHierarchy,
) -> Result<()> {
    // 1. hierarchy probe
    let remote_study = find_scu::find_study(
        scp,
        &inner.calling_ae_title,
        &inner.timeouts,
        inner.max_pdu_length,
        &spec.study_uid,
    )
    .await?;
    let Some(remote_study) = remote_study else {
        hierarchy.last_error_msg = Some("study not found on peer".to_string());
        return Ok(());
    };
    inner
        .model
        .write()
        .await
        .set_study_target(&spec.study_uid, remote_study.instance_count);

    let series_list = find_scu::find_series(
        scp,
        &inner.calling_ae_title,
        &inner.timeouts,
        inner.max_pdu_length,
        &spec.study_uid,
    )
    .await?;
    if series_list.is_empty() {
        hierarchy.last_error_msg = Some("peer reported no series".to_string());
        return Ok(());
    }
    for series in &series_list {
        hierarchy.series.insert(
            series.series_uid.clone(),
            SeriesUidHierarchy {
                uid: series.series_uid.clone(),
                modality: series.modality.clone(),
                reported_instance_count: series.instance_count,
                instances: BTreeMap::new(),
            },
        );
    }
    if level == MoveLevel::Instance {
        for series in &series_list {
            let uids = find_scu::find_instances(
                scp,
                &inner.calling_ae_title,
                &inner.timeouts,
                inner.max_pdu_length,
                &spec.study_uid,
                Some(&series.series_uid),
            )
            .await?;
            if let Some(node) = hierarchy.series.get_mut(&series.series_uid) {
                for uid in uids {
                    node.instances.insert(
                        uid.clone(),
                        InstanceUidHierarchy {
                            uid,
                            instance_number: None,
                        },
                    );
                }
            }
        }
    }

    // 2. pre-reconciliation against the local index
    let (stored, complete_series) = {
        let model = inner.model.read().await;
        let anon_pt_id = model.get_anon_patient_id(&spec.patient_id);
        let complete_series: std::collections::BTreeSet<String> = match anon_pt_id {
            Some(pt) => series_list
                .iter()
                .filter(|s| {
                    s.instance_count > 0
                        && model.series_complete(
                            pt,
                            &spec.study_uid,
                            &s.series_uid,
                            s.instance_count,
                        )
                })
                .map(|s| s.series_uid.clone())
                .collect(),
            None => Default::default(),
        };
        (
            model.get_stored_instance_uids(&spec.study_uid),
            complete_series,
        )
    };
    let target = remote_study.instance_count;
    hierarchy.pending_instances = target.saturating_sub(stored.len());

    // 3. issue C-MOVE at the requested level
    let mut identifiers: Vec<dicom_object::InMemDicomObject> = Vec::new();
    match level {
        MoveLevel::Study => {
            if hierarchy.pending_instances > 0 {
                identifiers.push(move_scu::move_identifier(
                    level.as_qr_level(),
                    &spec.study_uid,
                    None,
                    None,
                ));
            }
        }
        MoveLevel::Series => {
            for series in &series_list {
                if complete_series.contains(&series.series_uid) {
                    continue;
                }
                identifiers.push(move_scu::move_identifier(
                    level.as_qr_level(),
                    &spec.study_uid,
                    Some(&series.series_uid),
                    None,
                ));
            }
        }
        MoveLevel::Instance => {
            for series in hierarchy.series.values() {
                for uid in series.instances.keys() {
                    if stored.contains(uid) {
                        continue;
                    }
                    identifiers.push(move_scu::move_identifier(
                        level.as_qr_level(),
                        &spec.study_uid,
                        Some(&series.uid),
                        Some(uid),
                    ));
                }
            }
        }
    }

    for identifier in identifiers {
        if inner.abort.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        run_one_move(inner, scp, destination_ae, &identifier, hierarchy, updates).await?;
    }

    // 4. post-reconciliation: wait for the ingest queue to drain, then
    // compare the peer's instance list against what actually arrived
    wait_for_ingest_drain(inner).await;
    let reported = find_scu::find_instances(
        scp,
        &inner.calling_ae_title,
        &inner.timeouts,
        inner.max_pdu_length,
        &spec.study_uid,
        None,
    )
    .await?;
    let mut missing = missing_instances(&reported, inner, &spec.study_uid).await;

    if !missing.is_empty() {
        // one automatic step-down: retry only the gaps at instance level
        info!(
            "study {}: {} instances missing after {level} move, retrying at IMAGE level",
            spec.study_uid,
            missing.len()
        );
        for uid in &missing {
            if inner.abort.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let identifier =
                move_scu::move_identifier("IMAGE", &spec.study_uid, None, Some(uid));
            run_one_move(inner, scp, destination_ae, &identifier, hierarchy, updates).await?;
        }
        wait_for_ingest_drain(inner).await;
        missing = missing_instances(&reported, inner, &spec.study_uid).await;
    }

    hierarchy.pending_instances = missing.len();
    if missing.is_empty() {
        // transient move errors are moot once everything arrived
        hierarchy.last_error_msg = None;
    } else {
        hierarchy.last_error_msg = Some(format!(
            "{} instances still missing after retry",
            missing.len()
        ));
    }
    Ok(())
}

async fn run_one_move(
    inner: &Arc<Inner>,
    scp: &DicomNode,
    destination_ae: &str,
    identifier: &dicom_object::InMemDicomObject,
    hierarchy: &mut StudyUidHierarchy,
    updates: &mpsc::Sender<MoveStudyUpdate>,
) -> Result<()> {
    let result = move_scu::move_once(
        scp,
        &inner.calling_ae_title,
        destination_ae,
        &inner.timeouts,
        inner.max_pdu_length,
        identifier,
        &inner.abort,
        |status| {
            hierarchy.update_move_states(status);
        },
    )
    .await;
    hierarchy.commit_move();
    let _ = updates.try_send(snapshot(hierarchy, false));
    match result {
        Ok(_status) => Ok(()),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            // one failing move does not stop the study; reconciliation
            // will pick up whatever is missing
            warn!("C-MOVE failed: {e}");
            hierarchy.last_error_msg = Some(e.to_string());
            Ok(())
        }
    }
}

/// Instances the peer reports that the local index has not seen.
async fn missing_instances(
    reported: &[String],
    inner: &Arc<Inner>,
    study_uid: &str,
) -> Vec<String> {
    let model = inner.model.read().await;
    let stored = model.get_stored_instance_uids(study_uid);
    reported
        .iter()
        .filter(|uid| !stored.contains(*uid))
        .cloned()
        .collect()
}

/// Wait until the ingest queue is empty or the grace period elapses.
async fn wait_for_ingest_drain(inner: &Arc<Inner>) {
    let grace = Duration::from_secs(inner.timeouts.network);
    let start = tokio::time::Instant::now();
    while inner.ingest_queue_len.load(Ordering::SeqCst) > 0 {
        if start.elapsed() >= grace {
            warn!("ingest queue did not drain within the grace period");
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
