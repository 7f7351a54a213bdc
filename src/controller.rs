//! The control plane: project lifecycle, SCP start/stop, bulk operation
//! entry points and PHI CSV export.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::anonymizer::script::{AnonymizerScript, DEFAULT_PROFILE};
use crate::anonymizer::AnonymizerEngine;
use crate::config::ProjectModel;
use crate::error::{Error, Result};
use crate::export::ExportOrchestrator;
use crate::ingest::IngestService;
use crate::model::{java_index, phi_csv, snapshot, AnonymizerModel, Totals};
use crate::qr::MoveOrchestrator;
use crate::storage::StorageLayout;

pub struct AnonymizerController {
    config: Arc<ProjectModel>,
    model: Arc<RwLock<AnonymizerModel>>,
    engine: Arc<AnonymizerEngine>,
    layout: StorageLayout,
    ingest: Option<IngestService>,
    mover: Option<MoveOrchestrator>,
    exporter: ExportOrchestrator,
}

impl AnonymizerController {
    /// Open a project: prepare the storage tree, load or create the PHI
    /// index snapshot, and assemble the engine.
    pub fn open(config: ProjectModel) -> Result<AnonymizerController> {
        let layout = StorageLayout::new(&config.storage_dir);
        layout.prepare()?;

        let snapshot_path = layout.snapshot_path();
        let model = if snapshot_path.exists() {
            let loaded = snapshot::load(&snapshot_path)?;
            if loaded.site_id() != config.site_id || loaded.uid_root() != config.uid_root {
                return Err(Error::Config {
                    detail: format!(
                        "model snapshot belongs to site {:?} / uid root {:?}, \
                         but the project configures {:?} / {:?}",
                        loaded.site_id(),
                        loaded.uid_root(),
                        config.site_id,
                        config.uid_root
                    ),
                });
            }
            let totals = loaded.get_totals();
            info!(
                "loaded model snapshot: {} patients, {} studies, {} series, {} instances",
                totals.patients, totals.studies, totals.series, totals.instances
            );
            loaded
        } else {
            info!("starting with an empty PHI index");
            AnonymizerModel::new(&config.site_id, &config.uid_root)
        };
        let model = Arc::new(RwLock::new(model));

        let script = match &config.anonymizer_script {
            Some(path) => AnonymizerScript::load(path)?,
            None => DEFAULT_PROFILE.clone(),
        };
        let engine = Arc::new(AnonymizerEngine::new(
            model.clone(),
            layout.clone(),
            script,
            &config.project_name,
            &config.site_id,
            config.accepted_storage_classes(),
        ));
        let exporter = ExportOrchestrator::new(&config);

        Ok(AnonymizerController {
            config: Arc::new(config),
            model,
            engine,
            layout,
            ingest: None,
            mover: None,
            exporter,
        })
    }

    pub fn config(&self) -> &ProjectModel {
        &self.config
    }

    pub fn model(&self) -> Arc<RwLock<AnonymizerModel>> {
        self.model.clone()
    }

    pub fn engine(&self) -> Arc<AnonymizerEngine> {
        self.engine.clone()
    }

    /// Bind the local AE and start the ingest pipeline.
    pub async fn start_scp(&mut self) -> Result<()> {
        if self.ingest.is_some() {
            warn!("SCP already running");
            return Ok(());
        }
        let ingest =
            IngestService::start(&self.config, self.model.clone(), self.engine.clone()).await?;
        self.mover = Some(MoveOrchestrator::new(
            &self.config,
            self.model.clone(),
            ingest.queue_len_handle(),
        ));
        self.ingest = Some(ingest);
        Ok(())
    }

    /// Stop accepting associations, drain in-flight stores and flush the
    /// model.
    pub async fn stop_scp(&mut self) -> Result<()> {
        if let Some(mut ingest) = self.ingest.take() {
            ingest.stop().await?;
        }
        self.mover = None;
        Ok(())
    }

    pub fn is_scp_running(&self) -> bool {
        self.ingest.as_ref().map(IngestService::is_active).unwrap_or(false)
    }

    /// The bound SCP address while running.
    pub fn scp_addr(&self) -> Option<std::net::SocketAddr> {
        self.ingest.as_ref().map(IngestService::local_addr)
    }

    /// Datasets admitted off the wire but not yet anonymized.
    pub fn ingest_queue_len(&self) -> usize {
        self.ingest.as_ref().map(IngestService::queue_len).unwrap_or(0)
    }

    /// The retrieval orchestrator; available while the SCP runs (moved
    /// instances arrive through it).
    pub fn mover(&self) -> Option<&MoveOrchestrator> {
        self.mover.as_ref()
    }

    pub fn exporter(&self) -> &ExportOrchestrator {
        &self.exporter
    }

    pub async fn totals(&self) -> Totals {
        self.model.read().await.get_totals()
    }

    /// Write the PHI CSV into `private/phi_export/`.
    pub async fn create_phi_csv(&self) -> Result<PathBuf> {
        let model = self.model.read().await;
        phi_csv::create_phi_csv(&model, &self.layout.phi_export_dir())
    }

    /// Seed the lookup tables from a prior installation's Excel index.
    pub async fn import_java_index(&self, path: &std::path::Path) -> Result<usize> {
        let rows = java_index::read_java_phi_studies(path)?;
        let count = rows.len();
        let mut model = self.model.write().await;
        model.process_java_phi_studies(rows)?;
        Ok(count)
    }

    /// Clean shutdown: stop the SCP and write a final snapshot.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stop_scp().await?;
        let to_save = {
            let mut model = self.model.write().await;
            if model.is_dirty() {
                model.clear_dirty();
                Some(model.clone())
            } else {
                None
            }
        };
        if let Some(model) = to_save {
            snapshot::save(&model, &self.layout.snapshot_path())?;
        }
        info!("project closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ProjectModel {
        serde_json::from_value(serde_json::json!({
            "project_name": "TRIAL-42",
            "site_id": "RSNA-0001",
            "uid_root": "1.2.826.0.1.3680043.10.474",
            "storage_dir": dir.path().join("storage"),
            "local": { "ae_title": "ANONSCP", "host": "127.0.0.1", "port": 0 },
            "query": { "ae_title": "PACS", "host": "127.0.0.1", "port": 10104 },
            "export": { "ae_title": "EXPORT", "host": "127.0.0.1", "port": 10105 }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn open_creates_the_project_skeleton() {
        let tmp = TempDir::new().unwrap();
        let controller = AnonymizerController::open(config(&tmp)).unwrap();
        assert!(tmp.path().join("storage/private").is_dir());
        assert!(tmp.path().join("storage/private/phi_export").is_dir());
        assert_eq!(controller.totals().await, Totals::default());
        assert!(!controller.is_scp_running());
    }

    #[tokio::test]
    async fn shutdown_persists_and_reopen_restores() {
        let tmp = TempDir::new().unwrap();
        let mut controller = AnonymizerController::open(config(&tmp)).unwrap();
        controller
            .model()
            .write()
            .await
            .get_next_anon_patient_id("X123")
            .unwrap();
        controller.shutdown().await.unwrap();

        let reopened = AnonymizerController::open(config(&tmp)).unwrap();
        assert_eq!(
            reopened
                .model()
                .read()
                .await
                .get_anon_patient_id("X123")
                .map(str::to_string),
            Some("RSNA-0001-000001".to_string())
        );
    }

    #[tokio::test]
    async fn snapshot_from_another_site_is_refused() {
        let tmp = TempDir::new().unwrap();
        let mut controller = AnonymizerController::open(config(&tmp)).unwrap();
        controller
            .model()
            .write()
            .await
            .get_next_anon_patient_id("X123")
            .unwrap();
        controller.shutdown().await.unwrap();

        let mut other = config(&tmp);
        other.site_id = "OTHER-SITE".to_string();
        assert!(matches!(
            AnonymizerController::open(other),
            Err(Error::Config { .. })
        ));
    }

    #[tokio::test]
    async fn scp_lifecycle_binds_and_stops() {
        let tmp = TempDir::new().unwrap();
        let mut controller = AnonymizerController::open(config(&tmp)).unwrap();
        controller.start_scp().await.unwrap();
        assert!(controller.is_scp_running());
        assert!(controller.mover().is_some());
        controller.stop_scp().await.unwrap();
        assert!(!controller.is_scp_running());
        assert!(controller.mover().is_none());
    }
}
