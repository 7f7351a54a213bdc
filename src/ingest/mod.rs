//! The ingest pipeline: a bounded queue fed by the storage SCP, a pool of
//! anonymizer workers draining it, and a periodic model autosave.

pub mod scp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snafu::Report;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};

use crate::anonymizer::AnonymizerEngine;
use crate::config::ProjectModel;
use crate::error::{Error, Result};
use crate::model::{snapshot, AnonymizerModel};
use crate::storage::StorageLayout;
use scp::{ScpContext, WorkItem};

/// A running SCP with its worker pool and autosave timer.
pub struct IngestService {
    local_addr: SocketAddr,
    active: Arc<AtomicBool>,
    fatal: Arc<AtomicBool>,
    queue_len: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
    queue_tx: Option<mpsc::Sender<WorkItem>>,
    listener_task: Option<JoinHandle<()>>,
    worker_tasks: Vec<JoinHandle<()>>,
    autosave_task: Option<JoinHandle<()>>,
    model: Arc<RwLock<AnonymizerModel>>,
    layout: StorageLayout,
}

impl IngestService {
    /// Bind the local AE and start accepting associations.
    pub async fn start(
        config: &ProjectModel,
        model: Arc<RwLock<AnonymizerModel>>,
        engine: Arc<AnonymizerEngine>,
    ) -> Result<IngestService> {
        let layout = StorageLayout::new(&config.storage_dir);
        layout.prepare()?;

        let settings = config.ingest;
        let (queue_tx, queue_rx) = mpsc::channel::<WorkItem>(settings.queue_size);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let queue_len = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(true));
        let fatal = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let listen_addr = config.local.socket_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| Error::Config {
                detail: format!("cannot bind {listen_addr}: {e}"),
            })?;
        let local_addr = listener.local_addr().map_err(|e| Error::Config {
            detail: format!("cannot read bound address: {e}"),
        })?;
        info!("{} listening on: tcp://{local_addr}", config.local.ae_title);

        let ctx = Arc::new(ScpContext::from_config(
            config,
            layout.clone(),
            queue_tx.clone(),
            queue_len.clone(),
            active.clone(),
            fatal.clone(),
        ));

        let listener_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => {
                            info!("SCP listener shutting down");
                            break;
                        }
                        result = listener.accept() => {
                            let (socket, _addr) = match result {
                                Ok(pair) => pair,
                                Err(e) => {
                                    warn!("accept failed: {e}");
                                    continue;
                                }
                            };
                            let ctx = ctx.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = shutdown.notified() => {}
                                    result = scp::run_association(socket, ctx) => {
                                        if let Err(e) = result {
                                            error!("{}", Report::from_error(e));
                                        }
                                    }
                                }
                            });
                        }
                    }
                }
            })
        };

        let mut worker_tasks = Vec::with_capacity(settings.worker_count);
        for worker_id in 0..settings.worker_count {
            worker_tasks.push(tokio::spawn(anonymizer_worker(
                worker_id,
                queue_rx.clone(),
                queue_len.clone(),
                active.clone(),
                fatal.clone(),
                engine.clone(),
                settings.dequeue_timeout_ms,
                settings.worker_sleep_ms,
            )));
        }

        let autosave_task = {
            let model = model.clone();
            let active = active.clone();
            let path = layout.snapshot_path();
            let period = Duration::from_secs(settings.autosave_interval_secs);
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.tick().await; // immediate first tick
                while active.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    autosave(&model, &path).await;
                }
            })
        };

        Ok(IngestService {
            local_addr,
            active,
            fatal,
            queue_len,
            shutdown,
            queue_tx: Some(queue_tx),
            listener_task: Some(listener_task),
            worker_tasks,
            autosave_task: Some(autosave_task),
            model,
            layout,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The address the SCP actually bound (port 0 resolves here).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datasets admitted but not yet anonymized.
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    /// Shared handle to the queue length, for retrieval reconciliation.
    pub fn queue_len_handle(&self) -> Arc<AtomicUsize> {
        self.queue_len.clone()
    }

    /// Whether a fatal condition has shut the pipeline to new stores.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Deterministic shutdown: stop admitting, close the listener, drain
    /// workers with a bounded join, then flush the model.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping ingest pipeline");
        self.active.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Some(task) = self.listener_task.take() {
            task.abort();
            let _ = task.await;
        }
        // closing the channel lets workers run the queue dry and exit
        self.queue_tx.take();
        for task in self.worker_tasks.drain(..) {
            if timeout(Duration::from_secs(30), task).await.is_err() {
                warn!("worker did not drain within the join timeout");
            }
        }
        if let Some(task) = self.autosave_task.take() {
            task.abort();
            let _ = task.await;
        }
        autosave(&self.model, &self.layout.snapshot_path()).await;
        info!("ingest pipeline stopped");
        Ok(())
    }
}

/// Save the model when dirty. The clone happens under the writer lock so
/// the snapshot sees a consistent state; encoding and disk IO do not hold
/// the lock.
async fn autosave(model: &Arc<RwLock<AnonymizerModel>>, path: &std::path::Path) {
    let to_save = {
        let mut guard = model.write().await;
        if guard.is_dirty() {
            guard.clear_dirty();
            Some(guard.clone())
        } else {
            None
        }
    };
    if let Some(model) = to_save {
        if let Err(e) = snapshot::save(&model, path) {
            error!("model autosave failed: {e}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn anonymizer_worker(
    worker_id: usize,
    queue_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    queue_len: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
    fatal: Arc<AtomicBool>,
    engine: Arc<AnonymizerEngine>,
    dequeue_timeout_ms: u64,
    worker_sleep_ms: u64,
) {
    let dequeue_timeout = Duration::from_millis(dequeue_timeout_ms);
    let idle_sleep = Duration::from_millis(worker_sleep_ms);
    loop {
        let item = {
            let mut rx = queue_rx.lock().await;
            match timeout(dequeue_timeout, rx.recv()).await {
                Ok(Some(item)) => Some(item),
                // channel closed and drained
                Ok(None) => break,
                Err(_) => None,
            }
        };
        match item {
            Some(item) => {
                queue_len.fetch_sub(1, Ordering::SeqCst);
                match engine
                    .anonymize(&item.source, item.obj, &item.ts_uid, &item.bytes)
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        error!("worker {worker_id}: fatal: {e}");
                        fatal.store(true, Ordering::SeqCst);
                    }
                    Err(e) => {
                        // already quarantined by the engine
                        warn!("worker {worker_id}: {e}");
                    }
                }
            }
            None => {
                if !active.load(Ordering::SeqCst) && queue_len.load(Ordering::SeqCst) == 0 {
                    break;
                }
                tokio::time::sleep(idle_sleep).await;
            }
        }
    }
    info!("anonymizer worker {worker_id} exited");
}
