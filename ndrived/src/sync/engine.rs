use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ndrive_core::NuxeoClient;

use super::backoff::Backoff;
use super::dao::{DocPair, EngineDao};
use super::ledger::TransferStatus;
use super::local::LocalClient;
use super::local_watcher::{LocalWatcher, LocalWatcherConfig, WriteMonitor, start_notify_watcher};
use super::processor::{EngineEvent, Processor};
use super::queue::{QueueItem, QueueManager};
use super::remote_watcher::RemoteWatcher;
use super::states::{LocalState, RemoteState};
use super::stop::StopToken;
use super::transfer::{TransferConfig, TransferEngine};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const QUEUE_CAPACITY: usize = 1024;
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub uid: String,
    pub local_folder: PathBuf,
    pub remote_root_ref: String,
    /// Remote poll cadence.
    pub poll_interval: Duration,
    pub worker_count: usize,
    pub max_errors: i64,
    pub transfer: TransferConfig,
    pub watcher: LocalWatcherConfig,
    pub ignored_prefixes: Vec<String>,
    pub ignored_suffixes: Vec<String>,
}

impl EngineConfig {
    pub fn new(uid: impl Into<String>, local_folder: PathBuf, remote_root_ref: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            local_folder,
            remote_root_ref: remote_root_ref.into(),
            poll_interval: Duration::from_secs(30),
            worker_count: 4,
            max_errors: 3,
            transfer: TransferConfig::default(),
            watcher: LocalWatcherConfig::default(),
            ignored_prefixes: vec![".".into(), "~$".into(), "icon\r".into()],
            ignored_suffixes: vec![
                ".tmp".into(),
                ".swp".into(),
                ".lock".into(),
                ".part".into(),
                ".partial".into(),
                ".ndpart".into(),
                ".crdownload".into(),
                "~".into(),
                ".dwl".into(),
                ".dwl2".into(),
            ],
        }
    }
}

/// One engine: binds a local root to a remote workspace and owns its
/// database, queue, watchers and worker pool. Engines are independent.
pub struct Engine {
    config: EngineConfig,
    dao: Arc<EngineDao>,
    local: LocalClient,
    client: NuxeoClient,
    queue: Arc<QueueManager>,
    stop: StopToken,
    events: broadcast::Sender<EngineEvent>,
    transfer: TransferEngine,
    local_watcher: Arc<LocalWatcher>,
    remote_watcher: Arc<RemoteWatcher>,
    processor: Arc<Processor>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Wires the components around an already-initialized database.
    pub fn assemble(config: EngineConfig, dao: Arc<EngineDao>, client: NuxeoClient) -> Arc<Self> {
        let local = LocalClient::new(
            config.local_folder.clone(),
            config.ignored_prefixes.clone(),
            config.ignored_suffixes.clone(),
        );
        let stop = StopToken::new();
        let writes = WriteMonitor::default();
        let queue = Arc::new(QueueManager::new(QUEUE_CAPACITY));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transfer = TransferEngine::new(
            client.clone(),
            Arc::clone(&dao),
            local.clone(),
            config.transfer,
            stop.clone(),
        );
        let local_watcher = Arc::new(LocalWatcher::new(
            Arc::clone(&dao),
            local.clone(),
            writes.clone(),
            config.watcher,
        ));
        let remote_watcher = Arc::new(RemoteWatcher::new(
            Arc::clone(&dao),
            client.clone(),
            config.remote_root_ref.clone(),
        ));
        let processor = Arc::new(Processor::new(
            Arc::clone(&dao),
            client.clone(),
            local.clone(),
            transfer.clone(),
            Arc::clone(&queue),
            writes.clone(),
            stop.clone(),
            events.clone(),
            config.max_errors,
            config.remote_root_ref.clone(),
        ));
        Arc::new(Self {
            config,
            dao,
            local,
            client,
            queue,
            stop,
            events,
            transfer,
            local_watcher,
            remote_watcher,
            processor,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn uid(&self) -> &str {
        &self.config.uid
    }

    pub fn dao(&self) -> &Arc<EngineDao> {
        &self.dao
    }

    pub fn local(&self) -> &LocalClient {
        &self.local
    }

    pub fn client(&self) -> &NuxeoClient {
        &self.client
    }

    pub fn transfer(&self) -> &TransferEngine {
        &self.transfer
    }

    /// Direct Transfer manager bound to this engine's account and ledger.
    pub fn direct_transfer(&self) -> crate::direct_transfer::DirectTransferManager {
        crate::direct_transfer::DirectTransferManager::new(
            Arc::clone(&self.dao),
            self.client.clone(),
            self.transfer.clone(),
            self.stop.clone(),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn push_pairs(&self, pairs: &[DocPair]) {
        for pair in pairs {
            self.queue.push(QueueItem::from(pair)).await;
        }
    }

    /// Starts the continuous sync pipeline: resume the transfer ledger, run
    /// the initial scan, then spawn watcher, poller and worker tasks.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        info!(engine = %self.config.uid, root = %self.config.local_folder.display(), "engine starting");

        // Cancelled leftovers first, then everything resumable.
        if let Err(err) = self.transfer.cleanup_cancelled().await {
            warn!(error = %err, "cancelled-transfer cleanup failed, will retry next start");
        }
        self.resume_transfers().await?;

        let scanned = self.local_watcher.scan().await?;
        self.push_pairs(&scanned).await;

        let mut tasks = self.tasks.lock().await;

        // Filesystem events.
        match start_notify_watcher(&self.config.local_folder) {
            Ok((watcher, mut rx)) => {
                let engine = Arc::clone(self);
                tasks.push(tokio::spawn(async move {
                    // Keep the OS watcher alive for the task's lifetime.
                    let _watcher = watcher;
                    let flush_every = engine.config.watcher.coalesce_window.max(Duration::from_millis(100));
                    loop {
                        if engine.stop.is_stopping() {
                            break;
                        }
                        tokio::select! {
                            event = rx.recv() => {
                                let Some(event) = event else { break };
                                match engine.local_watcher.handle_event(event).await {
                                    Ok(pairs) => engine.push_pairs(&pairs).await,
                                    Err(err) => warn!(error = %err, "local event handling failed"),
                                }
                            }
                            _ = tokio::time::sleep(flush_every) => {
                                match engine.local_watcher.flush_pending().await {
                                    Ok(pairs) => engine.push_pairs(&pairs).await,
                                    Err(err) => warn!(error = %err, "pending-delete flush failed"),
                                }
                            }
                        }
                    }
                }));
            }
            Err(err) => warn!(error = %err, "local watcher unavailable, relying on scans"),
        }

        // Remote polling with jittered backoff on failure.
        {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let backoff = Backoff::for_poll();
                let mut failures = 0u32;
                loop {
                    if engine.stop.is_stopping() {
                        break;
                    }
                    if engine.stop.is_paused() {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    match engine.remote_watcher.poll().await {
                        Ok(pairs) => {
                            failures = 0;
                            engine.push_pairs(&pairs).await;
                            tokio::time::sleep(engine.config.poll_interval).await;
                        }
                        Err(err) => {
                            failures = failures.saturating_add(1);
                            let delay = backoff.delay(failures);
                            warn!(error = %err, failures, "remote poll failed, backing off");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }));
        }

        // Worker pool.
        for _ in 0..self.config.worker_count.max(1) {
            let processor = Arc::clone(&self.processor);
            tasks.push(tokio::spawn(processor.run()));
        }

        Ok(())
    }

    async fn resume_transfers(&self) -> anyhow::Result<()> {
        let (downloads, uploads) = self.dao.resumable_transfers().await?;
        for download in downloads {
            if let Some(pair_id) = download.pair_id {
                self.dao
                    .set_download_status(download.uid, TransferStatus::Ongoing)
                    .await?;
                if let Some(pair) = self.dao.pair_by_id(pair_id).await? {
                    self.queue.push(QueueItem::from(&pair)).await;
                }
            }
        }
        for upload in uploads {
            if let Some(pair_id) = upload.pair_id {
                self.dao
                    .set_upload_status(upload.uid, TransferStatus::Ongoing)
                    .await?;
                if let Some(pair) = self.dao.pair_by_id(pair_id).await? {
                    self.queue.push(QueueItem::from(&pair)).await;
                }
            }
        }
        Ok(())
    }

    /// Cooperative stop: flag, let workers reach a safe point, park live
    /// transfers, then join within a grace period.
    pub async fn stop(&self) {
        info!(engine = %self.config.uid, "engine stopping");
        self.stop.stop();
        self.queue.close();
        if let Err(err) = self.dao.suspend_ongoing_transfers().await {
            warn!(error = %err, "cannot suspend transfers");
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                warn!(engine = %self.config.uid, "worker did not stop within the grace period");
            }
        }
    }

    /// Pauses scheduling; running handlers finish or reach a safe pause
    /// point on their own.
    pub fn suspend(&self) {
        self.stop.pause();
        self.queue.suspend();
    }

    pub async fn resume(&self) {
        self.stop.resume();
        self.queue.resume();
        if let Err(err) = self.resume_transfers().await {
            warn!(error = %err, "cannot resume transfers");
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.queue.is_suspended()
    }

    //
    // User operations
    //

    /// Puts a parked pair back into rotation.
    pub async fn retry_pair(&self, pair_id: i64) -> anyhow::Result<()> {
        if let Some(pair) = self.dao.reset_error(pair_id).await? {
            self.queue.push(QueueItem::from(&pair)).await;
        }
        Ok(())
    }

    /// Conflict resolution: keep the local content.
    pub async fn resolve_with_local(&self, pair_id: i64) -> anyhow::Result<()> {
        let pair = self
            .dao
            .set_states(pair_id, LocalState::Resolved, RemoteState::Unknown)
            .await?;
        self.queue.push(QueueItem::from(&pair)).await;
        Ok(())
    }

    /// Conflict resolution: take the remote content.
    pub async fn resolve_with_remote(&self, pair_id: i64) -> anyhow::Result<()> {
        let pair = self
            .dao
            .set_states(pair_id, LocalState::Synchronized, RemoteState::Modified)
            .await?;
        self.queue.push(QueueItem::from(&pair)).await;
        Ok(())
    }

    /// Hides a remote subtree; already-synced content under it is removed
    /// locally without touching the server.
    pub async fn add_filter(&self, path: &str) -> anyhow::Result<()> {
        let affected = self.dao.add_filter(path).await?;
        self.push_pairs(&affected).await;
        Ok(())
    }

    /// Un-hides a subtree; the next poll re-discovers its remote content.
    pub async fn remove_filter(&self, path: &str) -> anyhow::Result<()> {
        self.dao.remove_filter(path).await?;
        Ok(())
    }

    pub async fn pause_download(&self, uid: i64) -> anyhow::Result<()> {
        self.dao
            .set_download_status(uid, TransferStatus::Paused)
            .await?;
        Ok(())
    }

    pub async fn pause_upload(&self, uid: i64) -> anyhow::Result<()> {
        self.dao.set_upload_status(uid, TransferStatus::Paused).await?;
        Ok(())
    }

    pub async fn resume_download(&self, uid: i64) -> anyhow::Result<()> {
        self.dao
            .set_download_status(uid, TransferStatus::Ongoing)
            .await?;
        if let Some(download) = self.dao.download_by_uid(uid).await?
            && let Some(pair_id) = download.pair_id
            && let Some(pair) = self.dao.pair_by_id(pair_id).await?
        {
            self.queue.push(QueueItem::from(&pair)).await;
        }
        Ok(())
    }

    pub async fn resume_upload(&self, uid: i64) -> anyhow::Result<()> {
        self.dao.set_upload_status(uid, TransferStatus::Ongoing).await?;
        if let Some(upload) = self.dao.upload_by_uid(uid).await?
            && let Some(pair_id) = upload.pair_id
            && let Some(pair) = self.dao.pair_by_id(pair_id).await?
        {
            self.queue.push(QueueItem::from(&pair)).await;
        }
        Ok(())
    }

    pub async fn cancel_download(&self, uid: i64) -> anyhow::Result<()> {
        self.dao
            .set_download_status(uid, TransferStatus::Cancelled)
            .await?;
        Ok(())
    }

    pub async fn cancel_upload(&self, uid: i64) -> anyhow::Result<()> {
        self.dao
            .set_upload_status(uid, TransferStatus::Cancelled)
            .await?;
        Ok(())
    }

    /// Writes the engine root marker so shell integrations and the watcher
    /// recognize the folder.
    pub fn tag_root(&self) -> anyhow::Result<()> {
        self.local
            .set_remote_id("/", &self.config.remote_root_ref)?;
        Ok(())
    }
}
