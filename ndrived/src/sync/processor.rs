use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use ndrive_core::{ApiErrorClass, NuxeoClient, NuxeoError, RemoteFileInfo};

use super::backoff::Backoff;
use super::dao::{DaoError, DocPair, EngineDao};
use super::ledger::TransferStatus;
use super::local::{LocalClient, LocalError, join_remote};
use super::local_watcher::WriteMonitor;
use super::queue::{QueueItem, QueueManager};
use super::states::{LocalState, PairState, RemoteState};
use super::stop::StopToken;
use super::transfer::{LinkStep, TransferEngine, TransferError, TransferOutcome};

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("api error: {0}")]
    Api(#[from] NuxeoError),
    #[error("database error: {0}")]
    Dao(#[from] DaoError),
    #[error("local error: {0}")]
    Local(#[from] LocalError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("parent of {0} is not synchronized yet")]
    MissingParent(String),
    #[error("name clash on {path}: {existing}")]
    NameClash { path: String, existing: String },
    #[error("pair has no {0}")]
    IncompletePair(&'static str),
}

/// Engine-level events surfaced to the manager and the shell.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    NewError { pair_id: i64 },
    InvalidAuthentication,
    NameClash { path: String },
    DiskFull { path: String },
    Synchronized { pair_id: i64 },
}

/// Worker pool draining the queue and executing the pair-state handlers.
///
/// Retry policy lives here and only here; adapters never retry, which keeps
/// per-pair error counts meaningful.
pub struct Processor {
    dao: Arc<EngineDao>,
    client: NuxeoClient,
    local: LocalClient,
    transfer: TransferEngine,
    queue: Arc<QueueManager>,
    writes: WriteMonitor,
    stop: StopToken,
    events: broadcast::Sender<EngineEvent>,
    backoff: Backoff,
    max_errors: i64,
    /// Remote ref the local `/` maps to.
    root_ref: String,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dao: Arc<EngineDao>,
        client: NuxeoClient,
        local: LocalClient,
        transfer: TransferEngine,
        queue: Arc<QueueManager>,
        writes: WriteMonitor,
        stop: StopToken,
        events: broadcast::Sender<EngineEvent>,
        max_errors: i64,
        root_ref: String,
    ) -> Self {
        Self {
            dao,
            client,
            local,
            transfer,
            queue,
            writes,
            stop,
            events,
            backoff: Backoff::for_retries(),
            max_errors,
            root_ref,
        }
    }

    /// One worker: drains the queue until it closes or the engine stops.
    /// Errors never escape a pair handler.
    pub async fn run(self: Arc<Self>) {
        while let Some(item) = self.queue.pop().await {
            if self.stop.is_stopping() {
                break;
            }
            self.process_item(item).await;
        }
    }

    pub async fn process_item(&self, item: QueueItem) {
        let pair = match self.dao.pair_by_id(item.pair_id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return, // removed by a cascade in the meantime
            Err(err) => {
                warn!(pair = item.pair_id, error = %err, "cannot re-read pair");
                return;
            }
        };
        if pair.version != item.version {
            debug!(pair = pair.id, "stale queue stamp, skipping");
            return;
        }
        if pair.pair_state.is_quiescent() {
            return;
        }
        if pair.error_count >= self.max_errors {
            // Parked until the user retries it.
            return;
        }

        match self.dispatch(&pair).await {
            Ok(()) => {
                let _ = self.events.send(EngineEvent::Synchronized { pair_id: pair.id });
            }
            Err(err) => self.handle_error(&pair, err).await,
        }
    }

    async fn dispatch(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        debug!(pair = pair.id, state = pair.pair_state.as_str(), "dispatch");
        match pair.pair_state {
            PairState::LocallyCreated => self.sync_locally_created(pair).await,
            PairState::LocallyResolved => self.sync_locally_resolved(pair).await,
            PairState::RemotelyCreated => self.sync_remotely_created(pair).await,
            PairState::LocallyModified => self.sync_locally_modified(pair).await,
            PairState::RemotelyModified => self.sync_remotely_modified(pair).await,
            PairState::LocallyMoved => self.sync_locally_moved(pair, true).await,
            PairState::RemotelyMoved => self.sync_remotely_moved(pair).await,
            PairState::LocallyMovedRemotelyModified => {
                self.sync_locally_moved(pair, false).await?;
                match self.dao.pair_by_id(pair.id).await? {
                    Some(refreshed) => self.sync_remotely_modified(&refreshed).await,
                    None => Ok(()),
                }
            }
            PairState::LocallyMovedCreated => {
                // The remote side is gone: the moved item is a plain create
                // at its new path.
                self.dao.clear_remote_ref(pair.id).await?;
                match self.dao.pair_by_id(pair.id).await? {
                    Some(refreshed) => self.sync_locally_created(&refreshed).await,
                    None => Ok(()),
                }
            }
            PairState::LocallyDeleted => self.sync_locally_deleted(pair).await,
            PairState::RemotelyDeleted => self.sync_remotely_deleted(pair).await,
            PairState::Deleted | PairState::UnknownDeleted | PairState::DeletedUnknown => {
                self.dao.remove_pair(pair.id).await?;
                Ok(())
            }
            // Direct Transfer pairs are driven by their own manager.
            PairState::DirectTransfer | PairState::Todo => Ok(()),
            PairState::Synchronized
            | PairState::Conflicted
            | PairState::Unsynchronized
            | PairState::Unknown => Ok(()),
        }
    }

    //
    // Upload direction
    //

    async fn sync_locally_created(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        let local_path = pair
            .local_path
            .clone()
            .ok_or(ProcessorError::IncompletePair("local_path"))?;
        let name = super::dao::name_of(&local_path);
        let parent_ref = self.remote_parent_ref(&local_path).await?;

        if pair.folderish {
            let info = self.client.create_folder(&parent_ref, &name).await?;
            self.finish_synchronized(pair, &info, None).await?;
            return Ok(());
        }

        if !self.local.exists(&local_path).await {
            // Vanished before we uploaded anything.
            self.dao.mark_locally_deleted(pair).await?;
            return Ok(());
        }
        self.upload_and_link(
            pair,
            LinkStep::CreateFile {
                parent_ref,
                name: name.clone(),
            },
        )
        .await
    }

    async fn sync_locally_resolved(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        // "Keep local": force our content up, whatever the remote did.
        match &pair.remote_ref {
            Some(fs_item_id) => {
                self.upload_and_link(
                    pair,
                    LinkStep::UpdateFile {
                        fs_item_id: fs_item_id.clone(),
                    },
                )
                .await
            }
            None => self.sync_locally_created(pair).await,
        }
    }

    async fn sync_locally_modified(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        let Some(fs_item_id) = pair.remote_ref.clone() else {
            return self.sync_locally_created(pair).await;
        };
        if pair.folderish {
            // Folder content never uploads; refresh bookkeeping only.
            let now = OffsetDateTime::now_utc().unix_timestamp();
            self.dao
                .synchronize_pair(pair, None, None, None, None, None, None, now)
                .await?;
            return Ok(());
        }
        self.upload_and_link(pair, LinkStep::UpdateFile { fs_item_id }).await
    }

    async fn upload_and_link(&self, pair: &DocPair, step: LinkStep) -> Result<(), ProcessorError> {
        let local_path = pair
            .local_path
            .clone()
            .ok_or(ProcessorError::IncompletePair("local_path"))?;
        let info = self.local.get_info(&local_path).await?;
        let digest = self
            .local
            .get_digest(&local_path, &pair.digest_algorithm)
            .await?;

        let row = match self.dao.upload_for_pair(pair.id).await? {
            Some(row) => row,
            None => {
                self.dao
                    .insert_upload(
                        Some(pair.id),
                        pair.session_id,
                        &local_path,
                        None,
                        None,
                        info.size as i64,
                        Some(&digest),
                        Some(&pair.digest_algorithm),
                    )
                    .await?
            }
        };
        self.dao
            .set_upload_status(row.uid, TransferStatus::Ongoing)
            .await?;

        let (outcome, row) = self.transfer.upload(&row).await?;
        if let TransferOutcome::Interrupted(status) = outcome {
            debug!(pair = pair.id, status = status.as_str(), "upload interrupted");
            return Ok(());
        }

        let linked = self.transfer.link_upload(&row, &step, Some(&digest)).await?;
        self.dao
            .set_upload_status(row.uid, TransferStatus::Done)
            .await?;
        self.dao.remove_upload(row.uid).await?;

        let info = linked.ok_or(ProcessorError::IncompletePair("upload result"))?;
        self.finish_synchronized(pair, &info, Some("upload")).await?;
        Ok(())
    }

    //
    // Download direction
    //

    async fn sync_remotely_created(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        let remote_ref = pair
            .remote_ref
            .clone()
            .ok_or(ProcessorError::IncompletePair("remote_ref"))?;
        let local_path = pair
            .local_path
            .clone()
            .ok_or(ProcessorError::IncompletePair("local_path"))?;

        // Two remote children differing only by case cannot both land on a
        // case-insensitive volume.
        let parent_path = super::dao::parent_of(&local_path);
        if self.local.exists(&parent_path).await {
            let siblings = self.local.get_children(&parent_path).await?;
            let name = super::dao::name_of(&local_path);
            if let Some(existing) = self.local.find_case_clash(&siblings, &name) {
                return Err(ProcessorError::NameClash {
                    path: local_path,
                    existing,
                });
            }
        }

        if pair.folderish {
            self.local.make_folder(&local_path).await?;
            self.writes.record(&local_path);
            self.local.set_remote_id(&local_path, &remote_ref)?;
            let now = OffsetDateTime::now_utc().unix_timestamp();
            self.dao
                .synchronize_pair(pair, None, None, None, None, None, None, now)
                .await?;
            return Ok(());
        }

        // The target path may hold an unrelated file (same name, different
        // document): de-duplicate with a suffix rather than overwrite.
        let mut pair = pair.clone();
        let mut local_path = local_path;
        if self.local.exists(&local_path).await
            && self.local.get_remote_id(&local_path).as_deref() != Some(remote_ref.as_str())
        {
            let deduped = self.free_sibling_path(&local_path).await;
            info!(pair = pair.id, from = %local_path, to = %deduped, "target taken, de-duplicating");
            pair = self
                .dao
                .update_local_paths(&pair, &deduped, pair.local_state)
                .await?;
            local_path = deduped;
        }
        let pair = &pair;

        let info = match self.client.get_fs_info(&remote_ref).await? {
            Some(info) => info,
            None => {
                self.dao.mark_remotely_deleted(pair).await?;
                return Ok(());
            }
        };
        let outcome = self.transfer.download(pair, &info).await?;
        if let TransferOutcome::Interrupted(status) = outcome {
            debug!(pair = pair.id, status = status.as_str(), "download interrupted");
            return Ok(());
        }
        self.writes.record(&local_path);
        self.finish_synchronized(pair, &info, Some("download")).await?;
        Ok(())
    }

    async fn sync_remotely_modified(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        let remote_ref = pair
            .remote_ref
            .clone()
            .ok_or(ProcessorError::IncompletePair("remote_ref"))?;
        if pair.folderish {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            self.dao
                .synchronize_pair(pair, None, None, None, None, None, None, now)
                .await?;
            return Ok(());
        }
        let info = match self.client.get_fs_info(&remote_ref).await? {
            Some(info) => info,
            None => {
                self.dao.mark_remotely_deleted(pair).await?;
                return Ok(());
            }
        };
        if info.digest.is_some() && info.digest == pair.local_digest {
            // Content already matches; only bookkeeping was stale.
            self.finish_synchronized(pair, &info, None).await?;
            return Ok(());
        }
        let outcome = self.transfer.download(pair, &info).await?;
        if let TransferOutcome::Interrupted(status) = outcome {
            debug!(pair = pair.id, status = status.as_str(), "download interrupted");
            return Ok(());
        }
        if let Some(local_path) = &pair.local_path {
            self.writes.record(local_path);
        }
        self.finish_synchronized(pair, &info, Some("download")).await?;
        Ok(())
    }

    //
    // Moves
    //

    async fn sync_locally_moved(&self, pair: &DocPair, finish: bool) -> Result<(), ProcessorError> {
        let fs_item_id = pair
            .remote_ref
            .clone()
            .ok_or(ProcessorError::IncompletePair("remote_ref"))?;
        let local_path = pair
            .local_path
            .clone()
            .ok_or(ProcessorError::IncompletePair("local_path"))?;
        let local_name = super::dao::name_of(&local_path);

        let target_parent_ref = self.remote_parent_ref(&local_path).await?;
        let mut latest: Option<RemoteFileInfo> = None;

        if pair.remote_parent_ref.as_deref() != Some(target_parent_ref.as_str()) {
            latest = Some(self.client.move_item(&fs_item_id, &target_parent_ref).await?);
        }
        if pair.remote_name.as_deref() != Some(local_name.as_str()) {
            latest = Some(self.client.rename(&fs_item_id, &local_name).await?);
        }

        if finish {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            let (name, parent) = match &latest {
                Some(info) => (Some(info.name.as_str()), info.parent_uid.as_deref()),
                None => (Some(local_name.as_str()), Some(target_parent_ref.as_str())),
            };
            self.dao
                .synchronize_pair(pair, None, parent, name, None, None, None, now)
                .await?;
        } else if let Some(info) = &latest {
            self.dao
                .update_remote_state(pair, info, RemoteState::Modified)
                .await?;
        }
        Ok(())
    }

    async fn sync_remotely_moved(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        let local_path = pair
            .local_path
            .clone()
            .ok_or(ProcessorError::IncompletePair("local_path"))?;
        let remote_name = pair
            .remote_name
            .clone()
            .ok_or(ProcessorError::IncompletePair("remote_name"))?;

        let new_parent_path = match &pair.remote_parent_ref {
            Some(parent_ref) if *parent_ref == self.root_ref => "/".to_string(),
            Some(parent_ref) => self
                .dao
                .pair_by_remote_ref(parent_ref)
                .await?
                .and_then(|parent| parent.local_path)
                .ok_or_else(|| ProcessorError::MissingParent(local_path.clone()))?,
            None => return Err(ProcessorError::IncompletePair("remote_parent_ref")),
        };
        let new_path = join_remote(&new_parent_path, &remote_name);
        if new_path == local_path {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            self.dao
                .synchronize_pair(pair, None, None, None, None, None, None, now)
                .await?;
            return Ok(());
        }

        // A freshly created local item already sitting on the target path is
        // a genuine conflict, parked for the user.
        if let Some(occupant) = self.dao.pair_by_local_path(&new_path).await?
            && occupant.id != pair.id
        {
            if occupant.local_state == LocalState::Created {
                self.dao
                    .set_states(pair.id, LocalState::Modified, RemoteState::Created)
                    .await?;
                info!(pair = pair.id, path = %new_path, "move target taken by a local create, conflict");
                return Ok(());
            }
            return Err(ProcessorError::NameClash {
                path: new_path,
                existing: occupant.local_path.unwrap_or_default(),
            });
        }

        self.local.move_to(&local_path, &new_path).await?;
        self.writes.record(&local_path);
        self.writes.record(&new_path);
        let moved = self
            .dao
            .update_local_paths(pair, &new_path, pair.local_state)
            .await?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.dao
            .synchronize_pair(&moved, None, None, Some(&remote_name), None, None, None, now)
            .await?;
        Ok(())
    }

    //
    // Deletions
    //

    async fn sync_locally_deleted(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        if let Some(fs_item_id) = &pair.remote_ref {
            match self
                .client
                .delete_item(fs_item_id, pair.remote_parent_ref.as_deref())
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(pair = pair.id, "remote side already gone");
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.remove_subtree_rows(pair).await
    }

    async fn sync_remotely_deleted(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        if let Some(local_path) = &pair.local_path
            && self.local.exists(local_path).await
        {
            self.writes.record(local_path);
            self.local.delete(local_path).await?;
        }
        self.remove_subtree_rows(pair).await
    }

    /// Children were cascaded in the database already; their dispatches are
    /// no-ops once these rows are gone.
    async fn remove_subtree_rows(&self, pair: &DocPair) -> Result<(), ProcessorError> {
        if let Some(local_path) = &pair.local_path {
            self.dao.remove_pairs_under(local_path).await?;
        } else {
            self.dao.remove_pair(pair.id).await?;
        }
        Ok(())
    }

    //
    // Shared tail
    //

    async fn finish_synchronized(
        &self,
        pair: &DocPair,
        info: &RemoteFileInfo,
        last_transfer: Option<&str>,
    ) -> Result<(), ProcessorError> {
        if let Some(local_path) = &pair.local_path {
            self.local.set_remote_id(local_path, &info.uid)?;
        }
        let digest = info.digest.as_deref();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.dao
            .synchronize_pair(
                pair,
                Some(&info.uid),
                info.parent_uid.as_deref(),
                Some(&info.name),
                digest,
                digest,
                last_transfer,
                now,
            )
            .await?;
        Ok(())
    }

    /// First `name__<n>` sibling path not taken on disk.
    async fn free_sibling_path(&self, local_path: &str) -> String {
        let parent = super::dao::parent_of(local_path);
        let name = super::dao::name_of(local_path);
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
            _ => (name.clone(), None),
        };
        for index in 1..1000 {
            let candidate = match &ext {
                Some(ext) => join_remote(&parent, &format!("{stem}__{index}.{ext}")),
                None => join_remote(&parent, &format!("{stem}__{index}")),
            };
            if !self.local.exists(&candidate).await {
                return candidate;
            }
        }
        join_remote(&parent, &format!("{stem}__dup"))
    }

    /// Remote ref of the synchronized parent of a local path.
    async fn remote_parent_ref(&self, local_path: &str) -> Result<String, ProcessorError> {
        let parent_path = super::dao::parent_of(local_path);
        if parent_path == "/" {
            return Ok(self.root_ref.clone());
        }
        self.dao
            .pair_by_local_path(&parent_path)
            .await?
            .and_then(|parent| parent.remote_ref)
            .ok_or_else(|| ProcessorError::MissingParent(local_path.to_string()))
    }

    //
    // Error policy
    //

    async fn handle_error(&self, pair: &DocPair, err: ProcessorError) {
        if let ProcessorError::Dao(DaoError::StaleVersion(_)) = &err {
            // Someone else advanced the pair mid-handler; the new version is
            // queued on its own.
            debug!(pair = pair.id, "pair advanced underneath the handler");
            return;
        }

        if let ProcessorError::Transfer(transfer_err) = &err
            && transfer_err.is_source_vanished()
        {
            info!(pair = pair.id, "source vanished mid-upload, switching to local deletion");
            if let Ok(affected) = self.dao.mark_locally_deleted(pair).await {
                for touched in &affected {
                    self.queue.push(QueueItem::from(touched)).await;
                }
            }
            return;
        }

        if let ProcessorError::NameClash { path, .. } = &err {
            warn!(pair = pair.id, path = %path, "name clash, parking the pair");
            let _ = self
                .dao
                .park_pair(pair.id, &err.to_string(), self.max_errors)
                .await;
            let _ = self.events.send(EngineEvent::NameClash { path: path.clone() });
            return;
        }

        match api_class(&err) {
            Some(ApiErrorClass::Auth) => {
                warn!(pair = pair.id, "credentials rejected, stopping scheduling");
                let _ = self.events.send(EngineEvent::InvalidAuthentication);
                self.stop.pause();
            }
            Some(ApiErrorClass::Forbidden) => {
                info!(pair = pair.id, "permission denied, parking");
                let _ = self
                    .dao
                    .park_pair(pair.id, &err.to_string(), self.max_errors)
                    .await;
                let _ = self.events.send(EngineEvent::NewError { pair_id: pair.id });
            }
            Some(ApiErrorClass::NotFound) => {
                debug!(pair = pair.id, "remote side does not exist, treating as deletion");
                if let Ok(affected) = self.dao.mark_remotely_deleted(pair).await {
                    for touched in &affected {
                        self.queue.push(QueueItem::from(touched)).await;
                    }
                }
            }
            _ if is_disk_full(&err) => {
                let path = pair.local_path.clone().unwrap_or_default();
                warn!(pair = pair.id, path = %path, "no space left on device");
                let _ = self.events.send(EngineEvent::DiskFull { path });
                let _ = self.dao.increase_error(pair.id, &err.to_string(), None).await;
            }
            _ if is_transient(&err) => self.retry_later(pair, &err).await,
            _ => {
                // Unexpected: developer error or an invariant violation.
                warn!(pair = pair.id, error = %err, "parking pair after unexpected error");
                let _ = self
                    .dao
                    .park_pair(pair.id, &err.to_string(), self.max_errors)
                    .await;
                let _ = self.events.send(EngineEvent::NewError { pair_id: pair.id });
            }
        }
    }

    async fn retry_later(&self, pair: &DocPair, err: &ProcessorError) {
        let count = match self
            .dao
            .increase_error(pair.id, &err.to_string(), Some(&format!("{err:?}")))
            .await
        {
            Ok(count) => count,
            Err(db_err) => {
                warn!(pair = pair.id, error = %db_err, "cannot record error");
                return;
            }
        };
        if count >= self.max_errors {
            info!(pair = pair.id, count, "too many errors, parked until retried");
            let _ = self.events.send(EngineEvent::NewError { pair_id: pair.id });
            return;
        }
        let delay = self.backoff.delay(count.try_into().unwrap_or(u32::MAX));
        let queue = Arc::clone(&self.queue);
        let dao = Arc::clone(&self.dao);
        let pair_id = pair.id;
        debug!(pair = pair_id, count, delay_ms = delay.as_millis() as u64, "retrying later");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(Some(fresh)) = dao.pair_by_id(pair_id).await {
                queue.push(QueueItem::from(&fresh)).await;
            }
        });
    }
}

fn api_class(err: &ProcessorError) -> Option<ApiErrorClass> {
    match err {
        ProcessorError::Api(api) => api.classification(),
        ProcessorError::Transfer(TransferError::Api(api)) => api.classification(),
        _ => None,
    }
}

fn is_transient(err: &ProcessorError) -> bool {
    match err {
        ProcessorError::Api(api) => api.is_retryable(),
        ProcessorError::Transfer(TransferError::Api(api)) => api.is_retryable(),
        // A failed integrity check re-downloads from scratch.
        ProcessorError::Transfer(TransferError::DigestMismatch { .. }) => true,
        ProcessorError::Transfer(TransferError::Stream(_)) => true,
        ProcessorError::MissingParent(_) => true,
        _ => false,
    }
}

fn is_disk_full(err: &ProcessorError) -> bool {
    fn io_full(io_err: &io::Error) -> bool {
        io_err.raw_os_error() == Some(28) // ENOSPC
    }
    match err {
        ProcessorError::Local(LocalError::Io(io_err)) => io_full(io_err),
        ProcessorError::Transfer(TransferError::Io(io_err)) => io_full(io_err),
        ProcessorError::Transfer(TransferError::Local(LocalError::Io(io_err))) => io_full(io_err),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;
    use std::path::Path;
    use tempfile::tempdir;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::sync::local::LocalInfo;
    use crate::sync::transfer::TransferConfig;

    const ROOT: &str = "root#1";

    struct Rig {
        dao: Arc<EngineDao>,
        local: LocalClient,
        queue: Arc<QueueManager>,
        processor: Processor,
        events: broadcast::Receiver<EngineEvent>,
    }

    async fn setup(server: &MockServer, root: &Path) -> Rig {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let dao = Arc::new(EngineDao::from_pool(pool));
        dao.init().await.unwrap();
        let local = LocalClient::new(root.to_path_buf(), vec![".".into()], vec![".tmp".into()]);
        let client = NuxeoClient::new(&server.uri(), "token").unwrap();
        let stop = StopToken::new();
        let transfer = TransferEngine::new(
            client.clone(),
            Arc::clone(&dao),
            local.clone(),
            TransferConfig::default(),
            stop.clone(),
        );
        let queue = Arc::new(QueueManager::new(64));
        let (events_tx, events_rx) = broadcast::channel(64);
        let processor = Processor::new(
            Arc::clone(&dao),
            client,
            local.clone(),
            transfer,
            Arc::clone(&queue),
            WriteMonitor::default(),
            stop,
            events_tx,
            3,
            ROOT.to_string(),
        );
        Rig {
            dao,
            local,
            queue,
            processor,
            events: events_rx,
        }
    }

    fn local_info(path: &str, digest: &str) -> LocalInfo {
        LocalInfo {
            path: path.to_string(),
            name: crate::sync::dao::name_of(path),
            folderish: false,
            size: 5,
            last_modified: 1_700_000_000,
            digest: Some(digest.to_string()),
            digest_algorithm: "md5".to_string(),
        }
    }

    fn fs_item_json(uid: &str, name: &str, digest: &str) -> serde_json::Value {
        serde_json::json!({
            "id": uid,
            "parentId": ROOT,
            "name": name,
            "folder": false,
            "lastModificationDate": 1_700_000_000_000i64,
            "digest": digest,
            "digestAlgorithm": "md5",
            "canRename": true,
            "canDelete": true,
            "canUpdate": true
        })
    }

    #[tokio::test]
    async fn simple_upload_reaches_synchronized() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;
        rig.local.make_file("/a.txt", b"hello").await.unwrap();

        Mock::given(method("POST"))
            .and(path("/nuxeo/api/v1/upload/"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({ "batchId": "batch-1" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/nuxeo/api/v1/upload/batch-1/0"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/nuxeo/site/automation/NuxeoDrive.CreateFile"))
            .and(body_partial_json(serde_json::json!({
                "params": { "parentId": ROOT, "name": "a.txt" },
                "input": "upload:batch-1:0"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(fs_item_json(
                    "doc#1",
                    "a.txt",
                    "5d41402abc4b2a76b9719d911017c592",
                )),
            )
            .mount(&server)
            .await;

        let pair = rig
            .dao
            .insert_local_state(
                &local_info("/a.txt", "5d41402abc4b2a76b9719d911017c592"),
                None,
                LocalState::Created,
            )
            .await
            .unwrap();
        rig.processor.process_item(QueueItem::from(&pair)).await;

        let pair = rig.dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::Synchronized);
        assert_eq!(pair.remote_ref.as_deref(), Some("doc#1"));
        assert_eq!(pair.last_transfer.as_deref(), Some("upload"));
        assert_eq!(
            pair.local_digest.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[tokio::test]
    async fn remote_create_downloads_and_synchronizes() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;

        let mut item = fs_item_json("doc#1", "a.txt", "5d41402abc4b2a76b9719d911017c592");
        item["downloadURL"] = serde_json::json!(format!("{}/blob", server.uri()));
        Mock::given(method("POST"))
            .and(path("/nuxeo/site/automation/NuxeoDrive.GetFileSystemItem"))
            .respond_with(ResponseTemplate::new(200).set_body_json(item))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let info = RemoteFileInfo {
            uid: "doc#1".into(),
            parent_uid: Some(ROOT.into()),
            name: "a.txt".into(),
            path: None,
            folderish: false,
            last_modification: Some(1_700_000_000),
            creation: None,
            digest: Some("5d41402abc4b2a76b9719d911017c592".into()),
            digest_algorithm: Some("md5".into()),
            download_url: None,
            can_rename: true,
            can_delete: true,
            can_update: true,
            can_create_child: false,
            can_scroll_descendants: false,
        };
        let pair = rig.dao.insert_remote_state(&info, "/a.txt", "/").await.unwrap();
        rig.processor.process_item(QueueItem::from(&pair)).await;

        assert_eq!(rig.local.read("/a.txt").await.unwrap(), b"hello");
        let pair = rig.dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::Synchronized);
        assert_eq!(pair.last_transfer.as_deref(), Some("download"));
    }

    #[tokio::test]
    async fn stale_version_stamp_is_skipped() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;

        let pair = rig
            .dao
            .insert_local_state(&local_info("/a.txt", "d"), None, LocalState::Created)
            .await
            .unwrap();
        let stale = QueueItem {
            version: pair.version - 1,
            ..QueueItem::from(&pair)
        };
        // No HTTP mock mounted: a dispatch would fail loudly.
        rig.processor.process_item(stale).await;
        let unchanged = rig.dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert_eq!(unchanged.version, pair.version);
        assert_eq!(unchanged.error_count, 0);
    }

    #[tokio::test]
    async fn local_deletion_deletes_remote_and_forgets_the_pair() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;

        Mock::given(method("POST"))
            .and(path("/nuxeo/site/automation/NuxeoDrive.Delete"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let pair = rig
            .dao
            .insert_local_state(&local_info("/a.txt", "d"), None, LocalState::Created)
            .await
            .unwrap();
        let pair = rig
            .dao
            .synchronize_pair(&pair, Some("doc#1"), Some(ROOT), Some("a.txt"), None, None, None, 1)
            .await
            .unwrap();
        let affected = rig.dao.mark_locally_deleted(&pair).await.unwrap();

        rig.processor
            .process_item(QueueItem::from(&affected[0]))
            .await;
        assert!(rig.dao.pair_by_id(pair.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remote_deletion_removes_local_file_without_remote_calls() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;
        rig.local.make_file("/a.txt", b"x").await.unwrap();

        let pair = rig
            .dao
            .insert_local_state(&local_info("/a.txt", "d"), None, LocalState::Created)
            .await
            .unwrap();
        let pair = rig
            .dao
            .synchronize_pair(&pair, Some("doc#1"), Some(ROOT), Some("a.txt"), None, None, None, 1)
            .await
            .unwrap();
        let affected = rig.dao.mark_remotely_deleted(&pair).await.unwrap();

        rig.processor
            .process_item(QueueItem::from(&affected[0]))
            .await;
        assert!(!rig.local.exists("/a.txt").await);
        assert!(rig.dao.pair_by_id(pair.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_failure_counts_and_does_not_park_early() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;
        rig.local.make_file("/a.txt", b"hello").await.unwrap();

        Mock::given(method("POST"))
            .and(path("/nuxeo/api/v1/upload/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let pair = rig
            .dao
            .insert_local_state(&local_info("/a.txt", "d"), None, LocalState::Created)
            .await
            .unwrap();
        rig.processor.process_item(QueueItem::from(&pair)).await;

        let pair = rig.dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert_eq!(pair.error_count, 1);
        assert_ne!(pair.pair_state, PairState::Synchronized);
    }

    #[tokio::test]
    async fn permission_denied_parks_the_pair() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let mut rig = setup(&server, dir.path()).await;
        rig.local.make_file("/a.txt", b"hello").await.unwrap();

        Mock::given(method("POST"))
            .and(path("/nuxeo/api/v1/upload/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let pair = rig
            .dao
            .insert_local_state(&local_info("/a.txt", "d"), None, LocalState::Created)
            .await
            .unwrap();
        rig.processor.process_item(QueueItem::from(&pair)).await;

        let pair = rig.dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert!(pair.error_count >= 3);
        assert!(rig.dao.parked_pairs(3).await.unwrap().len() == 1);
        let event = rig.events.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::NewError { .. }));
    }

    #[tokio::test]
    async fn missing_remote_turns_into_remote_deletion() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;

        Mock::given(method("POST"))
            .and(path("/nuxeo/site/automation/NuxeoDrive.GetFileSystemItem"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let info = RemoteFileInfo {
            uid: "doc#1".into(),
            parent_uid: Some(ROOT.into()),
            name: "a.txt".into(),
            path: None,
            folderish: false,
            last_modification: None,
            creation: None,
            digest: Some("d".into()),
            digest_algorithm: Some("md5".into()),
            download_url: None,
            can_rename: true,
            can_delete: true,
            can_update: true,
            can_create_child: false,
            can_scroll_descendants: false,
        };
        let pair = rig.dao.insert_remote_state(&info, "/a.txt", "/").await.unwrap();
        rig.processor.process_item(QueueItem::from(&pair)).await;

        let pair = rig.dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::RemotelyDeleted);
    }

    #[tokio::test]
    async fn remote_move_relocates_the_local_file() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;
        rig.local.make_file("/a.txt", b"x").await.unwrap();

        let info = RemoteFileInfo {
            uid: "doc#1".into(),
            parent_uid: Some(ROOT.into()),
            name: "a.txt".into(),
            path: None,
            folderish: false,
            last_modification: Some(1),
            creation: None,
            digest: Some("d".into()),
            digest_algorithm: Some("md5".into()),
            download_url: None,
            can_rename: true,
            can_delete: true,
            can_update: true,
            can_create_child: false,
            can_scroll_descendants: false,
        };
        let pair = rig.dao.insert_remote_state(&info, "/a.txt", "/").await.unwrap();
        let pair = rig
            .dao
            .synchronize_pair(&pair, None, Some(ROOT), Some("a.txt"), Some("d"), Some("d"), None, 1)
            .await
            .unwrap();

        let mut renamed = info.clone();
        renamed.name = "b.txt".into();
        let pair = rig
            .dao
            .update_remote_state(&pair, &renamed, RemoteState::Moved)
            .await
            .unwrap();
        assert_eq!(pair.pair_state, PairState::RemotelyMoved);

        rig.processor.process_item(QueueItem::from(&pair)).await;
        assert!(rig.local.exists("/b.txt").await);
        assert!(!rig.local.exists("/a.txt").await);
        let pair = rig.dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::Synchronized);
        assert_eq!(pair.local_path.as_deref(), Some("/b.txt"));
    }

    #[tokio::test]
    async fn move_target_taken_by_local_create_becomes_conflicted() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let rig = setup(&server, dir.path()).await;
        rig.local.make_file("/a.txt", b"x").await.unwrap();
        rig.local.make_file("/b.txt", b"y").await.unwrap();

        let info = RemoteFileInfo {
            uid: "doc#1".into(),
            parent_uid: Some(ROOT.into()),
            name: "a.txt".into(),
            path: None,
            folderish: false,
            last_modification: Some(1),
            creation: None,
            digest: Some("d".into()),
            digest_algorithm: Some("md5".into()),
            download_url: None,
            can_rename: true,
            can_delete: true,
            can_update: true,
            can_create_child: false,
            can_scroll_descendants: false,
        };
        let pair = rig.dao.insert_remote_state(&info, "/a.txt", "/").await.unwrap();
        let pair = rig
            .dao
            .synchronize_pair(&pair, None, Some(ROOT), Some("a.txt"), Some("d"), Some("d"), None, 1)
            .await
            .unwrap();
        // A fresh local file claims the move target.
        rig.dao
            .insert_local_state(&local_info("/b.txt", "y-digest"), None, LocalState::Created)
            .await
            .unwrap();

        let mut renamed = info.clone();
        renamed.name = "b.txt".into();
        let pair = rig
            .dao
            .update_remote_state(&pair, &renamed, RemoteState::Moved)
            .await
            .unwrap();
        rig.processor.process_item(QueueItem::from(&pair)).await;

        let pair = rig.dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::Conflicted);
        // Nothing moved on disk.
        assert_eq!(rig.local.read("/a.txt").await.unwrap(), b"x");
        assert_eq!(rig.local.read("/b.txt").await.unwrap(), b"y");
    }
}
