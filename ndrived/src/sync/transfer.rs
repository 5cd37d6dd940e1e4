use std::io::SeekFrom;
use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use ndrive_core::{NuxeoClient, NuxeoError, RemoteFileInfo};

use super::dao::{DaoError, DocPair, EngineDao};
use super::ledger::{TransferStatus, Upload};
use super::local::{LocalClient, LocalError};
use super::stop::StopToken;

/// Staging area for in-flight downloads, hidden from the watcher by its
/// leading dot.
const TMP_DIR: &str = "/.ndrive-tmp";

/// Bytes streamed between two status re-reads.
const SUSPENSION_INTERVAL: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("api error: {0}")]
    Api(#[from] NuxeoError),
    #[error("database error: {0}")]
    Dao(#[from] DaoError),
    #[error("local error: {0}")]
    Local(#[from] LocalError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream error: {0}")]
    Stream(#[from] reqwest::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("source file disappeared: {0}")]
    SourceVanished(String),
    #[error("transfer row vanished: {0}")]
    MissingRow(i64),
}

impl TransferError {
    /// Filesystem race during an upload: the pair is locally deleted, not in
    /// error.
    pub fn is_source_vanished(&self) -> bool {
        matches!(self, TransferError::SourceVanished(_))
    }
}

/// How a transfer attempt ended. Interruptions are not errors: progress is
/// persisted and the worker is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Interrupted(TransferStatus),
}

/// The commit step an upload finishes with.
#[derive(Debug, Clone)]
pub enum LinkStep {
    /// `NuxeoDrive.CreateFile` under a parent (continuous sync create).
    CreateFile { parent_ref: String, name: String },
    /// `NuxeoDrive.UpdateFile` on an existing item (content update).
    UpdateFile { fs_item_id: String },
    /// `Blob.AttachOnDocument` (Direct Transfer).
    AttachToDoc { doc_ref: String, xpath: String },
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Chunking starts above this size.
    pub chunk_limit: u64,
    pub chunk_size: u64,
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_limit: 20 * 1024 * 1024,
            chunk_size: 20 * 1024 * 1024,
            download_concurrency: 4,
            upload_concurrency: 2,
        }
    }
}

/// Chunked, resumable transfer engine shared by the processor and the
/// Direct Transfer manager.
#[derive(Clone)]
pub struct TransferEngine {
    client: NuxeoClient,
    dao: Arc<EngineDao>,
    local: LocalClient,
    config: TransferConfig,
    stop: StopToken,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

impl TransferEngine {
    pub fn new(
        client: NuxeoClient,
        dao: Arc<EngineDao>,
        local: LocalClient,
        config: TransferConfig,
        stop: StopToken,
    ) -> Self {
        Self {
            client,
            dao,
            local,
            config,
            stop,
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Deterministic staging path so a restarted engine finds the partial
    /// blob again.
    pub fn tmp_path_for(pair_id: i64) -> String {
        format!("{TMP_DIR}/{pair_id}.ndpart")
    }

    //
    // Download
    //

    /// Streams a blob into the staging file, verifies its digest and moves
    /// it into place. Resumes from whatever the staging file already holds.
    pub async fn download(
        &self,
        pair: &DocPair,
        info: &RemoteFileInfo,
    ) -> Result<TransferOutcome, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .expect("transfer semaphore closed");

        let local_path = pair
            .local_path
            .clone()
            .unwrap_or_else(|| format!("/{}", info.name));
        let tmp_path = Self::tmp_path_for(pair.id);
        let download_url = info
            .download_url
            .clone()
            .ok_or(NuxeoError::MissingField("downloadURL"))?;

        let row = match self.dao.download_for_pair(pair.id).await? {
            Some(row) if row.status.is_resumable() => row,
            _ => {
                self.dao
                    .insert_download(
                        pair.id,
                        &local_path,
                        &tmp_path,
                        info_size(info),
                        info.digest.as_deref(),
                        info.digest_algorithm.as_deref(),
                    )
                    .await?
            }
        };
        self.dao
            .set_download_status(row.uid, TransferStatus::Ongoing)
            .await?;

        let tmp_abs = self.local.abspath(&tmp_path)?;
        if let Some(parent) = tmp_abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let offset = match tokio::fs::metadata(&tmp_abs).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut stream = match self.client.download(&download_url, offset).await {
            Ok(stream) => stream,
            Err(err) if err.is_not_found() => {
                // Deleted remotely while we were at it: no local file may
                // appear.
                self.discard_download(row.uid, &tmp_path).await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&tmp_abs)
            .await?;
        let mut written = offset;
        let mut since_check = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            since_check += chunk.len() as u64;
            if since_check >= SUSPENSION_INTERVAL {
                since_check = 0;
                self.dao.set_download_progress(row.uid, written as i64).await?;
                if let Some(outcome) = self.download_suspension_point(row.uid, &tmp_path).await? {
                    file.flush().await?;
                    return Ok(outcome);
                }
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        self.dao.set_download_progress(row.uid, written as i64).await?;

        // Integrity before the blob becomes visible.
        if let Some(expected) = info.digest.as_deref() {
            let algo = info.digest_algorithm.as_deref().unwrap_or("md5");
            let actual = self.local.get_digest(&tmp_path, algo).await?;
            if actual != expected.to_ascii_lowercase() {
                self.discard_download(row.uid, &tmp_path).await?;
                return Err(TransferError::DigestMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
        }

        let final_abs = self.local.abspath(&local_path)?;
        if let Some(parent) = final_abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&tmp_abs, &final_abs).await?;
        self.local.set_remote_id(&local_path, &info.uid)?;

        self.dao
            .set_download_status(row.uid, TransferStatus::Done)
            .await?;
        self.dao.remove_download(row.uid).await?;
        debug!(path = %local_path, bytes = written, "download done");
        Ok(TransferOutcome::Completed)
    }

    async fn download_suspension_point(
        &self,
        uid: i64,
        tmp_path: &str,
    ) -> Result<Option<TransferOutcome>, TransferError> {
        if self.stop.is_stopping() || self.stop.is_paused() {
            self.dao
                .set_download_status(uid, TransferStatus::Suspended)
                .await?;
            return Ok(Some(TransferOutcome::Interrupted(TransferStatus::Suspended)));
        }
        let row = self
            .dao
            .download_by_uid(uid)
            .await?
            .ok_or(TransferError::MissingRow(uid))?;
        match row.status {
            TransferStatus::Ongoing => Ok(None),
            TransferStatus::Cancelled => {
                self.discard_download(uid, tmp_path).await?;
                Ok(Some(TransferOutcome::Interrupted(TransferStatus::Cancelled)))
            }
            status => Ok(Some(TransferOutcome::Interrupted(status))),
        }
    }

    async fn discard_download(&self, uid: i64, tmp_path: &str) -> Result<(), TransferError> {
        if let Ok(tmp_abs) = self.local.abspath(tmp_path) {
            let _ = tokio::fs::remove_file(tmp_abs).await;
        }
        self.dao.remove_download(uid).await?;
        Ok(())
    }

    //
    // Upload
    //

    /// Streams a local file into a server batch, chunked above the
    /// configured limit. Returns the ledger row ready for the link step.
    pub async fn upload(
        &self,
        row: &Upload,
    ) -> Result<(TransferOutcome, Upload), TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .expect("transfer semaphore closed");

        // Session rows carry absolute source paths (Direct Transfer uploads
        // anything, not just the synced root); pair rows are root-relative.
        let source_abs = if row.session_id.is_some() {
            std::path::PathBuf::from(&row.path)
        } else {
            self.local.abspath(&row.path)?
        };
        let meta = match tokio::fs::metadata(&source_abs).await {
            Ok(meta) => meta,
            Err(_) => return Err(TransferError::SourceVanished(row.path.clone())),
        };
        let filesize = meta.len();
        let name = super::dao::name_of(&row.path);

        // Acquire or revalidate the server batch.
        let batch_id = match &row.batch_id {
            Some(batch_id) => match self.client.batch_file_info(batch_id, row.file_idx as u32).await {
                Ok(_) => batch_id.clone(),
                Err(err) if err.is_not_found() => {
                    info!(batch_id = %batch_id, "server lost the batch, starting over");
                    self.dao.reset_upload_progress(row.uid).await?;
                    let batch = self.client.create_batch().await?;
                    batch.batch_id
                }
                Err(err) => return Err(err.into()),
            },
            None => self.client.create_batch().await?.batch_id,
        };

        if filesize <= self.config.chunk_limit {
            if let Some(outcome) = self.upload_suspension_point(row.uid).await? {
                return Ok((outcome, self.upload_row(row.uid).await?));
            }
            let content = tokio::fs::read(&source_abs)
                .await
                .map_err(|_| TransferError::SourceVanished(row.path.clone()))?;
            self.dao
                .set_upload_batch(row.uid, &batch_id, row.file_idx, filesize as i64, 1)
                .await?;
            self.client
                .upload_whole(&batch_id, row.file_idx as u32, &name, content)
                .await?;
            self.dao.set_upload_progress(row.uid, filesize as i64).await?;
            return Ok((TransferOutcome::Completed, self.upload_row(row.uid).await?));
        }

        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = filesize.div_ceil(chunk_size);
        self.dao
            .set_upload_batch(
                row.uid,
                &batch_id,
                row.file_idx,
                chunk_size as i64,
                chunk_count as i64,
            )
            .await?;

        // Chunks already on the server are skipped; uploads are idempotent
        // per (batch, file, index).
        let uploaded: Vec<u32> = self
            .client
            .batch_file_info(&batch_id, row.file_idx as u32)
            .await
            .map(|info| info.uploaded_chunk_ids)
            .unwrap_or_default();

        let mut file = tokio::fs::File::open(&source_abs)
            .await
            .map_err(|_| TransferError::SourceVanished(row.path.clone()))?;
        let mut uploaded_bytes = (uploaded.len() as u64).saturating_mul(chunk_size);

        for index in 0..chunk_count {
            if uploaded.contains(&(index as u32)) {
                continue;
            }
            if let Some(outcome) = self.upload_suspension_point(row.uid).await? {
                return Ok((outcome, self.upload_row(row.uid).await?));
            }

            let offset = index * chunk_size;
            let len = chunk_size.min(filesize - offset) as usize;
            let mut buffer = vec![0u8; len];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buffer)
                .await
                .map_err(|_| TransferError::SourceVanished(row.path.clone()))?;

            self.client
                .upload_chunk(
                    &batch_id,
                    row.file_idx as u32,
                    index as u32,
                    chunk_count as u32,
                    &name,
                    filesize,
                    buffer,
                )
                .await?;
            uploaded_bytes = (uploaded_bytes + len as u64).min(filesize);
            self.dao
                .set_upload_progress(row.uid, uploaded_bytes as i64)
                .await?;
        }

        Ok((TransferOutcome::Completed, self.upload_row(row.uid).await?))
    }

    async fn upload_row(&self, uid: i64) -> Result<Upload, TransferError> {
        self.dao
            .upload_by_uid(uid)
            .await?
            .ok_or(TransferError::MissingRow(uid))
    }

    async fn upload_suspension_point(
        &self,
        uid: i64,
    ) -> Result<Option<TransferOutcome>, TransferError> {
        if self.stop.is_stopping() || self.stop.is_paused() {
            self.dao
                .set_upload_status(uid, TransferStatus::Suspended)
                .await?;
            return Ok(Some(TransferOutcome::Interrupted(TransferStatus::Suspended)));
        }
        let row = self.upload_row(uid).await?;
        match row.status {
            TransferStatus::Ongoing => Ok(None),
            status => Ok(Some(TransferOutcome::Interrupted(status))),
        }
    }

    /// Commits an uploaded batch to a document. A `502`/`503` on the commit
    /// is probed for idempotent completion before being reported.
    pub async fn link_upload(
        &self,
        row: &Upload,
        step: &LinkStep,
        expected_digest: Option<&str>,
    ) -> Result<Option<RemoteFileInfo>, TransferError> {
        let batch_id = row
            .batch_id
            .clone()
            .ok_or(NuxeoError::MissingField("batchId"))?;
        let file_idx = row.file_idx as u32;

        let result = match step {
            LinkStep::CreateFile { parent_ref, name } => self
                .client
                .create_file_with_batch(parent_ref, name, &batch_id, file_idx)
                .await
                .map(Some),
            LinkStep::UpdateFile { fs_item_id } => self
                .client
                .update_file_with_batch(fs_item_id, &batch_id, file_idx)
                .await
                .map(Some),
            LinkStep::AttachToDoc { doc_ref, xpath } => self
                .client
                .attach_blob(&batch_id, file_idx, doc_ref, xpath)
                .await
                .map(|_| None),
        };

        let info = match result {
            Ok(info) => info,
            Err(err) if is_gateway_flap(&err) => {
                warn!(error = %err, "commit answered a gateway error, probing for completion");
                match self.probe_link(step).await? {
                    Some(info) => {
                        info!("commit had succeeded server-side");
                        Some(info)
                    }
                    None => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        // Server-computed digest must match the source.
        if let (Some(expected), Some(info)) = (expected_digest, info.as_ref())
            && let Some(server_digest) = info.digest.as_deref()
            && server_digest != expected
        {
            return Err(TransferError::DigestMismatch {
                expected: expected.to_string(),
                actual: server_digest.to_string(),
            });
        }
        Ok(info)
    }

    async fn probe_link(&self, step: &LinkStep) -> Result<Option<RemoteFileInfo>, TransferError> {
        match step {
            LinkStep::CreateFile { parent_ref, name } => {
                let children = self.client.get_fs_children(parent_ref).await?;
                Ok(children.into_iter().find(|child| child.name == *name))
            }
            LinkStep::UpdateFile { fs_item_id } => {
                Ok(self.client.get_fs_info(fs_item_id).await?)
            }
            LinkStep::AttachToDoc { .. } => {
                // No cheap probe on a bare document ref; report the error.
                Ok(None)
            }
        }
    }

    //
    // Cancellation cleanup
    //

    /// One GC cycle over cancelled transfers: staged blobs and server
    /// batches are dropped before the rows go away.
    pub async fn cleanup_cancelled(&self) -> Result<usize, TransferError> {
        let (downloads, uploads) = self.dao.cancelled_transfers().await?;
        let mut cleaned = 0;
        for download in downloads {
            if let Ok(tmp_abs) = self.local.abspath(&download.tmp_path) {
                let _ = tokio::fs::remove_file(tmp_abs).await;
            }
            self.dao.remove_download(download.uid).await?;
            cleaned += 1;
        }
        for upload in uploads {
            if let Some(batch_id) = &upload.batch_id
                && let Err(err) = self.client.cancel_batch(batch_id).await
            {
                warn!(batch_id = %batch_id, error = %err, "cannot drop server batch, leaving the row");
                continue;
            }
            self.dao.remove_upload(upload.uid).await?;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

fn info_size(_info: &RemoteFileInfo) -> i64 {
    // The Drive item payload has no size field; the ledger learns it as
    // bytes arrive.
    0
}

fn is_gateway_flap(err: &NuxeoError) -> bool {
    matches!(
        err,
        NuxeoError::Api { status, .. }
            if status.as_u16() == 502 || status.as_u16() == 503
    )
}
