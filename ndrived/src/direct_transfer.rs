//! Direct Transfer: user-initiated bulk upload to an arbitrary remote
//! location, independent from the continuous sync pipeline. Shares the
//! transfer machinery and ledger, but runs its own single-threaded drain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use ndrive_core::{NuxeoClient, NuxeoError};

use crate::sync::dao::{DaoError, EngineDao};
use crate::sync::ledger::{DuplicateBehavior, Session, TransferStatus, Upload};
use crate::sync::local::LocalInfo;
use crate::sync::states::LocalState;
use crate::sync::stop::StopToken;
use crate::sync::transfer::{LinkStep, TransferEngine, TransferError, TransferOutcome};

const BLOB_XPATH: &str = "file:content";
const FOLDER_TYPE: &str = "Folder";
const FILE_TYPE: &str = "File";

#[derive(Debug, Error)]
pub enum DirectTransferError {
    #[error("api error: {0}")]
    Api(#[from] NuxeoError),
    #[error("database error: {0}")]
    Dao(#[from] DaoError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no session with id {0}")]
    MissingSession(i64),
    #[error("nothing to upload under {0}")]
    EmptyPlan(String),
}

/// Synchronous duplicate decision, consulted exactly once per file when a
/// same-named sibling is found. The default resolver answers with the
/// session's recorded behavior.
pub type DuplicateResolver = Arc<dyn Fn(&str, DuplicateBehavior) -> DuplicateBehavior + Send + Sync>;

pub struct DirectTransferManager {
    dao: Arc<EngineDao>,
    client: NuxeoClient,
    transfer: TransferEngine,
    stop: StopToken,
    resolver: DuplicateResolver,
}

impl DirectTransferManager {
    pub fn new(
        dao: Arc<EngineDao>,
        client: NuxeoClient,
        transfer: TransferEngine,
        stop: StopToken,
    ) -> Self {
        Self {
            dao,
            client,
            transfer,
            stop,
            resolver: Arc::new(|_, session_default| session_default),
        }
    }

    /// Installs the shell's duplicate-decision callback.
    pub fn with_resolver(mut self, resolver: DuplicateResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Creates a session from a set of local paths: folders are expanded
    /// into file entries with their remote paths precomputed.
    pub async fn plan_session(
        &self,
        local_paths: &[PathBuf],
        remote_parent_path: &str,
        remote_parent_ref: &str,
        behavior: DuplicateBehavior,
        priority: i64,
    ) -> Result<Session, DirectTransferError> {
        let mut entries = Vec::new();
        for path in local_paths {
            expand_path(path, "", &mut entries)?;
        }
        if entries.is_empty() {
            return Err(DirectTransferError::EmptyPlan(
                remote_parent_path.to_string(),
            ));
        }

        let session = self
            .dao
            .create_session(
                remote_parent_path,
                remote_parent_ref,
                behavior,
                priority,
                now_unix(),
            )
            .await?;

        let mut total_bytes = 0i64;
        for entry in &entries {
            let remote_path = join_remote_path(remote_parent_path, &entry.remote_relative);
            total_bytes += entry.size as i64;
            let source = entry.local_path.to_string_lossy().into_owned();

            // Each planned file gets a pair manufactured in the `direct`
            // state; the continuous-sync pipeline leaves those alone.
            let pair_id = match self.dao.pair_by_local_path(&source).await? {
                Some(pair) => Some(pair.id),
                None => {
                    let info = LocalInfo {
                        path: source.clone(),
                        name: entry
                            .remote_relative
                            .rsplit('/')
                            .next()
                            .unwrap_or(&entry.remote_relative)
                            .to_string(),
                        folderish: false,
                        size: entry.size,
                        last_modified: now_unix(),
                        digest: None,
                        digest_algorithm: "md5".to_string(),
                    };
                    Some(
                        self.dao
                            .insert_local_state(&info, Some(session.id), LocalState::Direct)
                            .await?
                            .id,
                    )
                }
            };

            self.dao
                .insert_upload(
                    pair_id,
                    Some(session.id),
                    &source,
                    Some(remote_parent_ref),
                    Some(&remote_path),
                    entry.size as i64,
                    None,
                    None,
                )
                .await?;
        }
        self.dao
            .set_session_plan(session.id, entries.len() as i64, total_bytes)
            .await?;
        info!(
            session = session.id,
            files = entries.len(),
            bytes = total_bytes,
            "direct transfer planned"
        );
        self.dao
            .session_by_id(session.id)
            .await?
            .ok_or(DirectTransferError::MissingSession(session.id))
    }

    /// Drains one session to completion (or to its first interruption).
    /// Returns the session's status afterwards.
    pub async fn process_session(
        &self,
        session_id: i64,
    ) -> Result<TransferStatus, DirectTransferError> {
        let session = self
            .dao
            .session_by_id(session_id)
            .await?
            .ok_or(DirectTransferError::MissingSession(session_id))?;
        if session.status != TransferStatus::Ongoing {
            return Ok(session.status);
        }

        // Remote folders created (or found) so far, keyed by remote path.
        let mut folder_refs: HashMap<String, String> = HashMap::new();
        folder_refs.insert(
            session.remote_parent_path.clone(),
            session.remote_parent_ref.clone(),
        );

        for upload in self.dao.session_uploads(session_id).await? {
            if !upload.status.is_resumable() {
                continue;
            }
            if self.stop.is_stopping() {
                self.dao
                    .set_session_status(session_id, TransferStatus::Suspended, None)
                    .await?;
                return Ok(TransferStatus::Suspended);
            }
            let current = self
                .dao
                .session_by_id(session_id)
                .await?
                .ok_or(DirectTransferError::MissingSession(session_id))?;
            if current.status != TransferStatus::Ongoing {
                return Ok(current.status);
            }

            match self.process_upload(&current, &upload, &mut folder_refs).await {
                Ok(Some(interrupted)) => {
                    // Progress is persisted; the session resumes later.
                    debug!(session = session_id, upload = upload.uid, status = interrupted.as_str(), "upload interrupted");
                    if interrupted == TransferStatus::Suspended {
                        self.dao
                            .set_session_status(session_id, TransferStatus::Suspended, None)
                            .await?;
                    }
                    return Ok(interrupted);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(session = session_id, upload = upload.uid, error = %err, "upload failed");
                    self.dao
                        .increase_upload_error(upload.uid, &err.to_string())
                        .await?;
                    return Err(err);
                }
            }
        }

        self.dao
            .set_session_status(session_id, TransferStatus::Done, Some(now_unix()))
            .await?;
        info!(session = session_id, "direct transfer done");
        Ok(TransferStatus::Done)
    }

    /// One file: ensure its remote folder chain, settle the duplicate
    /// policy, stream the blob and attach it. `Some(status)` means the
    /// transfer was interrupted, not finished.
    async fn process_upload(
        &self,
        session: &Session,
        upload: &Upload,
        folder_refs: &mut HashMap<String, String>,
    ) -> Result<Option<TransferStatus>, DirectTransferError> {
        let remote_path = upload
            .remote_path
            .clone()
            .unwrap_or_else(|| session.remote_parent_path.clone());
        let (dir_path, name) = split_remote_path(&remote_path);

        let dir_ref = self
            .ensure_remote_folder(&session.remote_parent_path, &dir_path, folder_refs)
            .await?;

        // Same-named sibling: ask once, then act on the decision.
        let mut target_doc: Option<String> = None;
        let children = self.client.document_children(&dir_ref).await?;
        if let Some(existing) = children
            .iter()
            .find(|doc| doc.title.as_deref() == Some(name.as_str()))
        {
            let decision = (self.resolver)(&name, session.duplicate_behavior);
            match decision {
                DuplicateBehavior::Ignore => {
                    debug!(name = %name, "duplicate ignored");
                    self.dao
                        .set_upload_status(upload.uid, TransferStatus::Cancelled)
                        .await?;
                    return Ok(None);
                }
                DuplicateBehavior::Override => {
                    target_doc = Some(existing.uid.clone());
                }
                DuplicateBehavior::Create => {}
            }
        }

        self.dao
            .set_upload_status(upload.uid, TransferStatus::Ongoing)
            .await?;
        let (outcome, row) = self.transfer.upload(upload).await?;
        if let TransferOutcome::Interrupted(status) = outcome {
            return Ok(Some(status));
        }

        let doc_ref = match target_doc {
            Some(doc_ref) => doc_ref,
            None => {
                self.client
                    .create_document(&dir_ref, &name, FILE_TYPE)
                    .await?
            }
        };
        self.transfer
            .link_upload(
                &row,
                &LinkStep::AttachToDoc {
                    doc_ref,
                    xpath: BLOB_XPATH.to_string(),
                },
                None,
            )
            .await?;

        self.dao
            .set_upload_status(upload.uid, TransferStatus::Done)
            .await?;
        self.dao
            .record_session_upload(session.id, row.filesize)
            .await?;
        if let Some(pair_id) = upload.pair_id {
            // The manufactured pair served its purpose.
            self.dao.remove_pair(pair_id).await?;
        }
        Ok(None)
    }

    /// Walks the folder chain below the session root, creating missing
    /// remote folders and caching their refs.
    async fn ensure_remote_folder(
        &self,
        session_root: &str,
        dir_path: &str,
        folder_refs: &mut HashMap<String, String>,
    ) -> Result<String, DirectTransferError> {
        if let Some(existing) = folder_refs.get(dir_path) {
            return Ok(existing.clone());
        }
        let relative = dir_path
            .strip_prefix(session_root)
            .unwrap_or(dir_path)
            .trim_matches('/');

        let mut current_path = session_root.to_string();
        let mut current_ref = folder_refs
            .get(session_root)
            .cloned()
            .unwrap_or_else(|| session_root.to_string());
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            let next_path = join_remote_path(&current_path, segment);
            if let Some(cached) = folder_refs.get(&next_path) {
                current_ref = cached.clone();
                current_path = next_path;
                continue;
            }
            let children = self.client.document_children(&current_ref).await?;
            let next_ref = match children
                .iter()
                .find(|doc| doc.title.as_deref() == Some(segment))
            {
                Some(doc) => doc.uid.clone(),
                None => {
                    self.client
                        .create_document(&current_ref, segment, FOLDER_TYPE)
                        .await?
                }
            };
            folder_refs.insert(next_path.clone(), next_ref.clone());
            current_ref = next_ref;
            current_path = next_path;
        }
        Ok(current_ref)
    }

    //
    // Session control
    //

    pub async fn pause_session(&self, session_id: i64) -> Result<(), DirectTransferError> {
        self.dao
            .set_session_status(session_id, TransferStatus::Paused, None)
            .await?;
        Ok(())
    }

    pub async fn resume_session(&self, session_id: i64) -> Result<TransferStatus, DirectTransferError> {
        self.dao
            .set_session_status(session_id, TransferStatus::Ongoing, None)
            .await?;
        self.process_session(session_id).await
    }

    /// Cancels the session and all of its pending uploads; server batches
    /// are dropped by the next cleanup cycle.
    pub async fn cancel_session(&self, session_id: i64) -> Result<(), DirectTransferError> {
        for upload in self.dao.session_uploads(session_id).await? {
            if upload.status.is_resumable() {
                self.dao
                    .set_upload_status(upload.uid, TransferStatus::Cancelled)
                    .await?;
                if let Some(pair_id) = upload.pair_id {
                    self.dao.remove_pair(pair_id).await?;
                }
            }
        }
        self.dao
            .set_session_status(session_id, TransferStatus::Cancelled, Some(now_unix()))
            .await?;
        Ok(())
    }

    pub async fn change_priority(&self, session_id: i64, priority: i64) -> Result<(), DirectTransferError> {
        self.dao.set_session_priority(session_id, priority).await?;
        Ok(())
    }
}

struct PlannedFile {
    local_path: PathBuf,
    /// Path below the session's remote parent, `/`-separated.
    remote_relative: String,
    size: u64,
}

fn expand_path(
    path: &Path,
    prefix: &str,
    entries: &mut Vec<PlannedFile>,
) -> Result<(), DirectTransferError> {
    let meta = std::fs::metadata(path)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let relative = if prefix.is_empty() {
        name.clone()
    } else {
        format!("{prefix}/{name}")
    };
    if meta.is_dir() {
        let mut children: Vec<PathBuf> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        children.sort();
        for child in children {
            expand_path(&child, &relative, entries)?;
        }
    } else {
        entries.push(PlannedFile {
            local_path: path.to_path_buf(),
            remote_relative: relative,
            size: meta.len(),
        });
    }
    Ok(())
}

fn join_remote_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child.trim_matches('/'))
}

fn split_remote_path(path: &str) -> (String, String) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (String::new(), path.to_string()),
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
