//! Transfer ledger: the durable `Downloads`/`Uploads`/`Sessions` tables.
//!
//! Rows survive restarts so interrupted transfers resume where they stopped.

use sqlx::Row;
use thiserror::Error;

use super::dao::{DaoError, EngineDao};

#[derive(Debug, Error)]
#[error("invalid transfer field: {0}")]
pub struct InvalidTransferField(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Ongoing,
    /// User-initiated; resumable.
    Paused,
    /// Engine-initiated (stop/quit); resumed on next start.
    Suspended,
    Done,
    /// Must never resume; schedules cleanup.
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Ongoing => "ongoing",
            TransferStatus::Paused => "paused",
            TransferStatus::Suspended => "suspended",
            TransferStatus::Done => "done",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidTransferField> {
        match value {
            "ongoing" => Ok(TransferStatus::Ongoing),
            "paused" => Ok(TransferStatus::Paused),
            "suspended" => Ok(TransferStatus::Suspended),
            "done" => Ok(TransferStatus::Done),
            "cancelled" => Ok(TransferStatus::Cancelled),
            other => Err(InvalidTransferField(other.to_string())),
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            TransferStatus::Ongoing | TransferStatus::Paused | TransferStatus::Suspended
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateBehavior {
    Create,
    Ignore,
    Override,
}

impl DuplicateBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateBehavior::Create => "create",
            DuplicateBehavior::Ignore => "ignore",
            DuplicateBehavior::Override => "override",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidTransferField> {
        match value {
            "create" => Ok(DuplicateBehavior::Create),
            "ignore" => Ok(DuplicateBehavior::Ignore),
            "override" => Ok(DuplicateBehavior::Override),
            other => Err(InvalidTransferField(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub uid: i64,
    pub pair_id: Option<i64>,
    pub path: String,
    pub tmp_path: String,
    pub status: TransferStatus,
    pub filesize: i64,
    pub downloaded_size: i64,
    pub chunk_size: i64,
    pub digest: Option<String>,
    pub digest_algorithm: Option<String>,
    pub request_uid: Option<String>,
    pub error_count: i64,
    pub error_count_total: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub uid: i64,
    pub pair_id: Option<i64>,
    pub session_id: Option<i64>,
    pub path: String,
    pub remote_parent_ref: Option<String>,
    pub remote_path: Option<String>,
    pub status: TransferStatus,
    pub filesize: i64,
    pub uploaded_size: i64,
    pub chunk_size: i64,
    pub chunk_count: i64,
    pub batch_id: Option<String>,
    pub file_idx: i64,
    pub digest: Option<String>,
    pub digest_algorithm: Option<String>,
    pub request_uid: Option<String>,
    pub error_count: i64,
    pub error_count_total: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: i64,
    pub remote_parent_path: String,
    pub remote_parent_ref: String,
    pub status: TransferStatus,
    pub priority: i64,
    pub duplicate_behavior: DuplicateBehavior,
    pub planned_items: i64,
    pub uploaded_items: i64,
    pub total_bytes: i64,
    pub uploaded_bytes: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

const DOWNLOAD_COLUMNS: &str = "uid, pair_id, path, tmp_path, status, filesize, downloaded_size, \
     chunk_size, digest, digest_algorithm, request_uid, error_count, error_count_total, last_error";

const UPLOAD_COLUMNS: &str = "uid, pair_id, session_id, path, remote_parent_ref, remote_path, \
     status, filesize, uploaded_size, chunk_size, chunk_count, batch_id, file_idx, digest, \
     digest_algorithm, request_uid, error_count, error_count_total, last_error";

const SESSION_COLUMNS: &str = "id, remote_parent_path, remote_parent_ref, status, priority, \
     duplicate_behavior, planned_items, uploaded_items, total_bytes, uploaded_bytes, started_at, \
     finished_at";

impl EngineDao {
    //
    // Downloads
    //

    pub async fn insert_download(
        &self,
        pair_id: i64,
        path: &str,
        tmp_path: &str,
        filesize: i64,
        digest: Option<&str>,
        digest_algorithm: Option<&str>,
    ) -> Result<Download, DaoError> {
        sqlx::query(
            "INSERT INTO Downloads (pair_id, path, tmp_path, status, filesize, digest, \
                 digest_algorithm) \
             VALUES (?1, ?2, ?3, 'ongoing', ?4, ?5, ?6) \
             ON CONFLICT(pair_id) DO UPDATE SET \
                 path = excluded.path, tmp_path = excluded.tmp_path, status = 'ongoing', \
                 filesize = excluded.filesize, digest = excluded.digest, \
                 digest_algorithm = excluded.digest_algorithm",
        )
        .bind(pair_id)
        .bind(path)
        .bind(tmp_path)
        .bind(filesize)
        .bind(digest)
        .bind(digest_algorithm)
        .execute(self.pool())
        .await?;
        self.download_for_pair(pair_id)
            .await?
            .ok_or(DaoError::MissingPair(pair_id))
    }

    pub async fn download_for_pair(&self, pair_id: i64) -> Result<Option<Download>, DaoError> {
        let row = sqlx::query(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM Downloads WHERE pair_id = ?1"
        ))
        .bind(pair_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_download).transpose()
    }

    pub async fn download_by_uid(&self, uid: i64) -> Result<Option<Download>, DaoError> {
        let row = sqlx::query(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM Downloads WHERE uid = ?1"
        ))
        .bind(uid)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_download).transpose()
    }

    /// Monotonic within one attempt: a smaller value than the stored one is
    /// kept as-is.
    pub async fn set_download_progress(&self, uid: i64, downloaded: i64) -> Result<(), DaoError> {
        sqlx::query(
            "UPDATE Downloads SET downloaded_size = MAX(downloaded_size, ?1) WHERE uid = ?2",
        )
        .bind(downloaded)
        .bind(uid)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_download_status(
        &self,
        uid: i64,
        status: TransferStatus,
    ) -> Result<(), DaoError> {
        sqlx::query("UPDATE Downloads SET status = ?1 WHERE uid = ?2")
            .bind(status.as_str())
            .bind(uid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn remove_download(&self, uid: i64) -> Result<(), DaoError> {
        sqlx::query("DELETE FROM Downloads WHERE uid = ?1")
            .bind(uid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    //
    // Uploads
    //

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_upload(
        &self,
        pair_id: Option<i64>,
        session_id: Option<i64>,
        path: &str,
        remote_parent_ref: Option<&str>,
        remote_path: Option<&str>,
        filesize: i64,
        digest: Option<&str>,
        digest_algorithm: Option<&str>,
    ) -> Result<Upload, DaoError> {
        let result = sqlx::query(
            "INSERT INTO Uploads (pair_id, session_id, path, remote_parent_ref, remote_path, \
                 status, filesize, digest, digest_algorithm) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'ongoing', ?6, ?7, ?8)",
        )
        .bind(pair_id)
        .bind(session_id)
        .bind(path)
        .bind(remote_parent_ref)
        .bind(remote_path)
        .bind(filesize)
        .bind(digest)
        .bind(digest_algorithm)
        .execute(self.pool())
        .await?;
        self.upload_by_uid(result.last_insert_rowid())
            .await?
            .ok_or(DaoError::MissingPair(0))
    }

    pub async fn upload_by_uid(&self, uid: i64) -> Result<Option<Upload>, DaoError> {
        let row = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM Uploads WHERE uid = ?1"
        ))
        .bind(uid)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_upload).transpose()
    }

    /// The resumable upload owned by a pair, if any. A pair has at most one.
    pub async fn upload_for_pair(&self, pair_id: i64) -> Result<Option<Upload>, DaoError> {
        let row = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM Uploads WHERE pair_id = ?1 \
             AND status IN ('ongoing', 'paused', 'suspended')"
        ))
        .bind(pair_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_upload).transpose()
    }

    pub async fn session_uploads(&self, session_id: i64) -> Result<Vec<Upload>, DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM Uploads WHERE session_id = ?1 ORDER BY uid"
        ))
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(row_to_upload).collect()
    }

    pub async fn set_upload_batch(
        &self,
        uid: i64,
        batch_id: &str,
        file_idx: i64,
        chunk_size: i64,
        chunk_count: i64,
    ) -> Result<(), DaoError> {
        sqlx::query(
            "UPDATE Uploads SET batch_id = ?1, file_idx = ?2, chunk_size = ?3, chunk_count = ?4 \
             WHERE uid = ?5",
        )
        .bind(batch_id)
        .bind(file_idx)
        .bind(chunk_size)
        .bind(chunk_count)
        .bind(uid)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_upload_progress(&self, uid: i64, uploaded: i64) -> Result<(), DaoError> {
        sqlx::query("UPDATE Uploads SET uploaded_size = MAX(uploaded_size, ?1) WHERE uid = ?2")
            .bind(uploaded)
            .bind(uid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// A fresh attempt restarts progress accounting (a new batch may have
    /// been allocated).
    pub async fn reset_upload_progress(&self, uid: i64) -> Result<(), DaoError> {
        sqlx::query(
            "UPDATE Uploads SET uploaded_size = 0, batch_id = NULL, chunk_count = 0 \
             WHERE uid = ?1",
        )
        .bind(uid)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_upload_status(&self, uid: i64, status: TransferStatus) -> Result<(), DaoError> {
        sqlx::query("UPDATE Uploads SET status = ?1 WHERE uid = ?2")
            .bind(status.as_str())
            .bind(uid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn increase_upload_error(&self, uid: i64, error: &str) -> Result<i64, DaoError> {
        sqlx::query(
            "UPDATE Uploads SET error_count = error_count + 1, \
                 error_count_total = error_count_total + 1, last_error = ?1 \
             WHERE uid = ?2",
        )
        .bind(error)
        .bind(uid)
        .execute(self.pool())
        .await?;
        let row = sqlx::query("SELECT error_count FROM Uploads WHERE uid = ?1")
            .bind(uid)
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get("error_count")?)
    }

    pub async fn remove_upload(&self, uid: i64) -> Result<(), DaoError> {
        sqlx::query("DELETE FROM Uploads WHERE uid = ?1")
            .bind(uid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Transfers to restart automatically when the engine starts.
    pub async fn resumable_transfers(&self) -> Result<(Vec<Download>, Vec<Upload>), DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM Downloads \
             WHERE status IN ('ongoing', 'suspended') ORDER BY uid"
        ))
        .fetch_all(self.pool())
        .await?;
        let downloads = rows
            .into_iter()
            .map(row_to_download)
            .collect::<Result<Vec<_>, _>>()?;

        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM Uploads \
             WHERE status IN ('ongoing', 'suspended') ORDER BY uid"
        ))
        .fetch_all(self.pool())
        .await?;
        let uploads = rows
            .into_iter()
            .map(row_to_upload)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((downloads, uploads))
    }

    /// Cancelled transfers whose on-disk or server-side leftovers still need
    /// a cleanup pass.
    pub async fn cancelled_transfers(&self) -> Result<(Vec<Download>, Vec<Upload>), DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM Downloads WHERE status = 'cancelled' ORDER BY uid"
        ))
        .fetch_all(self.pool())
        .await?;
        let downloads = rows
            .into_iter()
            .map(row_to_download)
            .collect::<Result<Vec<_>, _>>()?;

        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM Uploads WHERE status = 'cancelled' ORDER BY uid"
        ))
        .fetch_all(self.pool())
        .await?;
        let uploads = rows
            .into_iter()
            .map(row_to_upload)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((downloads, uploads))
    }

    /// Engine stop: park every live transfer so the next start resumes it.
    pub async fn suspend_ongoing_transfers(&self) -> Result<(), DaoError> {
        sqlx::query("UPDATE Downloads SET status = 'suspended' WHERE status = 'ongoing'")
            .execute(self.pool())
            .await?;
        sqlx::query("UPDATE Uploads SET status = 'suspended' WHERE status = 'ongoing'")
            .execute(self.pool())
            .await?;
        Ok(())
    }

    //
    // Direct Transfer sessions
    //

    pub async fn create_session(
        &self,
        remote_parent_path: &str,
        remote_parent_ref: &str,
        duplicate_behavior: DuplicateBehavior,
        priority: i64,
        started_at: i64,
    ) -> Result<Session, DaoError> {
        let result = sqlx::query(
            "INSERT INTO Sessions (remote_parent_path, remote_parent_ref, status, priority, \
                 duplicate_behavior, started_at) \
             VALUES (?1, ?2, 'ongoing', ?3, ?4, ?5)",
        )
        .bind(remote_parent_path)
        .bind(remote_parent_ref)
        .bind(priority)
        .bind(duplicate_behavior.as_str())
        .bind(started_at)
        .execute(self.pool())
        .await?;
        self.session_by_id(result.last_insert_rowid())
            .await?
            .ok_or(DaoError::MissingPair(0))
    }

    pub async fn session_by_id(&self, id: i64) -> Result<Option<Session>, DaoError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM Sessions WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_session).transpose()
    }

    /// Sessions that still have work, highest priority first.
    pub async fn active_sessions(&self) -> Result<Vec<Session>, DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM Sessions WHERE status = 'ongoing' \
             ORDER BY priority DESC, id ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(row_to_session).collect()
    }

    pub async fn set_session_plan(
        &self,
        id: i64,
        planned_items: i64,
        total_bytes: i64,
    ) -> Result<(), DaoError> {
        sqlx::query("UPDATE Sessions SET planned_items = ?1, total_bytes = ?2 WHERE id = ?3")
            .bind(planned_items)
            .bind(total_bytes)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn record_session_upload(&self, id: i64, bytes: i64) -> Result<(), DaoError> {
        sqlx::query(
            "UPDATE Sessions SET uploaded_items = uploaded_items + 1, \
                 uploaded_bytes = uploaded_bytes + ?1 \
             WHERE id = ?2",
        )
        .bind(bytes)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_session_status(
        &self,
        id: i64,
        status: TransferStatus,
        finished_at: Option<i64>,
    ) -> Result<(), DaoError> {
        sqlx::query("UPDATE Sessions SET status = ?1, finished_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(finished_at)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_session_priority(&self, id: i64, priority: i64) -> Result<(), DaoError> {
        sqlx::query("UPDATE Sessions SET priority = MAX(0, ?1) WHERE id = ?2")
            .bind(priority)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

fn row_to_download(row: sqlx::sqlite::SqliteRow) -> Result<Download, DaoError> {
    let status: String = row.try_get("status")?;
    Ok(Download {
        uid: row.try_get("uid")?,
        pair_id: row.try_get("pair_id")?,
        path: row.try_get("path")?,
        tmp_path: row.try_get("tmp_path")?,
        status: TransferStatus::parse(&status)?,
        filesize: row.try_get("filesize")?,
        downloaded_size: row.try_get("downloaded_size")?,
        chunk_size: row.try_get("chunk_size")?,
        digest: row.try_get("digest")?,
        digest_algorithm: row.try_get("digest_algorithm")?,
        request_uid: row.try_get("request_uid")?,
        error_count: row.try_get("error_count")?,
        error_count_total: row.try_get("error_count_total")?,
        last_error: row.try_get("last_error")?,
    })
}

fn row_to_upload(row: sqlx::sqlite::SqliteRow) -> Result<Upload, DaoError> {
    let status: String = row.try_get("status")?;
    Ok(Upload {
        uid: row.try_get("uid")?,
        pair_id: row.try_get("pair_id")?,
        session_id: row.try_get("session_id")?,
        path: row.try_get("path")?,
        remote_parent_ref: row.try_get("remote_parent_ref")?,
        remote_path: row.try_get("remote_path")?,
        status: TransferStatus::parse(&status)?,
        filesize: row.try_get("filesize")?,
        uploaded_size: row.try_get("uploaded_size")?,
        chunk_size: row.try_get("chunk_size")?,
        chunk_count: row.try_get("chunk_count")?,
        batch_id: row.try_get("batch_id")?,
        file_idx: row.try_get("file_idx")?,
        digest: row.try_get("digest")?,
        digest_algorithm: row.try_get("digest_algorithm")?,
        request_uid: row.try_get("request_uid")?,
        error_count: row.try_get("error_count")?,
        error_count_total: row.try_get("error_count_total")?,
        last_error: row.try_get("last_error")?,
    })
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<Session, DaoError> {
    let status: String = row.try_get("status")?;
    let behavior: String = row.try_get("duplicate_behavior")?;
    Ok(Session {
        id: row.try_get("id")?,
        remote_parent_path: row.try_get("remote_parent_path")?,
        remote_parent_ref: row.try_get("remote_parent_ref")?,
        status: TransferStatus::parse(&status)?,
        priority: row.try_get("priority")?,
        duplicate_behavior: DuplicateBehavior::parse(&behavior)?,
        planned_items: row.try_get("planned_items")?,
        uploaded_items: row.try_get("uploaded_items")?,
        total_bytes: row.try_get("total_bytes")?,
        uploaded_bytes: row.try_get("uploaded_bytes")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}
