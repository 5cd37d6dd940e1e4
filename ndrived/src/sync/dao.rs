use std::path::Path;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Row, SqliteConnection, SqlitePool};
use thiserror::Error;
use tracing::debug;

use ndrive_core::RemoteFileInfo;

use super::local::LocalInfo;
use super::states::{InvalidState, LocalState, PairState, RemoteState, pair_state_of};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/engine");

pub const CONFIG_REMOTE_LOG_ID: &str = "remote_last_event_log_id";
pub const CONFIG_REMOTE_SYNC_DATE: &str = "remote_last_sync_date";
pub const CONFIG_REMOTE_ROOTS: &str = "remote_last_roots";

#[derive(Debug, Error)]
pub enum DaoError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    InvalidState(#[from] InvalidState),
    #[error(transparent)]
    InvalidTransferField(#[from] super::ledger::InvalidTransferField),
    #[error("no pair with id {0}")]
    MissingPair(i64),
    #[error("stale version for pair {0}")]
    StaleVersion(i64),
}

/// One logical document observed on one or both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct DocPair {
    pub id: i64,
    pub local_path: Option<String>,
    pub local_parent_path: Option<String>,
    pub local_name: Option<String>,
    pub remote_name: Option<String>,
    pub remote_ref: Option<String>,
    pub remote_parent_ref: Option<String>,
    pub folderish: bool,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    pub digest_algorithm: String,
    pub local_state: LocalState,
    pub remote_state: RemoteState,
    pub pair_state: PairState,
    pub last_transfer: Option<String>,
    pub last_sync_date: Option<i64>,
    pub last_local_updated: Option<i64>,
    pub last_remote_updated: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_details: Option<String>,
    pub error_count: i64,
    pub session_id: Option<i64>,
    pub version: i64,
}

/// A transition generated by the remote watcher, applied atomically with the
/// cursor update.
#[derive(Debug, Clone)]
pub enum RemoteChangeOp {
    Created {
        info: RemoteFileInfo,
        local_path: String,
        local_parent_path: String,
    },
    Modified {
        pair_id: i64,
        info: RemoteFileInfo,
    },
    Moved {
        pair_id: i64,
        info: RemoteFileInfo,
    },
    Deleted {
        pair_id: i64,
    },
}

pub struct EngineDao {
    pool: SqlitePool,
}

const PAIR_COLUMNS: &str = "id, local_path, local_parent_path, local_name, remote_name, \
     remote_ref, remote_parent_ref, folderish, local_digest, remote_digest, digest_algorithm, \
     local_state, remote_state, pair_state, last_transfer, last_sync_date, last_local_updated, \
     last_remote_updated, last_error, last_error_details, error_count, session_id, version";

impl EngineDao {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(db_path: &Path) -> Result<Self, DaoError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        let dao = Self { pool };
        dao.init().await?;
        Ok(dao)
    }

    pub async fn init(&self) -> Result<(), DaoError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    //
    // Pair lookups
    //

    pub async fn pair_by_id(&self, id: i64) -> Result<Option<DocPair>, DaoError> {
        let mut conn = self.pool.acquire().await?;
        pair_by_id_conn(&mut *conn, id).await
    }

    pub async fn pair_by_local_path(&self, path: &str) -> Result<Option<DocPair>, DaoError> {
        let row = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States WHERE local_path = ?1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_pair).transpose()
    }

    pub async fn pair_by_remote_ref(&self, remote_ref: &str) -> Result<Option<DocPair>, DaoError> {
        let mut conn = self.pool.acquire().await?;
        pair_by_remote_ref_conn(&mut *conn, remote_ref).await
    }

    pub async fn local_children(&self, parent_path: &str) -> Result<Vec<DocPair>, DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States WHERE local_parent_path = ?1 ORDER BY local_path"
        ))
        .bind(parent_path)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pair).collect()
    }

    pub async fn remote_children(&self, parent_ref: &str) -> Result<Vec<DocPair>, DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States WHERE remote_parent_ref = ?1 ORDER BY remote_name"
        ))
        .bind(parent_ref)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pair).collect()
    }

    /// Pairs under a local path prefix, the pair itself included.
    pub async fn pairs_under(&self, local_path: &str) -> Result<Vec<DocPair>, DaoError> {
        let prefix = format!("{}/%", local_path.trim_end_matches('/'));
        let rows = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States WHERE local_path = ?1 OR local_path LIKE ?2 \
             ORDER BY local_path"
        ))
        .bind(local_path)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pair).collect()
    }

    /// Every pair whose state requires work, parked ones excluded.
    pub async fn unsynchronized_pairs(&self, max_errors: i64) -> Result<Vec<DocPair>, DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States \
             WHERE pair_state NOT IN ('synchronized', 'unsynchronized', 'conflicted', 'todo', 'unknown') \
               AND error_count < ?1 \
             ORDER BY id"
        ))
        .bind(max_errors)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pair).collect()
    }

    pub async fn conflicted_pairs(&self) -> Result<Vec<DocPair>, DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States WHERE pair_state = 'conflicted' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pair).collect()
    }

    pub async fn parked_pairs(&self, max_errors: i64) -> Result<Vec<DocPair>, DaoError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States WHERE error_count >= ?1 ORDER BY id"
        ))
        .bind(max_errors)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pair).collect()
    }

    //
    // Pair creation
    //

    /// Registers a first local observation. The pair starts
    /// `locally_created` and waits for the processor to create the remote
    /// side.
    pub async fn insert_local_state(
        &self,
        info: &LocalInfo,
        session_id: Option<i64>,
        local_state: LocalState,
    ) -> Result<DocPair, DaoError> {
        let pair_state = pair_state_of(local_state, RemoteState::Unknown);
        let parent = parent_of(&info.path);
        sqlx::query(
            "INSERT INTO States (local_path, local_parent_path, local_name, folderish, \
                 local_digest, digest_algorithm, local_state, remote_state, pair_state, \
                 last_local_updated, session_id, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'unknown', ?8, ?9, ?10, 1) \
             ON CONFLICT(local_path) DO UPDATE SET \
                 local_digest = excluded.local_digest, \
                 local_state = excluded.local_state, \
                 pair_state = excluded.pair_state, \
                 last_local_updated = excluded.last_local_updated, \
                 version = States.version + 1",
        )
        .bind(&info.path)
        .bind(&parent)
        .bind(&info.name)
        .bind(info.folderish as i64)
        .bind(&info.digest)
        .bind(&info.digest_algorithm)
        .bind(local_state.as_str())
        .bind(pair_state.as_str())
        .bind(info.last_modified)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        self.pair_by_local_path(&info.path)
            .await?
            .ok_or(DaoError::MissingPair(0))
    }

    /// Registers a first remote observation (the local side does not exist
    /// yet).
    pub async fn insert_remote_state(
        &self,
        info: &RemoteFileInfo,
        local_path: &str,
        local_parent_path: &str,
    ) -> Result<DocPair, DaoError> {
        let mut conn = self.pool.acquire().await?;
        insert_remote_state_conn(&mut *conn, info, local_path, local_parent_path).await
    }

    //
    // Pair transitions
    //

    /// Refreshes the local side and recomputes the composite state.
    pub async fn update_local_state(
        &self,
        pair: &DocPair,
        info: &LocalInfo,
        local_state: LocalState,
    ) -> Result<DocPair, DaoError> {
        let pair_state = pair_state_of(local_state, pair.remote_state);
        let parent = parent_of(&info.path);
        sqlx::query(
            "UPDATE States SET local_path = ?1, local_parent_path = ?2, local_name = ?3, \
                 local_digest = ?4, local_state = ?5, pair_state = ?6, last_local_updated = ?7, \
                 version = version + 1 \
             WHERE id = ?8",
        )
        .bind(&info.path)
        .bind(&parent)
        .bind(&info.name)
        .bind(&info.digest)
        .bind(local_state.as_str())
        .bind(pair_state.as_str())
        .bind(info.last_modified)
        .bind(pair.id)
        .execute(&self.pool)
        .await?;
        self.pair_by_id(pair.id)
            .await?
            .ok_or(DaoError::MissingPair(pair.id))
    }

    /// Refreshes the remote side and recomputes the composite state.
    pub async fn update_remote_state(
        &self,
        pair: &DocPair,
        info: &RemoteFileInfo,
        remote_state: RemoteState,
    ) -> Result<DocPair, DaoError> {
        let mut conn = self.pool.acquire().await?;
        update_remote_state_conn(&mut *conn, pair, info, remote_state).await?;
        self.pair_by_id(pair.id)
            .await?
            .ok_or(DaoError::MissingPair(pair.id))
    }

    /// Moves the local side of a pair, keeping the remote ref.
    pub async fn update_local_paths(
        &self,
        pair: &DocPair,
        new_path: &str,
        local_state: LocalState,
    ) -> Result<DocPair, DaoError> {
        let pair_state = pair_state_of(local_state, pair.remote_state);
        let parent = parent_of(new_path);
        let name = name_of(new_path);
        sqlx::query(
            "UPDATE States SET local_path = ?1, local_parent_path = ?2, local_name = ?3, \
                 local_state = ?4, pair_state = ?5, version = version + 1 \
             WHERE id = ?6",
        )
        .bind(new_path)
        .bind(&parent)
        .bind(&name)
        .bind(local_state.as_str())
        .bind(pair_state.as_str())
        .bind(pair.id)
        .execute(&self.pool)
        .await?;
        self.pair_by_id(pair.id)
            .await?
            .ok_or(DaoError::MissingPair(pair.id))
    }

    /// Sets both side states explicitly (conflict resolution, direct
    /// transfer bookkeeping).
    pub async fn set_states(
        &self,
        pair_id: i64,
        local_state: LocalState,
        remote_state: RemoteState,
    ) -> Result<DocPair, DaoError> {
        let pair_state = pair_state_of(local_state, remote_state);
        sqlx::query(
            "UPDATE States SET local_state = ?1, remote_state = ?2, pair_state = ?3, \
                 version = version + 1 \
             WHERE id = ?4",
        )
        .bind(local_state.as_str())
        .bind(remote_state.as_str())
        .bind(pair_state.as_str())
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        self.pair_by_id(pair_id)
            .await?
            .ok_or(DaoError::MissingPair(pair_id))
    }

    /// Commits a fully reconciled pair. Guarded by the version the caller
    /// read; a concurrent transition makes the commit a no-op and the error
    /// tells the processor to re-drive the pair.
    #[allow(clippy::too_many_arguments)]
    pub async fn synchronize_pair(
        &self,
        pair: &DocPair,
        remote_ref: Option<&str>,
        remote_parent_ref: Option<&str>,
        remote_name: Option<&str>,
        local_digest: Option<&str>,
        remote_digest: Option<&str>,
        last_transfer: Option<&str>,
        sync_date: i64,
    ) -> Result<DocPair, DaoError> {
        let result = sqlx::query(
            "UPDATE States SET \
                 local_state = 'synchronized', remote_state = 'synchronized', \
                 pair_state = 'synchronized', \
                 remote_ref = COALESCE(?1, remote_ref), \
                 remote_parent_ref = COALESCE(?2, remote_parent_ref), \
                 remote_name = COALESCE(?3, remote_name), \
                 local_digest = COALESCE(?4, local_digest), \
                 remote_digest = COALESCE(?5, remote_digest), \
                 last_transfer = COALESCE(?6, last_transfer), \
                 last_sync_date = ?7, last_error = NULL, last_error_details = NULL, \
                 error_count = 0, version = version + 1 \
             WHERE id = ?8 AND version = ?9",
        )
        .bind(remote_ref)
        .bind(remote_parent_ref)
        .bind(remote_name)
        .bind(local_digest)
        .bind(remote_digest)
        .bind(last_transfer)
        .bind(sync_date)
        .bind(pair.id)
        .bind(pair.version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DaoError::StaleVersion(pair.id));
        }
        self.pair_by_id(pair.id)
            .await?
            .ok_or(DaoError::MissingPair(pair.id))
    }

    /// Marks a folder and every descendant remotely deleted in one
    /// transaction; descendants become no-ops for the processor.
    pub async fn mark_remotely_deleted(&self, pair: &DocPair) -> Result<Vec<DocPair>, DaoError> {
        let mut tx = self.pool.begin().await?;
        let affected = mark_deleted_cascade_conn(&mut *tx, pair, Side::Remote).await?;
        tx.commit().await?;
        Ok(affected)
    }

    /// Same cascade for a local deletion.
    pub async fn mark_locally_deleted(&self, pair: &DocPair) -> Result<Vec<DocPair>, DaoError> {
        let mut tx = self.pool.begin().await?;
        let affected = mark_deleted_cascade_conn(&mut *tx, pair, Side::Local).await?;
        tx.commit().await?;
        Ok(affected)
    }

    pub async fn unsynchronize_pair(&self, pair_id: i64) -> Result<(), DaoError> {
        sqlx::query(
            "UPDATE States SET local_state = 'unsynchronized', pair_state = 'unsynchronized', \
                 version = version + 1 \
             WHERE id = ?1",
        )
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drops the remote identity of a pair (used when a copied file carries
    /// a duplicated remote id).
    pub async fn clear_remote_ref(&self, pair_id: i64) -> Result<(), DaoError> {
        sqlx::query(
            "UPDATE States SET remote_ref = NULL, remote_parent_ref = NULL, \
                 remote_state = 'unknown', local_state = 'created', \
                 pair_state = 'locally_created', version = version + 1 \
             WHERE id = ?1",
        )
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_pair(&self, pair_id: i64) -> Result<(), DaoError> {
        sqlx::query("DELETE FROM States WHERE id = ?1")
            .bind(pair_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Garbage-collects pairs deleted on both sides and pairs with no side
    /// left at all.
    pub async fn purge_deleted_pairs(&self) -> Result<u64, DaoError> {
        let result = sqlx::query(
            "DELETE FROM States WHERE pair_state = 'deleted' \
                 OR (local_path IS NULL AND remote_ref IS NULL)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    //
    // Error bookkeeping
    //

    pub async fn increase_error(
        &self,
        pair_id: i64,
        error: &str,
        details: Option<&str>,
    ) -> Result<i64, DaoError> {
        sqlx::query(
            "UPDATE States SET last_error = ?1, last_error_details = ?2, \
                 error_count = error_count + 1, version = version + 1 \
             WHERE id = ?3",
        )
        .bind(error)
        .bind(details)
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT error_count FROM States WHERE id = ?1")
            .bind(pair_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("error_count")?)
    }

    /// Takes a pair out of scheduling until the user retries it.
    pub async fn park_pair(&self, pair_id: i64, error: &str, max_errors: i64) -> Result<(), DaoError> {
        sqlx::query(
            "UPDATE States SET last_error = ?1, error_count = MAX(error_count, ?2), \
                 version = version + 1 \
             WHERE id = ?3",
        )
        .bind(error)
        .bind(max_errors)
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes a subtree of pair rows after a deletion handler succeeded.
    pub async fn remove_pairs_under(&self, local_path: &str) -> Result<u64, DaoError> {
        let prefix = format!("{}/%", local_path.trim_end_matches('/'));
        let result = sqlx::query("DELETE FROM States WHERE local_path = ?1 OR local_path LIKE ?2")
            .bind(local_path)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// User-driven retry of a parked pair.
    pub async fn reset_error(&self, pair_id: i64) -> Result<Option<DocPair>, DaoError> {
        sqlx::query(
            "UPDATE States SET last_error = NULL, last_error_details = NULL, error_count = 0, \
                 version = version + 1 \
             WHERE id = ?1",
        )
        .bind(pair_id)
        .execute(&self.pool)
        .await?;
        self.pair_by_id(pair_id).await
    }

    //
    // Remote change batches
    //

    /// Applies a poll cycle's transitions and advances the cursor in a
    /// single transaction, keeping the cursor monotonic.
    pub async fn apply_remote_changes(
        &self,
        ops: Vec<RemoteChangeOp>,
        log_id: Option<i64>,
        sync_date: i64,
        roots: &str,
    ) -> Result<Vec<DocPair>, DaoError> {
        let mut tx = self.pool.begin().await?;
        let mut touched = Vec::new();
        for op in ops {
            match op {
                RemoteChangeOp::Created {
                    info,
                    local_path,
                    local_parent_path,
                } => {
                    let pair =
                        insert_remote_state_conn(&mut *tx, &info, &local_path, &local_parent_path)
                            .await?;
                    touched.push(pair);
                }
                RemoteChangeOp::Modified { pair_id, info } => {
                    if let Some(pair) = pair_by_id_conn(&mut *tx, pair_id).await? {
                        update_remote_state_conn(&mut *tx, &pair, &info, RemoteState::Modified)
                            .await?;
                        if let Some(updated) = pair_by_id_conn(&mut *tx, pair_id).await? {
                            touched.push(updated);
                        }
                    }
                }
                RemoteChangeOp::Moved { pair_id, info } => {
                    if let Some(pair) = pair_by_id_conn(&mut *tx, pair_id).await? {
                        update_remote_state_conn(&mut *tx, &pair, &info, RemoteState::Moved).await?;
                        if let Some(updated) = pair_by_id_conn(&mut *tx, pair_id).await? {
                            touched.push(updated);
                        }
                    }
                }
                RemoteChangeOp::Deleted { pair_id } => {
                    if let Some(pair) = pair_by_id_conn(&mut *tx, pair_id).await? {
                        let affected = mark_deleted_cascade_conn(&mut *tx, &pair, Side::Remote).await?;
                        touched.extend(affected);
                    }
                }
            }
        }
        if let Some(log_id) = log_id {
            set_config_conn(&mut *tx, CONFIG_REMOTE_LOG_ID, &log_id.to_string()).await?;
        }
        set_config_conn(&mut *tx, CONFIG_REMOTE_SYNC_DATE, &sync_date.to_string()).await?;
        set_config_conn(&mut *tx, CONFIG_REMOTE_ROOTS, roots).await?;
        tx.commit().await?;
        Ok(touched)
    }

    //
    // Filters
    //

    pub async fn filters(&self) -> Result<Vec<String>, DaoError> {
        let rows = sqlx::query("SELECT path FROM Filters ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("path").map_err(DaoError::from))
            .collect()
    }

    /// Declares a subtree hidden. Narrower filters become redundant and are
    /// dropped; every pair under the prefix is marked remotely deleted so
    /// the processor cleans the local side without emitting remote changes.
    pub async fn add_filter(&self, path: &str) -> Result<Vec<DocPair>, DaoError> {
        let path = normalize_filter(path);
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM Filters WHERE path LIKE ?1")
            .bind(format!("{path}%"))
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO Filters (path) VALUES (?1)")
            .bind(&path)
            .execute(&mut *tx)
            .await?;

        let exact = path.trim_end_matches('/').to_string();
        let rows = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States WHERE local_path = ?1 OR local_path LIKE ?2 \
             ORDER BY local_path"
        ))
        .bind(&exact)
        .bind(format!("{path}%"))
        .fetch_all(&mut *tx)
        .await?;
        let mut affected = Vec::new();
        for row in rows {
            let pair = row_to_pair(row)?;
            if let Some(updated) =
                set_remote_deleted_conn(&mut *tx, pair.id, pair.local_state).await?
            {
                affected.push(updated);
            }
        }
        tx.commit().await?;
        debug!(filter = %path, pairs = affected.len(), "filter added");
        Ok(affected)
    }

    pub async fn remove_filter(&self, path: &str) -> Result<(), DaoError> {
        sqlx::query("DELETE FROM Filters WHERE path = ?1")
            .bind(normalize_filter(path))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    //
    // Config
    //

    pub async fn get_config(&self, key: &str) -> Result<Option<String>, DaoError> {
        let row = sqlx::query("SELECT value FROM Config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => {
                let value: Vec<u8> = row.try_get("value")?;
                Some(String::from_utf8_lossy(&value).into_owned())
            }
            None => None,
        })
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), DaoError> {
        let mut conn = self.pool.acquire().await?;
        set_config_conn(&mut *conn, key, value).await
    }

    pub async fn remote_cursor(&self) -> Result<(Option<i64>, Option<i64>), DaoError> {
        let log_id = self
            .get_config(CONFIG_REMOTE_LOG_ID)
            .await?
            .and_then(|value| value.parse().ok());
        let sync_date = self
            .get_config(CONFIG_REMOTE_SYNC_DATE)
            .await?
            .and_then(|value| value.parse().ok());
        Ok((log_id, sync_date))
    }
}

/// Returns true when `path` falls under one of the (sorted, slash-ended)
/// filter prefixes.
pub fn is_filtered(filters: &[String], path: &str) -> bool {
    let candidate = format!("{}/", path.trim_end_matches('/'));
    filters.iter().any(|filter| candidate.starts_with(filter))
}

fn normalize_filter(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

pub(crate) fn parent_of(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

pub(crate) fn name_of(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| path.to_string())
}

enum Side {
    Local,
    Remote,
}

fn row_to_pair(row: sqlx::sqlite::SqliteRow) -> Result<DocPair, DaoError> {
    let local_state: String = row.try_get("local_state")?;
    let remote_state: String = row.try_get("remote_state")?;
    let pair_state: String = row.try_get("pair_state")?;
    let folderish: i64 = row.try_get("folderish")?;
    Ok(DocPair {
        id: row.try_get("id")?,
        local_path: row.try_get("local_path")?,
        local_parent_path: row.try_get("local_parent_path")?,
        local_name: row.try_get("local_name")?,
        remote_name: row.try_get("remote_name")?,
        remote_ref: row.try_get("remote_ref")?,
        remote_parent_ref: row.try_get("remote_parent_ref")?,
        folderish: folderish != 0,
        local_digest: row.try_get("local_digest")?,
        remote_digest: row.try_get("remote_digest")?,
        digest_algorithm: row.try_get("digest_algorithm")?,
        local_state: LocalState::parse(&local_state)?,
        remote_state: RemoteState::parse(&remote_state)?,
        pair_state: PairState::parse(&pair_state)?,
        last_transfer: row.try_get("last_transfer")?,
        last_sync_date: row.try_get("last_sync_date")?,
        last_local_updated: row.try_get("last_local_updated")?,
        last_remote_updated: row.try_get("last_remote_updated")?,
        last_error: row.try_get("last_error")?,
        last_error_details: row.try_get("last_error_details")?,
        error_count: row.try_get("error_count")?,
        session_id: row.try_get("session_id")?,
        version: row.try_get("version")?,
    })
}

async fn pair_by_id_conn(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<DocPair>, DaoError> {
    let row = sqlx::query(&format!("SELECT {PAIR_COLUMNS} FROM States WHERE id = ?1"))
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.map(row_to_pair).transpose()
}

async fn pair_by_remote_ref_conn(
    conn: &mut SqliteConnection,
    remote_ref: &str,
) -> Result<Option<DocPair>, DaoError> {
    let row = sqlx::query(&format!(
        "SELECT {PAIR_COLUMNS} FROM States WHERE remote_ref = ?1"
    ))
    .bind(remote_ref)
    .fetch_optional(conn)
    .await?;
    row.map(row_to_pair).transpose()
}

async fn insert_remote_state_conn(
    conn: &mut SqliteConnection,
    info: &RemoteFileInfo,
    local_path: &str,
    local_parent_path: &str,
) -> Result<DocPair, DaoError> {
    let pair_state = pair_state_of(LocalState::Unknown, RemoteState::Created);
    sqlx::query(
        "INSERT INTO States (local_path, local_parent_path, local_name, remote_name, \
             remote_ref, remote_parent_ref, folderish, remote_digest, digest_algorithm, \
             local_state, remote_state, pair_state, last_remote_updated, version) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'unknown', 'created', ?10, ?11, 1) \
         ON CONFLICT(remote_ref) DO UPDATE SET \
             remote_name = excluded.remote_name, \
             remote_parent_ref = excluded.remote_parent_ref, \
             remote_digest = excluded.remote_digest, \
             remote_state = 'created', \
             pair_state = ?10, \
             last_remote_updated = excluded.last_remote_updated, \
             version = States.version + 1",
    )
    .bind(local_path)
    .bind(local_parent_path)
    .bind(&info.name)
    .bind(&info.name)
    .bind(&info.uid)
    .bind(&info.parent_uid)
    .bind(info.folderish as i64)
    .bind(&info.digest)
    .bind(info.digest_algorithm.as_deref().unwrap_or("md5"))
    .bind(pair_state.as_str())
    .bind(info.last_modification)
    .execute(&mut *conn)
    .await?;
    pair_by_remote_ref_conn(conn, &info.uid)
        .await?
        .ok_or(DaoError::MissingPair(0))
}

async fn update_remote_state_conn(
    conn: &mut SqliteConnection,
    pair: &DocPair,
    info: &RemoteFileInfo,
    remote_state: RemoteState,
) -> Result<(), DaoError> {
    let pair_state = pair_state_of(pair.local_state, remote_state);
    sqlx::query(
        "UPDATE States SET remote_name = ?1, remote_parent_ref = ?2, remote_digest = ?3, \
             remote_state = ?4, pair_state = ?5, last_remote_updated = ?6, \
             version = version + 1 \
         WHERE id = ?7",
    )
    .bind(&info.name)
    .bind(&info.parent_uid)
    .bind(&info.digest)
    .bind(remote_state.as_str())
    .bind(pair_state.as_str())
    .bind(info.last_modification)
    .bind(pair.id)
    .execute(conn)
    .await?;
    Ok(())
}

async fn set_remote_deleted_conn(
    conn: &mut SqliteConnection,
    pair_id: i64,
    local_state: LocalState,
) -> Result<Option<DocPair>, DaoError> {
    let pair_state = pair_state_of(local_state, RemoteState::Deleted);
    sqlx::query(
        "UPDATE States SET remote_state = 'deleted', pair_state = ?1, version = version + 1 \
         WHERE id = ?2",
    )
    .bind(pair_state.as_str())
    .bind(pair_id)
    .execute(&mut *conn)
    .await?;
    pair_by_id_conn(conn, pair_id).await
}

async fn mark_deleted_cascade_conn(
    conn: &mut SqliteConnection,
    pair: &DocPair,
    side: Side,
) -> Result<Vec<DocPair>, DaoError> {
    let mut targets = vec![pair.clone()];
    if pair.folderish
        && let Some(local_path) = &pair.local_path
    {
        let prefix = format!("{}/%", local_path.trim_end_matches('/'));
        let rows = sqlx::query(&format!(
            "SELECT {PAIR_COLUMNS} FROM States WHERE local_path LIKE ?1 ORDER BY local_path DESC"
        ))
        .bind(prefix)
        .fetch_all(&mut *conn)
        .await?;
        for row in rows {
            targets.push(row_to_pair(row)?);
        }
    }

    let mut affected = Vec::new();
    for target in targets {
        let (local_state, remote_state) = match side {
            Side::Local => (LocalState::Deleted, target.remote_state),
            Side::Remote => (target.local_state, RemoteState::Deleted),
        };
        let pair_state = pair_state_of(local_state, remote_state);
        sqlx::query(
            "UPDATE States SET local_state = ?1, remote_state = ?2, pair_state = ?3, \
                 version = version + 1 \
             WHERE id = ?4",
        )
        .bind(local_state.as_str())
        .bind(remote_state.as_str())
        .bind(pair_state.as_str())
        .bind(target.id)
        .execute(&mut *conn)
        .await?;
        if let Some(updated) = pair_by_id_conn(conn, target.id).await? {
            affected.push(updated);
        }
    }
    Ok(affected)
}

async fn set_config_conn(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
) -> Result<(), DaoError> {
    sqlx::query(
        "INSERT INTO Config (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.as_bytes())
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) async fn make_dao() -> EngineDao {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let dao = EngineDao::from_pool(pool);
        dao.init().await.unwrap();
        dao
    }

    fn local_info(path: &str, folderish: bool, digest: Option<&str>) -> LocalInfo {
        LocalInfo {
            path: path.to_string(),
            name: name_of(path),
            folderish,
            size: if folderish { 0 } else { 5 },
            last_modified: 1_700_000_000,
            digest: digest.map(str::to_string),
            digest_algorithm: "md5".to_string(),
        }
    }

    fn remote_info(uid: &str, name: &str, folderish: bool, digest: Option<&str>) -> RemoteFileInfo {
        RemoteFileInfo {
            uid: uid.to_string(),
            parent_uid: Some("root#ref".to_string()),
            name: name.to_string(),
            path: None,
            folderish,
            last_modification: Some(1_700_000_100),
            creation: Some(1_700_000_000),
            digest: digest.map(str::to_string),
            digest_algorithm: Some("md5".to_string()),
            download_url: None,
            can_rename: true,
            can_delete: true,
            can_update: !folderish,
            can_create_child: folderish,
            can_scroll_descendants: folderish,
        }
    }

    #[tokio::test]
    async fn local_insert_computes_pair_state_and_version() {
        let dao = make_dao().await;
        let pair = dao
            .insert_local_state(&local_info("/a.txt", false, Some("digest")), None, LocalState::Created)
            .await
            .unwrap();
        assert_eq!(pair.pair_state, PairState::LocallyCreated);
        assert_eq!(pair.version, 1);
        assert_eq!(pair.local_parent_path.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn remote_insert_then_synchronize_bumps_version() {
        let dao = make_dao().await;
        let pair = dao
            .insert_remote_state(&remote_info("doc#1", "a.txt", false, Some("d1")), "/a.txt", "/")
            .await
            .unwrap();
        assert_eq!(pair.pair_state, PairState::RemotelyCreated);

        let synced = dao
            .synchronize_pair(
                &pair,
                None,
                None,
                None,
                Some("d1"),
                Some("d1"),
                Some("download"),
                1_700_000_200,
            )
            .await
            .unwrap();
        assert_eq!(synced.pair_state, PairState::Synchronized);
        assert_eq!(synced.version, pair.version + 1);
        assert_eq!(synced.last_transfer.as_deref(), Some("download"));
    }

    #[tokio::test]
    async fn synchronize_with_stale_version_is_rejected() {
        let dao = make_dao().await;
        let pair = dao
            .insert_local_state(&local_info("/a.txt", false, Some("d")), None, LocalState::Created)
            .await
            .unwrap();
        // Another writer touches the pair in between.
        dao.increase_error(pair.id, "transient", None).await.unwrap();

        let err = dao
            .synchronize_pair(&pair, None, None, None, None, None, None, 1)
            .await
            .expect_err("stale version must not commit");
        assert!(matches!(err, DaoError::StaleVersion(_)));
    }

    #[tokio::test]
    async fn remote_deletion_cascades_to_descendants() {
        let dao = make_dao().await;
        let folder = dao
            .insert_remote_state(&remote_info("folder#1", "Folder1", true, None), "/Folder1", "/")
            .await
            .unwrap();
        let folder = dao
            .synchronize_pair(&folder, None, None, None, None, None, None, 1)
            .await
            .unwrap();
        let child = dao
            .insert_remote_state(
                &remote_info("doc#2", "inner.txt", false, Some("d2")),
                "/Folder1/inner.txt",
                "/Folder1",
            )
            .await
            .unwrap();
        dao.synchronize_pair(&child, None, None, None, Some("d2"), Some("d2"), None, 1)
            .await
            .unwrap();

        let affected = dao.mark_remotely_deleted(&folder).await.unwrap();
        assert_eq!(affected.len(), 2);
        assert!(
            affected
                .iter()
                .all(|p| p.pair_state == PairState::RemotelyDeleted)
        );
    }

    #[tokio::test]
    async fn add_filter_marks_subtree_and_drops_narrower_filters() {
        let dao = make_dao().await;
        dao.add_filter("/Folder1/Sub").await.unwrap();
        let folder = dao
            .insert_remote_state(&remote_info("folder#1", "Folder1", true, None), "/Folder1", "/")
            .await
            .unwrap();
        dao.synchronize_pair(&folder, None, None, None, None, None, None, 1)
            .await
            .unwrap();
        let child = dao
            .insert_remote_state(
                &remote_info("doc#2", "a.txt", false, Some("d")),
                "/Folder1/a.txt",
                "/Folder1",
            )
            .await
            .unwrap();
        dao.synchronize_pair(&child, None, None, None, Some("d"), Some("d"), None, 1)
            .await
            .unwrap();

        let affected = dao.add_filter("/Folder1").await.unwrap();
        assert_eq!(affected.len(), 2);
        assert!(
            affected
                .iter()
                .all(|p| p.pair_state == PairState::RemotelyDeleted)
        );
        assert_eq!(dao.filters().await.unwrap(), vec!["/Folder1/".to_string()]);
    }

    #[tokio::test]
    async fn filter_matching_is_prefix_based() {
        let filters = vec!["/Folder1/".to_string()];
        assert!(is_filtered(&filters, "/Folder1/a.txt"));
        assert!(is_filtered(&filters, "/Folder1"));
        assert!(!is_filtered(&filters, "/Folder12/a.txt"));
    }

    #[tokio::test]
    async fn apply_remote_changes_is_atomic_with_cursor() {
        let dao = make_dao().await;
        let ops = vec![RemoteChangeOp::Created {
            info: remote_info("doc#1", "a.txt", false, Some("d1")),
            local_path: "/a.txt".to_string(),
            local_parent_path: "/".to_string(),
        }];
        let touched = dao
            .apply_remote_changes(ops, Some(43), 1_700_000_300, "default:root")
            .await
            .unwrap();
        assert_eq!(touched.len(), 1);
        let (log_id, sync_date) = dao.remote_cursor().await.unwrap();
        assert_eq!(log_id, Some(43));
        assert_eq!(sync_date, Some(1_700_000_300));
    }

    #[tokio::test]
    async fn applying_a_change_twice_produces_no_extra_transition() {
        let dao = make_dao().await;
        let info = remote_info("doc#1", "a.txt", false, Some("d1"));
        dao.apply_remote_changes(
            vec![RemoteChangeOp::Created {
                info: info.clone(),
                local_path: "/a.txt".to_string(),
                local_parent_path: "/".to_string(),
            }],
            Some(10),
            1,
            "roots",
        )
        .await
        .unwrap();
        dao.apply_remote_changes(
            vec![RemoteChangeOp::Created {
                info,
                local_path: "/a.txt".to_string(),
                local_parent_path: "/".to_string(),
            }],
            Some(11),
            2,
            "roots",
        )
        .await
        .unwrap();

        let pair = dao.pair_by_remote_ref("doc#1").await.unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::RemotelyCreated);
        let all = dao.pairs_under("/").await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn error_bookkeeping_parks_and_retries() {
        let dao = make_dao().await;
        let pair = dao
            .insert_local_state(&local_info("/a.txt", false, Some("d")), None, LocalState::Created)
            .await
            .unwrap();
        for _ in 0..3 {
            dao.increase_error(pair.id, "boom", Some("details")).await.unwrap();
        }
        assert_eq!(dao.parked_pairs(3).await.unwrap().len(), 1);
        assert!(dao.unsynchronized_pairs(3).await.unwrap().is_empty());

        let retried = dao.reset_error(pair.id).await.unwrap().unwrap();
        assert_eq!(retried.error_count, 0);
        assert_eq!(dao.unsynchronized_pairs(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_remote_ref_turns_copy_into_fresh_pair() {
        let dao = make_dao().await;
        let pair = dao
            .insert_remote_state(&remote_info("doc#1", "a.txt", false, Some("d")), "/a.txt", "/")
            .await
            .unwrap();
        dao.clear_remote_ref(pair.id).await.unwrap();
        let fresh = dao.pair_by_id(pair.id).await.unwrap().unwrap();
        assert_eq!(fresh.remote_ref, None);
        assert_eq!(fresh.pair_state, PairState::LocallyCreated);
    }

    #[tokio::test]
    async fn purge_removes_double_deleted_pairs() {
        let dao = make_dao().await;
        let pair = dao
            .insert_local_state(&local_info("/a.txt", false, Some("d")), None, LocalState::Created)
            .await
            .unwrap();
        dao.set_states(pair.id, LocalState::Deleted, RemoteState::Deleted)
            .await
            .unwrap();
        assert_eq!(dao.purge_deleted_pairs().await.unwrap(), 1);
        assert!(dao.pair_by_id(pair.id).await.unwrap().is_none());
    }
}
