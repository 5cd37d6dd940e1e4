//! Process-wide manager: owns the engines, the shared options, the manager
//! database (engine registry, notifications, auto-locked paths) and the
//! update checker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rand::Rng;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

use ndrive_core::{ClientConfig, NuxeoClient, NuxeoError};

use crate::options::{Options, State};
use crate::sync::dao::EngineDao;
use crate::sync::engine::{Engine, EngineConfig};
use crate::updater::{
    Channel, LoginCapability, UpdateStatus, VersionInfo, get_update_status,
};

static MANAGER_MIGRATOR: Migrator = sqlx::migrate!("./migrations/manager");

const CONFIG_DEVICE_ID: &str = "device_id";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine error: {0}")]
    Engine(#[from] crate::sync::dao::DaoError),
    #[error("api error: {0}")]
    Api(#[from] NuxeoError),
    #[error("no engine bound to {0}")]
    UnknownEngine(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRecord {
    pub uid: String,
    pub local_folder: String,
    pub server_url: String,
    pub remote_token: Option<String>,
    pub root_ref: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uid: String,
    pub engine_uid: Option<String>,
    pub level: String,
    pub title: String,
    pub description: Option<String>,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoLockedPath {
    pub path: String,
    pub process: i64,
    pub remote_id: Option<String>,
}

pub struct ManagerDao {
    pool: SqlitePool,
}

impl ManagerDao {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(db_path: &Path) -> Result<Self, ManagerError> {
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

    pub async fn init(&self) -> Result<(), ManagerError> {
        MANAGER_MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_engine(
        &self,
        uid: &str,
        local_folder: &str,
        server_url: &str,
        token: &str,
        root_ref: &str,
        name: Option<&str>,
    ) -> Result<(), ManagerError> {
        sqlx::query(
            "INSERT INTO Engines (uid, local_folder, server_url, remote_token, root_ref, name) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(uid)
        .bind(local_folder)
        .bind(server_url)
        .bind(token)
        .bind(root_ref)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_engines(&self) -> Result<Vec<EngineRecord>, ManagerError> {
        let rows = sqlx::query(
            "SELECT uid, local_folder, server_url, remote_token, root_ref, name \
             FROM Engines ORDER BY uid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(EngineRecord {
                    uid: row.try_get("uid")?,
                    local_folder: row.try_get("local_folder")?,
                    server_url: row.try_get("server_url")?,
                    remote_token: row.try_get("remote_token")?,
                    root_ref: row.try_get("root_ref")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    pub async fn remove_engine(&self, uid: &str) -> Result<(), ManagerError> {
        sqlx::query("DELETE FROM Engines WHERE uid = ?1")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>, ManagerError> {
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

    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), ManagerError> {
        sqlx::query(
            "INSERT INTO Config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value.as_bytes())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_notification(&self, notification: &Notification) -> Result<(), ManagerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO Notifications (uid, engine_uid, level, title, description, created) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&notification.uid)
        .bind(&notification.engine_uid)
        .bind(&notification.level)
        .bind(&notification.title)
        .bind(&notification.description)
        .bind(notification.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_notifications(&self) -> Result<Vec<Notification>, ManagerError> {
        let rows = sqlx::query(
            "SELECT uid, engine_uid, level, title, description, created \
             FROM Notifications ORDER BY created DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Notification {
                    uid: row.try_get("uid")?,
                    engine_uid: row.try_get("engine_uid")?,
                    level: row.try_get("level")?,
                    title: row.try_get("title")?,
                    description: row.try_get("description")?,
                    created: row.try_get("created")?,
                })
            })
            .collect()
    }

    pub async fn discard_notification(&self, uid: &str) -> Result<(), ManagerError> {
        sqlx::query("DELETE FROM Notifications WHERE uid = ?1")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Registers a path handed to an external editor so it is unlocked when
    /// the process goes away.
    pub async fn lock_path(
        &self,
        path: &str,
        process: i64,
        remote_id: Option<&str>,
    ) -> Result<(), ManagerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO AutoLock (path, process, remote_id) VALUES (?1, ?2, ?3)",
        )
        .bind(path)
        .bind(process)
        .bind(remote_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unlock_path(&self, path: &str) -> Result<(), ManagerError> {
        sqlx::query("DELETE FROM AutoLock WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn locked_paths(&self) -> Result<Vec<AutoLockedPath>, ManagerError> {
        let rows = sqlx::query("SELECT path, process, remote_id FROM AutoLock ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(AutoLockedPath {
                    path: row.try_get("path")?,
                    process: row.try_get("process")?,
                    remote_id: row.try_get("remote_id")?,
                })
            })
            .collect()
    }
}

/// Owns every engine of the process plus the shared singletons.
pub struct Manager {
    home: PathBuf,
    dao: ManagerDao,
    options: Arc<Options>,
    state: Arc<State>,
    device_id: String,
    engines: RwLock<HashMap<String, Arc<Engine>>>,
}

impl Manager {
    pub async fn new(home: PathBuf, options: Arc<Options>) -> Result<Self, ManagerError> {
        std::fs::create_dir_all(&home)?;
        let dao = ManagerDao::new(&home.join("manager.db")).await?;
        let device_id = match dao.get_config(CONFIG_DEVICE_ID).await? {
            Some(device_id) => device_id,
            None => {
                let device_id = generate_uid();
                dao.set_config(CONFIG_DEVICE_ID, &device_id).await?;
                device_id
            }
        };
        Ok(Self {
            home,
            dao,
            options,
            state: Arc::new(State::default()),
            device_id,
            engines: RwLock::new(HashMap::new()),
        })
    }

    pub fn dao(&self) -> &ManagerDao {
        &self.dao
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines
            .read()
            .expect("engine map poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn engine(&self, uid: &str) -> Option<Arc<Engine>> {
        self.engines
            .read()
            .expect("engine map poisoned")
            .get(uid)
            .cloned()
    }

    fn client_config(&self) -> ClientConfig {
        let snapshot = self.options.snapshot();
        ClientConfig {
            app_name: "ndrive".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            device_id: self.device_id.clone(),
            metrics: serde_json::json!({
                "channel": snapshot.channel.as_str(),
                "chunk_size": snapshot.chunk_size_bytes,
            }),
            timeout: std::time::Duration::from_secs(snapshot.timeout_secs),
            tx_timeout: std::time::Duration::from_secs(snapshot.timeout_secs * 10),
        }
    }

    /// Binds a new engine: one local root, one server account, one remote
    /// root, one database file.
    pub async fn bind_engine(
        &self,
        server_url: &str,
        token: &str,
        local_folder: &Path,
        remote_root_ref: &str,
        name: Option<&str>,
    ) -> Result<Arc<Engine>, ManagerError> {
        let uid = generate_uid();
        std::fs::create_dir_all(local_folder)?;
        self.dao
            .insert_engine(
                &uid,
                &local_folder.to_string_lossy(),
                server_url,
                token,
                remote_root_ref,
                name,
            )
            .await?;

        let engine = self
            .load_engine(&uid, server_url, token, local_folder, remote_root_ref)
            .await?;
        info!(engine = %uid, folder = %local_folder.display(), "engine bound");
        Ok(engine)
    }

    /// Restores every registered engine from the manager database.
    pub async fn load_engines(&self) -> Result<Vec<Arc<Engine>>, ManagerError> {
        let mut loaded = Vec::new();
        for record in self.dao.list_engines().await? {
            let (Some(token), Some(root_ref)) = (&record.remote_token, &record.root_ref) else {
                warn!(engine = %record.uid, "registry row misses its token or root, skipping");
                continue;
            };
            let engine = self
                .load_engine(
                    &record.uid,
                    &record.server_url,
                    token,
                    Path::new(&record.local_folder),
                    root_ref,
                )
                .await?;
            loaded.push(engine);
        }
        Ok(loaded)
    }

    async fn load_engine(
        &self,
        uid: &str,
        server_url: &str,
        token: &str,
        local_folder: &Path,
        remote_root_ref: &str,
    ) -> Result<Arc<Engine>, ManagerError> {
        let snapshot = self.options.snapshot();
        let db_path = self.home.join(format!("ndrive_{uid}.db"));
        let dao = Arc::new(EngineDao::new(&db_path).await?);
        let client = NuxeoClient::with_config(server_url, token, self.client_config())?;

        let mut config = EngineConfig::new(uid, local_folder.to_path_buf(), remote_root_ref);
        config.poll_interval = std::time::Duration::from_secs(snapshot.delay_secs);
        config.worker_count = snapshot.sync_workers;
        config.max_errors = snapshot.max_errors;
        config.transfer.chunk_limit = snapshot.chunk_limit_bytes;
        config.transfer.chunk_size = snapshot.chunk_size_bytes;
        config.ignored_prefixes = snapshot.ignored_prefixes.clone();
        config.ignored_suffixes = snapshot.ignored_suffixes.clone();

        let engine = Engine::assemble(config, dao, client);
        if let Err(err) = engine.tag_root() {
            warn!(engine = uid, error = %err, "cannot tag the engine root");
        }
        self.engines
            .write()
            .expect("engine map poisoned")
            .insert(uid.to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    pub async fn unbind_engine(&self, uid: &str) -> Result<(), ManagerError> {
        let engine = self
            .engines
            .write()
            .expect("engine map poisoned")
            .remove(uid)
            .ok_or_else(|| ManagerError::UnknownEngine(uid.to_string()))?;
        engine.stop().await;
        if let Err(err) = engine.local().clean_xattr("/").await {
            warn!(engine = uid, error = %err, "cannot strip remote ids while unbinding");
        }
        self.dao.remove_engine(uid).await?;
        let _ = std::fs::remove_file(self.home.join(format!("ndrive_{uid}.db")));
        Ok(())
    }

    /// Graceful process exit: flag, then stop engines one by one.
    pub async fn stop(&self) {
        self.state.set_about_to_quit();
        for engine in self.engines() {
            engine.stop().await;
        }
    }

    //
    // Updates
    //

    /// Fetches the catalog and computes the update status against the first
    /// bound server.
    pub async fn check_for_update(&self) -> Result<Option<(UpdateStatus, String)>, ManagerError> {
        let snapshot = self.options.snapshot();
        let url = format!("{}/versions.json", snapshot.update_site_url.trim_end_matches('/'));
        let catalog = match fetch_catalog(&url).await {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(url = %url, error = %err, "update site unavailable");
                return Ok(Some((UpdateStatus::UnavailableSite, String::new())));
            }
        };

        let server_version = match self.engines().first() {
            Some(engine) => engine.client().server_version().await.ok(),
            None => None,
        };
        Ok(compute_update_status(
            env!("CARGO_PKG_VERSION"),
            &catalog,
            snapshot.channel,
            server_version.as_deref(),
            LoginCapability::new_only(),
            snapshot.client_version.as_deref(),
        ))
    }
}

/// Pure wrapper so the decision stays testable without a manager.
pub fn compute_update_status(
    current: &str,
    catalog: &std::collections::BTreeMap<String, VersionInfo>,
    channel: Channel,
    server_version: Option<&str>,
    login: LoginCapability,
    pinned: Option<&str>,
) -> Option<(UpdateStatus, String)> {
    get_update_status(current, catalog, channel, server_version, login, pinned)
}

async fn fetch_catalog(
    url: &str,
) -> Result<std::collections::BTreeMap<String, VersionInfo>, NuxeoError> {
    let response = reqwest::Client::new().get(url).send().await?;
    if !response.status().is_success() {
        return Err(NuxeoError::Api {
            status: response.status(),
            body: String::new(),
            retry_after: None,
        });
    }
    let catalog = response.json().await?;
    Ok(catalog)
}

fn generate_uid() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let value: u8 = rng.gen_range(0..16);
            char::from_digit(value as u32, 16).expect("hex digit")
        })
        .collect()
}
