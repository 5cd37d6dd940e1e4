use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::dao::{DocPair, EngineDao, is_filtered};
use super::local::{LocalClient, LocalInfo};
use super::states::{LocalState, PairState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created { path: String },
    Modified { path: String },
    Deleted { path: String },
    Moved { from: String, to: String },
}

/// Translates raw notify events into engine-relative [`LocalEvent`]s.
pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2
                && let (Some(from), Some(to)) = (
                    to_engine_path(root, &event.paths[0]),
                    to_engine_path(root, &event.paths[1]),
                )
            {
                return vec![LocalEvent::Moved { from, to }];
            }
            // Single-path rename halves surface as delete + create and are
            // re-joined by the coalescing window.
            event
                .paths
                .into_iter()
                .filter_map(|path| to_engine_path(root, &path))
                .map(|path| LocalEvent::Modified { path })
                .collect()
        }
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .filter_map(|path| to_engine_path(root, &path))
            .map(|path| LocalEvent::Created { path })
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter_map(|path| to_engine_path(root, &path))
            .map(|path| LocalEvent::Modified { path })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter_map(|path| to_engine_path(root, &path))
            .map(|path| LocalEvent::Deleted { path })
            .collect(),
        _ => Vec::new(),
    }
}

fn to_engine_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let joined = std::path::PathBuf::from("/").join(relative);
    Some(joined.to_string_lossy().replace('\\', "/"))
}

/// Shared record of processor-initiated writes, consulted by the watcher to
/// suppress self-feedback events inside the quiesce window.
#[derive(Clone, Default)]
pub struct WriteMonitor {
    inner: Arc<Mutex<HashMap<String, Instant>>>,
}

impl WriteMonitor {
    pub fn record(&self, path: &str) {
        self.inner
            .lock()
            .expect("write monitor poisoned")
            .insert(path.to_string(), Instant::now());
    }

    pub fn is_recent(&self, path: &str, window: Duration) -> bool {
        let mut inner = self.inner.lock().expect("write monitor poisoned");
        match inner.get(path) {
            Some(stamp) if stamp.elapsed() <= window => true,
            Some(_) => {
                inner.remove(path);
                false
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LocalWatcherConfig {
    /// Delete+create pairs carrying the same remote id within this window
    /// collapse into a move.
    pub coalesce_window: Duration,
    /// Events this close to a processor write on the same path are echoes.
    pub quiesce_window: Duration,
}

impl Default for LocalWatcherConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_secs(1),
            quiesce_window: Duration::from_millis(250),
        }
    }
}

struct PendingDelete {
    pair: DocPair,
    seen: Instant,
}

/// Observes the local tree and emits pair-state transitions.
pub struct LocalWatcher {
    dao: Arc<EngineDao>,
    local: LocalClient,
    writes: WriteMonitor,
    config: LocalWatcherConfig,
    /// Deleted pairs waiting for a matching create (move detection), keyed
    /// by remote ref.
    pending_deletes: Mutex<HashMap<String, PendingDelete>>,
}

impl LocalWatcher {
    pub fn new(
        dao: Arc<EngineDao>,
        local: LocalClient,
        writes: WriteMonitor,
        config: LocalWatcherConfig,
    ) -> Self {
        Self {
            dao,
            local,
            writes,
            config,
            pending_deletes: Mutex::new(HashMap::new()),
        }
    }

    /// No event is waiting for coalescing. Exposed for tests and
    /// diagnostics.
    pub fn empty_events(&self) -> bool {
        self.pending_deletes
            .lock()
            .expect("pending map poisoned")
            .is_empty()
    }

    /// Paths currently held for coalescing.
    pub fn dirty_paths(&self) -> Vec<String> {
        self.pending_deletes
            .lock()
            .expect("pending map poisoned")
            .values()
            .filter_map(|pending| pending.pair.local_path.clone())
            .collect()
    }

    /// Reconciles the observed tree with the database. Idempotent: running
    /// it again on an unchanged tree yields no further transitions.
    pub async fn scan(&self) -> anyhow::Result<Vec<DocPair>> {
        let filters = self.dao.filters().await?;
        let mut touched = Vec::new();
        let mut seen = Vec::new();
        let mut stack = vec!["/".to_string()];

        while let Some(dir) = stack.pop() {
            for info in self.local.get_children(&dir).await? {
                if is_filtered(&filters, &info.path) {
                    continue;
                }
                seen.push(info.path.clone());
                if info.folderish {
                    stack.push(info.path.clone());
                }
                if let Some(pair) = self.reconcile_entry(&info).await? {
                    touched.push(pair);
                }
            }
        }

        // Pairs whose local side vanished while the engine was stopped.
        for pair in self.dao.pairs_under("/").await? {
            let Some(local_path) = pair.local_path.clone() else {
                continue;
            };
            if seen.contains(&local_path) {
                continue;
            }
            if matches!(pair.local_state, LocalState::Deleted | LocalState::Unknown) {
                continue;
            }
            if pair.local_state == LocalState::Direct {
                continue;
            }
            if !self.local.exists(&local_path).await {
                touched.extend(self.dao.mark_locally_deleted(&pair).await?);
            }
        }

        debug!(transitions = touched.len(), "initial scan done");
        Ok(touched)
    }

    async fn reconcile_entry(&self, info: &LocalInfo) -> anyhow::Result<Option<DocPair>> {
        let remote_id = self.local.get_remote_id(&info.path);
        let digest = if info.folderish {
            None
        } else {
            Some(self.local.get_digest(&info.path, "md5").await?)
        };
        let mut info = info.clone();
        info.digest = digest.clone();

        // Prefer the remote-id match: it survives offline renames.
        if let Some(remote_id) = remote_id
            && let Some(pair) = self.dao.pair_by_remote_ref(&remote_id).await?
        {
            if pair.local_path.as_deref() != Some(info.path.as_str()) {
                if self.dao.pair_by_local_path(&info.path).await?.is_some() {
                    // The original still lives at its old path: this entry is
                    // a copy carrying a duplicated id. Untag it and let it
                    // become a fresh document.
                    self.local.remove_remote_id(&info.path)?;
                    let fresh = self
                        .dao
                        .insert_local_state(&info, None, LocalState::Created)
                        .await?;
                    return Ok(Some(fresh));
                }
                let moved = self
                    .dao
                    .update_local_paths(&pair, &info.path, LocalState::Moved)
                    .await?;
                return Ok(Some(moved));
            }
            if !pair.folderish && pair.local_digest != info.digest {
                let modified = self
                    .dao
                    .update_local_state(&pair, &info, LocalState::Modified)
                    .await?;
                return Ok(Some(modified));
            }
            return Ok(None);
        }

        match self.dao.pair_by_local_path(&info.path).await? {
            Some(pair) if !pair.folderish && pair.local_digest != info.digest => {
                let state = if pair.pair_state == PairState::Synchronized {
                    LocalState::Modified
                } else {
                    pair.local_state
                };
                Ok(Some(self.dao.update_local_state(&pair, &info, state).await?))
            }
            Some(_) => Ok(None),
            None => Ok(Some(
                self.dao
                    .insert_local_state(&info, None, LocalState::Created)
                    .await?,
            )),
        }
    }

    /// Applies one filesystem event. Returns the pairs whose state changed.
    pub async fn handle_event(&self, event: LocalEvent) -> anyhow::Result<Vec<DocPair>> {
        let filters = self.dao.filters().await?;
        let path = match &event {
            LocalEvent::Created { path }
            | LocalEvent::Modified { path }
            | LocalEvent::Deleted { path } => path,
            LocalEvent::Moved { to, .. } => to,
        };
        // Any ignored segment hides the whole subtree (staging dirs
        // included).
        if path
            .trim_matches('/')
            .split('/')
            .any(|segment| self.local.is_ignored(segment))
        {
            return Ok(Vec::new());
        }
        if is_filtered(&filters, path) {
            return Ok(Vec::new());
        }
        if self.writes.is_recent(path, self.config.quiesce_window) {
            debug!(path = %path, "suppressing event inside the quiesce window");
            return Ok(Vec::new());
        }

        match event {
            LocalEvent::Created { path } => self.on_created(&path).await,
            LocalEvent::Modified { path } => self.on_modified(&path).await,
            LocalEvent::Deleted { path } => self.on_deleted(&path).await,
            LocalEvent::Moved { from, to } => self.on_moved(&from, &to).await,
        }
    }

    async fn on_created(&self, path: &str) -> anyhow::Result<Vec<DocPair>> {
        if !self.local.exists(path).await {
            return Ok(Vec::new());
        }
        let mut info = self.local.get_info(path).await?;
        if !info.folderish {
            info.digest = Some(self.local.get_digest(path, "md5").await?);
        }

        if let Some(remote_id) = self.local.get_remote_id(path) {
            // A delete seen moments ago with the same id makes this a move.
            let pending = {
                let mut map = self.pending_deletes.lock().expect("pending map poisoned");
                map.remove(&remote_id)
            };
            if let Some(pending) = pending {
                let moved = self
                    .dao
                    .update_local_paths(&pending.pair, path, LocalState::Moved)
                    .await?;
                return Ok(vec![moved]);
            }
            if let Some(pair) = self.dao.pair_by_remote_ref(&remote_id).await?
                && pair.local_path.as_deref() != Some(path)
                && let Some(original) = &pair.local_path
                && self.local.exists(original).await
            {
                // Copy-then-rename save pattern: the copy keeps the tag of
                // the original. Untag so it becomes a fresh document.
                self.local.remove_remote_id(path)?;
                let fresh = self
                    .dao
                    .insert_local_state(&info, None, LocalState::Created)
                    .await?;
                return Ok(vec![fresh]);
            }
        }

        let pair = self
            .dao
            .insert_local_state(&info, None, LocalState::Created)
            .await?;
        Ok(vec![pair])
    }

    async fn on_modified(&self, path: &str) -> anyhow::Result<Vec<DocPair>> {
        let Some(pair) = self.dao.pair_by_local_path(path).await? else {
            return self.on_created(path).await;
        };
        if pair.folderish {
            return Ok(Vec::new());
        }
        if !self.local.exists(path).await {
            return Ok(Vec::new());
        }
        let mut info = self.local.get_info(path).await?;
        info.digest = Some(self.local.get_digest(path, "md5").await?);
        if info.digest == pair.local_digest {
            return Ok(Vec::new());
        }
        let updated = self
            .dao
            .update_local_state(&pair, &info, LocalState::Modified)
            .await?;
        Ok(vec![updated])
    }

    async fn on_deleted(&self, path: &str) -> anyhow::Result<Vec<DocPair>> {
        let Some(pair) = self.dao.pair_by_local_path(path).await? else {
            return Ok(Vec::new());
        };
        if self.local.exists(path).await {
            // Stale event; the path is still there.
            return Ok(Vec::new());
        }
        if let Some(remote_ref) = pair.remote_ref.clone() {
            // Hold the deletion for the coalescing window: a create with the
            // same remote id turns it into a move.
            let mut map = self.pending_deletes.lock().expect("pending map poisoned");
            map.insert(
                remote_ref,
                PendingDelete {
                    pair,
                    seen: Instant::now(),
                },
            );
            return Ok(Vec::new());
        }
        Ok(self.dao.mark_locally_deleted(&pair).await?)
    }

    async fn on_moved(&self, from: &str, to: &str) -> anyhow::Result<Vec<DocPair>> {
        let Some(pair) = self.dao.pair_by_local_path(from).await? else {
            return self.on_created(to).await;
        };
        if from.to_lowercase() == to.to_lowercase() && from != to {
            // Case-only rename on a case-insensitive volume: track the new
            // spelling without a server round-trip.
            let updated = self
                .dao
                .update_local_paths(&pair, to, pair.local_state)
                .await?;
            return Ok(vec![updated]);
        }
        let moved = self
            .dao
            .update_local_paths(&pair, to, LocalState::Moved)
            .await?;
        Ok(vec![moved])
    }

    /// Promotes pending deletions older than the coalescing window into
    /// definitive `locally_deleted` transitions.
    pub async fn flush_pending(&self) -> anyhow::Result<Vec<DocPair>> {
        let expired: Vec<DocPair> = {
            let mut map = self.pending_deletes.lock().expect("pending map poisoned");
            let window = self.config.coalesce_window;
            let keys: Vec<String> = map
                .iter()
                .filter(|(_, pending)| pending.seen.elapsed() >= window)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| map.remove(&key))
                .map(|pending| pending.pair)
                .collect()
        };

        let mut touched = Vec::new();
        for pair in expired {
            match self.dao.mark_locally_deleted(&pair).await {
                Ok(affected) => touched.extend(affected),
                Err(err) => warn!(pair = pair.id, error = %err, "cannot flush pending deletion"),
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;
    use tempfile::tempdir;

    async fn setup(dir: &Path) -> (Arc<EngineDao>, LocalClient, LocalWatcher) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let dao = Arc::new(EngineDao::from_pool(pool));
        dao.init().await.unwrap();
        let local = LocalClient::new(
            dir.to_path_buf(),
            vec![".".into(), "~$".into()],
            vec![".tmp".into(), ".partial".into()],
        );
        let watcher = LocalWatcher::new(
            Arc::clone(&dao),
            local.clone(),
            WriteMonitor::default(),
            LocalWatcherConfig {
                coalesce_window: Duration::from_millis(0),
                quiesce_window: Duration::from_millis(250),
            },
        );
        (dao, local, watcher)
    }

    #[tokio::test]
    async fn scan_registers_new_files_and_folders() {
        let dir = tempdir().unwrap();
        let (dao, local, watcher) = setup(dir.path()).await;
        local.make_folder("/Docs").await.unwrap();
        local.make_file("/Docs/a.txt", b"hello").await.unwrap();

        let touched = watcher.scan().await.unwrap();
        assert_eq!(touched.len(), 2);

        let pair = dao.pair_by_local_path("/Docs/a.txt").await.unwrap().unwrap();
        assert_eq!(pair.pair_state, PairState::LocallyCreated);
        assert_eq!(
            pair.local_digest.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[tokio::test]
    async fn scan_is_idempotent() {
        let dir = tempdir().unwrap();
        let (_dao, local, watcher) = setup(dir.path()).await;
        local.make_file("/a.txt", b"one").await.unwrap();

        let first = watcher.scan().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = watcher.scan().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn scan_detects_offline_delete() {
        let dir = tempdir().unwrap();
        let (dao, local, watcher) = setup(dir.path()).await;
        local.make_file("/a.txt", b"one").await.unwrap();
        let pair = watcher.scan().await.unwrap().remove(0);
        dao.synchronize_pair(&pair, Some("doc#1"), None, Some("a.txt"), None, None, None, 1)
            .await
            .unwrap();

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        let touched = watcher.scan().await.unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].pair_state, PairState::LocallyDeleted);
    }

    #[tokio::test]
    async fn modification_with_same_digest_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (_dao, local, watcher) = setup(dir.path()).await;
        local.make_file("/a.txt", b"same").await.unwrap();
        watcher.scan().await.unwrap();

        let touched = watcher
            .handle_event(LocalEvent::Modified {
                path: "/a.txt".into(),
            })
            .await
            .unwrap();
        assert!(touched.is_empty());
    }

    #[tokio::test]
    async fn quiesce_window_suppresses_processor_echo() {
        let dir = tempdir().unwrap();
        let (_dao, local, _) = setup(dir.path()).await;
        let writes = WriteMonitor::default();
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let dao = Arc::new(EngineDao::from_pool(pool));
        dao.init().await.unwrap();
        let watcher = LocalWatcher::new(
            Arc::clone(&dao),
            local.clone(),
            writes.clone(),
            LocalWatcherConfig::default(),
        );

        local.make_file("/a.txt", b"x").await.unwrap();
        writes.record("/a.txt");
        let touched = watcher
            .handle_event(LocalEvent::Created {
                path: "/a.txt".into(),
            })
            .await
            .unwrap();
        assert!(touched.is_empty());
    }

    #[tokio::test]
    async fn filtered_subtree_events_are_ignored() {
        let dir = tempdir().unwrap();
        let (dao, local, watcher) = setup(dir.path()).await;
        dao.add_filter("/Folder1").await.unwrap();
        local.make_file("/Folder1/a.txt", b"x").await.unwrap();

        let touched = watcher
            .handle_event(LocalEvent::Created {
                path: "/Folder1/a.txt".into(),
            })
            .await
            .unwrap();
        assert!(touched.is_empty());
    }

    #[tokio::test]
    async fn delete_then_flush_marks_pair_deleted() {
        let dir = tempdir().unwrap();
        let (dao, local, watcher) = setup(dir.path()).await;
        local.make_file("/a.txt", b"x").await.unwrap();
        let pair = watcher.scan().await.unwrap().remove(0);
        dao.synchronize_pair(&pair, Some("doc#1"), None, Some("a.txt"), None, None, None, 1)
            .await
            .unwrap();

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        let touched = watcher
            .handle_event(LocalEvent::Deleted {
                path: "/a.txt".into(),
            })
            .await
            .unwrap();
        // Held back for move coalescing first.
        assert!(touched.is_empty());
        assert!(!watcher.empty_events());

        let flushed = watcher.flush_pending().await.unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].pair_state, PairState::LocallyDeleted);
        assert!(watcher.empty_events());
    }

    #[tokio::test]
    async fn case_only_rename_keeps_pair_synchronized() {
        let dir = tempdir().unwrap();
        let (dao, local, watcher) = setup(dir.path()).await;
        local.make_file("/readme.txt", b"x").await.unwrap();
        let pair = watcher.scan().await.unwrap().remove(0);
        let pair = dao
            .synchronize_pair(&pair, Some("doc#1"), None, Some("readme.txt"), None, None, None, 1)
            .await
            .unwrap();
        assert_eq!(pair.pair_state, PairState::Synchronized);

        local.move_to("/readme.txt", "/README.txt").await.unwrap();
        let touched = watcher
            .handle_event(LocalEvent::Moved {
                from: "/readme.txt".into(),
                to: "/README.txt".into(),
            })
            .await
            .unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].pair_state, PairState::Synchronized);
        assert_eq!(touched[0].local_path.as_deref(), Some("/README.txt"));
    }

    #[tokio::test]
    async fn real_move_produces_locally_moved() {
        let dir = tempdir().unwrap();
        let (dao, local, watcher) = setup(dir.path()).await;
        local.make_file("/Docs/a.txt", b"x").await.unwrap();
        let pairs = watcher.scan().await.unwrap();
        let pair = pairs
            .iter()
            .find(|p| p.local_path.as_deref() == Some("/Docs/a.txt"))
            .unwrap();
        dao.synchronize_pair(pair, Some("doc#1"), None, Some("a.txt"), None, None, None, 1)
            .await
            .unwrap();

        local.move_to("/Docs/a.txt", "/Docs/b.txt").await.unwrap();
        let touched = watcher
            .handle_event(LocalEvent::Moved {
                from: "/Docs/a.txt".into(),
                to: "/Docs/b.txt".into(),
            })
            .await
            .unwrap();
        assert_eq!(touched[0].pair_state, PairState::LocallyMoved);
        assert_eq!(touched[0].local_name.as_deref(), Some("b.txt"));
    }
}
