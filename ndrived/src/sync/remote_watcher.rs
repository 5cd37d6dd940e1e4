use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use ndrive_core::{ChangeSummary, NuxeoClient, NuxeoError, RemoteFileInfo};

use super::dao::{
    CONFIG_REMOTE_ROOTS, DaoError, DocPair, EngineDao, RemoteChangeOp, is_filtered,
};
use super::local::join_remote;
use super::states::RemoteState;

const SCROLL_BATCH_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum RemoteWatcherError {
    #[error("api error: {0}")]
    Api(#[from] NuxeoError),
    #[error("database error: {0}")]
    Dao(#[from] DaoError),
}

/// Periodic poller of the server change feed.
///
/// Transport failures leave every cursor untouched; the engine loop backs
/// off and re-schedules.
pub struct RemoteWatcher {
    dao: Arc<EngineDao>,
    client: NuxeoClient,
    /// Remote ref of the synchronization root, mapped to the local `/`.
    root_ref: String,
}

impl RemoteWatcher {
    pub fn new(dao: Arc<EngineDao>, client: NuxeoClient, root_ref: String) -> Self {
        Self {
            dao,
            client,
            root_ref,
        }
    }

    /// One poll cycle. Returns the pairs whose state changed.
    pub async fn poll(&self) -> Result<Vec<DocPair>, RemoteWatcherError> {
        let (log_id, sync_date) = self.dao.remote_cursor().await?;
        let roots = self
            .dao
            .get_config(CONFIG_REMOTE_ROOTS)
            .await?
            .unwrap_or_default();
        let summary = self
            .client
            .get_changes(&roots, log_id, sync_date.unwrap_or(0))
            .await?;

        if summary.has_too_many_changes {
            info!("change feed overflowed, falling back to a full remote scan");
            return self.full_scan(&summary).await;
        }

        let filters = self.dao.filters().await?;
        let mut ops = Vec::new();
        for change in &summary.file_system_changes {
            let Some(fs_item_id) = change.file_system_item_id.as_deref() else {
                continue;
            };
            let existing = self.dao.pair_by_remote_ref(fs_item_id).await?;
            let info = change.file_system_item.clone().map(RemoteFileInfo::from);

            // A missing item payload or an explicit deletion event both mean
            // the item is gone for us (server trash included).
            let deleted = change.event_id == "deleted" || info.is_none();
            if deleted {
                if let Some(pair) = existing {
                    if pair.remote_state != RemoteState::Deleted {
                        ops.push(RemoteChangeOp::Deleted { pair_id: pair.id });
                    }
                } else {
                    debug!(fs_item_id, "deletion for an item we never knew, skipping");
                }
                continue;
            }
            let info = info.expect("checked above");

            let local_path = match self.local_path_for(&info, &HashMap::new()).await? {
                Some(path) => path,
                None => {
                    debug!(fs_item_id, "change outside the known tree, skipping");
                    continue;
                }
            };
            if is_filtered(&filters, &local_path) {
                // Filtered items are non-existent from the engine's point of
                // view; an already-known pair is cleaned up.
                if let Some(pair) = existing {
                    ops.push(RemoteChangeOp::Deleted { pair_id: pair.id });
                }
                continue;
            }

            match existing {
                Some(pair) => {
                    let moved = pair.remote_parent_ref.as_deref() != info.parent_uid.as_deref()
                        || pair.remote_name.as_deref() != Some(info.name.as_str());
                    let modified = pair.remote_digest != info.digest;
                    if moved {
                        ops.push(RemoteChangeOp::Moved {
                            pair_id: pair.id,
                            info,
                        });
                    } else if modified {
                        ops.push(RemoteChangeOp::Modified {
                            pair_id: pair.id,
                            info,
                        });
                    }
                    // Same name, parent and digest: already applied.
                }
                None => {
                    let local_parent_path = super::dao::parent_of(&local_path);
                    ops.push(RemoteChangeOp::Created {
                        info,
                        local_path,
                        local_parent_path,
                    });
                }
            }
        }

        let touched = self
            .dao
            .apply_remote_changes(
                ops,
                summary.upper_bound,
                summary.sync_date,
                &summary.active_synchronization_root_definitions,
            )
            .await?;
        Ok(touched)
    }

    /// Scoped remote scan of the root, emitting transitions equivalent to an
    /// incremental feed. Used when the feed reports an overflow.
    async fn full_scan(&self, summary: &ChangeSummary) -> Result<Vec<DocPair>, RemoteWatcherError> {
        let filters = self.dao.filters().await?;

        let mut items = Vec::new();
        let mut scroll_id: Option<String> = None;
        loop {
            let batch = self
                .client
                .scroll_descendants(&self.root_ref, scroll_id.as_deref(), SCROLL_BATCH_SIZE)
                .await?;
            if batch.file_system_items.is_empty() {
                break;
            }
            scroll_id = Some(batch.scroll_id);
            items.extend(
                batch
                    .file_system_items
                    .into_iter()
                    .map(RemoteFileInfo::from),
            );
        }

        let by_uid: HashMap<String, RemoteFileInfo> = items
            .iter()
            .map(|info| (info.uid.clone(), info.clone()))
            .collect();

        let mut ops = Vec::new();
        let mut seen = HashSet::new();
        for info in &items {
            seen.insert(info.uid.clone());
            let Some(local_path) = self.local_path_for(info, &by_uid).await? else {
                continue;
            };
            if is_filtered(&filters, &local_path) {
                if let Some(pair) = self.dao.pair_by_remote_ref(&info.uid).await? {
                    ops.push(RemoteChangeOp::Deleted { pair_id: pair.id });
                }
                continue;
            }
            match self.dao.pair_by_remote_ref(&info.uid).await? {
                Some(pair) => {
                    let moved = pair.remote_parent_ref.as_deref() != info.parent_uid.as_deref()
                        || pair.remote_name.as_deref() != Some(info.name.as_str());
                    let modified = pair.remote_digest != info.digest;
                    if moved {
                        ops.push(RemoteChangeOp::Moved {
                            pair_id: pair.id,
                            info: info.clone(),
                        });
                    } else if modified {
                        ops.push(RemoteChangeOp::Modified {
                            pair_id: pair.id,
                            info: info.clone(),
                        });
                    }
                }
                None => {
                    let local_parent_path = super::dao::parent_of(&local_path);
                    ops.push(RemoteChangeOp::Created {
                        info: info.clone(),
                        local_path,
                        local_parent_path,
                    });
                }
            }
        }

        // Pairs whose remote side disappeared while the feed overflowed.
        for pair in self.dao.pairs_under("/").await? {
            if let Some(remote_ref) = &pair.remote_ref
                && !seen.contains(remote_ref)
                && pair.remote_state != RemoteState::Deleted
                && pair.remote_state != RemoteState::Unknown
            {
                ops.push(RemoteChangeOp::Deleted { pair_id: pair.id });
            }
        }

        let touched = self
            .dao
            .apply_remote_changes(
                ops,
                summary.upper_bound,
                summary.sync_date,
                &summary.active_synchronization_root_definitions,
            )
            .await?;
        Ok(touched)
    }

    /// Local path a remote item maps to, walking parent refs through the
    /// database (and, during a scan, the in-flight batch). `None` when the
    /// item is not under the engine's root.
    async fn local_path_for(
        &self,
        info: &RemoteFileInfo,
        batch: &HashMap<String, RemoteFileInfo>,
    ) -> Result<Option<String>, RemoteWatcherError> {
        let mut segments = vec![info.name.clone()];
        let mut parent = info.parent_uid.clone();
        let mut hops = 0u32;
        loop {
            let Some(parent_ref) = parent else {
                return Ok(None);
            };
            if parent_ref == self.root_ref {
                break;
            }
            if let Some(pair) = self.dao.pair_by_remote_ref(&parent_ref).await? {
                if let Some(parent_path) = pair.local_path {
                    let tail = segments.into_iter().rev().fold(
                        parent_path,
                        |acc, segment| join_remote(&acc, &segment),
                    );
                    return Ok(Some(tail));
                }
                return Ok(None);
            }
            let Some(batch_parent) = batch.get(&parent_ref) else {
                return Ok(None);
            };
            segments.push(batch_parent.name.clone());
            parent = batch_parent.parent_uid.clone();
            hops += 1;
            if hops > 128 {
                warn!(uid = %info.uid, "remote parent chain too deep, skipping");
                return Ok(None);
            }
        }
        let path = segments
            .into_iter()
            .rev()
            .fold("/".to_string(), |acc, segment| join_remote(&acc, &segment));
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::states::PairState;
    use sqlx::SqlitePool;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ROOT: &str = "root#1";

    async fn setup(server: &MockServer) -> (Arc<EngineDao>, RemoteWatcher) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let dao = Arc::new(EngineDao::from_pool(pool));
        dao.init().await.unwrap();
        let client = NuxeoClient::new(&server.uri(), "token").unwrap();
        let watcher = RemoteWatcher::new(Arc::clone(&dao), client, ROOT.to_string());
        (dao, watcher)
    }

    fn fs_item(uid: &str, parent: &str, name: &str, folder: bool, digest: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": uid,
            "parentId": parent,
            "name": name,
            "folder": folder,
            "lastModificationDate": 1_700_000_000_000i64,
            "digest": digest,
            "digestAlgorithm": digest.map(|_| "md5"),
            "canRename": true,
            "canDelete": true,
            "canUpdate": !folder,
            "canCreateChild": folder
        })
    }

    async fn mount_changes(server: &MockServer, changes: serde_json::Value, upper_bound: Option<i64>) {
        let mut body = serde_json::json!({
            "hasTooManyChanges": false,
            "activeSynchronizationRootDefinitions": "default:root#1",
            "fileSystemChanges": changes,
            "syncDate": 1_700_000_500i64
        });
        if let Some(upper_bound) = upper_bound {
            body["upperBound"] = serde_json::json!(upper_bound);
        }
        Mock::given(method("POST"))
            .and(path("/nuxeo/site/automation/NuxeoDrive.GetChangeSummary"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn new_remote_item_becomes_remotely_created() {
        let server = MockServer::start().await;
        let (dao, watcher) = setup(&server).await;
        mount_changes(
            &server,
            serde_json::json!([{
                "eventId": "documentCreated",
                "fileSystemItemId": "doc#1",
                "eventDate": 1_700_000_400_000i64,
                "fileSystemItem": fs_item("doc#1", ROOT, "a.txt", false, Some("d1"))
            }]),
            Some(57),
        )
        .await;

        let touched = watcher.poll().await.unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].pair_state, PairState::RemotelyCreated);
        assert_eq!(touched[0].local_path.as_deref(), Some("/a.txt"));

        let (log_id, _) = dao.remote_cursor().await.unwrap();
        assert_eq!(log_id, Some(57));
    }

    #[tokio::test]
    async fn cursor_falls_back_to_sync_date_without_upper_bound() {
        let server = MockServer::start().await;
        let (dao, watcher) = setup(&server).await;
        mount_changes(&server, serde_json::json!([]), None).await;

        watcher.poll().await.unwrap();
        // No id-based cursor: the next poll keys on the sync date instead.
        let (log_id, sync_date) = dao.remote_cursor().await.unwrap();
        assert_eq!(log_id, None);
        assert_eq!(sync_date, Some(1_700_000_500));
    }

    #[tokio::test]
    async fn deletion_event_cascades() {
        let server = MockServer::start().await;
        let (dao, watcher) = setup(&server).await;
        let info = RemoteFileInfo::from(
            serde_json::from_value::<ndrive_core::FileSystemItem>(fs_item(
                "doc#1", ROOT, "a.txt", false, Some("d1"),
            ))
            .unwrap(),
        );
        dao.insert_remote_state(&info, "/a.txt", "/").await.unwrap();

        mount_changes(
            &server,
            serde_json::json!([{
                "eventId": "deleted",
                "fileSystemItemId": "doc#1",
                "eventDate": 1_700_000_450_000i64
            }]),
            Some(58),
        )
        .await;

        let touched = watcher.poll().await.unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].pair_state, PairState::RemotelyDeleted);
    }

    #[tokio::test]
    async fn rename_becomes_remotely_moved() {
        let server = MockServer::start().await;
        let (dao, watcher) = setup(&server).await;
        let info = RemoteFileInfo::from(
            serde_json::from_value::<ndrive_core::FileSystemItem>(fs_item(
                "doc#1", ROOT, "a.txt", false, Some("d1"),
            ))
            .unwrap(),
        );
        let pair = dao.insert_remote_state(&info, "/a.txt", "/").await.unwrap();
        dao.synchronize_pair(&pair, None, Some(ROOT), Some("a.txt"), Some("d1"), Some("d1"), None, 1)
            .await
            .unwrap();

        mount_changes(
            &server,
            serde_json::json!([{
                "eventId": "documentMoved",
                "fileSystemItemId": "doc#1",
                "eventDate": 1_700_000_450_000i64,
                "fileSystemItem": fs_item("doc#1", ROOT, "b.txt", false, Some("d1"))
            }]),
            Some(59),
        )
        .await;

        let touched = watcher.poll().await.unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].pair_state, PairState::RemotelyMoved);
        assert_eq!(touched[0].remote_name.as_deref(), Some("b.txt"));
    }

    #[tokio::test]
    async fn applying_the_same_change_twice_is_idempotent() {
        let server = MockServer::start().await;
        let (dao, watcher) = setup(&server).await;
        mount_changes(
            &server,
            serde_json::json!([{
                "eventId": "documentCreated",
                "fileSystemItemId": "doc#1",
                "eventDate": 1_700_000_400_000i64,
                "fileSystemItem": fs_item("doc#1", ROOT, "a.txt", false, Some("d1"))
            }]),
            Some(57),
        )
        .await;

        watcher.poll().await.unwrap();
        let second = watcher.poll().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(dao.pairs_under("/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn filtered_item_is_treated_as_non_existent() {
        let server = MockServer::start().await;
        let (dao, watcher) = setup(&server).await;
        dao.add_filter("/Folder1").await.unwrap();
        let folder_info = RemoteFileInfo::from(
            serde_json::from_value::<ndrive_core::FileSystemItem>(fs_item(
                "folder#1", ROOT, "Folder1", true, None,
            ))
            .unwrap(),
        );
        dao.insert_remote_state(&folder_info, "/Folder1", "/")
            .await
            .unwrap();

        mount_changes(
            &server,
            serde_json::json!([{
                "eventId": "documentCreated",
                "fileSystemItemId": "doc#2",
                "eventDate": 1_700_000_400_000i64,
                "fileSystemItem": fs_item("doc#2", "folder#1", "inner.txt", false, Some("d2"))
            }]),
            Some(60),
        )
        .await;

        watcher.poll().await.unwrap();
        assert!(dao.pair_by_remote_ref("doc#2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overflow_triggers_scroll_scan() {
        let server = MockServer::start().await;
        let (dao, watcher) = setup(&server).await;

        Mock::given(method("POST"))
            .and(path("/nuxeo/site/automation/NuxeoDrive.GetChangeSummary"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hasTooManyChanges": true,
                "activeSynchronizationRootDefinitions": "default:root#1",
                "fileSystemChanges": [],
                "syncDate": 1_700_000_600i64,
                "upperBound": 99
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/nuxeo/site/automation/NuxeoDrive.ScrollDescendants"))
            .and(body_partial_json(serde_json::json!({
                "params": { "id": ROOT }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "scrollId": "s-1",
                "fileSystemItems": []
            })))
            .mount(&server)
            .await;

        // First scroll page is empty: nothing exists remotely any more.
        let info = RemoteFileInfo::from(
            serde_json::from_value::<ndrive_core::FileSystemItem>(fs_item(
                "doc#1", ROOT, "a.txt", false, Some("d1"),
            ))
            .unwrap(),
        );
        let pair = dao.insert_remote_state(&info, "/a.txt", "/").await.unwrap();
        dao.synchronize_pair(&pair, None, Some(ROOT), Some("a.txt"), Some("d1"), Some("d1"), None, 1)
            .await
            .unwrap();

        let touched = watcher.poll().await.unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].pair_state, PairState::RemotelyDeleted);
        let (log_id, _) = dao.remote_cursor().await.unwrap();
        assert_eq!(log_id, Some(99));
    }

    #[tokio::test]
    async fn transport_failure_leaves_cursor_untouched() {
        let server = MockServer::start().await;
        let (dao, watcher) = setup(&server).await;
        dao.set_config(super::super::dao::CONFIG_REMOTE_LOG_ID, "41")
            .await
            .unwrap();
        Mock::given(method("POST"))
            .and(path("/nuxeo/site/automation/NuxeoDrive.GetChangeSummary"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert!(watcher.poll().await.is_err());
        let (log_id, _) = dao.remote_cursor().await.unwrap();
        assert_eq!(log_id, Some(41));
    }
}
