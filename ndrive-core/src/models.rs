use serde::{Deserialize, Serialize};

/// Raw filesystem item as returned by the Drive Automation operations.
///
/// Timestamps are epoch milliseconds on the wire; [`RemoteFileInfo`] holds
/// the converted form used by the rest of the client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemItem {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    pub folder: bool,
    #[serde(default)]
    pub last_modification_date: Option<i64>,
    #[serde(default)]
    pub creation_date: Option<i64>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub digest_algorithm: Option<String>,
    #[serde(rename = "downloadURL", default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub can_rename: bool,
    #[serde(default)]
    pub can_delete: bool,
    #[serde(default)]
    pub can_update: bool,
    #[serde(default)]
    pub can_create_child: bool,
    #[serde(default)]
    pub can_scroll_descendants: bool,
    #[serde(default)]
    pub last_contributor: Option<String>,
}

/// Normalized view of a [`FileSystemItem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub uid: String,
    pub parent_uid: Option<String>,
    pub name: String,
    pub path: Option<String>,
    pub folderish: bool,
    /// Unix seconds.
    pub last_modification: Option<i64>,
    pub creation: Option<i64>,
    pub digest: Option<String>,
    /// Lowercased, dash-free algorithm name ("md5", "sha256").
    pub digest_algorithm: Option<String>,
    pub download_url: Option<String>,
    pub can_rename: bool,
    pub can_delete: bool,
    pub can_update: bool,
    pub can_create_child: bool,
    pub can_scroll_descendants: bool,
}

impl From<FileSystemItem> for RemoteFileInfo {
    fn from(item: FileSystemItem) -> Self {
        let digest_algorithm = item
            .digest_algorithm
            .map(|algo| algo.to_ascii_lowercase().replace('-', ""));
        Self {
            uid: item.id,
            parent_uid: item.parent_id,
            name: item.name,
            path: item.path,
            folderish: item.folder,
            last_modification: item.last_modification_date.map(|ms| ms / 1000),
            creation: item.creation_date.map(|ms| ms / 1000),
            digest: item.digest,
            digest_algorithm,
            download_url: item.download_url,
            can_rename: item.can_rename,
            can_delete: item.can_delete,
            can_update: item.can_update,
            can_create_child: item.can_create_child,
            can_scroll_descendants: item.can_scroll_descendants,
        }
    }
}

/// One entry of the audit change feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemChange {
    pub event_id: String,
    #[serde(default)]
    pub doc_uuid: Option<String>,
    #[serde(default)]
    pub file_system_item_id: Option<String>,
    #[serde(default)]
    pub file_system_item_name: Option<String>,
    #[serde(default)]
    pub file_system_item: Option<FileSystemItem>,
    pub event_date: i64,
}

/// Result of `NuxeoDrive.GetChangeSummary`.
///
/// `upper_bound` is absent on servers without id-based cursors; callers fall
/// back to `sync_date` in that case.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub has_too_many_changes: bool,
    #[serde(default)]
    pub active_synchronization_root_definitions: String,
    #[serde(default)]
    pub file_system_changes: Vec<FileSystemChange>,
    pub sync_date: i64,
    #[serde(default)]
    pub upper_bound: Option<i64>,
}

/// One page of `NuxeoDrive.ScrollDescendants`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollBatch {
    pub scroll_id: String,
    #[serde(default)]
    pub file_system_items: Vec<FileSystemItem>,
}

/// Server-side upload session handle.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpload {
    pub batch_id: String,
}

/// Upload extent of one file inside a batch, used to resume after a crash.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFileInfo {
    #[serde(default)]
    pub uploaded_chunk_ids: Vec<u32>,
    #[serde(default)]
    pub uploaded_size: u64,
    #[serde(default)]
    pub chunk_count: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepositoryStatus {
    #[serde(rename = "productVersion")]
    pub product_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_system_item_converts_to_info() {
        let item: FileSystemItem = serde_json::from_value(serde_json::json!({
            "id": "defaultFileSystemItemFactory#default#uuid-1",
            "parentId": "defaultSyncRootFolderItemFactory#default#uuid-0",
            "name": "A.txt",
            "path": "/org/root/A.txt",
            "folder": false,
            "lastModificationDate": 1_700_000_000_000i64,
            "creationDate": 1_600_000_000_000i64,
            "digest": "abc",
            "digestAlgorithm": "MD5",
            "downloadURL": "nxfile/default/uuid-1/blobholder:0/A.txt",
            "canRename": true,
            "canDelete": true,
            "canUpdate": true
        }))
        .unwrap();

        let info = RemoteFileInfo::from(item);
        assert_eq!(info.uid, "defaultFileSystemItemFactory#default#uuid-1");
        assert_eq!(info.digest_algorithm.as_deref(), Some("md5"));
        assert_eq!(info.last_modification, Some(1_700_000_000));
        assert!(!info.folderish);
        assert!(info.can_update);
    }

    #[test]
    fn change_summary_tolerates_missing_upper_bound() {
        let summary: ChangeSummary = serde_json::from_value(serde_json::json!({
            "hasTooManyChanges": false,
            "activeSynchronizationRootDefinitions": "default:uuid-0",
            "fileSystemChanges": [],
            "syncDate": 1_700_000_123i64
        }))
        .unwrap();
        assert!(summary.upper_bound.is_none());
        assert_eq!(summary.sync_date, 1_700_000_123);
    }

    #[test]
    fn folderish_change_parses_embedded_item() {
        let change: FileSystemChange = serde_json::from_value(serde_json::json!({
            "eventId": "documentCreated",
            "docUuid": "uuid-2",
            "fileSystemItemId": "defaultFileSystemItemFactory#default#uuid-2",
            "eventDate": 1_700_000_200_000i64,
            "fileSystemItem": {
                "id": "defaultFileSystemItemFactory#default#uuid-2",
                "parentId": "defaultSyncRootFolderItemFactory#default#uuid-0",
                "name": "Folder1",
                "folder": true,
                "canCreateChild": true
            }
        }))
        .unwrap();
        let info = RemoteFileInfo::from(change.file_system_item.unwrap());
        assert!(info.folderish);
        assert!(info.can_create_child);
        assert!(info.digest.is_none());
    }
}
