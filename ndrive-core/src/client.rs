use std::collections::HashMap;
use std::time::Duration;

use futures_util::Stream;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

use crate::models::{
    BatchFileInfo, BatchUpload, ChangeSummary, FileSystemItem, RemoteFileInfo, RepositoryStatus,
    ScrollBatch,
};

const AUTOMATION_PATH: &str = "nuxeo/site/automation/";
const UPLOAD_PATH: &str = "nuxeo/api/v1/upload/";
const CMIS_PATH: &str = "nuxeo/json/cmis";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum NuxeoError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("api response missing field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Forbidden,
    NotFound,
    RateLimit,
    Transient,
    Permanent,
}

impl NuxeoError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            NuxeoError::Api { status, .. } => Some(classify_api_status(*status)),
            NuxeoError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == Some(ApiErrorClass::NotFound)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            NuxeoError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    match status {
        StatusCode::UNAUTHORIZED => ApiErrorClass::Auth,
        StatusCode::FORBIDDEN => ApiErrorClass::Forbidden,
        StatusCode::NOT_FOUND => ApiErrorClass::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ApiErrorClass::RateLimit,
        status if status.is_server_error() => ApiErrorClass::Transient,
        StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT => ApiErrorClass::Transient,
        _ => ApiErrorClass::Permanent,
    }
}

/// Identification carried on every request (§ application headers).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub app_name: String,
    pub client_version: String,
    pub device_id: String,
    /// Feature flags forwarded as a JSON blob in `X-Custom-Metrics`.
    pub metrics: Value,
    pub timeout: Duration,
    /// Timeout for operations that commit a server-side blob transaction.
    pub tx_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_name: "ndrive".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            device_id: String::new(),
            metrics: Value::Null,
            timeout: DEFAULT_TIMEOUT,
            tx_timeout: DEFAULT_TX_TIMEOUT,
        }
    }
}

/// Client over one server account.
///
/// No operation retries on its own; transient failures are surfaced to the
/// caller which owns the retry policy.
#[derive(Clone)]
pub struct NuxeoClient {
    http: Client,
    base_url: Url,
    token: String,
    config: ClientConfig,
}

impl NuxeoClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, NuxeoError> {
        Self::with_config(base_url, token, ClientConfig::default())
    }

    pub fn with_config(
        base_url: &str,
        token: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, NuxeoError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token: token.into(),
            config,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// `NuxeoDrive.GetChangeSummary`. Uses `lowerBound` when an id-based
    /// cursor is known, `lastSyncDate` otherwise.
    pub async fn get_changes(
        &self,
        last_root_definitions: &str,
        log_id: Option<i64>,
        last_sync_date: i64,
    ) -> Result<ChangeSummary, NuxeoError> {
        let params = match log_id {
            Some(log_id) => json!({
                "lowerBound": log_id,
                "lastSyncActiveRootDefinitions": last_root_definitions,
            }),
            None => json!({
                "lastSyncDate": last_sync_date,
                "lastSyncActiveRootDefinitions": last_root_definitions,
            }),
        };
        self.operation("NuxeoDrive.GetChangeSummary", None, params, false)
            .await
    }

    /// Returns `None` when the item does not exist (the server answers with
    /// a null body rather than a 404).
    pub async fn get_fs_info(&self, fs_item_id: &str) -> Result<Option<RemoteFileInfo>, NuxeoError> {
        let item: Option<FileSystemItem> = self
            .operation(
                "NuxeoDrive.GetFileSystemItem",
                None,
                json!({ "id": fs_item_id }),
                false,
            )
            .await?;
        Ok(item.map(RemoteFileInfo::from))
    }

    pub async fn fs_exists(&self, fs_item_id: &str) -> Result<bool, NuxeoError> {
        self.operation(
            "NuxeoDrive.FileSystemItemExists",
            None,
            json!({ "id": fs_item_id }),
            false,
        )
        .await
    }

    pub async fn get_fs_children(
        &self,
        fs_item_id: &str,
    ) -> Result<Vec<RemoteFileInfo>, NuxeoError> {
        let items: Vec<FileSystemItem> = self
            .operation(
                "NuxeoDrive.GetChildren",
                None,
                json!({ "id": fs_item_id }),
                false,
            )
            .await?;
        Ok(items.into_iter().map(RemoteFileInfo::from).collect())
    }

    /// One page of the scalable descendant walk used for full remote scans.
    pub async fn scroll_descendants(
        &self,
        fs_item_id: &str,
        scroll_id: Option<&str>,
        batch_size: u32,
    ) -> Result<ScrollBatch, NuxeoError> {
        let mut params = json!({ "id": fs_item_id, "batchSize": batch_size });
        if let Some(scroll_id) = scroll_id {
            params["scrollId"] = Value::String(scroll_id.to_string());
        }
        self.operation("NuxeoDrive.ScrollDescendants", None, params, false)
            .await
    }

    pub async fn get_filesystem_root_info(&self) -> Result<RemoteFileInfo, NuxeoError> {
        let item: FileSystemItem = self
            .operation("NuxeoDrive.GetTopLevelFolder", None, json!({}), false)
            .await?;
        Ok(RemoteFileInfo::from(item))
    }

    /// The user's personal workspace, used as the default Direct Transfer
    /// destination.
    pub async fn personal_space(&self) -> Result<Document, NuxeoError> {
        self.operation("UserWorkspace.Get", None, json!({}), false)
            .await
    }

    pub async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteFileInfo, NuxeoError> {
        let item: FileSystemItem = self
            .operation(
                "NuxeoDrive.CreateFolder",
                None,
                json!({ "parentId": parent_id, "name": name }),
                false,
            )
            .await?;
        Ok(RemoteFileInfo::from(item))
    }

    /// Creates a document and attaches an already-uploaded batch blob in one
    /// operation. Used by the continuous-sync upload path.
    pub async fn create_file_with_batch(
        &self,
        parent_id: &str,
        name: &str,
        batch_id: &str,
        file_idx: u32,
    ) -> Result<RemoteFileInfo, NuxeoError> {
        let item: FileSystemItem = self
            .operation(
                "NuxeoDrive.CreateFile",
                Some(batch_input(batch_id, file_idx)),
                json!({ "parentId": parent_id, "name": name }),
                true,
            )
            .await?;
        Ok(RemoteFileInfo::from(item))
    }

    pub async fn update_file_with_batch(
        &self,
        fs_item_id: &str,
        batch_id: &str,
        file_idx: u32,
    ) -> Result<RemoteFileInfo, NuxeoError> {
        let item: FileSystemItem = self
            .operation(
                "NuxeoDrive.UpdateFile",
                Some(batch_input(batch_id, file_idx)),
                json!({ "id": fs_item_id }),
                true,
            )
            .await?;
        Ok(RemoteFileInfo::from(item))
    }

    /// `Blob.AttachOnDocument`, the single point of commit for an upload.
    pub async fn attach_blob(
        &self,
        batch_id: &str,
        file_idx: u32,
        doc_ref: &str,
        xpath: &str,
    ) -> Result<(), NuxeoError> {
        let _: Value = self
            .operation(
                "Blob.AttachOnDocument",
                Some(batch_input(batch_id, file_idx)),
                json!({ "document": doc_ref, "xpath": xpath }),
                true,
            )
            .await?;
        Ok(())
    }

    /// Creates a bare document (no blob) under the given parent.
    pub async fn create_document(
        &self,
        parent_ref: &str,
        name: &str,
        doc_type: &str,
    ) -> Result<String, NuxeoError> {
        let doc: Document = self
            .operation(
                "Document.Create",
                Some(Value::String(parent_ref.to_string())),
                json!({ "type": doc_type, "name": name }),
                false,
            )
            .await?;
        Ok(doc.uid)
    }

    pub async fn document_children(&self, parent_ref: &str) -> Result<Vec<Document>, NuxeoError> {
        let page: DocumentPage = self
            .operation(
                "Document.GetChildren",
                Some(Value::String(parent_ref.to_string())),
                json!({}),
                false,
            )
            .await?;
        Ok(page.entries)
    }

    pub async fn set_ace(
        &self,
        doc_ref: &str,
        user: &str,
        permission: &str,
    ) -> Result<(), NuxeoError> {
        let _: Value = self
            .operation(
                "Document.SetACE",
                Some(Value::String(doc_ref.to_string())),
                json!({ "user": user, "permission": permission }),
                false,
            )
            .await?;
        Ok(())
    }

    pub async fn exists_in_parent(
        &self,
        parent_id: &str,
        name: &str,
        folderish: bool,
    ) -> Result<bool, NuxeoError> {
        let children = self.get_fs_children(parent_id).await?;
        Ok(children
            .iter()
            .any(|child| child.name == name && child.folderish == folderish))
    }

    pub async fn rename(&self, fs_item_id: &str, name: &str) -> Result<RemoteFileInfo, NuxeoError> {
        let item: FileSystemItem = self
            .operation(
                "NuxeoDrive.Rename",
                None,
                json!({ "id": fs_item_id, "name": name }),
                false,
            )
            .await?;
        Ok(RemoteFileInfo::from(item))
    }

    pub async fn move_item(
        &self,
        fs_item_id: &str,
        dest_parent_id: &str,
    ) -> Result<RemoteFileInfo, NuxeoError> {
        let item: FileSystemItem = self
            .operation(
                "NuxeoDrive.Move",
                None,
                json!({ "srcId": fs_item_id, "destId": dest_parent_id }),
                false,
            )
            .await?;
        Ok(RemoteFileInfo::from(item))
    }

    pub async fn delete_item(
        &self,
        fs_item_id: &str,
        parent_fs_item_id: Option<&str>,
    ) -> Result<(), NuxeoError> {
        let mut params = json!({ "id": fs_item_id });
        if let Some(parent) = parent_fs_item_id {
            params["parentId"] = Value::String(parent.to_string());
        }
        let _: Value = self
            .operation("NuxeoDrive.Delete", None, params, false)
            .await?;
        Ok(())
    }

    //
    // Batch upload endpoints (resumable sessions)
    //

    pub async fn create_batch(&self) -> Result<BatchUpload, NuxeoError> {
        let url = self.endpoint(UPLOAD_PATH)?;
        let response = self.request(self.http.post(url)).send().await?;
        Self::handle_response(response).await
    }

    /// Uploads one chunk. Idempotent for a given
    /// `(batch_id, file_idx, chunk_index)`.
    pub async fn upload_chunk(
        &self,
        batch_id: &str,
        file_idx: u32,
        chunk_index: u32,
        chunk_count: u32,
        file_name: &str,
        file_size: u64,
        chunk: Vec<u8>,
    ) -> Result<(), NuxeoError> {
        let url = self.endpoint(&format!("{UPLOAD_PATH}{batch_id}/{file_idx}"))?;
        let response = self
            .request(self.http.post(url))
            .header("X-Upload-Type", "chunked")
            .header("X-Upload-Chunk-Index", chunk_index.to_string())
            .header("X-Upload-Chunk-Count", chunk_count.to_string())
            .header("X-File-Name", file_name)
            .header("X-File-Size", file_size.to_string())
            .body(chunk)
            .send()
            .await?;
        let _: Value = Self::handle_response(response).await?;
        Ok(())
    }

    /// Single-request upload for files under the chunking threshold.
    pub async fn upload_whole(
        &self,
        batch_id: &str,
        file_idx: u32,
        file_name: &str,
        body: Vec<u8>,
    ) -> Result<(), NuxeoError> {
        let url = self.endpoint(&format!("{UPLOAD_PATH}{batch_id}/{file_idx}"))?;
        let response = self
            .request(self.http.post(url))
            .header("X-File-Name", file_name)
            .body(body)
            .send()
            .await?;
        let _: Value = Self::handle_response(response).await?;
        Ok(())
    }

    /// Current uploaded extent of a batch file; lets a crashed upload resume
    /// where it stopped. An unknown batch answers 404.
    pub async fn batch_file_info(
        &self,
        batch_id: &str,
        file_idx: u32,
    ) -> Result<BatchFileInfo, NuxeoError> {
        let url = self.endpoint(&format!("{UPLOAD_PATH}{batch_id}/{file_idx}"))?;
        let response = self.request(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn cancel_batch(&self, batch_id: &str) -> Result<(), NuxeoError> {
        let url = self.endpoint(&format!("{UPLOAD_PATH}{batch_id}"))?;
        let response = self.request(self.http.delete(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            // Already gone server-side; nothing left to clean.
            return Ok(());
        }
        Self::expect_success(response).await
    }

    //
    // Blob download
    //

    /// Opens a byte stream on a blob, starting at `offset`. The caller owns
    /// chunk pacing, pause checks and integrity verification.
    pub async fn download(
        &self,
        download_url: &str,
        offset: u64,
    ) -> Result<impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + use<>, NuxeoError> {
        let url = match Url::parse(download_url) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self.base_url.join(download_url)?,
            Err(err) => return Err(err.into()),
        };
        let mut request = self.request(self.http.get(url));
        if offset > 0 {
            request = request.header("Range", format!("bytes={offset}-"));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(NuxeoError::Api {
                status,
                body,
                retry_after,
            });
        }
        Ok(response.bytes_stream())
    }

    pub async fn server_version(&self) -> Result<String, NuxeoError> {
        let url = self.endpoint(CMIS_PATH)?;
        let response = self.request(self.http.get(url)).send().await?;
        let repos: HashMap<String, RepositoryStatus> = Self::handle_response(response).await?;
        repos
            .get("default")
            .or_else(|| repos.values().next())
            .map(|repo| repo.product_version.clone())
            .ok_or(NuxeoError::MissingField("productVersion"))
    }

    //
    // Internals
    //

    async fn operation<T: DeserializeOwned>(
        &self,
        command: &str,
        input: Option<Value>,
        params: Value,
        tx: bool,
    ) -> Result<T, NuxeoError> {
        let url = self.endpoint(&format!("{AUTOMATION_PATH}{command}"))?;
        let mut body = json!({ "params": params });
        if let Some(input) = input {
            body["input"] = input;
        }
        let mut request = self
            .request(self.http.post(url))
            .header("Content-Type", "application/json")
            .json(&body);
        if tx {
            // Server-side blob commits may outlive the metadata timeout.
            request = request
                .timeout(self.config.tx_timeout)
                .header("Nuxeo-Transaction-Timeout", self.config.tx_timeout.as_secs());
        }
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder
            .timeout(self.config.timeout)
            .header("X-Authentication-Token", &self.token)
            .header("X-Application-Name", &self.config.app_name)
            .header("X-Client-Version", &self.config.client_version)
            .header("X-Device-Id", &self.config.device_id);
        if !self.config.metrics.is_null() {
            builder = builder.header("X-Custom-Metrics", self.config.metrics.to_string());
        }
        builder
    }

    fn endpoint(&self, path: &str) -> Result<Url, NuxeoError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NuxeoError> {
        if response.status().is_success() {
            let text = response.text().await?;
            if text.trim().is_empty() {
                // Void operations answer 204 or an empty body; represent it
                // as JSON null so Option/Value targets keep working.
                return serde_json::from_value(Value::Null)
                    .map_err(|_| NuxeoError::MissingField("body"));
            }
            serde_json::from_str(&text).map_err(|_| NuxeoError::MissingField("body"))
        } else {
            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            Err(NuxeoError::Api {
                status,
                body,
                retry_after,
            })
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), NuxeoError> {
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        Err(NuxeoError::Api {
            status,
            body,
            retry_after,
        })
    }
}

fn batch_input(batch_id: &str, file_idx: u32) -> Value {
    Value::String(format!("upload:{batch_id}:{file_idx}"))
}

fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Document {
    pub uid: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub doc_type: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct DocumentPage {
    #[serde(default)]
    entries: Vec<Document>,
}
