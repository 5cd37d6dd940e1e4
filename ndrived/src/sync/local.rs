use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::warn;

/// Extended attribute carrying the remote filesystem-item id.
const XATTR_REMOTE_ID: &str = "user.ndrive";
/// Variant used on the synchronization root itself.
const XATTR_ROOT_ID: &str = "user.ndriveroot";

const DIGEST_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum LocalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("local path is empty")]
    EmptyPath,
    #[error("local path contains unsupported component")]
    UnsupportedComponent,
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigest(String),
    #[error("name clash between {existing:?} and {incoming:?}")]
    NameClash { existing: String, incoming: String },
}

/// Snapshot of one local file or folder, keyed by its engine-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInfo {
    /// Path relative to the engine root, `/`-separated, leading slash.
    pub path: String,
    pub name: String,
    pub folderish: bool,
    pub size: u64,
    /// Unix seconds.
    pub last_modified: i64,
    pub digest: Option<String>,
    pub digest_algorithm: String,
}

/// Pathed operations over one engine's local root.
///
/// All paths are relative to the root; escape via `..` is refused. Writes to
/// one path are serialized through a per-path mutex so a watcher-triggered
/// touch never races a processor write.
#[derive(Clone)]
pub struct LocalClient {
    root: PathBuf,
    ignored_prefixes: Vec<String>,
    ignored_suffixes: Vec<String>,
    path_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LocalClient {
    pub fn new(
        root: PathBuf,
        ignored_prefixes: Vec<String>,
        ignored_suffixes: Vec<String>,
    ) -> Self {
        Self {
            root,
            ignored_prefixes,
            ignored_suffixes,
            path_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an engine-relative path under the configured root.
    pub fn abspath(&self, path: &str) -> Result<PathBuf, LocalError> {
        if path.is_empty() {
            return Err(LocalError::EmptyPath);
        }
        let mut out = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => continue,
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(LocalError::UnsupportedComponent);
                }
            }
        }
        Ok(out)
    }

    /// Engine-relative path of an absolute one, or `None` outside the root.
    pub fn relpath(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let joined = PathBuf::from("/").join(relative);
        Some(joined.to_string_lossy().replace('\\', "/"))
    }

    /// Serializes writers touching the same path.
    pub fn path_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.path_locks.lock().expect("path lock map poisoned");
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Names matching the configured prefixes/suffixes are invisible to the
    /// engine: never scanned, watched or uploaded.
    pub fn is_ignored(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.ignored_prefixes
            .iter()
            .any(|prefix| lower.starts_with(prefix.as_str()))
            || self
                .ignored_suffixes
                .iter()
                .any(|suffix| lower.ends_with(suffix.as_str()))
    }

    pub async fn exists(&self, path: &str) -> bool {
        match self.abspath(path) {
            Ok(abspath) => tokio::fs::metadata(abspath).await.is_ok(),
            Err(_) => false,
        }
    }

    pub async fn get_info(&self, path: &str) -> Result<LocalInfo, LocalError> {
        let abspath = self.abspath(path)?;
        let meta = tokio::fs::metadata(&abspath).await?;
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(LocalInfo {
            path: path.to_string(),
            name: super::dao::name_of(path),
            folderish: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            last_modified,
            digest: None,
            digest_algorithm: "md5".to_string(),
        })
    }

    /// Direct children, ignored names excluded, sorted by name.
    pub async fn get_children(&self, path: &str) -> Result<Vec<LocalInfo>, LocalError> {
        let abspath = self.abspath(path)?;
        let mut entries = tokio::fs::read_dir(&abspath).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.is_ignored(&name) {
                continue;
            }
            let child_path = join_remote(path, &name);
            out.push(self.get_info(&child_path).await?);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn make_folder(&self, path: &str) -> Result<(), LocalError> {
        let abspath = self.abspath(path)?;
        tokio::fs::create_dir_all(abspath).await?;
        Ok(())
    }

    pub async fn make_file(&self, path: &str, content: &[u8]) -> Result<(), LocalError> {
        let abspath = self.abspath(path)?;
        if let Some(parent) = abspath.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(abspath, content).await?;
        Ok(())
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>, LocalError> {
        Ok(tokio::fs::read(self.abspath(path)?).await?)
    }

    pub async fn write(&self, path: &str, content: &[u8]) -> Result<(), LocalError> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        self.make_file(path, content).await
    }

    pub async fn rename(&self, path: &str, new_name: &str) -> Result<String, LocalError> {
        let parent = super::dao::parent_of(path);
        let new_path = join_remote(&parent, new_name);
        self.move_to(path, &new_path).await?;
        Ok(new_path)
    }

    pub async fn move_to(&self, path: &str, new_path: &str) -> Result<(), LocalError> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        let from = self.abspath(path)?;
        let to = self.abspath(new_path)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    /// Moves to the platform trash; falls back to permanent deletion with a
    /// warning when the trash refuses the path.
    pub async fn delete(&self, path: &str) -> Result<(), LocalError> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        let abspath = self.abspath(path)?;
        let trashed =
            tokio::task::spawn_blocking(move || trash::delete(&abspath).map(|_| abspath))
                .await
                .map_err(|err| io::Error::other(err.to_string()))?;
        match trashed {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(path, error = %err, "trash refused the item, deleting permanently");
                let abspath = self.abspath(path)?;
                let meta = tokio::fs::metadata(&abspath).await?;
                if meta.is_dir() {
                    tokio::fs::remove_dir_all(abspath).await?;
                } else {
                    tokio::fs::remove_file(abspath).await?;
                }
                Ok(())
            }
        }
    }

    /// Streaming content fingerprint. Zero-length files yield the
    /// algorithm's digest of the empty input.
    pub async fn get_digest(&self, path: &str, algorithm: &str) -> Result<String, LocalError> {
        let abspath = self.abspath(path)?;
        let mut file = tokio::fs::File::open(&abspath).await?;
        let mut buffer = vec![0u8; DIGEST_CHUNK];
        match algorithm {
            "md5" => {
                let mut context = md5::Context::new();
                loop {
                    let read = file.read(&mut buffer).await?;
                    if read == 0 {
                        break;
                    }
                    context.consume(&buffer[..read]);
                }
                Ok(format!("{:x}", context.compute()))
            }
            "sha256" => {
                let mut hasher = Sha256::new();
                loop {
                    let read = file.read(&mut buffer).await?;
                    if read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..read]);
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
            other => Err(LocalError::UnsupportedDigest(other.to_string())),
        }
    }

    //
    // Remote-id tagging
    //

    /// Best-effort: a failed tag is logged, never fatal; the pair is
    /// re-tagged on the next successful touch.
    pub fn set_remote_id(&self, path: &str, remote_id: &str) -> Result<(), LocalError> {
        let abspath = self.abspath(path)?;
        let name = if path == "/" { XATTR_ROOT_ID } else { XATTR_REMOTE_ID };
        if let Err(err) = xattr::set(&abspath, name, remote_id.as_bytes()) {
            warn!(path, error = %err, "cannot tag item with its remote id");
        }
        Ok(())
    }

    pub fn get_remote_id(&self, path: &str) -> Option<String> {
        let abspath = self.abspath(path).ok()?;
        let name = if path == "/" { XATTR_ROOT_ID } else { XATTR_REMOTE_ID };
        let value = xattr::get(&abspath, name).ok()??;
        String::from_utf8(value).ok()
    }

    pub fn remove_remote_id(&self, path: &str) -> Result<(), LocalError> {
        let abspath = self.abspath(path)?;
        let name = if path == "/" { XATTR_ROOT_ID } else { XATTR_REMOTE_ID };
        if let Err(err) = xattr::remove(&abspath, name)
            && err.raw_os_error() != Some(libc_enodata())
        {
            warn!(path, error = %err, "cannot strip remote id");
        }
        Ok(())
    }

    /// Recursively strips remote ids, e.g. before unbinding an engine.
    pub async fn clean_xattr(&self, path: &str) -> Result<(), LocalError> {
        self.remove_remote_id(path)?;
        let info = self.get_info(path).await?;
        if info.folderish {
            for child in self.get_children(path).await? {
                Box::pin(self.clean_xattr(&child.path)).await?;
            }
        }
        Ok(())
    }

    /// Reports two names that collide on a case-insensitive volume.
    pub fn find_case_clash(&self, siblings: &[LocalInfo], name: &str) -> Option<String> {
        let lower = name.to_lowercase();
        siblings
            .iter()
            .find(|info| info.name != name && info.name.to_lowercase() == lower)
            .map(|info| info.name.clone())
    }
}

pub fn join_remote(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

fn libc_enodata() -> i32 {
    // ENODATA on Linux; the value xattr reports for an absent attribute.
    61
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn client(root: &Path) -> LocalClient {
        LocalClient::new(
            root.to_path_buf(),
            vec![".".into(), "~$".into()],
            vec![".tmp".into(), ".partial".into(), "~".into()],
        )
    }

    #[tokio::test]
    async fn abspath_refuses_escape() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        assert!(matches!(
            local.abspath("/../etc/passwd"),
            Err(LocalError::UnsupportedComponent)
        ));
        assert_eq!(
            local.abspath("/Docs/A.txt").unwrap(),
            dir.path().join("Docs/A.txt")
        );
    }

    #[tokio::test]
    async fn children_skip_ignored_names() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_file("/a.txt", b"a").await.unwrap();
        local.make_file("/.hidden", b"x").await.unwrap();
        local.make_file("/report.tmp", b"x").await.unwrap();
        local.make_file("/~$draft.docx", b"x").await.unwrap();

        let children = local.get_children("/").await.unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn digest_of_empty_file_is_empty_input_digest() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_file("/empty", b"").await.unwrap();
        assert_eq!(
            local.get_digest("/empty", "md5").await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            local.get_digest("/empty", "sha256").await.unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn digest_matches_known_value() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_file("/hello.txt", b"hello").await.unwrap();
        assert_eq!(
            local.get_digest("/hello.txt", "md5").await.unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert!(matches!(
            local.get_digest("/hello.txt", "crc32").await,
            Err(LocalError::UnsupportedDigest(_))
        ));
    }

    #[tokio::test]
    async fn rename_and_move_keep_content() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_file("/Docs/a.txt", b"payload").await.unwrap();

        let renamed = local.rename("/Docs/a.txt", "b.txt").await.unwrap();
        assert_eq!(renamed, "/Docs/b.txt");
        local.move_to("/Docs/b.txt", "/Archive/b.txt").await.unwrap();
        assert_eq!(local.read("/Archive/b.txt").await.unwrap(), b"payload");
        assert!(!local.exists("/Docs/b.txt").await);
    }

    #[tokio::test]
    async fn delete_removes_the_item_one_way_or_another() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_file("/Docs/a.txt", b"x").await.unwrap();
        local.delete("/Docs/a.txt").await.unwrap();
        assert!(!local.exists("/Docs/a.txt").await);

        local.make_folder("/Sub/Deep").await.unwrap();
        local.delete("/Sub").await.unwrap();
        assert!(!local.exists("/Sub").await);
    }

    #[tokio::test]
    async fn remote_id_round_trips_when_xattrs_are_supported() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_file("/a.txt", b"x").await.unwrap();

        let abspath = local.abspath("/a.txt").unwrap();
        if xattr::set(&abspath, "user.ndrive-probe", b"1").is_err() {
            // Filesystem without user xattrs; tagging degrades to a warning.
            return;
        }

        local.set_remote_id("/a.txt", "doc#1").unwrap();
        assert_eq!(local.get_remote_id("/a.txt").as_deref(), Some("doc#1"));
        local.remove_remote_id("/a.txt").unwrap();
        assert_eq!(local.get_remote_id("/a.txt"), None);
    }

    #[tokio::test]
    async fn case_clash_is_detected() {
        let dir = tempdir().unwrap();
        let local = client(dir.path());
        local.make_file("/Readme.txt", b"x").await.unwrap();
        let siblings = local.get_children("/").await.unwrap();
        assert_eq!(
            local.find_case_clash(&siblings, "README.TXT").as_deref(),
            Some("Readme.txt")
        );
        assert_eq!(local.find_case_clash(&siblings, "Readme.txt"), None);
    }

    #[test]
    fn join_remote_handles_root() {
        assert_eq!(join_remote("/", "a.txt"), "/a.txt");
        assert_eq!(join_remote("/Docs", "a.txt"), "/Docs/a.txt");
        assert_eq!(join_remote("/Docs/", "a.txt"), "/Docs/a.txt");
    }
}
