//! Local directory as blob storage.
//!
//! `root/<container>/<name>` holds blob content; blob names use `/` for
//! subdirectories. Metadata lives in a `<name>.relaymeta.json` sidecar that is
//! hidden from listings. The change marker hashes size and modification time,
//! so rewriting a file with identical content still yields a new marker. A
//! same-size rewrite that lands within the filesystem's mtime granularity
//! keeps the old marker and is not seen as a change.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use relayhost_core::error::{RelayError, Result};
use relayhost_core::traits::BlobGateway;
use relayhost_core::types::{BlobEntry, BlobListing, ChangeMarker};
use sha2::{Digest, Sha256};

const META_SUFFIX: &str = ".relaymeta.json";

/// Blob containers backed by subdirectories of `root`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            root: root.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a container directory; the name must be one plain path segment.
    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        let mut components = Path::new(container).components();
        let single = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none()
            && !container.contains(['/', '\\']);
        if !single {
            return Err(RelayError::Storage(format!("invalid container '{container}'")));
        }
        Ok(self.root.join(container))
    }

    /// Resolve a blob path, refusing names that escape the container.
    fn blob_file(&self, container: &str, name: &str) -> Result<PathBuf> {
        let dir = self.container_dir(container)?;
        let relative = Path::new(name);
        let safe = !name.is_empty()
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(RelayError::Storage(format!("invalid blob path '{container}/{name}'")));
        }
        Ok(dir.join(relative))
    }

    fn meta_file(file: &Path) -> PathBuf {
        let mut os = file.as_os_str().to_owned();
        os.push(META_SUFFIX);
        PathBuf::from(os)
    }
}

fn join_error(e: tokio::task::JoinError) -> RelayError {
    RelayError::Storage(format!("blocking task failed: {e}"))
}

/// Hash of size and mtime, rendered like an ETag.
fn marker_for(meta: &std::fs::Metadata) -> ChangeMarker {
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(meta.len().to_le_bytes());
    hasher.update(modified.to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02X}")).collect();
    ChangeMarker::new(format!("0x{hex}"))
}

fn read_metadata(file: &Path) -> BTreeMap<String, String> {
    let meta_path = LocalBlobStore::meta_file(file);
    match std::fs::read_to_string(&meta_path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("⚠️ Ignoring unreadable blob metadata {}: {e}", meta_path.display());
            BTreeMap::new()
        }),
        Err(_) => BTreeMap::new(),
    }
}

fn entry_for(file: &Path, name: String) -> std::io::Result<BlobEntry> {
    let meta = std::fs::metadata(file)?;
    Ok(BlobEntry {
        name,
        change_marker: marker_for(&meta),
        metadata: read_metadata(file),
    })
}

/// All blob names under `dir`, `/`-separated and sorted.
fn walk(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];
    while let Some((current, prefix)) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = if prefix.is_empty() {
                file_name.clone()
            } else {
                format!("{prefix}/{file_name}")
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push((entry.path(), name));
            } else if file_type.is_file() && !file_name.ends_with(META_SUFFIX) {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl BlobGateway for LocalBlobStore {
    async fn list_blobs(&self, container: &str, page_token: Option<&str>) -> Result<BlobListing> {
        let dir = self.container_dir(container)?;
        let token = page_token.map(str::to_string);
        let page_size = self.page_size;

        tokio::task::spawn_blocking(move || -> Result<BlobListing> {
            if !dir.is_dir() {
                return Ok(BlobListing::default());
            }
            let names = walk(&dir)?;
            let mut remaining = names
                .into_iter()
                .filter(|n| token.as_deref().is_none_or(|t| n.as_str() > t))
                .peekable();

            let mut entries = Vec::new();
            while entries.len() < page_size {
                let Some(name) = remaining.next() else { break };
                match entry_for(&dir.join(&name), name.clone()) {
                    Ok(entry) => entries.push(entry),
                    // Deleted between walk and stat.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            let next_page = if remaining.peek().is_some() {
                entries.last().map(|e| e.name.clone())
            } else {
                None
            };
            Ok(BlobListing { entries, next_page })
        })
        .await
        .map_err(join_error)?
    }

    async fn get_properties(&self, container: &str, name: &str) -> Result<Option<BlobEntry>> {
        let file = self.blob_file(container, name)?;
        let name = name.to_string();
        tokio::task::spawn_blocking(move || match entry_for(&file, name) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
        .map_err(join_error)?
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let file = self.blob_file(container, name)?;
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_blob(
        &self,
        container: &str,
        name: &str,
        data: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<BlobEntry> {
        let file = self.blob_file(container, name)?;
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<BlobEntry> {
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let meta_path = LocalBlobStore::meta_file(&file);
            if metadata.is_empty() {
                std::fs::remove_file(&meta_path).ok();
            } else {
                std::fs::write(&meta_path, serde_json::to_vec(&metadata)?)?;
            }
            std::fs::write(&file, data)?;
            Ok(entry_for(&file, name)?)
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("relayhost-local-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_put_list_and_metadata() {
        let root = temp_root();
        let store = LocalBlobStore::new(&root, 2);
        let mut metadata = BTreeMap::new();
        metadata.insert("$RelayParentId".to_string(), "abc".to_string());

        store.put_blob("input", "a.txt", b"1".to_vec(), metadata).await.unwrap();
        store.put_blob("input", "nested/b.txt", b"2".to_vec(), BTreeMap::new()).await.unwrap();
        store.put_blob("input", "c.txt", b"3".to_vec(), BTreeMap::new()).await.unwrap();

        let first = store.list_blobs("input", None).await.unwrap();
        let names: Vec<_> = first.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "c.txt"]);
        assert_eq!(first.entries[0].metadata["$RelayParentId"], "abc");

        let token = first.next_page.unwrap();
        let second = store.list_blobs("input", Some(&token)).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].name, "nested/b.txt");
        assert!(second.next_page.is_none());

        assert_eq!(store.get_blob("input", "c.txt").await.unwrap(), Some(b"3".to_vec()));
        assert!(store.get_properties("input", "zzz").await.unwrap().is_none());
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let store = LocalBlobStore::new(temp_root(), 10);
        assert!(store.get_blob("input", "../secret").await.is_err());
        assert!(store.get_blob("..", "x").await.is_err());
        assert!(store.list_blobs("missing", None).await.unwrap().entries.is_empty());
        assert!(store.list_blobs("..", None).await.is_err());
        assert!(store.list_blobs("../elsewhere", None).await.is_err());
        assert!(store.list_blobs("/etc", None).await.is_err());
        assert!(store.list_blobs("", None).await.is_err());
    }
}
