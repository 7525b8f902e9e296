//! Filesystem-backed source store.
//!
//! Collections are directories under a configured root. Control state (the
//! attribute map and the export lock) lives in a reserved `.deposit-agent/`
//! folder inside each collection, which tree walks never see.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use super::{SourceFile, SourceStore, SourceTree, StoreAttestations, StoreReader};
use crate::utils::errors::ExportError;

/// Reserved control folder, excluded from every tree walk.
pub const CONTROL_DIR: &str = ".deposit-agent";

const ATTRS_FILE: &str = "attributes.json";
const LOCK_FILE: &str = "lock";

type AttrMap = HashMap<String, Vec<String>>;

pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection_dir(&self, collection: &str) -> crate::Result<PathBuf> {
        validate_relative(collection)?;
        Ok(self.root.join(collection))
    }

    fn resolve(&self, collection: &str, relative_path: &str) -> crate::Result<PathBuf> {
        let dir = self.collection_dir(collection)?;
        validate_relative(relative_path)?;
        Ok(dir.join(relative_path))
    }

    fn control_dir(&self, collection: &str) -> crate::Result<PathBuf> {
        Ok(self.collection_dir(collection)?.join(CONTROL_DIR))
    }

    async fn read_attrs(&self, collection: &str) -> crate::Result<AttrMap> {
        let path = self.control_dir(collection)?.join(ATTRS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AttrMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_attrs(&self, collection: &str, attrs: &AttrMap) -> crate::Result<()> {
        let dir = self.control_dir(collection)?;
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(attrs)?;
        tokio::fs::write(dir.join(ATTRS_FILE), bytes).await?;
        Ok(())
    }
}

// rejects traversal segments and anything aimed at the control folder
fn validate_relative(path: &str) -> crate::Result<()> {
    if path.is_empty() {
        return Err(ExportError::Store("empty path".to_string()));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) if segment != CONTROL_DIR => {}
            _ => {
                return Err(ExportError::Store(format!(
                    "unsafe path rejected: {path}"
                )))
            }
        }
    }
    Ok(())
}

fn walk_collection(root: &Path) -> crate::Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != CONTROL_DIR);
    for entry in walker {
        let entry = entry.map_err(|e| ExportError::Store(format!("tree walk failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry
            .metadata()
            .map_err(|e| ExportError::Store(format!("tree walk failed: {e}")))?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        files.push(SourceFile {
            relative_path: relative.to_string_lossy().into_owned(),
            size: metadata.len(),
        });
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn file_attestation(path: &Path) -> crate::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha2:{}", BASE64.encode(hasher.finalize())))
}

#[async_trait]
impl SourceStore for FsStore {
    async fn load_tree(&self, collection: &str) -> crate::Result<SourceTree> {
        let dir = self.collection_dir(collection)?;
        if !dir.is_dir() {
            return Err(ExportError::Store(format!(
                "collection not found: {collection}"
            )));
        }
        let files = tokio::task::spawn_blocking(move || walk_collection(&dir))
            .await
            .map_err(|e| ExportError::Store(format!("tree walk task failed: {e}")))??;
        debug!(collection, files = files.len(), "loaded source tree");
        Ok(SourceTree {
            collection: collection.to_string(),
            files,
        })
    }

    async fn open_file(
        &self,
        collection: &str,
        relative_path: &str,
    ) -> crate::Result<StoreReader> {
        let path = self.resolve(collection, relative_path)?;
        let file = tokio::fs::File::open(&path).await?;
        Ok(Box::new(file))
    }

    async fn fetch_attestations(&self, collection: &str) -> crate::Result<StoreAttestations> {
        let dir = self.collection_dir(collection)?;
        let attestations = tokio::task::spawn_blocking(move || {
            let mut out = StoreAttestations::new();
            for file in walk_collection(&dir)? {
                let attested = file_attestation(&dir.join(&file.relative_path))?;
                out.insert(file.relative_path, attested);
            }
            Ok::<_, ExportError>(out)
        })
        .await
        .map_err(|e| ExportError::Store(format!("digest task failed: {e}")))??;
        debug!(collection, files = attestations.len(), "fetched digest attestations");
        Ok(attestations)
    }

    async fn add_attribute(
        &self,
        collection: &str,
        name: &str,
        value: &str,
    ) -> crate::Result<()> {
        let mut attrs = self.read_attrs(collection).await?;
        let values = attrs.entry(name.to_string()).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
        self.write_attrs(collection, &attrs).await
    }

    async fn remove_attribute(
        &self,
        collection: &str,
        name: &str,
        value: &str,
    ) -> crate::Result<bool> {
        let mut attrs = self.read_attrs(collection).await?;
        let removed = match attrs.get_mut(name) {
            Some(values) => match values.iter().position(|v| v == value) {
                Some(index) => {
                    values.remove(index);
                    if values.is_empty() {
                        attrs.remove(name);
                    }
                    true
                }
                None => false,
            },
            None => false,
        };
        if removed {
            self.write_attrs(collection, &attrs).await?;
        }
        Ok(removed)
    }

    async fn attribute_values(
        &self,
        collection: &str,
        name: &str,
    ) -> crate::Result<Vec<String>> {
        let attrs = self.read_attrs(collection).await?;
        Ok(attrs.get(name).cloned().unwrap_or_default())
    }

    async fn open_collection(&self, collection: &str) -> crate::Result<()> {
        let dir = self.control_dir(collection)?;
        tokio::fs::create_dir_all(&dir).await?;
        let lock = dir.join(LOCK_FILE);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock)
            .await
        {
            Ok(_) => {
                debug!(collection, "collection locked for export");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(ExportError::Store(
                format!("collection is already locked: {collection}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn close_collection(&self, collection: &str) -> crate::Result<()> {
        let lock = self.control_dir(collection)?.join(LOCK_FILE);
        match tokio::fs::remove_file(&lock).await {
            Ok(()) => {
                debug!(collection, "collection lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, collection: &str, relative_path: &str) -> crate::Result<()> {
        let path = self.resolve(collection, relative_path)?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::decode_attestation;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn seed(dir: &TempDir, files: &[(&str, &str)]) -> FsStore {
        for (path, contents) in files {
            let full = dir.path().join("coll1").join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
        FsStore::new(dir.path())
    }

    #[tokio::test]
    async fn test_load_tree_sorted_and_sized() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("z.txt", "abc"), ("a/b.txt", "hello"), ("a/c.txt", "")]);

        let tree = store.load_tree("coll1").await.unwrap();
        assert_eq!(tree.collection, "coll1");
        let paths: Vec<&str> = tree.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a/b.txt", "a/c.txt", "z.txt"]);
        assert_eq!(tree.files[0].size, 5);
        assert_eq!(tree.total_bytes(), 8);
    }

    #[tokio::test]
    async fn test_walk_skips_control_dir() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("data.txt", "x")]);
        store.add_attribute("coll1", "k", "v").await.unwrap();

        let tree = store.load_tree("coll1").await.unwrap();
        assert_eq!(tree.file_count(), 1);
        assert_eq!(tree.files[0].relative_path, "data.txt");
    }

    #[tokio::test]
    async fn test_missing_collection_errors() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        assert!(store.load_tree("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_attestations_decode_to_sha256() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a/b.txt", "hello")]);

        let attestations = store.fetch_attestations("coll1").await.unwrap();
        let raw = attestations.get("a/b.txt").unwrap();
        assert!(raw.starts_with("sha2:"));
        assert_eq!(decode_attestation(raw).unwrap(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_attribute_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("f", "")]);

        store.add_attribute("coll1", "exporterState", "A:one").await.unwrap();
        store.add_attribute("coll1", "exporterState", "A:two").await.unwrap();
        // adding the same value twice keeps it single
        store.add_attribute("coll1", "exporterState", "A:two").await.unwrap();
        assert_eq!(
            store.attribute_values("coll1", "exporterState").await.unwrap(),
            vec!["A:one", "A:two"]
        );

        assert!(store.remove_attribute("coll1", "exporterState", "A:one").await.unwrap());
        // absent value reports false, not an error
        assert!(!store.remove_attribute("coll1", "exporterState", "A:one").await.unwrap());
        assert_eq!(
            store.attribute_values("coll1", "exporterState").await.unwrap(),
            vec!["A:two"]
        );
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_reentrant_close() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("f", "")]);

        store.open_collection("coll1").await.unwrap();
        assert!(store.open_collection("coll1").await.is_err());

        store.close_collection("coll1").await.unwrap();
        // closing an unheld lock is fine
        store.close_collection("coll1").await.unwrap();
        store.open_collection("coll1").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_file() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a/b.txt", "hello")]);

        store.delete_file("coll1", "a/b.txt").await.unwrap();
        assert!(store.delete_file("coll1", "a/b.txt").await.is_err());
        assert_eq!(store.load_tree("coll1").await.unwrap().file_count(), 0);
    }

    #[tokio::test]
    async fn test_unsafe_paths_rejected() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("f", "secret")]);

        assert!(store.open_file("coll1", "../outside.txt").await.is_err());
        assert!(store.open_file("coll1", "/etc/passwd").await.is_err());
        assert!(store
            .open_file("coll1", ".deposit-agent/attributes.json")
            .await
            .is_err());
        assert!(store.delete_file("../coll1", "f").await.is_err());
    }
}
