//! Source store surface: tree walks, byte reads, digest attestations,
//! collection metadata, and the advisory export lock.

pub mod fs;

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::AsyncRead;

use crate::utils::errors::ExportError;

/// One file in a collection, addressed relative to the collection root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub relative_path: String,
    pub size: u64,
}

/// Snapshot of a collection's file tree, sorted by relative path.
#[derive(Debug, Clone)]
pub struct SourceTree {
    pub collection: String,
    pub files: Vec<SourceFile>,
}

impl SourceTree {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Sequential reader over one file's bytes.
pub type StoreReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Raw digest attestations keyed by relative path, in the store's native
/// `sha2:<base64>` form. See [`decode_attestation`].
pub type StoreAttestations = BTreeMap<String, String>;

/// Everything the export pipeline needs from the system holding the data.
///
/// Attribute operations back the phase markers, so their implementations
/// must tolerate concurrent readers; `remove_attribute` reports absence
/// instead of failing on it.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Walk the collection and return its file tree.
    async fn load_tree(&self, collection: &str) -> crate::Result<SourceTree>;

    /// Open a sequential reader over one file.
    async fn open_file(&self, collection: &str, relative_path: &str)
        -> crate::Result<StoreReader>;

    /// Fetch the store's own digest attestation for every file in the
    /// collection. Slow on large collections; callers overlap it with other
    /// work.
    async fn fetch_attestations(&self, collection: &str) -> crate::Result<StoreAttestations>;

    /// Add one value to a multi-valued collection attribute.
    async fn add_attribute(&self, collection: &str, name: &str, value: &str)
        -> crate::Result<()>;

    /// Remove one value from a collection attribute. Returns whether the
    /// value was present; removing an absent value is not an error.
    async fn remove_attribute(
        &self,
        collection: &str,
        name: &str,
        value: &str,
    ) -> crate::Result<bool>;

    /// All values currently held by a collection attribute.
    async fn attribute_values(&self, collection: &str, name: &str)
        -> crate::Result<Vec<String>>;

    /// Take the advisory lock bracketing an export run.
    async fn open_collection(&self, collection: &str) -> crate::Result<()>;

    /// Release the advisory lock. Releasing an unheld lock is not an error.
    async fn close_collection(&self, collection: &str) -> crate::Result<()>;

    /// Remove one source file. Only called for files whose transfer was
    /// fully verified.
    async fn delete_file(&self, collection: &str, relative_path: &str) -> crate::Result<()>;
}

/// Decode a store attestation (`sha2:` prefix, base64 raw digest) into the
/// lowercase hex this pipeline compares in.
pub fn decode_attestation(value: &str) -> crate::Result<String> {
    let encoded = value.strip_prefix("sha2:").ok_or_else(|| {
        ExportError::Store(format!("unrecognized digest attestation: {value}"))
    })?;
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| ExportError::Store(format!("bad digest attestation: {e}")))?;
    Ok(hex::encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_decode_attestation() {
        // base64 of the raw sha-256 of "hello"
        let attested = "sha2:LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=";
        assert_eq!(decode_attestation(attested).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_decode_rejects_foreign_schemes() {
        assert!(decode_attestation("md5:abcd").is_err());
        assert!(decode_attestation("plainhex").is_err());
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(decode_attestation("sha2:!!!not-base64!!!").is_err());
    }

    #[test]
    fn test_tree_totals() {
        let tree = SourceTree {
            collection: "c".to_string(),
            files: vec![
                SourceFile {
                    relative_path: "a".to_string(),
                    size: 10,
                },
                SourceFile {
                    relative_path: "b".to_string(),
                    size: 32,
                },
            ],
        };
        assert_eq!(tree.file_count(), 2);
        assert_eq!(tree.total_bytes(), 42);
    }
}
