//! Per-file digest bookkeeping for a single bundling pass.

use std::collections::BTreeMap;

use crate::bundle::digest::DigestPair;

/// Maps each file's store path to the digests computed while its bytes
/// streamed through the bundler.
///
/// A fresh ledger is produced by every pass over the source tree. Only the
/// ledger from the pass whose bytes actually went over the wire is handed to
/// reconciliation; the sizing pass recomputes everything and its ledger is
/// dropped.
#[derive(Debug, Default)]
pub struct TransferLedger {
    entries: BTreeMap<String, DigestPair>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the digests observed for one file. Keys are the original
    /// store-relative paths, not the sanitized archive paths.
    pub fn record(&mut self, path: impl Into<String>, digests: DigestPair) {
        self.entries.insert(path.into(), digests);
    }

    pub fn digests(&self, path: &str) -> Option<&DigestPair> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DigestPair)> {
        self.entries.iter().map(|(path, pair)| (path.as_str(), pair))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(sha: &str, md5: &str) -> DigestPair {
        DigestPair {
            sha256_hex: sha.to_string(),
            md5_hex: md5.to_string(),
        }
    }

    #[test]
    fn test_record_and_lookup() {
        let mut ledger = TransferLedger::new();
        assert!(ledger.is_empty());

        ledger.record("a/b.txt", pair("sha-b", "md5-b"));
        ledger.record("a/c.txt", pair("sha-c", "md5-c"));

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.digests("a/b.txt").unwrap().sha256_hex, "sha-b");
        assert!(ledger.digests("missing.txt").is_none());
    }

    #[test]
    fn test_iteration_is_path_ordered() {
        let mut ledger = TransferLedger::new();
        ledger.record("z.txt", pair("s1", "m1"));
        ledger.record("a.txt", pair("s2", "m2"));
        ledger.record("m/n.txt", pair("s3", "m3"));

        let paths: Vec<&str> = ledger.paths().collect();
        assert_eq!(paths, vec!["a.txt", "m/n.txt", "z.txt"]);
    }

    #[test]
    fn test_rerecording_overwrites() {
        let mut ledger = TransferLedger::new();
        ledger.record("a.txt", pair("old", "old"));
        ledger.record("a.txt", pair("new", "new"));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.digests("a.txt").unwrap().md5_hex, "new");
    }
}
