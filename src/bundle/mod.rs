//! Streaming bundle pipeline: archive encoders, digest plumbing, and the
//! two-pass size-then-stream driver.

pub mod bag;
pub mod builder;
pub mod digest;
pub mod sink;
pub mod stream;
pub mod tar;
pub mod zip;

use std::str::FromStr;

pub use bag::BagMeta;
pub use stream::{estimate_size, open_stream, BundleEstimate, BundleStream, LedgerHandle};

use crate::utils::errors::ExportError;

/// Shape of the deposit leaving the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// One zip archive (the canonical shape).
    Zip,
    /// One tar archive.
    Tar,
    /// One zip archive in bag layout with synthesized tag members.
    Bag,
    /// No archive; every file is deposited individually.
    PerFile,
}

impl ArchiveFormat {
    pub fn is_bundled(self) -> bool {
        !matches!(self, ArchiveFormat::PerFile)
    }
}

impl FromStr for ArchiveFormat {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar" => Ok(ArchiveFormat::Tar),
            "bag" => Ok(ArchiveFormat::Bag),
            "per-file" => Ok(ArchiveFormat::PerFile),
            other => Err(ExportError::Config(format!(
                "unknown bundle format: {other}"
            ))),
        }
    }
}

/// How zip members are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberMode {
    Deflated,
    Stored,
}

impl FromStr for MemberMode {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "deflate" => Ok(MemberMode::Deflated),
            "store" => Ok(MemberMode::Stored),
            other => Err(ExportError::Config(format!(
                "unknown compression mode: {other}"
            ))),
        }
    }
}

/// Which files of the tree take part in the export. Empty means all.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    allow: Vec<String>,
}

impl PathFilter {
    pub fn new(allow: Vec<String>) -> Self {
        Self { allow }
    }

    pub fn everything() -> Self {
        Self::default()
    }

    pub fn allows(&self, relative_path: &str) -> bool {
        self.allow.is_empty() || self.allow.iter().any(|p| p == relative_path)
    }
}

/// Everything a bundling pass needs to know. Built once per export and
/// shared by both passes, so the passes cannot disagree about inputs.
#[derive(Debug, Clone)]
pub struct BundleSpec {
    pub format: ArchiveFormat,
    pub compression: MemberMode,
    pub block_size: usize,
    pub filter: PathFilter,
    /// Present only for bag layout.
    pub bag: Option<BagMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("zip".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zip);
        assert_eq!("tar".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Tar);
        assert_eq!("bag".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Bag);
        assert_eq!(
            "per-file".parse::<ArchiveFormat>().unwrap(),
            ArchiveFormat::PerFile
        );
        assert!("rar".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("deflate".parse::<MemberMode>().unwrap(), MemberMode::Deflated);
        assert_eq!("store".parse::<MemberMode>().unwrap(), MemberMode::Stored);
        assert!("brotli".parse::<MemberMode>().is_err());
    }

    #[test]
    fn test_bundled_formats() {
        assert!(ArchiveFormat::Zip.is_bundled());
        assert!(ArchiveFormat::Tar.is_bundled());
        assert!(ArchiveFormat::Bag.is_bundled());
        assert!(!ArchiveFormat::PerFile.is_bundled());
    }

    #[test]
    fn test_path_filter() {
        let all = PathFilter::everything();
        assert!(all.allows("anything/at/all.txt"));

        let some = PathFilter::new(vec!["a/b.txt".to_string()]);
        assert!(some.allows("a/b.txt"));
        assert!(!some.allows("a/c.txt"));
    }
}
