//! Drives one full pass over the source tree, feeding file bytes into an
//! archive encoder and recording per-file digests on the way through.
//!
//! Member order is the tree's path order, so every pass over an unchanged
//! tree emits the same members in the same sequence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWrite};
use tracing::{debug, trace};

use super::bag::{self, BagMeta, PAYLOAD_PREFIX};
use super::tar::TarEncoder;
use super::zip::ZipEncoder;
use super::{ArchiveFormat, BundleSpec};
use crate::bundle::digest::DigestSink;
use crate::ledger::TransferLedger;
use crate::store::{SourceStore, SourceTree};
use crate::utils::errors::ExportError;

// dropped from folder segments on top of the reserved set
const FOLDER_SPECIALS: &[char] = &[
    '\\', '(', ')', '[', ']', '{', '}', '$', '%', '&', '+', '@', '~', '\'', '€', '!', '^',
];
// refused by the destination in any name segment
const RESERVED: &[char] = &['\\', ':', '*', '?', '"', '<', '>', '|', ';', '#'];

const PLACEHOLDER: char = '_';

/// Rewrite a store-relative path into the form the destination will accept.
///
/// The final segment only loses the reserved characters; every folder
/// segment additionally loses a wider set of specials. `/` separators are
/// kept as archive structure.
pub fn sanitize_member_path(relative: &str) -> String {
    let (folder, name) = match relative.rsplit_once('/') {
        Some((folder, name)) => (folder, name),
        None => ("", relative),
    };
    let folder = replace_chars(&replace_chars(folder, FOLDER_SPECIALS), RESERVED);
    let name = replace_chars(name, RESERVED);
    if folder.is_empty() {
        name
    } else {
        format!("{folder}/{name}")
    }
}

fn replace_chars(value: &str, set: &[char]) -> String {
    value
        .chars()
        .map(|c| if set.contains(&c) { PLACEHOLDER } else { c })
        .collect()
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedMember {
    pub store_path: String,
    pub archive_path: String,
    pub size: u64,
}

/// Apply the path filter, sanitize, order, and reject archive-path
/// collisions before any byte is read.
pub(crate) fn plan_members(
    tree: &SourceTree,
    spec: &BundleSpec,
) -> crate::Result<Vec<PlannedMember>> {
    let mut files: Vec<_> = tree
        .files
        .iter()
        .filter(|f| spec.filter.allows(&f.relative_path))
        .collect();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut seen: HashMap<String, String> = HashMap::new();
    let mut planned = Vec::with_capacity(files.len());
    for file in files {
        let mut archive_path = sanitize_member_path(&file.relative_path);
        if spec.format == ArchiveFormat::Bag {
            archive_path = format!("{PAYLOAD_PREFIX}{archive_path}");
        }
        if let Some(previous) = seen.insert(archive_path.clone(), file.relative_path.clone()) {
            return Err(ExportError::PathCollision(format!(
                "'{previous}' and '{}' both map to '{archive_path}'",
                file.relative_path
            )));
        }
        planned.push(PlannedMember {
            store_path: file.relative_path.clone(),
            archive_path,
            size: file.size,
        });
    }
    Ok(planned)
}

/// Encode the whole tree into `writer` as one archive, returning the ledger
/// of per-file digests observed along the way.
pub async fn build_bundle<W>(
    store: Arc<dyn SourceStore>,
    tree: Arc<SourceTree>,
    spec: Arc<BundleSpec>,
    writer: W,
) -> crate::Result<TransferLedger>
where
    W: AsyncWrite + Unpin + Send,
{
    let members = plan_members(&tree, &spec)?;
    debug!(
        collection = %tree.collection,
        members = members.len(),
        format = ?spec.format,
        "bundling source tree"
    );
    match spec.format {
        ArchiveFormat::Zip => build_zip(&*store, &tree, &spec, &members, writer, None).await,
        ArchiveFormat::Bag => {
            let meta = spec
                .bag
                .clone()
                .ok_or_else(|| ExportError::Archive("bag metadata missing".to_string()))?;
            build_zip(&*store, &tree, &spec, &members, writer, Some(meta)).await
        }
        ArchiveFormat::Tar => build_tar(&*store, &tree, &spec, &members, writer).await,
        ArchiveFormat::PerFile => Err(ExportError::Archive(
            "per-file deposits do not produce a bundle".to_string(),
        )),
    }
}

async fn build_zip<W>(
    store: &dyn SourceStore,
    tree: &SourceTree,
    spec: &BundleSpec,
    members: &[PlannedMember],
    writer: W,
    bag: Option<BagMeta>,
) -> crate::Result<TransferLedger>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut encoder = ZipEncoder::new(writer, spec.compression);
    let mut ledger = TransferLedger::new();
    let mut payload_digests: Vec<(String, String)> = Vec::new();
    let mut block = vec![0u8; spec.block_size];

    for member in members {
        let mut reader = store.open_file(&tree.collection, &member.store_path).await?;
        encoder.begin_member(&member.archive_path).await?;
        let mut digests = DigestSink::new();
        loop {
            let n = reader.read(&mut block).await?;
            if n == 0 {
                break;
            }
            digests.update(&block[..n]);
            encoder.write_member_data(&block[..n]).await?;
        }
        encoder.finish_member().await?;
        let digests = digests.finish();
        if bag.is_some() {
            payload_digests.push((member.archive_path.clone(), digests.md5_hex.clone()));
        }
        trace!(path = %member.store_path, sha256 = %digests.sha256_hex, "member bundled");
        ledger.record(&member.store_path, digests);
    }

    if let Some(meta) = bag {
        for (path, content) in bag::tag_members(&meta, &payload_digests) {
            encoder.begin_member(&path).await?;
            encoder.write_member_data(&content).await?;
            encoder.finish_member().await?;
        }
    }

    let (total, _) = encoder.finish().await?;
    debug!(bytes = total, members = members.len(), "bundle pass complete");
    Ok(ledger)
}

async fn build_tar<W>(
    store: &dyn SourceStore,
    tree: &SourceTree,
    spec: &BundleSpec,
    members: &[PlannedMember],
    writer: W,
) -> crate::Result<TransferLedger>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut encoder = TarEncoder::new(writer);
    let mut ledger = TransferLedger::new();
    let mut block = vec![0u8; spec.block_size];

    for member in members {
        let mut reader = store.open_file(&tree.collection, &member.store_path).await?;
        encoder.begin_member(&member.archive_path, member.size).await?;
        let mut digests = DigestSink::new();
        loop {
            let n = reader.read(&mut block).await?;
            if n == 0 {
                break;
            }
            digests.update(&block[..n]);
            encoder.write_member_data(&block[..n]).await?;
        }
        encoder.finish_member().await?;
        let digests = digests.finish();
        trace!(path = %member.store_path, sha256 = %digests.sha256_hex, "member bundled");
        ledger.record(&member.store_path, digests);
    }

    let (total, _) = encoder.finish().await?;
    debug!(bytes = total, members = members.len(), "bundle pass complete");
    Ok(ledger)
}
