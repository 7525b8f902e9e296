//! Digest reconciliation between the source store, the transfer ledger, and
//! the destination's upload report.
//!
//! Two independent checks bracket the transfer. Source fidelity: what was
//! read matches what the store attests to hold (SHA-256). Destination
//! fidelity: what the destination landed matches what was sent (MD5). Both
//! are all-or-nothing; one bad file condemns the whole transfer.

use std::collections::HashMap;

use tracing::{error, info, warn};

use crate::bundle::builder::sanitize_member_path;
use crate::ledger::TransferLedger;
use crate::store::{decode_attestation, StoreAttestations};

/// One file as the destination reported it after unpacking the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedFile {
    pub directory_label: String,
    pub file_name: String,
    pub md5_hex: String,
}

impl ReportedFile {
    pub fn path(&self) -> String {
        if self.directory_label.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.directory_label, self.file_name)
        }
    }
}

/// Every ledger entry's SHA-256 must match the store's attestation for the
/// same path. An empty ledger passes trivially.
pub fn validate_source(ledger: &TransferLedger, attestations: &StoreAttestations) -> bool {
    let mut matched = 0usize;
    for (path, digests) in ledger.iter() {
        match attestations.get(path) {
            Some(raw) => match decode_attestation(raw) {
                Ok(attested) if attested == digests.sha256_hex => matched += 1,
                Ok(attested) => {
                    error!(
                        path,
                        streamed = %digests.sha256_hex,
                        attested = %attested,
                        "SHA-256 mismatch against the source store"
                    );
                }
                Err(e) => {
                    error!(path, "undecodable digest attestation: {e}");
                }
            },
            None => {
                error!(path, "source store holds no digest for this file");
            }
        }
    }
    let ok = matched == ledger.len();
    if ok {
        info!(files = matched, "source checksums verified");
    } else {
        error!(matched, total = ledger.len(), "source checksum verification failed");
    }
    ok
}

/// Every file the destination reports must carry the MD5 the ledger recorded
/// for the matching path, and the counts must agree. `None` means the
/// destination sent no per-file report; the check is skipped, not failed.
pub fn validate_destination(ledger: &TransferLedger, reported: Option<&[ReportedFile]>) -> bool {
    let Some(reported) = reported else {
        warn!("destination sent no per-file report; skipping destination verification");
        return true;
    };

    // ledger keys are store paths; the destination speaks in sanitized
    // archive paths, with leading dots dropped from folder names
    let mut expected: HashMap<String, (&str, &str)> = HashMap::new();
    for (path, digests) in ledger.iter() {
        let archive_path = sanitize_member_path(path);
        let key = normalize_reported_path(&archive_path);
        if let Some((previous, _)) = expected.insert(key, (path, digests.md5_hex.as_str())) {
            error!(
                path,
                previous,
                "distinct source paths are indistinguishable after destination renaming"
            );
            return false;
        }
    }

    let mut matched = 0usize;
    for file in reported {
        let key = normalize_reported_path(&file.path());
        match expected.get(key.as_str()) {
            Some((_, md5_hex)) if md5_hex.eq_ignore_ascii_case(&file.md5_hex) => {
                matched += 1;
            }
            Some((path, md5_hex)) => {
                error!(
                    path,
                    sent = %md5_hex,
                    landed = %file.md5_hex,
                    "MD5 mismatch against the destination"
                );
            }
            None => {
                error!(reported = %file.path(), "destination reported a file that was never sent");
            }
        }
    }

    let ok = matched == ledger.len() && reported.len() == ledger.len();
    if ok {
        info!(files = matched, "destination checksums verified");
    } else {
        error!(
            matched,
            reported = reported.len(),
            sent = ledger.len(),
            "destination checksum verification failed"
        );
    }
    ok
}

/// Combined verdict over both reconciliation steps. Both always run, so a
/// source mismatch does not hide a destination mismatch in the logs.
pub fn validate(
    ledger: &TransferLedger,
    attestations: &StoreAttestations,
    reported: Option<&[ReportedFile]>,
) -> bool {
    let source_ok = validate_source(ledger, attestations);
    let destination_ok = validate_destination(ledger, reported);
    source_ok && destination_ok
}

// the destination serves folder segments with their leading dot stripped
fn normalize_reported_path(path: &str) -> String {
    path.split('/')
        .map(|segment| segment.strip_prefix('.').unwrap_or(segment))
        .collect::<Vec<_>>()
        .join("/")
}
