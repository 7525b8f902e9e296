//! Destination repository client: wire types and the HTTP surface.

pub mod http;

pub use http::DepositClient;

use serde::Deserialize;

use crate::reconcile::ReportedFile;

/// Envelope every destination API response arrives in.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct DatasetCreated {
    #[serde(rename = "persistentId")]
    pub persistent_id: String,
}

/// Per-file listing the destination returns after unpacking an upload.
#[derive(Debug, Deserialize)]
pub struct UploadReport {
    #[serde(default)]
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Deserialize)]
pub struct UploadedFile {
    #[serde(rename = "directoryLabel", default)]
    pub directory_label: String,
    #[serde(rename = "dataFile")]
    pub data_file: DataFileInfo,
}

#[derive(Debug, Deserialize)]
pub struct DataFileInfo {
    pub filename: String,
    pub md5: String,
}

impl UploadedFile {
    pub fn into_reported(self) -> ReportedFile {
        ReportedFile {
            directory_label: self.directory_label,
            file_name: self.data_file.filename,
            md5_hex: self.data_file.md5,
        }
    }
}
