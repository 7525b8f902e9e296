//! Export job descriptor.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One export job, as assembled from CLI arguments or delivered by a work
/// queue. Collections are addressed relative to the configured store root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    #[serde(default = "default_job_id")]
    pub job_id: String,
    /// Source collection to export.
    pub source_id: String,
    /// Destination collection alias the dataset is created under.
    pub destination_alias: String,
    /// Delete source files once their transfer is fully verified.
    #[serde(default)]
    pub delete_after: bool,
    /// Ask the destination to restrict access to the deposited files.
    #[serde(default)]
    pub restrict: bool,
    /// Limit the export to these relative paths. Empty means everything.
    #[serde(default)]
    pub restrict_paths: Vec<String>,
    /// Who the export is performed for; used in notifications.
    #[serde(default = "default_depositor")]
    pub depositor: String,
}

fn default_job_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_depositor() -> String {
    "unknown".to_string()
}
