//! Export phase markers on the source collection.
//!
//! Progress is written onto the collection itself as a multi-valued
//! attribute, so operators (and a future retry) can see where a run died
//! even if this process is gone. Marker writes are advisory: a failure to
//! record progress is logged and swallowed, never allowed to abort the
//! transfer it describes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::store::SourceStore;

/// Collection attribute holding the current phase marker.
pub const PHASE_ATTRIBUTE: &str = "exporterState";

/// Collection attribute recording the destination's persistent identifier.
pub const EXTERNAL_PID_ATTRIBUTE: &str = "externalPID";

/// Every phase an export can be observed in. The first eight are transit
/// phases, the next five are terminal failures, and the last two wrap up a
/// successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportPhase {
    InQueueForExport,
    CreateExporter,
    CreateDataset,
    PrepareCollection,
    ZipCollection,
    UploadZippedCollection,
    ValidateUpload,
    ValidateChecksum,
    DatasetUnknown,
    CreateDatasetFailed,
    UploadFailed,
    UploadCorrupted,
    RequestReviewFailed,
    Finalize,
    Exported,
}

impl ExportPhase {
    pub const ALL: [ExportPhase; 15] = [
        ExportPhase::InQueueForExport,
        ExportPhase::CreateExporter,
        ExportPhase::CreateDataset,
        ExportPhase::PrepareCollection,
        ExportPhase::ZipCollection,
        ExportPhase::UploadZippedCollection,
        ExportPhase::ValidateUpload,
        ExportPhase::ValidateChecksum,
        ExportPhase::DatasetUnknown,
        ExportPhase::CreateDatasetFailed,
        ExportPhase::UploadFailed,
        ExportPhase::UploadCorrupted,
        ExportPhase::RequestReviewFailed,
        ExportPhase::Finalize,
        ExportPhase::Exported,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExportPhase::InQueueForExport => "in-queue-for-export",
            ExportPhase::CreateExporter => "create-exporter",
            ExportPhase::CreateDataset => "create-dataset",
            ExportPhase::PrepareCollection => "prepare-collection",
            ExportPhase::ZipCollection => "zip-collection",
            ExportPhase::UploadZippedCollection => "upload-zipped-collection",
            ExportPhase::ValidateUpload => "validate-upload",
            ExportPhase::ValidateChecksum => "validate-checksum",
            ExportPhase::DatasetUnknown => "dataset-unknown",
            ExportPhase::CreateDatasetFailed => "create-dataset-failed",
            ExportPhase::UploadFailed => "upload-failed",
            ExportPhase::UploadCorrupted => "upload-corrupted",
            ExportPhase::RequestReviewFailed => "request-review-failed",
            ExportPhase::Finalize => "finalize",
            ExportPhase::Exported => "exported",
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            ExportPhase::DatasetUnknown
                | ExportPhase::CreateDatasetFailed
                | ExportPhase::UploadFailed
                | ExportPhase::UploadCorrupted
                | ExportPhase::RequestReviewFailed
        )
    }
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes phase markers for one export run.
///
/// Marker values are namespaced `{repository}:{phase}` so several
/// destinations can track state on the same collection independently.
pub struct PhaseTracker {
    store: Arc<dyn SourceStore>,
    collection: String,
    repository: String,
}

impl PhaseTracker {
    pub fn new(
        store: Arc<dyn SourceStore>,
        collection: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            repository: repository.into(),
        }
    }

    fn marker(&self, phase: ExportPhase) -> String {
        format!("{}:{}", self.repository, phase)
    }

    /// Set the opening marker of a run.
    pub async fn begin(&self) {
        self.add(ExportPhase::InQueueForExport).await;
        info!(collection = %self.collection, phase = %ExportPhase::InQueueForExport, "export phase set");
    }

    /// Replace `old` with `new`. Removing an absent `old` is fine, so a
    /// transition can recover from a marker someone cleared by hand.
    pub async fn advance(&self, old: ExportPhase, new: ExportPhase) {
        self.remove(old).await;
        self.add(new).await;
        info!(collection = %self.collection, phase = %new, "export phase set");
    }

    /// Replace `current` with a terminal failure marker, which stays on the
    /// collection for operators to find.
    pub async fn fail(&self, current: ExportPhase, marker: ExportPhase) {
        self.remove(current).await;
        self.add(marker).await;
        error!(collection = %self.collection, marker = %marker, "export failed");
    }

    /// Remove every marker this tracker could ever have written. Used on
    /// unexpected errors, where a stale marker would misreport a run that is
    /// no longer happening.
    pub async fn cleanup(&self) {
        for phase in ExportPhase::ALL {
            self.remove(phase).await;
        }
        warn!(collection = %self.collection, "export phase markers cleared");
    }

    /// The success marker is transient: it stays visible for `grace`, then
    /// clears so the collection ends in a marker-free steady state.
    pub async fn clear_exported(&self, grace: Duration) {
        tokio::time::sleep(grace).await;
        self.remove(ExportPhase::Exported).await;
        info!(collection = %self.collection, "exported marker cleared");
    }

    /// Raw marker values currently on the collection.
    pub async fn markers(&self) -> crate::Result<Vec<String>> {
        self.store
            .attribute_values(&self.collection, PHASE_ATTRIBUTE)
            .await
    }

    async fn add(&self, phase: ExportPhase) {
        if let Err(e) = self
            .store
            .add_attribute(&self.collection, PHASE_ATTRIBUTE, &self.marker(phase))
            .await
        {
            warn!(collection = %self.collection, phase = %phase, "failed to add phase marker: {e}");
        }
    }

    async fn remove(&self, phase: ExportPhase) {
        if let Err(e) = self
            .store
            .remove_attribute(&self.collection, PHASE_ATTRIBUTE, &self.marker(phase))
            .await
        {
            warn!(collection = %self.collection, phase = %phase, "failed to remove phase marker: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fs::FsStore;
    use tempfile::TempDir;

    async fn tracker() -> (TempDir, PhaseTracker) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("coll1")).unwrap();
        let store = Arc::new(FsStore::new(dir.path()));
        let tracker = PhaseTracker::new(store, "coll1", "Dataverse");
        (dir, tracker)
    }

    #[test]
    fn test_marker_strings() {
        assert_eq!(ExportPhase::InQueueForExport.as_str(), "in-queue-for-export");
        assert_eq!(ExportPhase::UploadZippedCollection.as_str(), "upload-zipped-collection");
        assert_eq!(ExportPhase::Exported.as_str(), "exported");
        // serde names line up with the wire strings
        assert_eq!(
            serde_json::to_string(&ExportPhase::ValidateChecksum).unwrap(),
            "\"validate-checksum\""
        );
    }

    #[test]
    fn test_terminal_failures() {
        let terminal: Vec<ExportPhase> = ExportPhase::ALL
            .into_iter()
            .filter(|p| p.is_terminal_failure())
            .collect();
        assert_eq!(
            terminal,
            vec![
                ExportPhase::DatasetUnknown,
                ExportPhase::CreateDatasetFailed,
                ExportPhase::UploadFailed,
                ExportPhase::UploadCorrupted,
                ExportPhase::RequestReviewFailed,
            ]
        );
    }

    #[tokio::test]
    async fn test_advance_keeps_single_marker() {
        let (_dir, tracker) = tracker().await;

        tracker.begin().await;
        assert_eq!(tracker.markers().await.unwrap(), vec!["Dataverse:in-queue-for-export"]);

        tracker
            .advance(ExportPhase::InQueueForExport, ExportPhase::PrepareCollection)
            .await;
        tracker
            .advance(ExportPhase::PrepareCollection, ExportPhase::CreateDataset)
            .await;
        assert_eq!(tracker.markers().await.unwrap(), vec!["Dataverse:create-dataset"]);
    }

    #[tokio::test]
    async fn test_fail_leaves_terminal_marker() {
        let (_dir, tracker) = tracker().await;

        tracker.begin().await;
        tracker
            .advance(ExportPhase::InQueueForExport, ExportPhase::UploadZippedCollection)
            .await;
        tracker
            .fail(ExportPhase::UploadZippedCollection, ExportPhase::UploadFailed)
            .await;
        assert_eq!(tracker.markers().await.unwrap(), vec!["Dataverse:upload-failed"]);
    }

    #[tokio::test]
    async fn test_cleanup_clears_everything() {
        let (_dir, tracker) = tracker().await;

        tracker.begin().await;
        tracker
            .advance(ExportPhase::InQueueForExport, ExportPhase::ZipCollection)
            .await;
        // simulate a stray marker from an older crashed run
        tracker.add(ExportPhase::UploadFailed).await;

        tracker.cleanup().await;
        assert!(tracker.markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_exported_after_grace() {
        let (_dir, tracker) = tracker().await;

        tracker.add(ExportPhase::Exported).await;
        tracker.clear_exported(Duration::ZERO).await;
        assert!(tracker.markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_advance_tolerates_missing_old_marker() {
        let (_dir, tracker) = tracker().await;

        tracker
            .advance(ExportPhase::ZipCollection, ExportPhase::UploadZippedCollection)
            .await;
        assert_eq!(
            tracker.markers().await.unwrap(),
            vec!["Dataverse:upload-zipped-collection"]
        );
    }
}
