//! Export orchestration.
//!
//! One executor runs one job: lock the collection, create the destination
//! dataset, size and stream the bundle, reconcile digests, then finalize.
//! Phase markers move with each step. Failures the pipeline understands
//! leave a terminal marker for operators; anything unexpected clears every
//! marker on the way out and the error is re-raised untouched.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bundle::builder::{plan_members, sanitize_member_path};
use crate::bundle::{
    estimate_size, open_stream, ArchiveFormat, BagMeta, BundleSpec, PathFilter,
};
use crate::bundle::digest::DigestStream;
use crate::config::Config;
use crate::deposit::http::BAGIT_PACKAGING;
use crate::deposit::DepositClient;
use crate::job::ExportJob;
use crate::ledger::TransferLedger;
use crate::phase::{ExportPhase, PhaseTracker, EXTERNAL_PID_ATTRIBUTE};
use crate::reconcile::{self, ReportedFile};
use crate::store::{SourceStore, SourceTree, StoreAttestations};
use crate::utils::errors::ExportError;

/// What a finished export looks like to the caller.
#[derive(Debug)]
pub struct ExportSummary {
    pub persistent_id: String,
    pub dataset_url: String,
    pub files: usize,
    pub bytes: u64,
    pub deleted: usize,
}

pub struct ExportExecutor {
    store: Arc<dyn SourceStore>,
    client: DepositClient,
    config: Config,
}

impl ExportExecutor {
    pub fn new(store: Arc<dyn SourceStore>, config: Config) -> crate::Result<Self> {
        let client = DepositClient::new(&config.destination)?;
        Ok(Self {
            store,
            client,
            config,
        })
    }

    /// Run one export job to completion.
    ///
    /// The collection lock brackets the whole run and is released on every
    /// path out. Errors with a matching terminal marker leave that marker
    /// behind; all others clear the markers entirely. Either way the error
    /// is returned to the caller, never swallowed.
    pub async fn execute(&self, job: &ExportJob) -> crate::Result<ExportSummary> {
        info!(job = %job.job_id, collection = %job.source_id, "starting export");
        let tracker = PhaseTracker::new(
            Arc::clone(&self.store),
            &job.source_id,
            &self.config.destination.repository,
        );
        tracker.begin().await;

        if let Err(e) = self.store.open_collection(&job.source_id).await {
            tracker.cleanup().await;
            return Err(e);
        }

        let mut phase = ExportPhase::InQueueForExport;
        let outcome = self.run(job, &tracker, &mut phase).await;
        match outcome {
            Ok(summary) => {
                let _ = self.store.close_collection(&job.source_id).await;
                tracker
                    .clear_exported(Duration::from_secs(self.config.export.exported_grace_secs))
                    .await;
                info!(
                    job = %job.job_id,
                    pid = %summary.persistent_id,
                    files = summary.files,
                    bytes = summary.bytes,
                    "export complete"
                );
                Ok(summary)
            }
            Err(e) => {
                match failure_marker(phase, &e) {
                    Some(marker) => {
                        tracker.fail(phase, marker).await;
                        self.client
                            .notify_failure(&job.source_id, marker, &job.depositor, &e.to_string())
                            .await;
                    }
                    None => tracker.cleanup().await,
                }
                let _ = self.store.close_collection(&job.source_id).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        job: &ExportJob,
        tracker: &PhaseTracker,
        phase: &mut ExportPhase,
    ) -> crate::Result<ExportSummary> {
        self.advance(tracker, phase, ExportPhase::CreateExporter).await;
        let tree = Arc::new(self.store.load_tree(&job.source_id).await?);
        info!(
            files = tree.file_count(),
            bytes = tree.total_bytes(),
            "source tree loaded"
        );

        self.advance(tracker, phase, ExportPhase::CreateDataset).await;
        let persistent_id = self
            .client
            .create_dataset(&job.destination_alias, &dataset_metadata(job))
            .await?;

        self.advance(tracker, phase, ExportPhase::PrepareCollection).await;
        let format = self.config.bundle.archive_format()?;
        let filter = PathFilter::new(job.restrict_paths.clone());
        let bag = (format == ArchiveFormat::Bag).then(|| BagMeta::for_tree(&tree, &filter));
        let spec = Arc::new(BundleSpec {
            format,
            compression: self.config.bundle.member_mode()?,
            block_size: self.config.bundle.block_size,
            filter,
            bag,
        });
        // the digest fetch is slow on big collections; overlap it with both
        // bundling passes and join it right before reconciliation
        let attestations = self.spawn_attestation_fetch(&job.source_id);

        let (ledger, reported, bytes) = if format.is_bundled() {
            self.deposit_bundle(job, &persistent_id, &tree, spec, tracker, phase)
                .await?
        } else {
            self.deposit_per_file(job, &persistent_id, &tree, &spec, tracker, phase)
                .await?
        };

        self.advance(tracker, phase, ExportPhase::ValidateChecksum).await;
        let attestations = attestations
            .await
            .map_err(|e| ExportError::Store(format!("digest fetch task failed: {e}")))??;
        if !reconcile::validate_source(&ledger, &attestations) {
            return Err(ExportError::UploadCorrupted(
                "source checksum mismatch".to_string(),
            ));
        }

        self.advance(tracker, phase, ExportPhase::ValidateUpload).await;
        if !reconcile::validate_destination(&ledger, reported.as_deref()) {
            return Err(ExportError::UploadCorrupted(
                "destination checksum mismatch".to_string(),
            ));
        }

        self.advance(tracker, phase, ExportPhase::Finalize).await;
        let deleted = self.finalize(job, &persistent_id, &ledger).await?;

        self.advance(tracker, phase, ExportPhase::Exported).await;
        Ok(ExportSummary {
            dataset_url: self.client.dataset_url(&persistent_id),
            persistent_id,
            files: ledger.len(),
            bytes,
            deleted,
        })
    }

    /// Size then stream one archive into the dataset.
    async fn deposit_bundle(
        &self,
        job: &ExportJob,
        persistent_id: &str,
        tree: &Arc<SourceTree>,
        spec: Arc<BundleSpec>,
        tracker: &PhaseTracker,
        phase: &mut ExportPhase,
    ) -> crate::Result<(TransferLedger, Option<Vec<ReportedFile>>, u64)> {
        self.advance(tracker, phase, ExportPhase::ZipCollection).await;
        let estimate =
            estimate_size(Arc::clone(&self.store), Arc::clone(tree), Arc::clone(&spec)).await?;
        info!(bytes = estimate.bytes, "bundle sized");

        self.advance(tracker, phase, ExportPhase::UploadZippedCollection).await;
        let format = spec.format;
        let (stream, ledger) = open_stream(
            Arc::clone(&self.store),
            Arc::clone(tree),
            spec,
            estimate.bytes,
        );
        let name = bundle_file_name(&tree.collection, format);
        let reported = match format {
            ArchiveFormat::Zip => Some(
                self.client
                    .upload_bundle(persistent_id, &name, stream, job.restrict)
                    .await?,
            ),
            ArchiveFormat::Tar => {
                self.client
                    .upload_octet(
                        persistent_id,
                        &name,
                        stream,
                        &estimate.md5_hex,
                        "application/x-tar",
                        None,
                    )
                    .await?;
                None
            }
            ArchiveFormat::Bag => {
                self.client
                    .upload_octet(
                        persistent_id,
                        &name,
                        stream,
                        &estimate.md5_hex,
                        "application/zip",
                        Some(BAGIT_PACKAGING),
                    )
                    .await?;
                None
            }
            ArchiveFormat::PerFile => unreachable!("per-file deposits never bundle"),
        };
        let ledger = ledger.join().await?;
        Ok((ledger, reported, estimate.bytes))
    }

    /// Deposit every file individually, folders becoming directory labels.
    async fn deposit_per_file(
        &self,
        job: &ExportJob,
        persistent_id: &str,
        tree: &SourceTree,
        spec: &BundleSpec,
        tracker: &PhaseTracker,
        phase: &mut ExportPhase,
    ) -> crate::Result<(TransferLedger, Option<Vec<ReportedFile>>, u64)> {
        let members = plan_members(tree, spec)?;

        self.advance(tracker, phase, ExportPhase::UploadZippedCollection).await;
        let mut ledger = TransferLedger::new();
        let mut reported = Vec::with_capacity(members.len());
        let mut bytes = 0u64;
        for member in members {
            let reader = self
                .store
                .open_file(&tree.collection, &member.store_path)
                .await?;
            let chunks = tokio_util::io::ReaderStream::with_capacity(reader, spec.block_size);
            let (body, digests) = DigestStream::new(chunks);
            let (directory_label, file_name) = match member.archive_path.rsplit_once('/') {
                Some((folder, name)) => (folder, name),
                None => ("", member.archive_path.as_str()),
            };
            reported.extend(
                self.client
                    .upload_file(
                        persistent_id,
                        directory_label,
                        file_name,
                        reqwest::Body::wrap_stream(body),
                        member.size,
                        job.restrict,
                    )
                    .await?,
            );
            let digests = digests.finish()?;
            bytes += member.size;
            ledger.record(&member.store_path, digests);
        }
        Ok((ledger, Some(reported), bytes))
    }

    /// Post-verification wrap-up: record the persistent identifier on the
    /// collection, delete confirmed source files if asked, then the optional
    /// review and confirmation calls.
    async fn finalize(
        &self,
        job: &ExportJob,
        persistent_id: &str,
        ledger: &TransferLedger,
    ) -> crate::Result<usize> {
        let pid_value = format!("{}:{persistent_id}", self.config.destination.repository);
        if let Err(e) = self
            .store
            .add_attribute(&job.source_id, EXTERNAL_PID_ATTRIBUTE, &pid_value)
            .await
        {
            warn!(collection = %job.source_id, "failed to record persistent identifier: {e}");
        }

        let mut deleted = 0usize;
        if job.delete_after {
            // only files whose transfer was verified, one failure does not
            // stop the rest
            for path in ledger.paths() {
                match self.store.delete_file(&job.source_id, path).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(path, "failed to delete source file: {e}"),
                }
            }
            info!(deleted, total = ledger.len(), "source files deleted");
        }

        if self.config.destination.submit_for_review {
            self.client.submit_for_review(persistent_id).await?;
        }
        if self.config.destination.send_confirmation {
            if let Err(e) = self
                .client
                .send_confirmation(&job.depositor, persistent_id)
                .await
            {
                warn!(depositor = %job.depositor, "failed to send confirmation email: {e}");
            }
        }
        Ok(deleted)
    }

    fn spawn_attestation_fetch(
        &self,
        collection: &str,
    ) -> JoinHandle<crate::Result<StoreAttestations>> {
        let store = Arc::clone(&self.store);
        let collection = collection.to_string();
        let timeout = Duration::from_secs(self.config.store.checksum_timeout_secs);
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, store.fetch_attestations(&collection)).await {
                Ok(result) => result,
                Err(_) => Err(ExportError::Store(format!(
                    "digest fetch timed out after {}s",
                    timeout.as_secs()
                ))),
            }
        })
    }

    async fn advance(
        &self,
        tracker: &PhaseTracker,
        phase: &mut ExportPhase,
        next: ExportPhase,
    ) {
        tracker.advance(*phase, next).await;
        *phase = next;
    }
}

/// Which terminal marker an error leaves behind, if any. Errors without one
/// are unexpected and clear the markers instead.
///
/// A bare HTTP error carries no phase of its own, so the marker follows the
/// phase it interrupted: during dataset creation it means the dataset was
/// never created, during finalize it can only be the review call.
fn failure_marker(phase: ExportPhase, error: &ExportError) -> Option<ExportPhase> {
    match error {
        ExportError::DatasetRejected(_) => Some(ExportPhase::CreateDatasetFailed),
        ExportError::DatasetUnknown(_) => Some(ExportPhase::DatasetUnknown),
        ExportError::UploadFailed(_) => Some(ExportPhase::UploadFailed),
        ExportError::UploadCorrupted(_) => Some(ExportPhase::UploadCorrupted),
        ExportError::ReviewFailed(_) => Some(ExportPhase::RequestReviewFailed),
        ExportError::Http(_) => Some(match phase {
            ExportPhase::CreateDataset => ExportPhase::CreateDatasetFailed,
            ExportPhase::Finalize => ExportPhase::RequestReviewFailed,
            _ => ExportPhase::UploadFailed,
        }),
        _ => None,
    }
}

fn bundle_file_name(collection: &str, format: ArchiveFormat) -> String {
    let base = collection.rsplit('/').next().unwrap_or(collection);
    let base = sanitize_member_path(base);
    match format {
        ArchiveFormat::Zip | ArchiveFormat::Bag => format!("{base}.zip"),
        ArchiveFormat::Tar => format!("{base}.tar"),
        ArchiveFormat::PerFile => base,
    }
}

/// Minimal citation metadata for the dataset shell. Field mapping from the
/// collection's own descriptive metadata is the caller's concern; this is
/// the floor the destination will accept.
fn dataset_metadata(job: &ExportJob) -> serde_json::Value {
    json!({
        "datasetVersion": {
            "metadataBlocks": {
                "citation": {
                    "displayName": "Citation Metadata",
                    "fields": [
                        {
                            "typeName": "title",
                            "multiple": false,
                            "typeClass": "primitive",
                            "value": job.source_id
                        },
                        {
                            "typeName": "author",
                            "multiple": true,
                            "typeClass": "compound",
                            "value": [{
                                "authorName": {
                                    "typeName": "authorName",
                                    "multiple": false,
                                    "typeClass": "primitive",
                                    "value": job.depositor
                                }
                            }]
                        },
                        {
                            "typeName": "dsDescription",
                            "multiple": true,
                            "typeClass": "compound",
                            "value": [{
                                "dsDescriptionValue": {
                                    "typeName": "dsDescriptionValue",
                                    "multiple": false,
                                    "typeClass": "primitive",
                                    "value": format!("Deposit of collection {}", job.source_id)
                                }
                            }]
                        },
                        {
                            "typeName": "subject",
                            "multiple": true,
                            "typeClass": "controlledVocabulary",
                            "value": ["Other"]
                        }
                    ]
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BundleConfig, DestinationConfig, ExportConfig, LogConfig, StoreConfig};
    use crate::phase::PHASE_ATTRIBUTE;
    use crate::store::fs::FsStore;
    use axum::extract::{Multipart, Path as AxumPath};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use md5::Digest;
    use std::io::Read;
    use tempfile::TempDir;

    fn mock_report_from_zip(bytes: &[u8]) -> Vec<serde_json::Value> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        let mut files = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).unwrap();
            let name = entry.name().to_string();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            let md5_hex = hex::encode(md5::Md5::digest(&contents));
            let (directory, file) = match name.rsplit_once('/') {
                Some((d, f)) => (d.to_string(), f.to_string()),
                None => (String::new(), name),
            };
            files.push(json!({
                "directoryLabel": directory,
                "dataFile": {"filename": file, "md5": md5_hex}
            }));
        }
        files
    }

    /// Destination double: creates datasets and answers bundle uploads by
    /// unzipping the body and reporting real MD5s, like the live service.
    fn mock_destination(corrupt_md5: bool) -> Router {
        Router::new()
            .without_v07_checks()
            .route(
                "/api/dataverses/{alias}/datasets",
                post(|AxumPath(_alias): AxumPath<String>| async {
                    (
                        StatusCode::CREATED,
                        Json(json!({
                            "status": "OK",
                            "data": {"id": 1, "persistentId": "doi:10.5072/FK2/MOCK"}
                        })),
                    )
                }),
            )
            .route(
                "/api/datasets/:persistentId/add",
                post(move |mut multipart: Multipart| async move {
                    let mut files = Vec::new();
                    while let Some(field) = multipart.next_field().await.unwrap() {
                        if field.name() == Some("file") {
                            let bytes = field.bytes().await.unwrap();
                            files = mock_report_from_zip(&bytes);
                        }
                    }
                    if corrupt_md5 {
                        if let Some(first) = files.first_mut() {
                            first["dataFile"]["md5"] = json!("0000deadbeef0000");
                        }
                    }
                    (
                        StatusCode::OK,
                        Json(json!({"status": "OK", "data": {"files": files}})),
                    )
                }),
            )
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config(root: &std::path::Path, base_url: String) -> Config {
        Config {
            store: StoreConfig {
                root: root.to_path_buf(),
                checksum_timeout_secs: 30,
            },
            destination: DestinationConfig {
                base_url,
                api_token: "secret".to_string(),
                repository: "Dataverse".to_string(),
                request_timeout_secs: 5,
                connect_timeout_secs: 5,
                mailer_url: None,
                notify_url: None,
                submit_for_review: false,
                send_confirmation: false,
            },
            bundle: BundleConfig::default(),
            export: ExportConfig {
                exported_grace_secs: 0,
            },
            log: LogConfig::default(),
        }
    }

    fn job(delete_after: bool) -> ExportJob {
        ExportJob {
            job_id: "test-job".to_string(),
            source_id: "coll1".to_string(),
            destination_alias: "lab".to_string(),
            delete_after,
            restrict: false,
            restrict_paths: Vec::new(),
            depositor: "m.curie".to_string(),
        }
    }

    fn seed(dir: &TempDir, files: &[(&str, &str)]) -> Arc<FsStore> {
        std::fs::create_dir_all(dir.path().join("coll1")).unwrap();
        for (path, contents) in files {
            let full = dir.path().join("coll1").join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
        Arc::new(FsStore::new(dir.path()))
    }

    async fn markers(store: &FsStore) -> Vec<String> {
        store
            .attribute_values("coll1", PHASE_ATTRIBUTE)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_exports_and_clears_markers() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a/b.txt", "hello"), ("a/c.txt", "")]);
        let base = serve(mock_destination(false)).await;
        let executor =
            ExportExecutor::new(store.clone(), config(dir.path(), base)).unwrap();

        let summary = executor.execute(&job(false)).await.unwrap();
        assert_eq!(summary.persistent_id, "doi:10.5072/FK2/MOCK");
        assert_eq!(summary.files, 2);
        assert!(summary.bytes > 0);
        assert_eq!(summary.deleted, 0);

        // marker-free steady state, lock released, pid recorded
        assert!(markers(&store).await.is_empty());
        store.open_collection("coll1").await.unwrap();
        assert_eq!(
            store
                .attribute_values("coll1", EXTERNAL_PID_ATTRIBUTE)
                .await
                .unwrap(),
            vec!["Dataverse:doi:10.5072/FK2/MOCK"]
        );
        // source files untouched without delete_after
        assert_eq!(store.load_tree("coll1").await.unwrap().file_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_after_removes_confirmed_files() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a/b.txt", "hello"), ("keep/c.txt", "stays")]);
        let base = serve(mock_destination(false)).await;
        let executor =
            ExportExecutor::new(store.clone(), config(dir.path(), base)).unwrap();

        let mut job = job(true);
        job.restrict_paths = vec!["a/b.txt".to_string()];
        let summary = executor.execute(&job).await.unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.deleted, 1);

        // only the exported file is gone
        let tree = store.load_tree("coll1").await.unwrap();
        assert_eq!(tree.file_count(), 1);
        assert_eq!(tree.files[0].relative_path, "keep/c.txt");
    }

    #[tokio::test]
    async fn test_create_dataset_rejection_leaves_marker() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a.txt", "x")]);
        let app = Router::new().route(
            "/api/dataverses/{alias}/datasets",
            post(|| async { StatusCode::FORBIDDEN }),
        );
        let base = serve(app).await;
        let executor =
            ExportExecutor::new(store.clone(), config(dir.path(), base)).unwrap();

        let err = executor.execute(&job(false)).await.unwrap_err();
        assert!(matches!(err, ExportError::DatasetRejected(_)));
        assert_eq!(markers(&store).await, vec!["Dataverse:create-dataset-failed"]);
        // lock released even on failure
        store.open_collection("coll1").await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_rejection_leaves_marker() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a.txt", "x")]);
        let app = Router::new()
            .without_v07_checks()
            .route(
                "/api/dataverses/{alias}/datasets",
                post(|| async {
                    (
                        StatusCode::CREATED,
                        Json(json!({
                            "status": "OK",
                            "data": {"id": 1, "persistentId": "doi:10.5072/FK2/MOCK"}
                        })),
                    )
                }),
            )
            .route(
                "/api/datasets/:persistentId/add",
                post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            );
        let base = serve(app).await;
        let executor =
            ExportExecutor::new(store.clone(), config(dir.path(), base)).unwrap();

        let err = executor.execute(&job(false)).await.unwrap_err();
        assert!(matches!(err, ExportError::UploadFailed(_)));
        assert_eq!(markers(&store).await, vec!["Dataverse:upload-failed"]);
    }

    #[tokio::test]
    async fn test_destination_md5_corruption_leaves_corrupted_marker() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a/b.txt", "hello")]);
        let base = serve(mock_destination(true)).await;
        let executor =
            ExportExecutor::new(store.clone(), config(dir.path(), base)).unwrap();

        let err = executor.execute(&job(false)).await.unwrap_err();
        assert!(matches!(err, ExportError::UploadCorrupted(_)));
        assert_eq!(markers(&store).await, vec!["Dataverse:upload-corrupted"]);
    }

    #[tokio::test]
    async fn test_locked_collection_refuses_second_run() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a.txt", "x")]);
        store.open_collection("coll1").await.unwrap();
        let base = serve(mock_destination(false)).await;
        let executor =
            ExportExecutor::new(store.clone(), config(dir.path(), base)).unwrap();

        let err = executor.execute(&job(false)).await.unwrap_err();
        assert!(matches!(err, ExportError::Store(_)));
        // failed to acquire, so markers are cleaned, not terminal
        assert!(markers(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_per_file_deposit() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a/b.txt", "hello"), ("root.txt", "top")]);
        let app = Router::new()
            .without_v07_checks()
            .route(
                "/api/dataverses/{alias}/datasets",
                post(|| async {
                    (
                        StatusCode::CREATED,
                        Json(json!({
                            "status": "OK",
                            "data": {"id": 1, "persistentId": "doi:10.5072/FK2/MOCK"}
                        })),
                    )
                }),
            )
            .route(
                "/api/datasets/:persistentId/add",
                post(|mut multipart: Multipart| async move {
                    let mut directory = String::new();
                    let mut name = String::new();
                    let mut md5_hex = String::new();
                    while let Some(field) = multipart.next_field().await.unwrap() {
                        match field.name() {
                            Some("jsonData") => {
                                let value: serde_json::Value =
                                    serde_json::from_slice(&field.bytes().await.unwrap()).unwrap();
                                directory = value["directoryLabel"]
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_string();
                            }
                            Some("file") => {
                                name = field.file_name().unwrap_or_default().to_string();
                                let bytes = field.bytes().await.unwrap();
                                md5_hex = hex::encode(md5::Md5::digest(&bytes));
                            }
                            _ => {}
                        }
                    }
                    (
                        StatusCode::OK,
                        Json(json!({
                            "status": "OK",
                            "data": {"files": [{
                                "directoryLabel": directory,
                                "dataFile": {"filename": name, "md5": md5_hex}
                            }]}
                        })),
                    )
                }),
            );
        let base = serve(app).await;
        let mut config = config(dir.path(), base);
        config.bundle.format = "per-file".to_string();
        let executor = ExportExecutor::new(store.clone(), config).unwrap();

        let summary = executor.execute(&job(false)).await.unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, 8);
        assert!(markers(&store).await.is_empty());
    }

    #[test]
    fn test_failure_markers() {
        let phase = ExportPhase::UploadZippedCollection;
        assert_eq!(
            failure_marker(phase, &ExportError::DatasetRejected("x".to_string())),
            Some(ExportPhase::CreateDatasetFailed)
        );
        assert_eq!(
            failure_marker(phase, &ExportError::UploadCorrupted("x".to_string())),
            Some(ExportPhase::UploadCorrupted)
        );
        assert_eq!(
            failure_marker(phase, &ExportError::ReviewFailed("x".to_string())),
            Some(ExportPhase::RequestReviewFailed)
        );
        assert_eq!(
            failure_marker(phase, &ExportError::Archive("x".to_string())),
            None
        );
    }

    #[tokio::test]
    async fn test_network_failure_marker_follows_phase() {
        // nothing listens on port 1
        let error = ExportError::Http(reqwest::get("http://127.0.0.1:1/").await.unwrap_err());
        assert_eq!(
            failure_marker(ExportPhase::CreateDataset, &error),
            Some(ExportPhase::CreateDatasetFailed)
        );
        assert_eq!(
            failure_marker(ExportPhase::Finalize, &error),
            Some(ExportPhase::RequestReviewFailed)
        );
        assert_eq!(
            failure_marker(ExportPhase::UploadZippedCollection, &error),
            Some(ExportPhase::UploadFailed)
        );
    }

    #[tokio::test]
    async fn test_unreachable_destination_leaves_create_marker() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir, &[("a.txt", "x")]);
        let executor = ExportExecutor::new(
            store.clone(),
            config(dir.path(), "http://127.0.0.1:1".to_string()),
        )
        .unwrap();

        let err = executor.execute(&job(false)).await.unwrap_err();
        assert!(matches!(err, ExportError::Http(_)));
        // the dataset was never created, the marker must say so
        assert_eq!(markers(&store).await, vec!["Dataverse:create-dataset-failed"]);
        store.open_collection("coll1").await.unwrap();
    }

    #[test]
    fn test_bundle_file_name() {
        assert_eq!(
            bundle_file_name("research/coll1", ArchiveFormat::Zip),
            "coll1.zip"
        );
        assert_eq!(bundle_file_name("coll1", ArchiveFormat::Tar), "coll1.tar");
        assert_eq!(
            bundle_file_name("a:b", ArchiveFormat::Bag),
            "a_b.zip"
        );
    }

    #[test]
    fn test_dataset_metadata_carries_title_and_author() {
        let metadata = dataset_metadata(&job(false));
        let fields = &metadata["datasetVersion"]["metadataBlocks"]["citation"]["fields"];
        assert_eq!(fields[0]["typeName"], "title");
        assert_eq!(fields[0]["value"], "coll1");
        assert_eq!(
            fields[1]["value"][0]["authorName"]["value"],
            "m.curie"
        );
    }
}
