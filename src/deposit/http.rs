//! HTTP client for the destination repository service.
//!
//! Small control calls (dataset creation, review, email) carry a short
//! per-request timeout. Uploads deliberately do not: a multi-hour transfer
//! is healthy as long as bytes keep moving, and the connect timeout plus the
//! destination's own limits bound the pathological cases.

use std::time::Duration;

use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{multipart, StatusCode};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{ApiEnvelope, DatasetCreated, UploadReport, UploadedFile};
use crate::bundle::BundleStream;
use crate::config::DestinationConfig;
use crate::phase::ExportPhase;
use crate::reconcile::ReportedFile;
use crate::utils::errors::ExportError;

const API_TOKEN_HEADER: &str = "X-Dataverse-key";

/// SWORD packaging identifier sent with bag deposits.
pub const BAGIT_PACKAGING: &str = "http://purl.org/net/sword/package/BagIt";

pub struct DepositClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    request_timeout: Duration,
    mailer_url: Option<String>,
    notify_url: Option<String>,
}

impl DepositClient {
    pub fn new(config: &DestinationConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            mailer_url: config.mailer_url.clone(),
            notify_url: config.notify_url.clone(),
        })
    }

    /// Create the dataset shell the upload will land in. Returns its
    /// persistent identifier.
    pub async fn create_dataset(
        &self,
        alias: &str,
        metadata: &serde_json::Value,
    ) -> crate::Result<String> {
        let url = format!("{}/api/dataverses/{alias}/datasets", self.base_url);
        info!(alias, "requesting dataset creation");
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .header(API_TOKEN_HEADER, &self.token)
            .json(metadata)
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "dataset creation rejected: {body}");
            return Err(ExportError::DatasetRejected(format!("{status}: {body}")));
        }
        let envelope: ApiEnvelope<DatasetCreated> = response.json().await?;
        let created = envelope.data.ok_or_else(|| {
            ExportError::DatasetRejected("response carried no persistent identifier".to_string())
        })?;
        info!(pid = %created.persistent_id, "dataset created");
        Ok(created.persistent_id)
    }

    // uploads are addressed by persistent identifier; without one there is
    // nowhere to deposit
    fn require_target(&self, persistent_id: &str) -> crate::Result<()> {
        if persistent_id.is_empty() {
            return Err(ExportError::DatasetUnknown(
                "no persistent identifier to upload against".to_string(),
            ));
        }
        Ok(())
    }

    /// Stream a bundle into the dataset as one multipart upload. The
    /// destination unpacks it and reports the landed files.
    pub async fn upload_bundle(
        &self,
        persistent_id: &str,
        bundle_name: &str,
        stream: BundleStream,
        restrict: bool,
    ) -> crate::Result<Vec<ReportedFile>> {
        self.require_target(persistent_id)?;
        let url = format!(
            "{}/api/datasets/:persistentId/add?persistentId={persistent_id}",
            self.base_url
        );
        let declared = stream.declared_len();
        info!(pid = persistent_id, bytes = declared, "uploading bundle");

        let json_data = json!({ "restrict": restrict }).to_string();
        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), declared)
            .file_name(bundle_name.to_string())
            .mime_str("application/zip")?;
        let form = multipart::Form::new()
            .text("jsonData", json_data)
            .part("file", part);

        let response = self
            .client
            .post(&url)
            .header(API_TOKEN_HEADER, &self.token)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "bundle upload rejected: {body}");
            return Err(ExportError::UploadFailed(format!("{status}: {body}")));
        }
        let envelope: ApiEnvelope<UploadReport> = response.json().await?;
        let files: Vec<ReportedFile> = envelope
            .data
            .map(|report| {
                report
                    .files
                    .into_iter()
                    .map(UploadedFile::into_reported)
                    .collect()
            })
            .unwrap_or_default();
        info!(reported = files.len(), "bundle upload accepted");
        Ok(files)
    }

    /// Stream a bundle into the dataset's binary deposit slot. Used for
    /// shapes the destination stores as-is (tar, bag), which come back with
    /// no per-file report.
    pub async fn upload_octet(
        &self,
        persistent_id: &str,
        bundle_name: &str,
        stream: BundleStream,
        md5_hex: &str,
        mime: &str,
        packaging: Option<&str>,
    ) -> crate::Result<()> {
        self.require_target(persistent_id)?;
        let url = format!(
            "{}/api/datasets/:persistentId/deposit?persistentId={persistent_id}",
            self.base_url
        );
        let declared = stream.declared_len();
        info!(pid = persistent_id, bytes = declared, mime, "uploading bundle");

        let mut request = self
            .client
            .post(&url)
            .header(API_TOKEN_HEADER, &self.token)
            .header(CONTENT_TYPE, mime)
            .header(CONTENT_LENGTH, declared)
            .header("Content-MD5", md5_hex)
            .header("In-Progress", "false")
            .header(CONTENT_DISPOSITION, format!("filename={bundle_name}"));
        if let Some(packaging) = packaging {
            request = request.header("Packaging", packaging);
        }
        let response = request
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "bundle upload rejected: {body}");
            return Err(ExportError::UploadFailed(format!("{status}: {body}")));
        }
        info!("bundle upload accepted");
        Ok(())
    }

    /// Deposit a single file, preserving its folder as a directory label.
    pub async fn upload_file(
        &self,
        persistent_id: &str,
        directory_label: &str,
        file_name: &str,
        body: reqwest::Body,
        declared: u64,
        restrict: bool,
    ) -> crate::Result<Vec<ReportedFile>> {
        self.require_target(persistent_id)?;
        let url = format!(
            "{}/api/datasets/:persistentId/add?persistentId={persistent_id}",
            self.base_url
        );
        debug!(pid = persistent_id, file = file_name, bytes = declared, "uploading file");

        let mut json_data = serde_json::Map::new();
        json_data.insert("restrict".to_string(), json!(restrict));
        if !directory_label.is_empty() {
            json_data.insert("directoryLabel".to_string(), json!(directory_label));
        }
        let part = multipart::Part::stream_with_length(body, declared)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new()
            .text("jsonData", serde_json::Value::Object(json_data).to_string())
            .part("file", part);

        let response = self
            .client
            .post(&url)
            .header(API_TOKEN_HEADER, &self.token)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, file = file_name, "file upload rejected: {body}");
            return Err(ExportError::UploadFailed(format!(
                "{file_name}: {status}: {body}"
            )));
        }
        let envelope: ApiEnvelope<UploadReport> = response.json().await?;
        Ok(envelope
            .data
            .map(|report| {
                report
                    .files
                    .into_iter()
                    .map(UploadedFile::into_reported)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Hand the dataset over to the destination's review workflow.
    pub async fn submit_for_review(&self, persistent_id: &str) -> crate::Result<()> {
        let url = format!(
            "{}/api/datasets/:persistentId/submitForReview?persistentId={persistent_id}",
            self.base_url
        );
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .header(API_TOKEN_HEADER, &self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "review submission rejected: {body}");
            return Err(ExportError::ReviewFailed(format!("{status}: {body}")));
        }
        info!(pid = persistent_id, "dataset submitted for review");
        Ok(())
    }

    /// Confirmation email to the depositor. Quietly does nothing when no
    /// mailer is configured.
    pub async fn send_confirmation(
        &self,
        depositor: &str,
        persistent_id: &str,
    ) -> crate::Result<()> {
        let Some(mailer_url) = &self.mailer_url else {
            debug!("no mailer configured; skipping confirmation email");
            return Ok(());
        };
        let payload = json!({
            "to": depositor,
            "subject": "Your deposit has been exported",
            "persistent_id": persistent_id,
            "dataset_url": self.dataset_url(persistent_id),
        });
        self.client
            .post(format!("{}/email/send", mailer_url.trim_end_matches('/')))
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        info!(to = depositor, "confirmation email sent");
        Ok(())
    }

    /// Best-effort operator notification about a failed export. Never
    /// returns an error; a dead notification channel must not change how
    /// the export itself fails.
    pub async fn notify_failure(
        &self,
        collection: &str,
        marker: ExportPhase,
        depositor: &str,
        reason: &str,
    ) {
        let Some(notify_url) = &self.notify_url else {
            return;
        };
        let payload = json!({
            "requester": depositor,
            "description": format!("Export of collection {collection} failed"),
            "message": format!("{marker}: {reason}"),
        });
        let outcome = self
            .client
            .post(notify_url)
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                debug!(collection, "failure notification delivered");
            }
            Ok(response) => {
                warn!(collection, status = %response.status(), "failure notification rejected");
            }
            Err(e) => {
                warn!(collection, "failure notification undeliverable: {e}");
            }
        }
    }

    /// Browser-facing URL of the draft dataset.
    pub fn dataset_url(&self, persistent_id: &str) -> String {
        format!(
            "{}/dataset.xhtml?persistentId={persistent_id}&version=DRAFT",
            self.base_url
        )
    }
}
