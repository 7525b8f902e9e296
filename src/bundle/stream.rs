//! Two-pass bundle sizing and the live upload stream.
//!
//! The destination wants an exact Content-Length before the first body byte,
//! and the bundle is never allowed to touch disk. So every bundled export
//! encodes twice: a sizing pass that drains the encoder locally to measure
//! the archive, then a live pass whose chunks go straight into the request
//! body. Deterministic encoding makes the two passes byte-identical, which
//! also lets the sizing pass supply the whole-bundle MD5.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use md5::{Digest, Md5};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;
use tracing::{debug, warn};

use super::builder::build_bundle;
use super::sink::{ChannelWriter, CHANNEL_CAPACITY, DEFAULT_CHUNK_SIZE};
use super::BundleSpec;
use crate::ledger::TransferLedger;
use crate::store::{SourceStore, SourceTree};
use crate::utils::errors::ExportError;

/// What the sizing pass learned about the bundle.
#[derive(Debug, Clone)]
pub struct BundleEstimate {
    pub bytes: u64,
    pub md5_hex: String,
}

fn spawn_encoder(
    store: Arc<dyn SourceStore>,
    tree: Arc<SourceTree>,
    spec: Arc<BundleSpec>,
) -> (
    mpsc::Receiver<io::Result<Bytes>>,
    JoinHandle<crate::Result<TransferLedger>>,
) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let error_tx = tx.clone();
    let handle = tokio::spawn(async move {
        let writer = ChannelWriter::new(PollSender::new(tx), DEFAULT_CHUNK_SIZE);
        let result = build_bundle(store, tree, spec, writer).await;
        if let Err(e) = &result {
            warn!("bundle encoding failed: {e}");
            // surface the failure to the consumer as the final stream item
            let _ = error_tx
                .send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())))
                .await;
        }
        result
    });
    (rx, handle)
}

/// Sizing pass: encode the whole bundle, drain the chunks locally, and
/// report the exact length plus the bundle MD5. The digests computed by this
/// pass are deliberately dropped; the live pass recomputes them for the
/// bytes that actually go over the wire.
pub async fn estimate_size(
    store: Arc<dyn SourceStore>,
    tree: Arc<SourceTree>,
    spec: Arc<BundleSpec>,
) -> crate::Result<BundleEstimate> {
    let (mut rx, handle) = spawn_encoder(store, tree, spec);
    let mut bytes = 0u64;
    let mut md5 = Md5::new();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(chunk) => {
                bytes += chunk.len() as u64;
                md5.update(&chunk);
            }
            // the join below carries the real error
            Err(_) => break,
        }
    }
    let ledger = handle
        .await
        .map_err(|e| ExportError::Archive(format!("bundle task failed: {e}")))??;
    let estimate = BundleEstimate {
        bytes,
        md5_hex: hex::encode(md5.finalize()),
    };
    debug!(
        bytes = estimate.bytes,
        md5 = %estimate.md5_hex,
        files = ledger.len(),
        "sizing pass complete"
    );
    Ok(estimate)
}

/// Live bundle chunks on their way into an HTTP body.
///
/// Carries the length declared by the sizing pass and counts the bytes that
/// actually stream, readable through [`BundleStream::counter`] after the
/// body has been consumed.
pub struct BundleStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    declared: u64,
    streamed: Arc<AtomicU64>,
}

impl BundleStream {
    pub fn declared_len(&self) -> u64 {
        self.declared
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.streamed)
    }
}

impl Stream for BundleStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.streamed.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Handle on the live pass's ledger, claimable once the upload is over.
pub struct LedgerHandle {
    handle: JoinHandle<crate::Result<TransferLedger>>,
}

impl LedgerHandle {
    pub async fn join(self) -> crate::Result<TransferLedger> {
        self.handle
            .await
            .map_err(|e| ExportError::Archive(format!("bundle task failed: {e}")))?
    }
}

/// Live pass: start encoding immediately and hand back the chunk stream.
/// The encoder runs at most [`CHANNEL_CAPACITY`] chunks ahead of whatever
/// consumes the stream.
pub fn open_stream(
    store: Arc<dyn SourceStore>,
    tree: Arc<SourceTree>,
    spec: Arc<BundleSpec>,
    declared: u64,
) -> (BundleStream, LedgerHandle) {
    let (rx, handle) = spawn_encoder(store, tree, spec);
    (
        BundleStream {
            rx,
            declared,
            streamed: Arc::new(AtomicU64::new(0)),
        },
        LedgerHandle { handle },
    )
}
