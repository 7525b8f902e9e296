//! Incremental dual-digest computation.
//!
//! Every file that leaves the agent is hashed twice while it streams: SHA-256
//! for reconciliation against the source store's own attestations, MD5 for
//! reconciliation against what the destination reports back. Both run over
//! the same chunks in one pass so the bytes are never read twice.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use md5::Md5;
use sha2::{Digest, Sha256};

/// The two digests observed for one file's byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPair {
    pub sha256_hex: String,
    pub md5_hex: String,
}

/// Feeds each chunk into SHA-256 and MD5 simultaneously.
#[derive(Debug)]
pub struct DigestSink {
    sha256: Sha256,
    md5: Md5,
}

impl DigestSink {
    pub fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            md5: Md5::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.sha256.update(chunk);
        self.md5.update(chunk);
    }

    pub fn finish(self) -> DigestPair {
        DigestPair {
            sha256_hex: hex::encode(self.sha256.finalize()),
            md5_hex: hex::encode(self.md5.finalize()),
        }
    }
}

impl Default for DigestSink {
    fn default() -> Self {
        Self::new()
    }
}

struct DigestState {
    sink: Option<DigestSink>,
    bytes: u64,
}

/// Read-out handle for a [`DigestStream`], usable after the stream itself has
/// been consumed by an HTTP body.
pub struct DigestHandle {
    state: Arc<Mutex<DigestState>>,
}

impl DigestHandle {
    /// Bytes forwarded so far.
    pub fn bytes(&self) -> u64 {
        self.state.lock().map(|s| s.bytes).unwrap_or(0)
    }

    /// Finalize the digests. Fails if the stream state was poisoned or the
    /// digests were already taken.
    pub fn finish(self) -> crate::Result<DigestPair> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| crate::ExportError::Archive("digest state poisoned".to_string()))?;
        let sink = state
            .sink
            .take()
            .ok_or_else(|| crate::ExportError::Archive("digests already taken".to_string()))?;
        Ok(sink.finish())
    }
}

/// Stream adapter that taps every chunk into a shared [`DigestSink`] while
/// forwarding it untouched. Used for per-file deposits, where the HTTP client
/// consumes the stream and the digests are read out afterwards.
pub struct DigestStream<S> {
    inner: S,
    state: Arc<Mutex<DigestState>>,
}

impl<S> DigestStream<S> {
    pub fn new(inner: S) -> (Self, DigestHandle) {
        let state = Arc::new(Mutex::new(DigestState {
            sink: Some(DigestSink::new()),
            bytes: 0,
        }));
        let handle = DigestHandle {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, handle)
    }
}

impl<S> Stream for DigestStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let mut state = match self.state.lock() {
                    Ok(state) => state,
                    Err(_) => {
                        return Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::Other,
                            "digest state poisoned",
                        ))))
                    }
                };
                if let Some(sink) = state.sink.as_mut() {
                    sink.update(&chunk);
                }
                state.bytes += chunk.len() as u64;
                drop(state);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    #[test]
    fn test_known_digests() {
        let mut sink = DigestSink::new();
        sink.update(b"hello");
        let pair = sink.finish();
        assert_eq!(pair.sha256_hex, HELLO_SHA256);
        assert_eq!(pair.md5_hex, HELLO_MD5);
    }

    #[test]
    fn test_empty_input() {
        let pair = DigestSink::new().finish();
        assert_eq!(pair.sha256_hex, EMPTY_SHA256);
        assert_eq!(pair.md5_hex, EMPTY_MD5);
    }

    #[test]
    fn test_chunking_does_not_change_digests() {
        let mut whole = DigestSink::new();
        whole.update(b"hello world");

        let mut split = DigestSink::new();
        split.update(b"hello");
        split.update(b" ");
        split.update(b"world");

        assert_eq!(whole.finish(), split.finish());
    }

    #[tokio::test]
    async fn test_digest_stream_taps_chunks() {
        let chunks: Vec<io::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"hel")), Ok(Bytes::from_static(b"lo"))];
        let (stream, handle) = DigestStream::new(futures_util::stream::iter(chunks));

        let forwarded: Vec<Bytes> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(forwarded, vec![Bytes::from_static(b"hel"), Bytes::from_static(b"lo")]);

        assert_eq!(handle.bytes(), 5);
        let pair = handle.finish().unwrap();
        assert_eq!(pair.sha256_hex, HELLO_SHA256);
        assert_eq!(pair.md5_hex, HELLO_MD5);
    }
}
