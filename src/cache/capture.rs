//! Body decorator that records a response while it streams to the client.

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
};
use bytes::{Bytes, BytesMut};
use http_body::{Body as _, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::runtime::Handle;
use tracing::debug;

use super::{CacheEntry, ResponseCache};

/// Wraps a response body, forwarding every frame untouched while keeping a
/// copy of the data.
///
/// Once the inner body reports its end, the copy is handed to
/// [`ResponseCache::store`] on a detached task, so the write is not tied to
/// the lifetime of the request. A body that errors, or is dropped before it
/// finished, is never committed. That includes a client disconnecting
/// mid-stream: the server drops the body and the partial copy with it.
pub struct ResponseCapture {
    inner: Body,
    buffer: BytesMut,
    commit: Option<PendingCommit>,
}

struct PendingCommit {
    cache: ResponseCache,
    key: String,
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseCapture {
    pub fn new(inner: Body, cache: ResponseCache, key: String, status: StatusCode, headers: HeaderMap) -> Self {
        let mut capture = Self {
            inner,
            buffer: BytesMut::new(),
            commit: Some(PendingCommit {
                cache,
                key,
                status,
                headers,
            }),
        };

        // An empty body may never be polled at all
        if capture.inner.is_end_stream() {
            capture.finish();
        }
        capture
    }

    fn finish(&mut self) {
        if let Some(commit) = self.commit.take() {
            commit.spawn(self.buffer.split().freeze());
        }
    }

    fn abandon(&mut self) {
        self.commit = None;
        self.buffer.clear();
    }
}

impl PendingCommit {
    fn spawn(self, body: Bytes) {
        let PendingCommit {
            cache,
            key,
            status,
            headers,
        } = self;

        let Ok(runtime) = Handle::try_current() else {
            debug!(key = %key, "No runtime available, skipping cache commit");
            return;
        };

        let entry = CacheEntry::new(status, headers, body);
        runtime.spawn(async move {
            cache.store(&key, &entry).await;
        });
    }
}

impl http_body::Body for ResponseCapture {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if this.commit.is_some() {
                    if let Some(data) = frame.data_ref() {
                        this.buffer.extend_from_slice(data);
                    }
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                debug!(error = %err, "Response body failed, not caching");
                this.abandon();
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ResponseCapture {
    fn drop(&mut self) {
        // The server may stop polling as soon as is_end_stream() turns true
        if self.inner.is_end_stream() {
            self.finish();
        }
    }
}
