//! Progress-observing transform over the archive byte stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};

use super::progress::ProgressTracker;
use crate::Result;

/// Counts bytes as they pass through to the uploader.
///
/// Pull-based: the inner stream is polled only when the consumer polls, and
/// nothing is buffered here, so the source is read no faster than parts are
/// accepted.
pub struct ProgressStream {
    inner: BoxStream<'static, Result<Bytes>>,
    tracker: Arc<ProgressTracker>,
}

impl ProgressStream {
    pub fn new(inner: BoxStream<'static, Result<Bytes>>, tracker: Arc<ProgressTracker>) -> Self {
        Self { inner, tracker }
    }
}

impl Stream for ProgressStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            self.tracker.record_fetched(chunk.len());
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
