//! Response body instrumentation.
//!
//! Relayed response bodies are streamed, so their size is only known once the
//! last frame has gone out. `MeteredBody` counts data frames as they pass and
//! writes the access log line when the stream ends, fails, or is dropped.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::http::{Method, StatusCode, Version};
use hyper::body::{Body as HttpBody, Bytes, Frame, SizeHint};

use crate::observability::metrics;

/// What gets logged for one relayed request.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub version: Version,
    pub method: Method,
    pub host: String,
    pub status: StatusCode,
}

impl AccessRecord {
    fn complete(&self, bytes: u64) {
        tracing::info!(
            version = ?self.version,
            method = %self.method,
            host = %self.host,
            status = self.status.as_u16(),
            bytes,
            kb = bytes / 1000,
            "Proxied request"
        );
        metrics::record_request(&self.method, self.status.as_u16(), bytes);
    }

    fn failed(&self, bytes: u64, error: &dyn std::fmt::Display) {
        tracing::warn!(
            version = ?self.version,
            method = %self.method,
            host = %self.host,
            status = self.status.as_u16(),
            bytes,
            error = %error,
            "Response stream failed"
        );
        metrics::record_request(&self.method, self.status.as_u16(), bytes);
    }

    fn aborted(&self, bytes: u64) {
        tracing::warn!(
            version = ?self.version,
            method = %self.method,
            host = %self.host,
            status = self.status.as_u16(),
            bytes,
            "Response stream abandoned by client"
        );
        metrics::record_request(&self.method, self.status.as_u16(), bytes);
    }
}

/// A body wrapper that counts bytes and logs exactly once.
pub struct MeteredBody<B>
where
    B: HttpBody,
{
    inner: B,
    bytes: u64,
    record: Option<AccessRecord>,
}

impl<B> MeteredBody<B>
where
    B: HttpBody,
{
    pub fn new(inner: B, record: AccessRecord) -> Self {
        Self {
            inner,
            bytes: 0,
            record: Some(record),
        }
    }
}

impl<B> HttpBody for MeteredBody<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                if let Some(record) = this.record.take() {
                    record.failed(this.bytes, &e);
                }
                Poll::Ready(Some(Err(e)))
            }
            None => {
                if let Some(record) = this.record.take() {
                    record.complete(this.bytes);
                }
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

impl<B> Drop for MeteredBody<B>
where
    B: HttpBody,
{
    fn drop(&mut self) {
        // Empty bodies may be dropped without ever being polled.
        if let Some(record) = self.record.take() {
            if self.inner.is_end_stream() {
                record.complete(self.bytes);
            } else {
                record.aborted(self.bytes);
            }
        }
    }
}
