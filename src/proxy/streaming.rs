//! Pass-through streaming of upstream bodies with metering

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;
type FinishHook = Box<dyn FnOnce(StreamSummary) + Send>;

/// How a relayed body ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Complete,
    /// The upstream body failed mid-stream
    Error,
    /// The client went away before the body ended
    Cancelled,
}

/// Byte counts and timings of one relayed body
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub end: StreamEnd,
    pub bytes: u64,
    pub first_at: Option<Instant>,
    pub last_at: Option<Instant>,
    /// Leading bytes of the body, bounded by the capture limit
    pub capture: Bytes,
}

/// Relays chunks untouched while counting them.
///
/// `on_finish` runs exactly once: when the upstream ends, when it errors, or
/// when the stream is dropped early because the client disconnected.
pub struct MeteredStream {
    inner: ByteStream,
    bytes: u64,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
    capture: BytesMut,
    capture_limit: usize,
    on_finish: Option<FinishHook>,
}

impl MeteredStream {
    pub fn new<S>(inner: S, capture_limit: usize, on_finish: impl FnOnce(StreamSummary) + Send + 'static) -> Self
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            bytes: 0,
            first_at: None,
            last_at: None,
            capture: BytesMut::new(),
            capture_limit,
            on_finish: Some(Box::new(on_finish)),
        }
    }

    fn observe(&mut self, chunk: &Bytes) {
        if chunk.is_empty() {
            return;
        }
        let now = Instant::now();
        self.first_at.get_or_insert(now);
        self.last_at = Some(now);
        self.bytes += chunk.len() as u64;

        let room = self.capture_limit.saturating_sub(self.capture.len());
        if room > 0 {
            self.capture.extend_from_slice(&chunk[..room.min(chunk.len())]);
        }
    }

    fn finish(&mut self, end: StreamEnd) {
        if let Some(hook) = self.on_finish.take() {
            hook(StreamSummary {
                end,
                bytes: self.bytes,
                first_at: self.first_at,
                last_at: self.last_at,
                capture: std::mem::take(&mut self.capture).freeze(),
            });
        }
    }
}

impl Stream for MeteredStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.on_finish.is_none() {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                self.observe(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, bytes = self.bytes, "Upstream stream failed");
                self.finish(StreamEnd::Error);
                Poll::Ready(Some(Err(std::io::Error::other(e.to_string()))))
            }
            Poll::Ready(None) => {
                self.finish(StreamEnd::Complete);
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        self.finish(StreamEnd::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};

    fn collect_summary() -> (Arc<Mutex<Vec<StreamSummary>>>, impl FnOnce(StreamSummary) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |summary| sink.lock().unwrap().push(summary))
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static {
        let items: Vec<reqwest::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        futures::stream::iter(items)
    }

    #[tokio::test]
    async fn test_relays_and_counts() {
        let (seen, hook) = collect_summary();
        let stream = MeteredStream::new(chunks(&["data: a\n\n", "data: b\n\n"]), 1024, hook);
        let out: Vec<Bytes> = stream.map(|r| r.unwrap()).collect().await;

        assert_eq!(out.concat(), b"data: a\n\ndata: b\n\n");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].end, StreamEnd::Complete);
        assert_eq!(seen[0].bytes, 18);
        assert!(seen[0].first_at.unwrap() <= seen[0].last_at.unwrap());
        assert_eq!(&seen[0].capture[..], b"data: a\n\ndata: b\n\n");
    }

    #[tokio::test]
    async fn test_capture_is_bounded() {
        let (seen, hook) = collect_summary();
        let stream = MeteredStream::new(chunks(&["abcdef", "ghij"]), 8, hook);
        let _: Vec<_> = stream.collect().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].bytes, 10);
        assert_eq!(&seen[0].capture[..], b"abcdefgh");
    }

    #[tokio::test]
    async fn test_drop_reports_cancelled_once() {
        let (seen, hook) = collect_summary();
        let mut stream = MeteredStream::new(chunks(&["one", "two"]), 16, hook);
        assert!(stream.next().await.is_some());
        drop(stream);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].end, StreamEnd::Cancelled);
        assert_eq!(seen[0].bytes, 3);
    }

    #[tokio::test]
    async fn test_empty_body_has_no_timings() {
        let (seen, hook) = collect_summary();
        let stream = MeteredStream::new(chunks(&[]), 16, hook);
        let _: Vec<_> = stream.collect().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].end, StreamEnd::Complete);
        assert_eq!(seen[0].bytes, 0);
        assert!(seen[0].first_at.is_none());
    }
}
