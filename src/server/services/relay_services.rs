use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use futures::{Stream, StreamExt, stream::BoxStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error};

use crate::server::utils::header_utils::{self, DEFAULT_STREAM_CONTENT_TYPE, PASSTHROUGH_HEADERS};

use super::upstream_services::UpstreamResponse;

/// upstream body handed to hyper chunk by chunk. hyper only polls when the caller can take
/// more so back-pressure reaches the upstream socket on its own
///
/// owns the request's drop guard: when hyper drops the body because the caller hung up, the
/// token gets cancelled and the upstream response is dropped with it
pub struct RelayStream {
    inner: BoxStream<'static, Result<Bytes, std::io::Error>>,
    cancel: CancellationToken,
    _guard: DropGuard,
    label: String,
    bytes_sent: u64,
    polled: bool,
    finished: bool,
}

impl RelayStream {
    pub fn new<S, E>(upstream: S, cancel: CancellationToken, guard: DropGuard, label: String) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            inner: upstream.map(|chunk| chunk.map_err(std::io::Error::other)).boxed(),
            cancel,
            _guard: guard,
            label,
            bytes_sent: 0,
            polled: false,
            finished: false,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// a body hyper never polled (HEAD, or a response discarded before writing) isn't a
    /// disconnect, only one dropped part way through is
    pub fn caller_disconnected(&self) -> bool {
        self.polled && !self.finished
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        self.polled = true;

        if self.cancel.is_cancelled() {
            self.finished = true;
            return Poll::Ready(Some(Err(std::io::Error::other("relay cancelled"))));
        }

        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                error!("upstream body for {} failed mid stream: {}", self.label, e);
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                debug!("relayed {} bytes from {}", self.bytes_sent, self.label);
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if self.caller_disconnected() {
            debug!(
                "caller disconnected from {} after {} bytes, dropping upstream",
                self.label, self.bytes_sent
            );
            metrics::counter!("proxy_client_disconnects_total").increment(1);
        }
    }
}

pub struct StreamRelay;

impl StreamRelay {
    /// status and range headers come through exactly as upstream sent them, content type
    /// falls back to octet-stream and caching is always off
    pub fn relay(
        upstream: UpstreamResponse,
        cancel: CancellationToken,
        guard: DropGuard,
        label: String,
    ) -> Response {
        let status = upstream.status();
        let headers = Self::response_headers(upstream.headers());

        debug!("relaying {} from {}", status, label);

        let body = Body::from_stream(RelayStream::new(upstream.into_stream(), cancel, guard, label));

        (status, headers, body).into_response()
    }

    pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
        let mut headers = header_utils::proxy_headers();

        headers.insert(
            header::CONTENT_TYPE,
            header_utils::content_type_or(upstream, DEFAULT_STREAM_CONTENT_TYPE),
        );

        for name in PASSTHROUGH_HEADERS.iter() {
            if let Some(value) = upstream.get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use futures::stream;

    use super::*;

    fn chunks(
        parts: Vec<Result<Bytes, std::io::Error>>,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        stream::iter(parts)
    }

    #[tokio::test]
    async fn test_relays_every_chunk_in_order() {
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let mut relay = RelayStream::new(
            chunks(vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"def"))]),
            cancel.clone(),
            guard,
            "test".to_string(),
        );

        let mut collected = Vec::new();
        while let Some(chunk) = relay.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(collected, b"abcdef");
        assert_eq!(relay.bytes_sent(), 6);
    }

    #[tokio::test]
    async fn test_dropping_relay_cancels_request() {
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let mut relay = RelayStream::new(
            chunks(vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"def"))]),
            cancel.clone(),
            guard,
            "test".to_string(),
        );

        let _ = relay.next().await;
        assert!(!cancel.is_cancelled());

        drop(relay);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_only_a_partly_read_body_counts_as_disconnect() {
        let relay = |parts| {
            let cancel = CancellationToken::new();
            let guard = cancel.clone().drop_guard();
            RelayStream::new(chunks(parts), cancel, guard, "test".to_string())
        };

        let never_polled = relay(vec![Ok(Bytes::from_static(b"abc"))]);
        assert!(!never_polled.caller_disconnected());

        let mut partly_read = relay(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]);
        let _ = partly_read.next().await;
        assert!(partly_read.caller_disconnected());

        let mut drained = relay(vec![Ok(Bytes::from_static(b"abc"))]);
        while drained.next().await.is_some() {}
        assert!(!drained.caller_disconnected());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_relay() {
        let cancel = CancellationToken::new();
        let guard = CancellationToken::new().drop_guard();
        let mut relay = RelayStream::new(
            chunks(vec![Ok(Bytes::from_static(b"abc"))]),
            cancel.clone(),
            guard,
            "test".to_string(),
        );

        cancel.cancel();
        assert!(relay.next().await.unwrap().is_err());
        assert!(relay.next().await.is_none());
    }

    #[tokio::test]
    async fn test_upstream_error_ends_relay() {
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let mut relay = RelayStream::new(
            chunks(vec![
                Ok(Bytes::from_static(b"abc")),
                Err(std::io::Error::other("reset")),
                Ok(Bytes::from_static(b"never")),
            ]),
            cancel,
            guard,
            "test".to_string(),
        );

        assert!(relay.next().await.unwrap().is_ok());
        assert!(relay.next().await.unwrap().is_err());
        assert!(relay.next().await.is_none());
    }

    #[test]
    fn test_response_headers_pass_range_through() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
        upstream.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/1000"));
        upstream.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        upstream.insert(header::SET_COOKIE, HeaderValue::from_static("session=abc"));
        upstream.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=600"));

        let headers = StreamRelay::response_headers(&upstream);

        assert_eq!(headers[header::CONTENT_TYPE], "video/mp2t");
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert!(headers.get(header::SET_COOKIE).is_none());
    }

    #[test]
    fn test_missing_content_type_defaults_to_octet_stream() {
        let headers = StreamRelay::response_headers(&HeaderMap::new());
        assert_eq!(headers[header::CONTENT_TYPE], DEFAULT_STREAM_CONTENT_TYPE);
    }
}
