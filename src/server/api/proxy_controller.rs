// the whole proxy request lives here: validate, fetch, then either rewrite the playlist or pipe
// the bytes through. every request stands on its own, nothing is cached or kept around
use std::fmt;
use std::time::Instant;

use axum::{
    Extension, Router,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error};
use url::Url;

use crate::server::{
    error::{AppResult, Error, ErrorKind},
    extractors::TargetUrl,
    services::{
        ProxyServices,
        relay_services::StreamRelay,
        resolver_services::ProxyTarget,
        upstream_services::{MAX_PLAYLIST_BYTES, UpstreamResponse},
    },
    utils::{
        encoding_utils::ContentEncoding,
        header_utils::{self, PLAYLIST_CONTENT_TYPE},
    },
};

/// which path a target takes, decided by the requested url alone. upstream content-type only
/// ever ends up in the outgoing header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Playlist,
    Stream,
}

impl ContentKind {
    pub fn from_url(url: &Url) -> Self {
        let path = url.path().to_ascii_lowercase();
        if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            Self::Playlist
        } else {
            Self::Stream
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    ReceivingRequest,
    Validating,
    Fetching,
    RewritingPlaylist,
    RelayingStream,
    Responding,
    Done,
    Failed(ErrorKind),
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "failed({})", kind.as_label()),
            other => write!(f, "{:?}", other),
        }
    }
}

/// walks one request through its states and logs the path it took
struct Dispatch {
    state: DispatchState,
    started: Instant,
}

impl Dispatch {
    fn start() -> Self {
        Self {
            state: DispatchState::ReceivingRequest,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: DispatchState) {
        debug!("{} -> {} ({:?})", self.state, next, self.started.elapsed());
        self.state = next;
    }

    fn finish(mut self, outcome: &'static str) {
        self.advance(DispatchState::Done);
        metrics::counter!("proxy_requests_total", "outcome" => outcome).increment(1);
    }

    fn fail(mut self, err: &Error) {
        let kind = err.kind();
        self.advance(DispatchState::Failed(kind));
        metrics::counter!("proxy_requests_total", "outcome" => kind.as_label()).increment(1);
    }
}

pub struct ProxyController;

impl ProxyController {
    pub fn app(proxy_path: &str) -> Router {
        Router::new().route(
            proxy_path,
            get(Self::proxy_get)
                .head(Self::proxy_get)
                .fallback(Self::method_not_allowed),
        )
    }

    async fn proxy_get(
        Extension(services): Extension<ProxyServices>,
        method: Method,
        headers: HeaderMap,
        TargetUrl(raw_url): TargetUrl,
    ) -> Response {
        let mut dispatch = Dispatch::start();

        // held by this handler until the relay takes it over, so a caller hanging up at any
        // point cancels whatever upstream work is still going
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();

        let result = Self::dispatch(
            &services,
            &mut dispatch,
            &method,
            &headers,
            &raw_url,
            cancel,
            guard,
        )
        .await;

        match result {
            Ok((response, outcome)) => {
                dispatch.finish(outcome);
                response
            }
            Err(e) => {
                match &e {
                    Error::FetchFailed(reason) | Error::InternalServerErrorWithContext(reason) => {
                        error!("proxy request failed: {}", reason)
                    }
                    other => debug!("proxy request rejected: {}", other),
                }
                dispatch.fail(&e);
                e.into_response()
            }
        }
    }

    async fn dispatch(
        services: &ProxyServices,
        dispatch: &mut Dispatch,
        method: &Method,
        headers: &HeaderMap,
        raw_url: &str,
        cancel: CancellationToken,
        guard: DropGuard,
    ) -> AppResult<(Response, &'static str)> {
        dispatch.advance(DispatchState::Validating);
        let target = services.targets.resolve(raw_url).await?;
        let kind = ContentKind::from_url(target.url());
        debug!("Proxying ({:?}): {}", kind, target.hostname());

        dispatch.advance(DispatchState::Fetching);
        let user_agent = headers.get(header::USER_AGENT);
        // a playlist has to be rewritten whole, a slice of one is useless
        let range = match kind {
            ContentKind::Playlist => None,
            ContentKind::Stream => headers.get(header::RANGE),
        };
        let upstream = services
            .fetcher
            .fetch(&target, method, range, user_agent, &cancel)
            .await?;

        if upstream.status().is_redirection() {
            dispatch.advance(DispatchState::Responding);
            return Ok((Self::redirect(services, &target, &upstream), "redirect"));
        }

        match kind {
            ContentKind::Playlist => {
                dispatch.advance(DispatchState::RewritingPlaylist);
                let response =
                    Self::playlist(services, &target, method, headers, upstream, &cancel).await?;
                dispatch.advance(DispatchState::Responding);
                Ok((response, "playlist"))
            }
            ContentKind::Stream => {
                dispatch.advance(DispatchState::RelayingStream);
                let response =
                    StreamRelay::relay(upstream, cancel, guard, target.hostname().to_string());
                dispatch.advance(DispatchState::Responding);
                Ok((response, "stream"))
            }
        }
    }

    async fn playlist(
        services: &ProxyServices,
        target: &ProxyTarget,
        method: &Method,
        headers: &HeaderMap,
        upstream: UpstreamResponse,
        cancel: &CancellationToken,
    ) -> AppResult<Response> {
        let content_type = header_utils::content_type_or(upstream.headers(), PLAYLIST_CONTENT_TYPE);

        if *method == Method::HEAD {
            let mut response_headers = header_utils::proxy_headers();
            response_headers.insert(header::CONTENT_TYPE, content_type);
            return Ok((StatusCode::OK, response_headers).into_response());
        }

        let upstream_encoding = ContentEncoding::from_content_encoding(
            upstream
                .headers()
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        let bytes = upstream.read_to_limit(MAX_PLAYLIST_BYTES, cancel).await?;
        debug!("Read {} bytes", bytes.len());

        let decompressed = upstream_encoding.decompress(&bytes).map_err(|e| {
            error!("Failed to decompress {:?} playlist: {}", upstream_encoding, e);
            Error::FetchFailed(format!("failed to decompress playlist: {}", e))
        })?;

        let text = String::from_utf8(decompressed).map_err(|e| {
            error!("Failed to parse m3u8 as UTF-8: {}", e);
            Error::FetchFailed("playlist is not valid utf-8".to_string())
        })?;

        let processed_body = services.rewriter.rewrite(&text, target.url());
        debug!(
            "Processed M3U8, response length: {} bytes",
            processed_body.len()
        );

        Self::build_m3u8_response(&processed_body, content_type, headers)
    }

    /// build m3u8 response with proper headers and optional compression
    fn build_m3u8_response(
        processed_body: &str,
        content_type: HeaderValue,
        headers: &HeaderMap,
    ) -> AppResult<Response> {
        // determine client's preferred encoding (apple hls likes gzip, not zstd)
        let encoding = ContentEncoding::from_accept_encoding(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        let mut response_headers = header_utils::proxy_headers();
        response_headers.insert(header::CONTENT_TYPE, content_type);

        let response_body = encoding.compress(processed_body.as_bytes()).map_err(|e| {
            error!("Failed to compress response with {:?}: {}", encoding, e);
            Error::InternalServerErrorWithContext("Failed to compress response".to_string())
        })?;

        if let Some(enc_header) = encoding.as_header_value() {
            debug!(
                "Compressed M3U8 with {:?} from {} to {} bytes",
                encoding,
                processed_body.len(),
                response_body.len()
            );
            header_utils::insert_static(&mut response_headers, header::CONTENT_ENCODING, enc_header);
        }

        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(response_body.len()));

        Ok((StatusCode::OK, response_headers, response_body).into_response())
    }

    /// 3xx goes back to the caller with the location pointed at us, so the next hop gets
    /// validated like any other request
    fn redirect(
        services: &ProxyServices,
        target: &ProxyTarget,
        upstream: &UpstreamResponse,
    ) -> Response {
        let mut response_headers = header_utils::proxy_headers();

        let location = upstream
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| services.rewriter.proxy_reference_for(location, target.url()))
            .and_then(|rewritten| HeaderValue::from_str(&rewritten).ok());

        match location {
            Some(location) => {
                response_headers.insert(header::LOCATION, location);
            }
            None => debug!("{} redirected without a usable location", target.hostname()),
        }

        (upstream.status(), response_headers).into_response()
    }

    async fn method_not_allowed() -> Error {
        Error::MethodNotAllowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kind_by_extension_only() {
        let kind = |s: &str| ContentKind::from_url(&Url::parse(s).unwrap());

        assert_eq!(kind("https://cdn.example.com/live/index.m3u8"), ContentKind::Playlist);
        assert_eq!(kind("https://cdn.example.com/live/INDEX.M3U8?token=1"), ContentKind::Playlist);
        assert_eq!(kind("https://cdn.example.com/radio/list.m3u"), ContentKind::Playlist);
        assert_eq!(kind("https://cdn.example.com/live/seg1.ts"), ContentKind::Stream);
        assert_eq!(kind("https://cdn.example.com/live/playlist"), ContentKind::Stream);
        assert_eq!(kind("https://cdn.example.com/x.mp4?f=a.m3u8"), ContentKind::Stream);
    }

    #[test]
    fn test_failed_state_display() {
        assert_eq!(
            DispatchState::Failed(ErrorKind::SecurityBlocked).to_string(),
            "failed(security_blocked)"
        );
        assert_eq!(DispatchState::Fetching.to_string(), "Fetching");
    }
}
