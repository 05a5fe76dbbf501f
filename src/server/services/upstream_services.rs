use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use futures::{StreamExt, stream::BoxStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::AppConfig;
use crate::server::error::{AppResult, Error};

use super::resolver_services::ProxyTarget;

/// playlists get buffered for rewriting so they get a ceiling, media never does
pub const MAX_PLAYLIST_BYTES: usize = 8 * 1024 * 1024;

/// issues the one outbound request for a validated target
///
/// a fresh client is built per request so the validated address can be pinned for the connect
/// and nothing is shared between requests
pub struct UpstreamFetcher {
    default_user_agent: HeaderValue,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl UpstreamFetcher {
    pub fn new(config: &AppConfig) -> Self {
        let default_user_agent = HeaderValue::from_str(&config.user_agent).unwrap_or_else(|_| {
            error!("configured user agent is not a valid header value, using the default");
            HeaderValue::from_static(crate::config::DEFAULT_USER_AGENT)
        });

        Self {
            default_user_agent,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }

    fn client_for(&self, target: &ProxyTarget) -> AppResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            // a redirect to a private address would skip validation, the dispatcher hands 3xx
            // back to the caller rewritten so the next hop comes through here again
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.idle_timeout)
            .pool_max_idle_per_host(0)
            .no_proxy();

        if !target.is_ip_literal() {
            // pin the address we validated so a second lookup can't hand back something else
            builder = builder.resolve(
                target.hostname(),
                SocketAddr::new(target.resolved_address(), target.port()),
            );
        }

        builder.build().map_err(|e| {
            error!("failed to build upstream client: {}", e);
            Error::InternalServerErrorWithContext(format!("failed to build client: {}", e))
        })
    }

    /// only `range` and the user agent ever go upstream, the caller's cookies and auth stay
    /// with us
    pub async fn fetch(
        &self,
        target: &ProxyTarget,
        method: &Method,
        range: Option<&HeaderValue>,
        user_agent: Option<&HeaderValue>,
        cancel: &CancellationToken,
    ) -> AppResult<UpstreamResponse> {
        let method = if *method == Method::HEAD {
            Method::HEAD
        } else {
            Method::GET
        };

        let client = self.client_for(target)?;

        let mut request = client.request(method, target.url().clone()).header(
            header::USER_AGENT,
            user_agent.unwrap_or(&self.default_user_agent).clone(),
        );

        if let Some(range) = range {
            debug!("forwarding range {:?}", range);
            request = request.header(header::RANGE, range.clone());
        }

        debug!("sending request to {}", target.hostname());

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("caller went away before {} answered", target.hostname());
                return Err(Error::FetchFailed("cancelled by caller".to_string()));
            }
            result = request.send() => result.map_err(|e| {
                error!("request to {} failed: {}", target.hostname(), e);
                Error::FetchFailed(e.to_string())
            })?,
        };

        let status = response.status();
        debug!("received response with status: {}", status);

        if !(status.is_success() || status.is_redirection()) {
            error!("upstream {} answered {}", target.hostname(), status);
            return Err(Error::UpstreamStatus(status));
        }

        Ok(UpstreamResponse { inner: response })
    }
}

pub struct UpstreamResponse {
    inner: reqwest::Response,
}

impl UpstreamResponse {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// reads the whole body, giving up past `limit` bytes or when the caller leaves
    pub async fn read_to_limit(self, limit: usize, cancel: &CancellationToken) -> AppResult<Vec<u8>> {
        let mut body = Vec::new();
        let mut stream = self.inner.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::FetchFailed("cancelled by caller".to_string()));
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|e| {
                error!("failed to read upstream body: {}", e);
                Error::FetchFailed(e.to_string())
            })?;

            if body.len() + chunk.len() > limit {
                error!("upstream body went past {} bytes", limit);
                return Err(Error::FetchFailed("response too large".to_string()));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, reqwest::Error>> {
        self.inner.bytes_stream().boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::Arc;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::server::services::address_services::AddressPolicy;
    use crate::server::services::resolver_services::{MockHostResolverTrait, TargetResolver};

    fn loopback_resolver(mock: MockHostResolverTrait) -> TargetResolver {
        TargetResolver::new(
            Arc::new(mock),
            AddressPolicy::new(vec!["127.0.0.1/32".parse().unwrap()]),
        )
    }

    async fn literal_target(server: &MockServer, route: &str) -> ProxyTarget {
        let mut mock = MockHostResolverTrait::new();
        mock.expect_lookup().never();
        loopback_resolver(mock)
            .resolve(&format!("{}{}", server.uri(), route))
            .await
            .unwrap()
    }

    fn fetcher() -> UpstreamFetcher {
        UpstreamFetcher::new(&AppConfig::default())
    }

    #[tokio::test]
    async fn test_forwards_range_and_default_user_agent_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/seg.ts"))
            .respond_with(ResponseTemplate::new(206).insert_header("content-range", "bytes 100-199/1000"))
            .mount(&server)
            .await;

        let target = literal_target(&server, "/seg.ts").await;
        let range = HeaderValue::from_static("bytes=100-199");
        let response = fetcher()
            .fetch(&target, &Method::GET, Some(&range), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let headers = &received[0].headers;
        assert_eq!(headers.get("range").unwrap(), "bytes=100-199");
        assert_eq!(
            headers.get("user-agent").unwrap(),
            crate::config::DEFAULT_USER_AGENT
        );
        assert!(headers.get("cookie").is_none());
        assert!(headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_caller_user_agent_wins_over_default() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let target = literal_target(&server, "/seg.ts").await;
        let agent = HeaderValue::from_static("AppleCoreMedia/1.0");
        fetcher()
            .fetch(&target, &Method::HEAD, None, Some(&agent), &CancellationToken::new())
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].method.as_str(), "HEAD");
        assert_eq!(received[0].headers.get("user-agent").unwrap(), "AppleCoreMedia/1.0");
        assert!(received[0].headers.get("range").is_none());
    }

    #[tokio::test]
    async fn test_error_status_is_upstream_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let target = literal_target(&server, "/gone.ts").await;
        let result = fetcher()
            .fetch(&target, &Method::GET, None, None, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(Error::UpstreamStatus(StatusCode::NOT_FOUND))
        ));
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "http://10.0.0.1/admin"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let target = literal_target(&server, "/hop").await;
        let response = fetcher()
            .fetch(&target, &Method::GET, None, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "http://10.0.0.1/admin");
    }

    #[tokio::test]
    async fn test_hostname_is_pinned_to_validated_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live/seg.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let mut mock = MockHostResolverTrait::new();
        mock.expect_lookup()
            .times(1)
            .returning(|_, _| Ok(vec!["127.0.0.1".parse::<IpAddr>().unwrap()]));

        let port = server.address().port();
        let target = loopback_resolver(mock)
            .resolve(&format!("http://media.test:{}/live/seg.ts", port))
            .await
            .unwrap();

        let response = fetcher()
            .fetch(&target, &Method::GET, None, None, &CancellationToken::new())
            .await
            .unwrap();
        let body = response
            .read_to_limit(1024, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, vec![1u8, 2, 3]);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fetch_failed() {
        // grab a free port and let it go again so nothing is listening there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut mock = MockHostResolverTrait::new();
        mock.expect_lookup().never();
        let target = loopback_resolver(mock)
            .resolve(&format!("http://127.0.0.1:{}/seg.ts", port))
            .await
            .unwrap();

        let result = fetcher()
            .fetch(&target, &Method::GET, None, None, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::FetchFailed(_))));
    }

    #[tokio::test]
    async fn test_cancelled_caller_never_reaches_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let target = literal_target(&server, "/seg.ts").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fetcher()
            .fetch(&target, &Method::GET, None, None, &cancel)
            .await;

        assert!(matches!(result, Err(Error::FetchFailed(_))));
    }

    #[tokio::test]
    async fn test_read_to_limit_refuses_oversized_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let target = literal_target(&server, "/big.m3u8").await;
        let response = fetcher()
            .fetch(&target, &Method::GET, None, None, &CancellationToken::new())
            .await
            .unwrap();

        let result = response.read_to_limit(1024, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::FetchFailed(_))));
    }
}
