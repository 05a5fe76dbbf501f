use axum::http::{HeaderMap, HeaderName, HeaderValue, header};

pub const DEFAULT_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// headers copied from upstream on the stream path, everything else gets dropped
pub const PASSTHROUGH_HEADERS: [HeaderName; 6] = [
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::CONTENT_ENCODING,
    header::ETAG,
    header::LAST_MODIFIED,
];

pub fn insert_static(headers: &mut HeaderMap, name: HeaderName, value: &'static str) {
    headers.insert(name, HeaderValue::from_static(value));
}

/// every response from the proxy gets these, errors included, so browser players can read the
/// response cross-origin and nothing in between decides to keep a copy
pub fn proxy_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_static(&mut headers, header::CACHE_CONTROL, "no-store");
    insert_static(&mut headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
    insert_static(&mut headers, header::ACCESS_CONTROL_ALLOW_HEADERS, "Range,Content-Type");
    insert_static(
        &mut headers,
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        "Content-Length,Content-Range,Accept-Ranges",
    );
    headers
}

/// upstream content-type if it's a usable header value, otherwise the fallback
pub fn content_type_or(upstream: &HeaderMap, fallback: &'static str) -> HeaderValue {
    upstream
        .get(header::CONTENT_TYPE)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_headers_are_no_store_and_cors() {
        let headers = proxy_headers();
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Range,Content-Type");
    }

    #[test]
    fn test_content_type_fallback() {
        let mut upstream = HeaderMap::new();
        assert_eq!(
            content_type_or(&upstream, DEFAULT_STREAM_CONTENT_TYPE),
            DEFAULT_STREAM_CONTENT_TYPE
        );

        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
        assert_eq!(
            content_type_or(&upstream, DEFAULT_STREAM_CONTENT_TYPE),
            "video/mp2t"
        );
    }
}
