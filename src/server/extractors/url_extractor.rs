use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use tracing::debug;

use crate::server::error::Error;

#[derive(Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

/// the `url` query param, already percent-decoded. nothing about it is checked here beyond
/// being present, that's the target resolver's job
pub struct TargetUrl(pub String);

impl<S> FromRequestParts<S> for TargetUrl
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(query): Query<UrlQuery> = Query::from_request_parts(parts, state)
            .await
            .map_err(|e| {
                debug!("unreadable query string: {}", e);
                Error::MissingUrl
            })?;

        match query.url {
            Some(url) if !url.trim().is_empty() => Ok(TargetUrl(url.trim().to_string())),
            _ => Err(Error::MissingUrl),
        }
    }
}
