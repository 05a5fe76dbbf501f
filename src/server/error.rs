use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::server::utils::header_utils;

pub type AppResult<T> = Result<T, Error>;

/// coarse buckets every error falls into, used for metrics labels and deciding what gets logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    SecurityBlocked,
    UpstreamFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::SecurityBlocked => "security_blocked",
            Self::UpstreamFailure => "upstream_failure",
            Self::Internal => "internal",
        }
    }
}

// the display strings here are what the caller sees, so nothing that came from the resolver or
// reqwest goes in them. log that stuff where the error is created instead
#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing url query param")]
    MissingUrl,

    #[error("Invalid URL")]
    InvalidUrl,

    #[error("Unsupported URL scheme")]
    UnsupportedScheme,

    #[error("Blocked target host")]
    BlockedHost,

    #[error("Blocked target address")]
    BlockedAddress,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Upstream returned an error status")]
    UpstreamStatus(StatusCode),

    // the string is only for logs
    #[error("Upstream fetch failed")]
    FetchFailed(String),

    #[error("Internal server error")]
    InternalServerErrorWithContext(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingUrl | Self::InvalidUrl | Self::UnsupportedScheme | Self::MethodNotAllowed => {
                ErrorKind::InvalidInput
            }
            Self::BlockedHost | Self::BlockedAddress => ErrorKind::SecurityBlocked,
            Self::UpstreamStatus(_) | Self::FetchFailed(_) => ErrorKind::UpstreamFailure,
            Self::InternalServerErrorWithContext(_) => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::MissingUrl
            | Self::InvalidUrl
            | Self::UnsupportedScheme
            | Self::BlockedHost
            | Self::BlockedAddress => StatusCode::BAD_REQUEST,
            Self::UpstreamStatus(_) | Self::FetchFailed(_) => StatusCode::BAD_GATEWAY,
            Self::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let mut headers = header_utils::proxy_headers();
        if matches!(self, Self::MethodNotAllowed) {
            header_utils::insert_static(&mut headers, axum::http::header::ALLOW, "GET, HEAD");
        }

        (self.status_code(), headers, self.to_string()).into_response()
    }
}
