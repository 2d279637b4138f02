use std::time::Duration;

use deltasync_core::RetryDisposition;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source api rejected credentials (http {status})")]
    Auth { status: u16 },
    #[error("http status {status} for {url}: {body}")]
    Http { status: u16, url: String, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("invalid source configuration: {0}")]
    Config(String),
}

impl SourceError {
    pub fn http(status: StatusCode, url: impl Into<String>, body: impl Into<String>) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Self::Auth {
                status: status.as_u16(),
            };
        }
        Self::Http {
            status: status.as_u16(),
            url: url.into(),
            body: body.into(),
        }
    }

    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            Self::Http { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Transport(err) => classify_reqwest_error(err),
            Self::Timeout(_) => RetryDisposition::Retryable,
            Self::Auth { .. } | Self::Decode(_) | Self::Config(_) => RetryDisposition::NonRetryable,
        }
    }

    /// Errors that must abort the whole run rather than just one request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Config(_))
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.as_u16() == 425
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}
