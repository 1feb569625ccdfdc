//! Shared HTTP plumbing for the ticketing and monitoring clients.
//!
//! Modules:
//! - client: paced, retrying request execution
//! - pagination: page cursors and the restartable paginator
//! - rate_limit: fixed-interval request pacing
//! - retry: retry policy and status classification

pub mod client;
pub mod pagination;
pub mod rate_limit;
pub mod retry;

pub use client::RemoteClient;
pub use pagination::{Page, PageCursor, Paginator};
pub use rate_limit::RequestPacer;
pub use retry::{Failure, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Still throttled after {attempts} attempts")]
    Throttled { attempts: u32 },
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Unexpected response body: {0}")]
    Decode(String),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("{endpoint} page {cursor}: {source}")]
    Page {
        endpoint: String,
        cursor: String,
        #[source]
        source: Box<RemoteError>,
    },
}

impl RemoteError {
    /// Whether a later run could plausibly succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status == 408 || *status >= 500,
            Self::Throttled { .. } => true,
            Self::Page { source, .. } => source.is_transient(),
            Self::Auth(_) | Self::Decode(_) | Self::Url(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Api { status, .. } => Some(*status),
            Self::Throttled { .. } => Some(429),
            Self::Page { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}
