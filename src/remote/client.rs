use std::time::Duration;

use serde::de::DeserializeOwned;

use super::rate_limit::RequestPacer;
use super::retry::{classify_status, classify_transport, jitter, parse_retry_after, Failure, RetryPolicy};
use super::RemoteError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const ERROR_BODY_LIMIT: usize = 300;

/// A paced, retrying HTTP client shared by one upstream's requests.
pub struct RemoteClient {
    http: reqwest::Client,
    pacer: RequestPacer,
    policy: RetryPolicy,
    label: &'static str,
}

impl RemoteClient {
    pub fn new(
        label: &'static str,
        requests_per_second: f64,
        policy: RetryPolicy,
    ) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("codex/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            pacer: RequestPacer::per_second(requests_per_second),
            policy,
            label,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `request`, pacing every attempt and retrying throttled or
    /// transient failures within the policy. Non-success responses that are
    /// not retried become `RemoteError::Api`.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let mut transient_attempts = 0u32;
        let mut throttled_attempts = 0u32;

        loop {
            let Some(attempt) = request.try_clone() else {
                // Streaming bodies cannot be replayed; send once.
                self.pacer.acquire().await;
                return ensure_success(request.send().await?).await;
            };

            self.pacer.acquire().await;
            let (failure, retry_after, last_error) = match attempt.send().await {
                Ok(response) => match classify_status(response.status()) {
                    None => return ensure_success(response).await,
                    Some(failure) => {
                        let retry_after =
                            parse_retry_after(response.headers().get(reqwest::header::RETRY_AFTER));
                        (failure, retry_after, api_error(response).await)
                    }
                },
                Err(err) => match classify_transport(&err) {
                    None => return Err(RemoteError::Http(err)),
                    Some(failure) => (failure, None, RemoteError::Http(err)),
                },
            };

            let retry = match failure {
                Failure::Transient => {
                    transient_attempts += 1;
                    transient_attempts
                }
                Failure::Throttled => {
                    throttled_attempts += 1;
                    throttled_attempts
                }
            };

            match self.policy.delay_for(retry, failure, retry_after) {
                Some(delay) => {
                    log::warn!(
                        "{} retry {} after {} (sleep {:?})",
                        self.label,
                        retry,
                        last_error,
                        delay
                    );
                    tokio::time::sleep(delay + jitter()).await;
                }
                None => {
                    return Err(match failure {
                        Failure::Throttled => RemoteError::Throttled {
                            attempts: throttled_attempts,
                        },
                        Failure::Transient => last_error,
                    });
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, RemoteError> {
        let response = self.send(request).await?;
        decode_json(response).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(api_error(response).await)
    }
}

async fn api_error(response: reqwest::Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RemoteError::Api {
        status,
        message: truncate(&body, ERROR_BODY_LIMIT),
    }
}

pub async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
    let body = response.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| RemoteError::Decode(format!("{} in '{}'", e, truncate(&body, ERROR_BODY_LIMIT))))
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
