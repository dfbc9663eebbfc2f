//! HTTP transport for OAI-PMH requests.
//!
//! [`HttpTransport`] issues one GET per call, retrying transient failures
//! according to its [`RetryPolicy`]. gzip/deflate bodies are decoded by the
//! client. Only failures that retrying cannot fix reach the caller.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use url::Url;

use crate::config::{self, USER_AGENT};
use crate::error::{HarvesterError, Result};
use crate::interrupt::InterruptFlag;
use crate::retry::{parse_retry_after, FailureKind, RetryDecision, RetryPolicy};

/// A successfully transferred and decoded response.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Request URL including the query.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    /// Decoded body bytes.
    pub body: Vec<u8>,
}

/// Source of OAI-PMH responses.
pub trait Transport {
    /// GET `base_url` with `params` as the query string.
    fn fetch(&self, base_url: &Url, params: &[(&str, String)]) -> Result<FetchedPage>;
}

/// Create a configured HTTP client.
///
/// # Returns
/// A `reqwest::blocking::Client` with the per-attempt timeout, user agent,
/// `Accept` header and transparent gzip/deflate decoding.
pub fn create_client(timeout: Duration) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(config::ACCEPT));

    let client = Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .gzip(true)
        .deflate(true)
        .build()?;
    Ok(client)
}

/// Append `params` to `base_url` as an encoded query string.
///
/// # Examples
/// ```
/// use url::Url;
/// use oaipmh_harvester::http::build_url;
///
/// let base = Url::parse("https://example.org/oai").unwrap();
/// let url = build_url(&base, &[("verb", "ListRecords".to_string()), ("set", "a:b".to_string())]);
/// assert_eq!(url.as_str(), "https://example.org/oai?verb=ListRecords&set=a%3Ab");
/// ```
#[must_use]
pub fn build_url(base_url: &Url, params: &[(&str, String)]) -> Url {
    let mut url = base_url.clone();
    url.query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    url
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Blocking HTTP transport with bounded retries.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    policy: RetryPolicy,
    interrupt: InterruptFlag,
}

/// Why a single attempt failed, and whether that is worth retrying.
struct AttemptFailure {
    kind: FailureKind,
    error: HarvesterError,
}

impl HttpTransport {
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: create_client(timeout)?,
            policy,
            interrupt: InterruptFlag::new(),
        })
    }

    /// Let retry waits be cut short by `interrupt`.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    fn attempt(&self, url: &Url) -> std::result::Result<FetchedPage, AttemptFailure> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(AttemptFailure {
                kind: classify_status(status, retry_after),
                error: HarvesterError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                },
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().map_err(|e| {
            if e.is_decode() {
                AttemptFailure {
                    kind: FailureKind::Permanent,
                    error: HarvesterError::Decompression {
                        url: url.to_string(),
                        source: e,
                    },
                }
            } else {
                AttemptFailure {
                    kind: FailureKind::Transient { retry_after: None },
                    error: HarvesterError::Http(e),
                }
            }
        })?;

        tracing::debug!(
            status = status.as_u16(),
            content_type = content_type.as_deref().unwrap_or("-"),
            bytes = body.len(),
            "response received"
        );

        Ok(FetchedPage {
            url: url.to_string(),
            status: status.as_u16(),
            content_type,
            body: body.to_vec(),
        })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, base_url: &Url, params: &[(&str, String)]) -> Result<FetchedPage> {
        let url = build_url(base_url, params);
        let mut attempt = 1;

        loop {
            if self.interrupt.is_triggered() {
                return Err(HarvesterError::Interrupted);
            }

            tracing::debug!(url = %url, attempt, "GET");
            let failure = match self.attempt(&url) {
                Ok(page) => return Ok(page),
                Err(failure) => failure,
            };

            match self.policy.decide(&failure.kind, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    tracing::warn!(
                        error = %failure.error,
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = millis(delay),
                        "Request failed, will retry"
                    );
                    if !self.interrupt.sleep(delay) {
                        return Err(HarvesterError::Interrupted);
                    }
                    attempt = next;
                }
                RetryDecision::GiveUp { reason } => {
                    tracing::debug!(%reason, "not retrying");
                    return Err(match failure.kind {
                        FailureKind::Permanent => failure.error,
                        FailureKind::Transient { .. } => HarvesterError::RetriesExhausted {
                            attempts: attempt,
                            message: failure.error.to_string(),
                        },
                    });
                }
            }
        }
    }
}

/// Classify a non-success status code.
///
/// | Status | Kind |
/// |--------|------|
/// | 408, 429 | Transient |
/// | 5xx | Transient |
/// | other 4xx, 3xx left unfollowed | Permanent |
fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> FailureKind {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        FailureKind::Transient { retry_after }
    } else {
        FailureKind::Permanent
    }
}

/// Classify an error raised before any response arrived.
fn classify_send_error(e: reqwest::Error) -> AttemptFailure {
    let error = HarvesterError::Http(e);
    let kind = if error.is_retryable() {
        FailureKind::Transient { retry_after: None }
    } else {
        FailureKind::Permanent
    };
    AttemptFailure { kind, error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_client() {
        let client = create_client(Duration::from_secs(5));
        assert!(client.is_ok());
    }

    #[test]
    fn test_classify_status() {
        let hint = Some(Duration::from_secs(2));
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, hint),
            FailureKind::Transient { retry_after: hint }
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None),
            FailureKind::Transient { retry_after: None }
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            FailureKind::Transient { retry_after: None }
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None),
            FailureKind::Transient { retry_after: None }
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, None),
            FailureKind::Permanent
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, hint),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_build_url_encodes_token() {
        let base = Url::parse("https://example.org/api/oai-pmh/").unwrap();
        let url = build_url(
            &base,
            &[
                ("verb", "ListRecords".to_string()),
                ("resumptionToken", "a b&c=d".to_string()),
            ],
        );
        assert_eq!(
            url.as_str(),
            "https://example.org/api/oai-pmh/?verb=ListRecords&resumptionToken=a+b%26c%3Dd"
        );
    }

    #[test]
    fn test_build_url_keeps_endpoint_query() {
        let base = Url::parse("https://example.org/cgi-bin/repo?type=oai").unwrap();
        let url = build_url(&base, &[("verb", "Identify".to_string())]);
        assert_eq!(
            url.as_str(),
            "https://example.org/cgi-bin/repo?type=oai&verb=Identify"
        );
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
