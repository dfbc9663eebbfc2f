//! Error types for the harvester.
//!
//! A single `HarvesterError` covers every failure a harvest can end in. The
//! transport keeps transient failures to itself and only surfaces an error
//! once retrying is pointless; everything that reaches the walker aborts the
//! run (except `noRecordsMatch`, which never becomes an error).

use std::path::PathBuf;

use thiserror::Error;

use crate::types::OaiErrorCode;

/// Main error type for the harvester library.
#[derive(Debug, Error)]
pub enum HarvesterError {
    /// Base URL could not be parsed or uses an unsupported scheme.
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A request parameter failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP request failed without a usable response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a status that is not worth retrying.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Body was transferred but could not be decoded (gzip/deflate).
    #[error("Failed to decompress response from {url}: {source}")]
    Decompression {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Every attempt failed with a transient error.
    #[error("Giving up after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// Response is not parseable XML, even after repair.
    #[error("Malformed OAI-PMH response: {message}{}", .dump.as_ref().map(|p| format!(" (raw response saved to {})", p.display())).unwrap_or_default())]
    MalformedResponse {
        message: String,
        dump: Option<PathBuf>,
    },

    /// Repository answered with an OAI-PMH `<error>` element.
    #[error("OAI-PMH error {code}: {message}")]
    Protocol { code: OaiErrorCode, message: String },

    /// Repository handed back the token it was just asked for.
    #[error("Repository returned the same resumptionToken twice: '{0}'")]
    RepeatedResumptionToken(String),

    /// Operator asked the harvest to stop.
    #[error("Harvest interrupted")]
    Interrupted,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint or JSONL serialization failed.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV dump failed.
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),
}

impl HarvesterError {
    /// Whether the error came from the repository's OAI-PMH error report.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::RepeatedResumptionToken(_)
        )
    }

    /// Whether another attempt at the same request could succeed.
    ///
    /// Timeouts, connection failures, 408, 429 and 5xx are transient;
    /// malformed requests, redirect loops, undecodable bodies and other
    /// statuses repeat identically.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !(e.is_builder() || e.is_redirect() || e.is_decode()),
            Self::HttpStatus { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Whether the error is a network-level failure (as opposed to bad data
    /// or a local problem).
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::HttpStatus { .. } | Self::RetriesExhausted { .. }
        )
    }
}

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, HarvesterError>;
