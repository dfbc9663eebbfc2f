//! OAI-PMH Harvester - Walk a repository's `ListRecords` / `ListIdentifiers`
//! responses into well-formed XML files.
//!
//! Harvests survive flaky servers (bounded retries honouring `Retry-After`),
//! sloppy XML (bare `&`, control characters) and interruptions (a checkpoint
//! after every page lets the next run continue where the last one stopped).
//!
//! # Example
//!
//! ```
//! use oaipmh_harvester::{HarvestRequest, Verb};
//!
//! let request = HarvestRequest::new(
//!     "https://example.org/api/oai-pmh/",
//!     Verb::ListRecords,
//!     "edm",
//!     "harvest/amsterdam.xml",
//! )
//! .unwrap()
//! .with_set(Some("amsterdam-museum".to_string()))
//! .with_rotation(Some(10_000));
//!
//! assert!(request.validate().is_ok());
//! assert_eq!(
//!     request.checkpoint_path().to_str(),
//!     Some("harvest/amsterdam.xml.state.json")
//! );
//! ```
//!
//! # Architecture
//!
//! The harvester is organized into several modules:
//!
//! - [`config`]: Configuration constants, validation and [`HarvestRequest`]
//! - [`types`]: Core data types (Verb, Record, ParsedPage, etc.)
//! - [`error`]: Error types and Result alias
//! - [`retry`]: Backoff policy and `Retry-After` parsing
//! - [`http`]: HTTP transport with retries
//! - [`sanitize`]: Repair of not-quite-XML response bodies
//! - [`xml`]: XML utilities
//! - [`parser`]: List response parsing
//! - [`checkpoint`]: Persisted harvest position
//! - [`writer`]: Streaming XML output with rotation
//! - [`dump`]: CSV / JSONL projections
//! - [`preflight`]: Identify / ListMetadataFormats checks
//! - [`interrupt`]: Operator interrupt flag
//! - [`harvester`]: The harvest walker
//! - [`cli`]: Command-line interface

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dump;
pub mod error;
pub mod harvester;
pub mod http;
pub mod interrupt;
pub mod parser;
pub mod preflight;
pub mod retry;
pub mod sanitize;
pub mod types;
pub mod writer;
pub mod xml;

// Re-export main functions
pub use harvester::{harvest, HarvestOutcome, HarvestStatus, Harvester};

// Re-export commonly used items
pub use config::{DumpMode, HarvestRequest};
pub use error::{HarvesterError, Result};
pub use interrupt::InterruptFlag;
pub use retry::RetryPolicy;
pub use types::{Record, Verb};
