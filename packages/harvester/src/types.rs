//! Core data types for the harvester.
//!
//! These types describe what travels between the parser, the walker and the
//! writers: records, OAI-PMH error codes, list-size hints and the preflight
//! repository description.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarvesterError;

/// The list verbs the harvester can walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Full records (header + metadata).
    ListRecords,

    /// Headers only.
    ListIdentifiers,
}

impl Verb {
    /// Protocol spelling of the verb.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListRecords => "ListRecords",
            Self::ListIdentifiers => "ListIdentifiers",
        }
    }

    /// Element name of the item this verb lists (`record` or `header`).
    #[must_use]
    pub fn item_element(&self) -> &'static str {
        match self {
            Self::ListRecords => "record",
            Self::ListIdentifiers => "header",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = HarvesterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ListRecords" => Ok(Self::ListRecords),
            "ListIdentifiers" => Ok(Self::ListIdentifiers),
            other => Err(HarvesterError::InvalidConfig(format!(
                "unsupported verb '{other}' (expected ListRecords or ListIdentifiers)"
            ))),
        }
    }
}

/// OAI-PMH error codes (protocol section 3.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OaiErrorCode {
    BadArgument,
    BadResumptionToken,
    BadVerb,
    CannotDisseminateFormat,
    IdDoesNotExist,
    NoRecordsMatch,
    NoMetadataFormats,
    NoSetHierarchy,
    /// A code outside the protocol's list.
    Other(String),
}

impl OaiErrorCode {
    /// Protocol spelling of the code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::BadArgument => "badArgument",
            Self::BadResumptionToken => "badResumptionToken",
            Self::BadVerb => "badVerb",
            Self::CannotDisseminateFormat => "cannotDisseminateFormat",
            Self::IdDoesNotExist => "idDoesNotExist",
            Self::NoRecordsMatch => "noRecordsMatch",
            Self::NoMetadataFormats => "noMetadataFormats",
            Self::NoSetHierarchy => "noSetHierarchy",
            Self::Other(code) => code,
        }
    }

    /// `noRecordsMatch` ends a list request with zero items; it is not a
    /// failure.
    #[must_use]
    pub fn is_empty_result(&self) -> bool {
        matches!(self, Self::NoRecordsMatch)
    }
}

impl From<&str> for OaiErrorCode {
    fn from(code: &str) -> Self {
        match code.trim() {
            "badArgument" => Self::BadArgument,
            "badResumptionToken" => Self::BadResumptionToken,
            "badVerb" => Self::BadVerb,
            "cannotDisseminateFormat" => Self::CannotDisseminateFormat,
            "idDoesNotExist" => Self::IdDoesNotExist,
            "noRecordsMatch" => Self::NoRecordsMatch,
            "noMetadataFormats" => Self::NoMetadataFormats,
            "noSetHierarchy" => Self::NoSetHierarchy,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for OaiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `<error>` element reported by the repository instead of list items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiErrorNote {
    pub code: OaiErrorCode,
    pub message: String,
}

/// One harvested item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// OAI identifier from the header.
    pub identifier: String,

    /// Header datestamp (ISO-8601 date or date-time).
    pub datestamp: String,

    /// Header carried `status="deleted"`.
    pub deleted: bool,

    /// `setSpec` values from the header.
    pub set_specs: Vec<String>,

    /// Raw `<metadata>` element. Always `None` for deleted records and for
    /// `ListIdentifiers` headers.
    pub metadata: Option<String>,

    /// The complete `<record>` element as written to the output, with any
    /// namespace declarations it inherited in the response copied onto it.
    pub xml: String,
}

impl Record {
    /// Whether the record is written header-only.
    #[must_use]
    pub fn is_header_only(&self) -> bool {
        self.metadata.is_none()
    }
}

/// Informational attributes of a `<resumptionToken>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListHints {
    pub complete_list_size: Option<u64>,
    pub cursor: Option<u64>,
    pub expiration_date: Option<String>,
}

/// Result of parsing one list response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Items on this page, in document order.
    pub records: Vec<Record>,

    /// Token for the next page; `None` when the list is exhausted.
    pub next_token: Option<String>,

    /// Protocol error reported instead of items.
    pub error: Option<OaiErrorNote>,

    /// completeListSize / cursor, when the repository sends them.
    pub hints: ListHints,
}

/// Repository description from the `Identify` verb.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub repository_name: Option<String>,
    pub base_url: Option<String>,
    pub protocol_version: Option<String>,
    pub granularity: Option<String>,
    pub earliest_datestamp: Option<String>,
    pub admin_emails: Vec<String>,
}

/// One entry of a `ListMetadataFormats` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFormat {
    pub prefix: String,
    pub schema: Option<String>,
    pub namespace: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_round_trip_spelling() {
        assert_eq!("ListRecords".parse::<Verb>().unwrap(), Verb::ListRecords);
        assert_eq!(
            "ListIdentifiers".parse::<Verb>().unwrap(),
            Verb::ListIdentifiers
        );
        assert_eq!(Verb::ListRecords.to_string(), "ListRecords");
    }

    #[test]
    fn test_verb_rejects_other_verbs() {
        assert!("GetRecord".parse::<Verb>().is_err());
        assert!("listrecords".parse::<Verb>().is_err());
    }

    #[test]
    fn test_item_element() {
        assert_eq!(Verb::ListRecords.item_element(), "record");
        assert_eq!(Verb::ListIdentifiers.item_element(), "header");
    }

    #[test]
    fn test_error_code_from_str() {
        assert_eq!(OaiErrorCode::from("noRecordsMatch"), OaiErrorCode::NoRecordsMatch);
        assert_eq!(
            OaiErrorCode::from(" badResumptionToken "),
            OaiErrorCode::BadResumptionToken
        );
        assert_eq!(
            OaiErrorCode::from("somethingElse"),
            OaiErrorCode::Other("somethingElse".to_string())
        );
    }

    #[test]
    fn test_only_no_records_match_is_empty_result() {
        assert!(OaiErrorCode::NoRecordsMatch.is_empty_result());
        assert!(!OaiErrorCode::NoSetHierarchy.is_empty_result());
        assert!(!OaiErrorCode::BadResumptionToken.is_empty_result());
    }
}
