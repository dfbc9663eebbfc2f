//! Repository checks run before a harvest: `Identify` and
//! `ListMetadataFormats`.
//!
//! Both are advisory. A repository that fails them may still serve the list
//! verbs, so problems are logged and the harvest goes ahead.

use roxmltree::Document;
use url::Url;

use crate::config::HarvestRequest;
use crate::error::{HarvesterError, Result};
use crate::http::Transport;
use crate::sanitize;
use crate::types::{MetadataFormat, OaiErrorCode, RepositoryInfo};
use crate::xml::{get_text, oai_child, oai_child_text, oai_children};

/// Fetch and parse the repository's `Identify` response.
pub fn identify<T: Transport + ?Sized>(transport: &T, base_url: &Url) -> Result<RepositoryInfo> {
    let page = transport.fetch(base_url, &[("verb", "Identify".to_string())])?;
    parse_identify(&sanitize::repair(&page.body))
}

/// Fetch and parse the metadata formats the repository offers.
pub fn list_metadata_formats<T: Transport + ?Sized>(
    transport: &T,
    base_url: &Url,
) -> Result<Vec<MetadataFormat>> {
    let page = transport.fetch(base_url, &[("verb", "ListMetadataFormats".to_string())])?;
    parse_metadata_formats(&sanitize::repair(&page.body))
}

/// Parse an `Identify` response.
///
/// # Examples
/// ```
/// use oaipmh_harvester::preflight::parse_identify;
///
/// let xml = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
///   <Identify><repositoryName>Amsterdam Museum</repositoryName>
///   <granularity>YYYY-MM-DD</granularity></Identify>
/// </OAI-PMH>"#;
/// let info = parse_identify(xml).unwrap();
/// assert_eq!(info.repository_name.as_deref(), Some("Amsterdam Museum"));
/// assert_eq!(info.earliest_datestamp, None);
/// ```
pub fn parse_identify(text: &str) -> Result<RepositoryInfo> {
    let doc = parse_document(text)?;
    let root = doc.root_element();
    check_error(root)?;

    let identify = oai_child(root, "Identify").ok_or_else(|| malformed("missing <Identify>"))?;

    Ok(RepositoryInfo {
        repository_name: oai_child_text(identify, "repositoryName"),
        base_url: oai_child_text(identify, "baseURL"),
        protocol_version: oai_child_text(identify, "protocolVersion"),
        granularity: oai_child_text(identify, "granularity"),
        earliest_datestamp: oai_child_text(identify, "earliestDatestamp"),
        admin_emails: oai_children(identify, "adminEmail")
            .map(get_text)
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

/// Parse a `ListMetadataFormats` response.
pub fn parse_metadata_formats(text: &str) -> Result<Vec<MetadataFormat>> {
    let doc = parse_document(text)?;
    let root = doc.root_element();
    check_error(root)?;

    let list = oai_child(root, "ListMetadataFormats")
        .ok_or_else(|| malformed("missing <ListMetadataFormats>"))?;

    Ok(oai_children(list, "metadataFormat")
        .filter_map(|format| {
            let prefix = oai_child_text(format, "metadataPrefix")?;
            Some(MetadataFormat {
                prefix,
                schema: oai_child_text(format, "schema"),
                namespace: oai_child_text(format, "metadataNamespace"),
            })
        })
        .collect())
}

/// What the preflight learned about the repository.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub repository: Option<RepositoryInfo>,
    pub formats: Option<Vec<MetadataFormat>>,
}

impl PreflightReport {
    /// Whether the repository lists `prefix`; `None` when the formats could
    /// not be retrieved.
    #[must_use]
    pub fn supports_prefix(&self, prefix: &str) -> Option<bool> {
        self.formats
            .as_ref()
            .map(|formats| formats.iter().any(|f| f.prefix == prefix))
    }
}

/// Run both checks for `request`, logging the outcome. Never fails.
pub fn run_preflight<T: Transport + ?Sized>(transport: &T, request: &HarvestRequest) -> PreflightReport {
    let repository = match identify(transport, &request.base_url) {
        Ok(info) => {
            tracing::info!(
                repository = info.repository_name.as_deref().unwrap_or("-"),
                base_url = info.base_url.as_deref().unwrap_or("-"),
                granularity = info.granularity.as_deref().unwrap_or("-"),
                earliest = info.earliest_datestamp.as_deref().unwrap_or("-"),
                "Identify"
            );
            Some(info)
        }
        Err(HarvesterError::Interrupted) => return PreflightReport::default(),
        Err(e) => {
            tracing::warn!(error = %e, "Identify failed, continuing");
            None
        }
    };

    let formats = match list_metadata_formats(transport, &request.base_url) {
        Ok(formats) => {
            let prefixes: Vec<&str> = formats.iter().map(|f| f.prefix.as_str()).collect();
            tracing::info!(formats = %prefixes.join(", "), "ListMetadataFormats");
            Some(formats)
        }
        Err(e) => {
            tracing::warn!(error = %e, "ListMetadataFormats failed, continuing");
            None
        }
    };

    let report = PreflightReport {
        repository,
        formats,
    };
    if report.supports_prefix(&request.metadata_prefix) == Some(false) {
        tracing::warn!(
            prefix = %request.metadata_prefix,
            "metadataPrefix is not listed by the repository; the harvest will likely fail"
        );
    }
    report
}

fn parse_document(text: &str) -> Result<Document<'_>> {
    Document::parse(text).map_err(|e| malformed(&e.to_string()))
}

fn check_error(root: roxmltree::Node<'_, '_>) -> Result<()> {
    if let Some(error) = oai_child(root, "error") {
        return Err(HarvesterError::Protocol {
            code: OaiErrorCode::from(error.attribute("code").unwrap_or_default()),
            message: get_text(error),
        });
    }
    Ok(())
}

fn malformed(message: &str) -> HarvesterError {
    HarvesterError::MalformedResponse {
        message: message.to_string(),
        dump: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::FetchedPage;
    use crate::types::Verb;
    use pretty_assertions::assert_eq;

    const IDENTIFY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-03-01T10:00:00Z</responseDate>
  <request verb="Identify">https://example.org/oai</request>
  <Identify>
    <repositoryName>Amsterdam Museum</repositoryName>
    <baseURL>https://example.org/oai</baseURL>
    <protocolVersion>2.0</protocolVersion>
    <adminEmail>oai@example.org</adminEmail>
    <adminEmail>collections@example.org</adminEmail>
    <earliestDatestamp>2010-01-01</earliestDatestamp>
    <deletedRecord>persistent</deletedRecord>
    <granularity>YYYY-MM-DDThh:mm:ssZ</granularity>
  </Identify>
</OAI-PMH>"#;

    const FORMATS: &str = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListMetadataFormats>
    <metadataFormat>
      <metadataPrefix>oai_dc</metadataPrefix>
      <schema>http://www.openarchives.org/OAI/2.0/oai_dc.xsd</schema>
      <metadataNamespace>http://www.openarchives.org/OAI/2.0/oai_dc/</metadataNamespace>
    </metadataFormat>
    <metadataFormat>
      <metadataPrefix>edm</metadataPrefix>
    </metadataFormat>
  </ListMetadataFormats>
</OAI-PMH>"#;

    /// Answers by verb; unknown verbs fail.
    struct StaticTransport {
        identify: Option<&'static str>,
        formats: Option<&'static str>,
    }

    impl Transport for StaticTransport {
        fn fetch(&self, base_url: &Url, params: &[(&str, String)]) -> Result<FetchedPage> {
            let body = match params[0].1.as_str() {
                "Identify" => self.identify,
                "ListMetadataFormats" => self.formats,
                _ => None,
            };
            match body {
                Some(body) => Ok(FetchedPage {
                    url: base_url.to_string(),
                    status: 200,
                    content_type: Some("text/xml".to_string()),
                    body: body.as_bytes().to_vec(),
                }),
                None => Err(HarvesterError::HttpStatus {
                    status: 500,
                    url: base_url.to_string(),
                }),
            }
        }
    }

    fn request(prefix: &str) -> HarvestRequest {
        HarvestRequest::new("https://example.org/oai", Verb::ListRecords, prefix, "out.xml").unwrap()
    }

    #[test]
    fn test_parse_identify() {
        let info = parse_identify(IDENTIFY).unwrap();
        assert_eq!(info.repository_name.as_deref(), Some("Amsterdam Museum"));
        assert_eq!(info.granularity.as_deref(), Some("YYYY-MM-DDThh:mm:ssZ"));
        assert_eq!(info.earliest_datestamp.as_deref(), Some("2010-01-01"));
        assert_eq!(
            info.admin_emails,
            vec!["oai@example.org", "collections@example.org"]
        );
    }

    #[test]
    fn test_parse_metadata_formats() {
        let formats = parse_metadata_formats(FORMATS).unwrap();
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0].prefix, "oai_dc");
        assert_eq!(
            formats[0].namespace.as_deref(),
            Some("http://www.openarchives.org/OAI/2.0/oai_dc/")
        );
        assert_eq!(formats[1].prefix, "edm");
        assert_eq!(formats[1].schema, None);
    }

    #[test]
    fn test_error_response_is_protocol_error() {
        let xml = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><error code="noMetadataFormats">none</error></OAI-PMH>"#;
        let err = parse_metadata_formats(xml).unwrap_err();
        assert!(matches!(
            err,
            HarvesterError::Protocol {
                code: OaiErrorCode::NoMetadataFormats,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_identify_is_malformed() {
        let xml = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"/>"#;
        assert!(matches!(
            parse_identify(xml),
            Err(HarvesterError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_preflight_reports_supported_prefix() {
        let transport = StaticTransport {
            identify: Some(IDENTIFY),
            formats: Some(FORMATS),
        };
        let report = run_preflight(&transport, &request("edm"));
        assert!(report.repository.is_some());
        assert_eq!(report.supports_prefix("edm"), Some(true));
        assert_eq!(report.supports_prefix("marc21"), Some(false));
    }

    #[test]
    fn test_preflight_failures_are_not_fatal() {
        let transport = StaticTransport {
            identify: None,
            formats: None,
        };
        let report = run_preflight(&transport, &request("edm"));
        assert!(report.repository.is_none());
        assert_eq!(report.supports_prefix("edm"), None);
    }
}
