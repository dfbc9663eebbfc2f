//! Record parser for `ListRecords` / `ListIdentifiers` responses.
//!
//! [`parse_page`] is a pure function of the (sanitized) response text: it
//! keeps no state between calls, so parsing the same body twice yields the
//! same page.

use roxmltree::{Document, Node};

use crate::error::{HarvesterError, Result};
use crate::types::{ListHints, OaiErrorCode, OaiErrorNote, ParsedPage, Record, Verb};
use crate::xml::{get_text, is_oai, oai_child, oai_child_text, oai_children, standalone_element};

/// Parse one list response.
///
/// A protocol `<error>` is not an `Err`: it comes back as
/// [`ParsedPage::error`] with no records and no token, and the walker decides
/// what it means. `Err` is reserved for bodies that are not an OAI-PMH
/// response at all.
///
/// # Examples
/// ```
/// use oaipmh_harvester::parser::parse_page;
/// use oaipmh_harvester::types::Verb;
///
/// let body = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
///   <ListIdentifiers>
///     <header><identifier>oai:x:1</identifier><datestamp>2024-01-01</datestamp></header>
///     <resumptionToken cursor="0">next</resumptionToken>
///   </ListIdentifiers>
/// </OAI-PMH>"#;
///
/// let page = parse_page(body, Verb::ListIdentifiers).unwrap();
/// assert_eq!(page.records.len(), 1);
/// assert_eq!(page.next_token.as_deref(), Some("next"));
/// ```
pub fn parse_page(text: &str, verb: Verb) -> Result<ParsedPage> {
    let doc = Document::parse(text).map_err(|e| malformed(e.to_string()))?;
    let root = doc.root_element();

    if !is_oai(root, "OAI-PMH") {
        return Err(malformed(format!(
            "unexpected root element <{}>",
            root.tag_name().name()
        )));
    }

    if let Some(error) = oai_child(root, "error") {
        return Ok(ParsedPage {
            error: Some(parse_error(error)),
            ..ParsedPage::default()
        });
    }

    let list = oai_child(root, verb.as_str()).ok_or_else(|| {
        malformed(format!("response contains neither <{verb}> nor <error>"))
    })?;

    let items = oai_children(list, verb.item_element());
    let records = match verb {
        Verb::ListRecords => items
            .map(|record| parse_record(record, text))
            .collect::<Result<Vec<_>>>()?,
        Verb::ListIdentifiers => items.map(|header| parse_header_item(header, text)).collect(),
    };

    let (next_token, hints) = match oai_child(list, "resumptionToken") {
        Some(token) => (
            Some(get_text(token)).filter(|t| !t.is_empty()),
            parse_hints(token),
        ),
        None => (None, ListHints::default()),
    };

    Ok(ParsedPage {
        records,
        next_token,
        error: None,
        hints,
    })
}

fn malformed(message: String) -> HarvesterError {
    HarvesterError::MalformedResponse {
        message,
        dump: None,
    }
}

fn parse_error(error: Node<'_, '_>) -> OaiErrorNote {
    OaiErrorNote {
        code: OaiErrorCode::from(error.attribute("code").unwrap_or_default()),
        message: get_text(error),
    }
}

/// Header fields shared by both verbs.
struct HeaderFields {
    identifier: String,
    datestamp: String,
    deleted: bool,
    set_specs: Vec<String>,
}

fn header_fields(header: Node<'_, '_>) -> HeaderFields {
    let identifier = oai_child_text(header, "identifier").unwrap_or_default();
    if identifier.is_empty() {
        tracing::warn!("record header without identifier");
    }

    HeaderFields {
        identifier,
        datestamp: oai_child_text(header, "datestamp").unwrap_or_default(),
        deleted: header.attribute("status") == Some("deleted"),
        set_specs: oai_children(header, "setSpec")
            .map(get_text)
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

fn parse_record(record: Node<'_, '_>, text: &str) -> Result<Record> {
    let header = oai_child(record, "header")
        .ok_or_else(|| malformed("<record> without <header>".to_string()))?;
    let fields = header_fields(header);

    let metadata = if fields.deleted {
        None
    } else {
        oai_child(record, "metadata").map(|m| text[m.range()].to_string())
    };

    Ok(Record {
        identifier: fields.identifier,
        datestamp: fields.datestamp,
        deleted: fields.deleted,
        set_specs: fields.set_specs,
        metadata,
        xml: standalone_element(record, text),
    })
}

/// A `ListIdentifiers` header becomes a header-only `<record>`.
fn parse_header_item(header: Node<'_, '_>, text: &str) -> Record {
    let fields = header_fields(header);

    Record {
        identifier: fields.identifier,
        datestamp: fields.datestamp,
        deleted: fields.deleted,
        set_specs: fields.set_specs,
        metadata: None,
        xml: format!("<record>{}</record>", standalone_element(header, text)),
    }
}

fn parse_hints(token: Node<'_, '_>) -> ListHints {
    ListHints {
        complete_list_size: token
            .attribute("completeListSize")
            .and_then(|v| v.trim().parse().ok()),
        cursor: token.attribute("cursor").and_then(|v| v.trim().parse().ok()),
        expiration_date: token.attribute("expirationDate").map(str::to_string),
    }
}
