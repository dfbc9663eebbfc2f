//! XML utility functions for navigating OAI-PMH responses and cutting
//! elements out of them.

use roxmltree::Node;

use crate::config::OAI_NAMESPACE;

/// Prefix bound implicitly in every document; never redeclared.
const XML_PREFIX: &str = "xml";

/// Check if a node is an OAI-PMH element with the given local name.
///
/// Elements without a namespace also match: some repositories forget the
/// default namespace declaration, and their responses are still usable.
///
/// # Examples
/// ```
/// use roxmltree::Document;
/// use oaipmh_harvester::xml::is_oai;
///
/// let xml = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><error/></OAI-PMH>"#;
/// let doc = Document::parse(xml).unwrap();
/// let error = doc.root_element().first_element_child().unwrap();
/// assert!(is_oai(error, "error"));
/// assert!(!is_oai(error, "record"));
/// ```
pub fn is_oai(node: Node<'_, '_>, local: &str) -> bool {
    node.is_element()
        && node.tag_name().name() == local
        && matches!(node.tag_name().namespace(), None | Some(OAI_NAMESPACE))
}

/// First OAI-PMH child element with the given local name.
pub fn oai_child<'a, 'input>(node: Node<'a, 'input>, local: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|child| is_oai(*child, local))
}

/// All OAI-PMH child elements with the given local name.
pub fn oai_children<'a, 'input>(
    node: Node<'a, 'input>,
    local: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(move |child| is_oai(*child, local))
}

/// First OAI-PMH descendant (including `node` itself) with the given local
/// name.
pub fn oai_descendant<'a, 'input>(
    node: Node<'a, 'input>,
    local: &str,
) -> Option<Node<'a, 'input>> {
    node.descendants().find(|n| is_oai(*n, local))
}

/// First descendant element in namespace `ns` with local name `local`.
pub fn find_descendant_ns<'a, 'input>(
    node: Node<'a, 'input>,
    ns: &str,
    local: &str,
) -> Option<Node<'a, 'input>> {
    node.descendants().find(|n| {
        n.is_element() && n.tag_name().name() == local && n.tag_name().namespace() == Some(ns)
    })
}

/// Get the text content of a node, trimmed.
///
/// # Returns
/// Trimmed text content, or empty string if no text
pub fn get_text(node: Node<'_, '_>) -> String {
    node.text()
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Trimmed text of the first OAI-PMH child named `local`, if non-empty.
pub fn oai_child_text(node: Node<'_, '_>, local: &str) -> Option<String> {
    oai_child(node, local)
        .map(get_text)
        .filter(|s| !s.is_empty())
}

/// Copy an element's source text out of its document so it can stand alone.
///
/// The slice is taken byte-for-byte from `input`. Namespace bindings the
/// element only inherits from its ancestors are declared on its start tag,
/// otherwise prefixed names inside it would be unbound once it is embedded
/// elsewhere.
///
/// # Examples
/// ```
/// use roxmltree::Document;
/// use oaipmh_harvester::xml::standalone_element;
///
/// let xml = r#"<root xmlns:dc="urn:dc"><item><dc:title>T</dc:title></item></root>"#;
/// let doc = Document::parse(xml).unwrap();
/// let item = doc.root_element().first_element_child().unwrap();
/// assert_eq!(
///     standalone_element(item, xml),
///     r#"<item xmlns:dc="urn:dc"><dc:title>T</dc:title></item>"#
/// );
/// ```
pub fn standalone_element(node: Node<'_, '_>, input: &str) -> String {
    let raw = &input[node.range()];
    let start_tag = &raw[..start_tag_end(raw)];
    let name_end = start_tag
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(start_tag.len());

    let mut declarations = String::new();
    for ns in node.namespaces() {
        let prefix = ns.name();
        if prefix == Some(XML_PREFIX) || declares_prefix(start_tag, prefix) {
            continue;
        }
        match prefix {
            Some(p) => declarations.push_str(&format!(" xmlns:{p}=\"{}\"", escape_attr(ns.uri()))),
            None => declarations.push_str(&format!(" xmlns=\"{}\"", escape_attr(ns.uri()))),
        }
    }

    if declarations.is_empty() {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len() + declarations.len());
    out.push_str(&raw[..name_end]);
    out.push_str(&declarations);
    out.push_str(&raw[name_end..]);
    out
}

/// Byte index just past the `>` closing the start tag of `raw`.
fn start_tag_end(raw: &str) -> usize {
    let mut quote: Option<char> = None;
    for (i, c) in raw.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return i + 1,
            _ => {}
        }
    }
    raw.len()
}

/// Whether a start tag already carries a declaration for `prefix`
/// (`None` = default namespace).
fn declares_prefix(start_tag: &str, prefix: Option<&str>) -> bool {
    let attr = match prefix {
        Some(p) => format!("xmlns:{p}"),
        None => "xmlns".to_string(),
    };
    start_tag.match_indices(&attr).any(|(i, _)| {
        let before_ok = start_tag[..i]
            .chars()
            .next_back()
            .is_some_and(char::is_whitespace);
        let after = start_tag[i + attr.len()..].trim_start();
        before_ok && after.starts_with('=')
    })
}

/// Escape text for use inside a double-quoted attribute value.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
