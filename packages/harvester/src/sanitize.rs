//! Best-effort repair of malformed OAI-PMH response bodies.
//!
//! Repositories regularly emit control characters copied from source
//! databases and unescaped ampersands in free text. Both make the whole page
//! unparseable. [`repair`] fixes exactly those two defects and nothing else:
//!
//! - code points outside the XML 1.0 `Char` production are dropped;
//! - an `&` that does not start one of the five predefined entity references
//!   or a numeric character reference becomes `&amp;`.
//!
//! CDATA sections, comments and processing instructions are copied verbatim
//! (apart from illegal characters), so repairing a well-formed document
//! returns it unchanged and repairing twice equals repairing once.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// An entity/character reference, or a lone ampersand.
#[allow(clippy::expect_used)] // Static regex that is guaranteed to be valid
static AMP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:amp|lt|gt|quot|apos|#[0-9]+|#x[0-9A-Fa-f]+);|&").expect("valid regex")
});

/// Start of a region whose content must not be touched.
#[allow(clippy::expect_used)] // Static regex that is guaranteed to be valid
static VERBATIM_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!\[CDATA\[|<!--|<\?").expect("valid regex"));

/// Repair a raw response body. Invalid UTF-8 is replaced with U+FFFD.
///
/// # Examples
/// ```
/// use oaipmh_harvester::sanitize::repair;
///
/// assert_eq!(repair(b"<t>A & B</t>"), "<t>A &amp; B</t>");
/// assert_eq!(repair(b"<t>bell\x07</t>"), "<t>bell</t>");
/// assert_eq!(repair(b"<t>&lt;ok&gt;</t>"), "<t>&lt;ok&gt;</t>");
/// ```
#[must_use]
pub fn repair(raw: &[u8]) -> String {
    repair_str(&String::from_utf8_lossy(raw))
}

/// [`repair`] for text that is already decoded.
#[must_use]
pub fn repair_str(text: &str) -> String {
    let text = strip_illegal_chars(text);

    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text.as_str();

    while let Some(start) = VERBATIM_START.find(rest) {
        out.push_str(&escape_bare_ampersands(&rest[..start.start()]));

        let terminator = match start.as_str() {
            "<![CDATA[" => "]]>",
            "<!--" => "-->",
            _ => "?>",
        };
        let region = &rest[start.start()..];
        let end = region[start.len()..]
            .find(terminator)
            .map(|i| start.len() + i + terminator.len())
            .unwrap_or(region.len());

        out.push_str(&region[..end]);
        rest = &region[end..];
    }
    out.push_str(&escape_bare_ampersands(rest));

    out
}

/// XML 1.0 `Char` production.
fn is_xml_char(c: char) -> bool {
    matches!(
        c,
        '\u{9}' | '\u{A}' | '\u{D}'
            | '\u{20}'..='\u{D7FF}'
            | '\u{E000}'..='\u{FFFD}'
            | '\u{10000}'..='\u{10FFFF}'
    )
}

fn strip_illegal_chars(text: &str) -> String {
    text.chars().filter(|c| is_xml_char(*c)).collect()
}

fn escape_bare_ampersands(segment: &str) -> std::borrow::Cow<'_, str> {
    AMP_PATTERN.replace_all(segment, |caps: &Captures<'_>| {
        let matched = &caps[0];
        if matched == "&" {
            "&amp;".to_string()
        } else {
            matched.to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TRICKY_INPUTS: &[&str] = &[
        "",
        "plain",
        "A & B",
        "&&&",
        "&amp;&amp",
        "&eacute; &#233; &#xE9; &#xZZ; &#;",
        "<a>\u{1}\u{8}\u{B}\u{C}\u{1F}x</a>",
        "<a><![CDATA[ & raw ]]> & </a>",
        "<a><![CDATA[ unterminated & ",
        "<!-- a & b --><a>c & d</a>",
        "<?xml version=\"1.0\"?><a href=\"x?a=1&b=2\"/>",
        "<a>\u{FFFE}\u{FFFF}\u{FFFD}</a>",
        "trailing &",
    ];

    #[test]
    fn test_bare_ampersand_escaped() {
        assert_eq!(repair_str("<t>A & B</t>"), "<t>A &amp; B</t>");
        assert_eq!(repair_str("<t>A&B</t>"), "<t>A&amp;B</t>");
        assert_eq!(repair_str("trailing &"), "trailing &amp;");
    }

    #[test]
    fn test_ampersand_in_attribute_escaped() {
        assert_eq!(
            repair_str(r#"<a href="x?a=1&b=2"/>"#),
            r#"<a href="x?a=1&amp;b=2"/>"#
        );
    }

    #[test]
    fn test_known_references_kept() {
        let input = "&amp; &lt; &gt; &quot; &apos; &#38; &#x26; &#X26;";
        // Upper-case X is not a valid hex reference marker.
        assert_eq!(
            repair_str(input),
            "&amp; &lt; &gt; &quot; &apos; &#38; &#x26; &amp;#X26;"
        );
    }

    #[test]
    fn test_undeclared_named_entity_escaped() {
        assert_eq!(repair_str("caf&eacute;"), "caf&amp;eacute;");
    }

    #[test]
    fn test_control_characters_stripped() {
        assert_eq!(repair_str("<a>x\u{0}y\u{7}z\u{1B}</a>"), "<a>xyz</a>");
        assert_eq!(repair_str("<a>\u{FFFE}ok\u{FFFF}</a>"), "<a>ok</a>");
    }

    #[test]
    fn test_whitespace_controls_kept() {
        assert_eq!(repair_str("<a>\tx\r\ny</a>"), "<a>\tx\r\ny</a>");
    }

    #[test]
    fn test_cdata_and_comments_untouched() {
        let input = "<a><![CDATA[ A & B ]]><!-- C & D --><?pi E & F?>G & H</a>";
        assert_eq!(
            repair_str(input),
            "<a><![CDATA[ A & B ]]><!-- C & D --><?pi E & F?>G &amp; H</a>"
        );
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let repaired = repair(b"<a>\xFF</a>");
        assert_eq!(repaired, "<a>\u{FFFD}</a>");
    }

    #[test]
    fn test_repair_is_idempotent() {
        for input in TRICKY_INPUTS {
            let once = repair_str(input);
            let twice = repair_str(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_well_formed_input_unchanged() {
        let inputs = [
            r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListRecords>
    <record><header><identifier>oai:x:1</identifier></header>
      <metadata><dc:title xmlns:dc="http://purl.org/dc/elements/1.1/">A &amp; B &#233;</dc:title></metadata>
    </record>
  </ListRecords>
</OAI-PMH>"#,
            "<a><![CDATA[<b> & </b>]]></a>",
            "<a>\t\r\n</a>",
        ];
        for input in inputs {
            assert!(roxmltree::Document::parse(input).is_ok());
            assert_eq!(repair_str(input), input);
        }
    }

    #[test]
    fn test_repaired_output_parses() {
        let repaired = repair(b"<a t=\"1 & 2\">A & B \x01</a>");
        let doc = roxmltree::Document::parse(&repaired).unwrap();
        assert_eq!(doc.root_element().text(), Some("A & B "));
        assert_eq!(doc.root_element().attribute("t"), Some("1 & 2"));
    }
}
