//! Flat CSV / JSONL projections of harvested records.
//!
//! Each record becomes one row of `identifier, datestamp, <field>`, where
//! `<field>` is a single metadata element chosen by qualified name
//! (`edm:isShownAt` by default).

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use roxmltree::{Document, Node};
use serde_json::{Map, Value};

use crate::checkpoint::DumpPosition;
use crate::config::{HarvestRequest, OAI_NAMESPACE};
use crate::error::{HarvesterError, Result};
use crate::types::Record;
use crate::xml::{find_descendant_ns, get_text, oai_child};

const RDF_NAMESPACE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";

/// Prefixes a field name may use.
const KNOWN_PREFIXES: &[(&str, &str)] = &[
    ("oai", OAI_NAMESPACE),
    ("edm", "http://www.europeana.eu/schemas/edm/"),
    ("dc", "http://purl.org/dc/elements/1.1/"),
    ("dcterms", "http://purl.org/dc/terms/"),
    ("ore", "http://www.openarchives.org/ore/terms/"),
    ("rdf", RDF_NAMESPACE),
];

/// Tried in order when `edm:isShownAt` is absent.
const IS_SHOWN_AT_FALLBACK: &[&str] = &["edm:isShownBy", "dc:identifier"];

/// Resolve `prefix:local` against the known prefixes.
///
/// An unprefixed name matches that local name in any namespace; an unknown
/// prefix resolves to nothing.
fn resolve_qname(qname: &str) -> Option<(Option<&'static str>, &str)> {
    match qname.split_once(':') {
        None => Some((None, qname)),
        Some((prefix, local)) => KNOWN_PREFIXES
            .iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, ns)| (Some(*ns), local)),
    }
}

fn find_field(metadata: Node<'_, '_>, qname: &str) -> Option<String> {
    let (ns, local) = resolve_qname(qname)?;
    let node = match ns {
        Some(ns) => find_descendant_ns(metadata, ns, local)?,
        None => metadata
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == local)?,
    };

    let text = get_text(node);
    if !text.is_empty() {
        return Some(text);
    }
    // EDM links are usually empty elements with an rdf:resource attribute.
    node.attribute((RDF_NAMESPACE, "resource"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Value of `field` inside the record's metadata, or an empty string.
///
/// # Examples
/// ```
/// use oaipmh_harvester::dump::extract_field;
///
/// let xml = r#"<record xmlns="http://www.openarchives.org/OAI/2.0/"
///   xmlns:dc="http://purl.org/dc/elements/1.1/">
///   <header><identifier>oai:x:1</identifier></header>
///   <metadata><dc:title> Nachtwacht </dc:title></metadata>
/// </record>"#;
/// assert_eq!(extract_field(xml, "dc:title"), "Nachtwacht");
/// assert_eq!(extract_field(xml, "dc:creator"), "");
/// ```
#[must_use]
pub fn extract_field(record_xml: &str, field: &str) -> String {
    let Ok(doc) = Document::parse(record_xml) else {
        return String::new();
    };
    let Some(metadata) = oai_child(doc.root_element(), "metadata") else {
        return String::new();
    };

    if let Some(value) = find_field(metadata, field) {
        return value;
    }
    if field == "edm:isShownAt" {
        for fallback in IS_SHOWN_AT_FALLBACK {
            if let Some(value) = find_field(metadata, fallback) {
                return value;
            }
        }
    }
    String::new()
}

/// One projected row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRow {
    pub identifier: String,
    pub datestamp: String,
    pub value: String,
}

impl DumpRow {
    #[must_use]
    pub fn project(record: &Record, field: &str) -> Self {
        let value = if record.is_header_only() {
            String::new()
        } else {
            extract_field(&record.xml, field)
        };
        Self {
            identifier: record.identifier.clone(),
            datestamp: record.datestamp.clone(),
            value,
        }
    }
}

/// Open a dump file for appending, cut back to `bytes` when resuming.
///
/// Returns the file and whether it starts empty.
fn open_dump(path: &Path, bytes: Option<u64>) -> Result<(File, bool)> {
    match bytes {
        Some(bytes) if bytes > 0 => {
            let on_disk = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if on_disk < bytes {
                return Err(HarvesterError::InvalidConfig(format!(
                    "cannot resume into {}: file holds {on_disk} bytes but the checkpoint recorded {bytes}; rerun with --no-resume to start over",
                    path.display()
                )));
            }
            let mut file = OpenOptions::new().write(true).open(path)?;
            file.set_len(bytes)?;
            file.seek(SeekFrom::End(0))?;
            Ok((file, false))
        }
        _ => Ok((File::create(path)?, true)),
    }
}

struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn open(path: PathBuf, field: &str, bytes: Option<u64>) -> Result<Self> {
        let (file, is_new) = open_dump(&path, bytes)?;
        let mut writer = csv::WriterBuilder::new().from_writer(file);
        if is_new {
            writer.write_record(["identifier", "datestamp", field])?;
        }
        Ok(Self { path, writer })
    }

    fn write(&mut self, row: &DumpRow) -> Result<()> {
        self.writer
            .write_record([&row.identifier, &row.datestamp, &row.value])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<u64> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_data()?;
        Ok(file.metadata()?.len())
    }
}

struct JsonlSink {
    path: PathBuf,
    field: String,
    file: BufWriter<File>,
}

impl JsonlSink {
    fn open(path: PathBuf, field: &str, bytes: Option<u64>) -> Result<Self> {
        let (file, _) = open_dump(&path, bytes)?;
        Ok(Self {
            path,
            field: field.to_string(),
            file: BufWriter::new(file),
        })
    }

    fn write(&mut self, row: &DumpRow) -> Result<()> {
        let mut object = Map::new();
        object.insert("identifier".into(), Value::String(row.identifier.clone()));
        object.insert("datestamp".into(), Value::String(row.datestamp.clone()));
        object.insert(self.field.clone(), Value::String(row.value.clone()));
        serde_json::to_writer(&mut self.file, &object)?;
        self.file.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<u64> {
        self.file.flush()?;
        let file = self.file.get_ref();
        file.sync_data()?;
        Ok(file.metadata()?.len())
    }
}

/// Writes enabled dump files alongside the XML output.
pub struct DumpWriter {
    field: String,
    csv: Option<CsvSink>,
    jsonl: Option<JsonlSink>,
}

impl std::fmt::Debug for DumpWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpWriter")
            .field("field", &self.field)
            .field("csv", &self.csv.as_ref().map(|s| &s.path))
            .field("jsonl", &self.jsonl.as_ref().map(|s| &s.path))
            .finish()
    }
}

impl DumpWriter {
    /// Open the dumps selected by the request's dump mode. `resume_from`
    /// carries the checkpointed file lengths; `None` starts new files.
    pub fn open(request: &HarvestRequest, resume_from: Option<DumpPosition>) -> Result<Self> {
        let position = resume_from.unwrap_or_default();
        let field = request.edm_field.clone();

        let csv = if request.dump.csv() {
            Some(CsvSink::open(request.csv_path(), &field, position.csv_bytes)?)
        } else {
            None
        };
        let jsonl = if request.dump.jsonl() {
            Some(JsonlSink::open(
                request.jsonl_path(),
                &field,
                position.jsonl_bytes,
            )?)
        } else {
            None
        };

        Ok(Self { field, csv, jsonl })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.csv.is_some() || self.jsonl.is_some()
    }

    /// Project `record` into every enabled dump.
    pub fn write(&mut self, record: &Record) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let row = DumpRow::project(record, &self.field);
        if let Some(csv) = self.csv.as_mut() {
            csv.write(&row)?;
        }
        if let Some(jsonl) = self.jsonl.as_mut() {
            jsonl.write(&row)?;
        }
        Ok(())
    }

    /// Flush every dump and report the file lengths for the checkpoint.
    pub fn flush(&mut self) -> Result<DumpPosition> {
        let csv_bytes = self.csv.as_mut().map(CsvSink::flush).transpose()?;
        let jsonl_bytes = self.jsonl.as_mut().map(JsonlSink::flush).transpose()?;
        Ok(DumpPosition {
            csv_bytes,
            jsonl_bytes,
        })
    }

    /// Paths of the enabled dump files.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.csv
            .iter()
            .map(|s| s.path.clone())
            .chain(self.jsonl.iter().map(|s| s.path.clone()))
            .collect()
    }
}
