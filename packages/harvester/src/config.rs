//! Configuration constants, request validation and the per-run
//! [`HarvestRequest`].

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::error::{HarvesterError, Result};
use crate::retry::RetryPolicy;
use crate::types::Verb;

/// OAI-PMH 2.0 namespace.
pub const OAI_NAMESPACE: &str = "http://www.openarchives.org/OAI/2.0/";

/// HTTP timeout per attempt, in seconds.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Attempts per request, including the first.
pub const DEFAULT_RETRIES: u32 = 3;

/// Backoff before the first retry when the server gives no `Retry-After`.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1500);

/// Growth factor of the backoff between attempts.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Upper bound for a computed backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Longest `Retry-After` the harvester is willing to honour.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Pause between consecutive page requests.
pub const DEFAULT_SLEEP: Duration = Duration::from_millis(300);

/// User agent string identifying this harvester.
pub const USER_AGENT: &str = concat!("oaipmh-harvester/", env!("CARGO_PKG_VERSION"));

/// Accept header sent with every request.
pub const ACCEPT: &str = "application/xml, text/xml;q=0.9, */*;q=0.1";

/// Suffix appended to the output path to name its checkpoint file.
pub const CHECKPOINT_SUFFIX: &str = ".state.json";

/// File (in the output directory) receiving a response that failed to parse.
pub const RESPONSE_DUMP_FILE: &str = "last_response_dump.xml";

/// Field projected into CSV/JSONL dumps when none is given.
pub const DEFAULT_EDM_FIELD: &str = "edm:isShownAt";

/// Log a progress line every this many records.
pub const PROGRESS_LOG_INTERVAL: u64 = 1000;

/// metadataPrefix grammar from the OAI-PMH XML schema.
#[allow(clippy::expect_used)] // Static regex that is guaranteed to be valid
static METADATA_PREFIX_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-_.!~*'()]+$").expect("valid regex"));

/// setSpec grammar: colon-separated hierarchy of unreserved characters.
#[allow(clippy::expect_used)] // Static regex that is guaranteed to be valid
static SET_SPEC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9\-_.!~*'()]+(:[A-Za-z0-9\-_.!~*'()]+)*$").expect("valid regex")
});

/// Validate and parse a repository base URL.
///
/// # Examples
/// ```
/// use oaipmh_harvester::config::validate_base_url;
///
/// assert!(validate_base_url("https://example.org/oai").is_ok());
/// assert!(validate_base_url("ftp://example.org/oai").is_err());
/// assert!(validate_base_url("not a url").is_err());
/// ```
pub fn validate_base_url(base_url: &str) -> Result<Url> {
    let url = Url::parse(base_url.trim()).map_err(|e| HarvesterError::InvalidUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(HarvesterError::InvalidUrl {
                url: base_url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            })
        }
    }

    if let Some(query) = url.query() {
        tracing::warn!(
            url = %url,
            query,
            "Base URL carries a query string; OAI-PMH arguments will be appended to it"
        );
    }

    Ok(url)
}

/// Validate a metadataPrefix.
///
/// # Examples
/// ```
/// use oaipmh_harvester::config::validate_metadata_prefix;
///
/// assert!(validate_metadata_prefix("oai_dc").is_ok());
/// assert!(validate_metadata_prefix("edm").is_ok());
/// assert!(validate_metadata_prefix("bad prefix").is_err());
/// ```
pub fn validate_metadata_prefix(prefix: &str) -> Result<()> {
    if METADATA_PREFIX_PATTERN.is_match(prefix) {
        Ok(())
    } else {
        Err(HarvesterError::InvalidConfig(format!(
            "invalid metadataPrefix '{prefix}'"
        )))
    }
}

/// Validate a setSpec.
///
/// # Examples
/// ```
/// use oaipmh_harvester::config::validate_set_spec;
///
/// assert!(validate_set_spec("amsterdam-museum").is_ok());
/// assert!(validate_set_spec("music:jazz").is_ok());
/// assert!(validate_set_spec("music::jazz").is_err());
/// ```
pub fn validate_set_spec(set_spec: &str) -> Result<()> {
    if SET_SPEC_PATTERN.is_match(set_spec) {
        Ok(())
    } else {
        Err(HarvesterError::InvalidConfig(format!(
            "invalid setSpec '{set_spec}'"
        )))
    }
}

/// Validate a rotation threshold; `None` disables rotation.
pub fn validate_rotation(rotate_every: Option<u64>) -> Result<()> {
    if rotate_every == Some(0) {
        return Err(HarvesterError::InvalidConfig(
            "rotation threshold must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Which flat exports accompany the XML output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpMode {
    #[default]
    None,
    Csv,
    Jsonl,
    Both,
}

impl DumpMode {
    #[must_use]
    pub fn csv(&self) -> bool {
        matches!(self, Self::Csv | Self::Both)
    }

    #[must_use]
    pub fn jsonl(&self) -> bool {
        matches!(self, Self::Jsonl | Self::Both)
    }
}

impl FromStr for DumpMode {
    type Err = HarvesterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "csv" => Ok(Self::Csv),
            "jsonl" => Ok(Self::Jsonl),
            "both" => Ok(Self::Both),
            other => Err(HarvesterError::InvalidConfig(format!(
                "unknown dump mode '{other}' (expected none, csv, jsonl or both)"
            ))),
        }
    }
}

impl fmt::Display for DumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Csv => "csv",
            Self::Jsonl => "jsonl",
            Self::Both => "both",
        })
    }
}

/// Immutable configuration of one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub base_url: Url,
    pub verb: Verb,
    pub metadata_prefix: String,
    pub set: Option<String>,
    pub max_items: Option<u64>,
    pub rotate_every: Option<u64>,
    pub output: PathBuf,
    pub dump: DumpMode,
    pub edm_field: String,
    pub sleep: Duration,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub resume: bool,
    pub preflight: bool,
}

impl HarvestRequest {
    /// Create a request with defaults for everything optional.
    pub fn new(
        base_url: &str,
        verb: Verb,
        metadata_prefix: impl Into<String>,
        output: impl Into<PathBuf>,
    ) -> Result<Self> {
        let base_url = validate_base_url(base_url)?;
        let metadata_prefix = metadata_prefix.into();
        validate_metadata_prefix(&metadata_prefix)?;

        Ok(Self {
            base_url,
            verb,
            metadata_prefix,
            set: None,
            max_items: None,
            rotate_every: None,
            output: output.into(),
            dump: DumpMode::None,
            edm_field: DEFAULT_EDM_FIELD.to_string(),
            sleep: DEFAULT_SLEEP,
            timeout: Duration::from_secs(HTTP_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            resume: true,
            preflight: true,
        })
    }

    #[must_use]
    pub fn with_set(mut self, set: Option<String>) -> Self {
        self.set = set.filter(|s| !s.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_max_items(mut self, max_items: Option<u64>) -> Self {
        self.max_items = max_items;
        self
    }

    #[must_use]
    pub fn with_rotation(mut self, rotate_every: Option<u64>) -> Self {
        self.rotate_every = rotate_every;
        self
    }

    #[must_use]
    pub fn with_dump(mut self, dump: DumpMode, edm_field: Option<String>) -> Self {
        self.dump = dump;
        if let Some(field) = edm_field.filter(|f| !f.trim().is_empty()) {
            self.edm_field = field;
        }
        self
    }

    #[must_use]
    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    #[must_use]
    pub fn with_preflight(mut self, preflight: bool) -> Self {
        self.preflight = preflight;
        self
    }

    /// Check the parts the builder methods accept unchecked.
    pub fn validate(&self) -> Result<()> {
        if let Some(set) = &self.set {
            validate_set_spec(set)?;
        }
        validate_rotation(self.rotate_every)?;
        if self.max_items == Some(0) {
            return Err(HarvesterError::InvalidConfig(
                "max items must be at least 1".to_string(),
            ));
        }
        if self.output.file_name().is_none() {
            return Err(HarvesterError::InvalidConfig(format!(
                "output path '{}' does not name a file",
                self.output.display()
            )));
        }
        Ok(())
    }

    /// Query parameters for a list request.
    ///
    /// Once a resumptionToken is known it is the only argument besides the
    /// verb (OAI-PMH exclusive argument rule).
    #[must_use]
    pub fn list_params(&self, token: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![("verb", self.verb.as_str().to_string())];
        match token {
            Some(token) => params.push(("resumptionToken", token.to_string())),
            None => {
                params.push(("metadataPrefix", self.metadata_prefix.clone()));
                if let Some(set) = &self.set {
                    params.push(("set", set.clone()));
                }
            }
        }
        params
    }

    /// Directory holding the output and its companion files.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        match self.output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    /// Path of rotation segment `index` (1-based).
    #[must_use]
    pub fn segment_path(&self, index: u32) -> PathBuf {
        segment_path(&self.output, index)
    }

    /// Path of the checkpoint file.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        let mut name: OsString = self.output.as_os_str().to_owned();
        name.push(CHECKPOINT_SUFFIX);
        PathBuf::from(name)
    }

    #[must_use]
    pub fn csv_path(&self) -> PathBuf {
        self.sibling(&format!("{}.csv", self.stem()))
    }

    #[must_use]
    pub fn jsonl_path(&self) -> PathBuf {
        self.sibling(&format!("{}.jsonl", self.stem()))
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.sibling(&format!("{}.log", self.stem()))
    }

    /// Where a response that failed to parse is saved.
    #[must_use]
    pub fn dump_path(&self) -> PathBuf {
        self.output_dir().join(RESPONSE_DUMP_FILE)
    }

    fn stem(&self) -> String {
        file_stem(&self.output)
    }

    fn sibling(&self, file_name: &str) -> PathBuf {
        sibling(&self.output, file_name)
    }
}

/// Path of rotation segment `index` (1-based) for `output`. The first
/// segment is the output path itself; later ones get `_part{index}` before
/// the extension.
pub(crate) fn segment_path(output: &Path, index: u32) -> PathBuf {
    if index <= 1 {
        return output.to_path_buf();
    }
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "xml".to_string());
    sibling(output, &format!("{}_part{index}.{ext}", file_stem(output)))
}

fn file_stem(output: &Path) -> String {
    output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "harvest".to_string())
}

fn sibling(output: &Path, file_name: &str) -> PathBuf {
    match output.parent() {
        Some(dir) => dir.join(file_name),
        None => PathBuf::from(file_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> HarvestRequest {
        HarvestRequest::new(
            "https://example.org/api/oai-pmh/",
            Verb::ListRecords,
            "edm",
            "out/amsterdam.xml",
        )
        .unwrap()
    }

    #[test]
    fn test_validate_base_url() {
        assert!(validate_base_url("http://example.org/oai").is_ok());
        assert!(validate_base_url("file:///etc/passwd").is_err());
        assert!(validate_base_url("").is_err());
    }

    #[test]
    fn test_validate_base_url_keeps_query() {
        let url = validate_base_url("https://example.org/cgi-bin/repo?type=oai").unwrap();
        assert_eq!(url.query(), Some("type=oai"));
    }

    #[test]
    fn test_validate_metadata_prefix() {
        assert!(validate_metadata_prefix("oai_dc").is_ok());
        assert!(validate_metadata_prefix("marc21").is_ok());
        assert!(validate_metadata_prefix("").is_err());
        assert!(validate_metadata_prefix("a&b").is_err());
    }

    #[test]
    fn test_validate_set_spec() {
        assert!(validate_set_spec("amsterdam-museum").is_ok());
        assert!(validate_set_spec("a:b:c").is_ok());
        assert!(validate_set_spec(":a").is_err());
        assert!(validate_set_spec("a b").is_err());
    }

    #[test]
    fn test_dump_mode_parse() {
        assert_eq!("csv".parse::<DumpMode>().unwrap(), DumpMode::Csv);
        assert_eq!("BOTH".parse::<DumpMode>().unwrap(), DumpMode::Both);
        assert!("xml".parse::<DumpMode>().is_err());
        assert!(DumpMode::Both.csv() && DumpMode::Both.jsonl());
        assert!(!DumpMode::None.csv() && !DumpMode::None.jsonl());
    }

    #[test]
    fn test_list_params_first_call() {
        let req = request().with_set(Some("amsterdam-museum".to_string()));
        assert_eq!(
            req.list_params(None),
            vec![
                ("verb", "ListRecords".to_string()),
                ("metadataPrefix", "edm".to_string()),
                ("set", "amsterdam-museum".to_string()),
            ]
        );
    }

    #[test]
    fn test_list_params_token_replaces_filters() {
        let req = request().with_set(Some("amsterdam-museum".to_string()));
        assert_eq!(
            req.list_params(Some("abc123")),
            vec![
                ("verb", "ListRecords".to_string()),
                ("resumptionToken", "abc123".to_string()),
            ]
        );
    }

    #[test]
    fn test_blank_set_is_no_set() {
        let req = request().with_set(Some("  ".to_string()));
        assert_eq!(req.set, None);
    }

    #[test]
    fn test_derived_paths() {
        let req = request();
        assert_eq!(req.segment_path(1), PathBuf::from("out/amsterdam.xml"));
        assert_eq!(req.segment_path(3), PathBuf::from("out/amsterdam_part3.xml"));
        assert_eq!(
            req.checkpoint_path(),
            PathBuf::from("out/amsterdam.xml.state.json")
        );
        assert_eq!(req.csv_path(), PathBuf::from("out/amsterdam.csv"));
        assert_eq!(req.jsonl_path(), PathBuf::from("out/amsterdam.jsonl"));
        assert_eq!(req.log_path(), PathBuf::from("out/amsterdam.log"));
        assert_eq!(
            req.dump_path(),
            PathBuf::from("out/last_response_dump.xml")
        );
    }

    #[test]
    fn test_segment_path_without_extension() {
        let req = HarvestRequest::new(
            "https://example.org/oai",
            Verb::ListIdentifiers,
            "oai_dc",
            "dump",
        )
        .unwrap();
        assert_eq!(req.segment_path(2), PathBuf::from("dump_part2.xml"));
        assert_eq!(req.output_dir(), Path::new("."));
    }

    #[test]
    fn test_validate_rejects_zero_rotation() {
        let req = request().with_rotation(Some(0));
        assert!(req.validate().is_err());
        assert!(request().with_rotation(Some(5)).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_set() {
        let req = request().with_set(Some("bad set".to_string()));
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_edm_field_default_and_override() {
        let req = request();
        assert_eq!(req.edm_field, DEFAULT_EDM_FIELD);
        let req = req.with_dump(DumpMode::Csv, Some("dc:title".to_string()));
        assert_eq!(req.edm_field, "dc:title");
    }
}
