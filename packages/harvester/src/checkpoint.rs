//! Harvest checkpoint: the walker's position, persisted after every page.
//!
//! A [`HarvestState`] always describes a page boundary whose records are
//! already flushed to the output (and dumps). It records the byte length of
//! every file being appended to at that boundary, so a resumed run can cut
//! away anything written after it.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HarvestRequest;
use crate::error::Result;
use crate::types::Verb;

/// Bumped whenever the stored layout changes meaning.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Configuration a checkpoint must agree with to be resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchKey {
    pub base_url: String,
    pub verb: Verb,
    pub metadata_prefix: String,
    pub set: Option<String>,
    pub output: PathBuf,
}

impl From<&HarvestRequest> for MatchKey {
    fn from(request: &HarvestRequest) -> Self {
        Self {
            base_url: request.base_url.to_string(),
            verb: request.verb,
            metadata_prefix: request.metadata_prefix.clone(),
            set: request.set.clone(),
            output: request.output.clone(),
        }
    }
}

/// Where the output writer stands at a page boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentPosition {
    /// 1-based rotation index of the open segment.
    #[serde(rename = "segment_index")]
    pub index: u32,
    /// Records in the open segment.
    #[serde(rename = "segment_records")]
    pub records: u64,
    /// Bytes of the open segment (opening wrapper included, closing
    /// wrapper excluded).
    #[serde(rename = "segment_bytes")]
    pub bytes: u64,
}

/// Byte lengths of the dump files at a page boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DumpPosition {
    pub csv_bytes: Option<u64>,
    pub jsonl_bytes: Option<u64>,
}

/// Persisted walker position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestState {
    pub version: u32,
    pub base_url: String,
    pub verb: Verb,
    pub metadata_prefix: String,
    pub set: Option<String>,
    pub output: PathBuf,
    /// Token for the next request; `None` before the first page.
    pub resumption_token: Option<String>,
    pub records_written: u64,
    pub pages: u64,
    #[serde(flatten)]
    pub segment: SegmentPosition,
    #[serde(flatten)]
    pub dumps: DumpPosition,
    pub updated_at: DateTime<Utc>,
}

impl HarvestState {
    /// State of a harvest that has not fetched anything yet.
    #[must_use]
    pub fn fresh(request: &HarvestRequest) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            base_url: request.base_url.to_string(),
            verb: request.verb,
            metadata_prefix: request.metadata_prefix.clone(),
            set: request.set.clone(),
            output: request.output.clone(),
            resumption_token: None,
            records_written: 0,
            pages: 0,
            segment: SegmentPosition {
                index: 1,
                records: 0,
                bytes: 0,
            },
            dumps: DumpPosition::default(),
            updated_at: Utc::now(),
        }
    }

    /// State after one more page has been flushed.
    #[must_use]
    pub fn after_page(
        &self,
        next_token: Option<String>,
        records_written: u64,
        segment: SegmentPosition,
        dumps: DumpPosition,
    ) -> Self {
        Self {
            resumption_token: next_token,
            records_written,
            pages: self.pages + 1,
            segment,
            dumps,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Whether this state was written by a run with the same configuration.
    #[must_use]
    pub fn matches(&self, key: &MatchKey) -> bool {
        self.base_url == key.base_url
            && self.verb == key.verb
            && self.metadata_prefix == key.metadata_prefix
            && self.set == key.set
            && self.output == key.output
    }
}

/// One checkpoint file per output path.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store next to the request's output (`<output>.state.json`).
    #[must_use]
    pub fn for_request(request: &HarvestRequest) -> Self {
        Self::new(request.checkpoint_path())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Persist `state` atomically.
    ///
    /// Writes a temp file, syncs it, then renames it over the checkpoint, so
    /// an interruption leaves either the old or the new state on disk.
    pub fn save(&self, state: &HarvestState) -> Result<()> {
        let temp_file = self.temp_path();
        let content = serde_json::to_string_pretty(state)?;

        {
            let mut file = File::create(&temp_file)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }

        // On Windows, rename fails if the destination already exists
        #[cfg(target_os = "windows")]
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }

        fs::rename(&temp_file, &self.path)?;
        tracing::trace!(
            path = %self.path.display(),
            records = state.records_written,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint if it exists and belongs to `key`.
    ///
    /// An unreadable, outdated or foreign checkpoint counts as absent; it is
    /// never applied to a different request.
    pub fn load(&self, key: &MatchKey) -> Result<Option<HarvestState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        let state: HarvestState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable checkpoint");
                return Ok(None);
            }
        };

        if state.version != CHECKPOINT_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                found = state.version,
                expected = CHECKPOINT_VERSION,
                "ignoring checkpoint from another version"
            );
            return Ok(None);
        }

        if !state.matches(key) {
            tracing::info!(
                path = %self.path.display(),
                "checkpoint belongs to a different harvest configuration, starting fresh"
            );
            return Ok(None);
        }

        Ok(Some(state))
    }

    /// Delete the checkpoint (and any stale temp file).
    pub fn clear(&self) -> Result<()> {
        for path in [self.path.clone(), self.temp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn request(dir: &Path) -> HarvestRequest {
        HarvestRequest::new(
            "https://example.org/oai",
            Verb::ListRecords,
            "edm",
            dir.join("out.xml"),
        )
        .unwrap()
        .with_set(Some("museum".to_string()))
    }

    fn advanced(request: &HarvestRequest) -> HarvestState {
        HarvestState::fresh(request).after_page(
            Some("token-2".to_string()),
            50,
            SegmentPosition {
                index: 2,
                records: 10,
                bytes: 4096,
            },
            DumpPosition {
                csv_bytes: Some(512),
                jsonl_bytes: None,
            },
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let store = CheckpointStore::for_request(&req);
        let state = advanced(&req);

        store.save(&state).unwrap();
        let loaded = store.load(&MatchKey::from(&req)).unwrap();

        assert_eq!(loaded, Some(state));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_save_replaces_previous_state() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let store = CheckpointStore::for_request(&req);

        let first = HarvestState::fresh(&req);
        store.save(&first).unwrap();
        let second = advanced(&req);
        store.save(&second).unwrap();

        let loaded = store.load(&MatchKey::from(&req)).unwrap().unwrap();
        assert_eq!(loaded.resumption_token.as_deref(), Some("token-2"));
        assert_eq!(loaded.pages, 1);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let store = CheckpointStore::for_request(&req);
        assert_eq!(store.load(&MatchKey::from(&req)).unwrap(), None);
    }

    #[test]
    fn test_load_mismatched_configuration() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let store = CheckpointStore::for_request(&req);
        store.save(&advanced(&req)).unwrap();

        let other_set = req.clone().with_set(Some("library".to_string()));
        assert_eq!(store.load(&MatchKey::from(&other_set)).unwrap(), None);

        let mut other_verb = req.clone();
        other_verb.verb = Verb::ListIdentifiers;
        assert_eq!(store.load(&MatchKey::from(&other_verb)).unwrap(), None);

        // The foreign checkpoint is left alone.
        assert!(store.exists());
    }

    #[test]
    fn test_load_corrupt_checkpoint_is_absent() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let store = CheckpointStore::for_request(&req);
        fs::write(store.path(), "{ not json").unwrap();

        assert_eq!(store.load(&MatchKey::from(&req)).unwrap(), None);
    }

    #[test]
    fn test_load_other_version_is_absent() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let store = CheckpointStore::for_request(&req);
        let mut state = advanced(&req);
        state.version = CHECKPOINT_VERSION + 1;
        store.save(&state).unwrap();

        assert_eq!(store.load(&MatchKey::from(&req)).unwrap(), None);
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let store = CheckpointStore::for_request(&req);
        store.save(&advanced(&req)).unwrap();
        fs::write(store.temp_path(), "partial").unwrap();

        store.clear().unwrap();
        assert!(!store.exists());
        assert!(!store.temp_path().exists());

        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn test_checkpoint_layout_is_flat() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let json: serde_json::Value = serde_json::to_value(advanced(&req)).unwrap();

        assert_eq!(json["segment_index"], 2);
        assert_eq!(json["segment_bytes"], 4096);
        assert_eq!(json["csv_bytes"], 512);
        assert_eq!(json["resumption_token"], "token-2");
        assert_eq!(json["verb"], "ListRecords");
    }

    #[test]
    fn test_after_page_keeps_configuration() {
        let dir = tempdir().unwrap();
        let req = request(dir.path());
        let state = advanced(&req);

        assert!(state.matches(&MatchKey::from(&req)));
        assert_eq!(state.records_written, 50);
        assert_eq!(state.segment.index, 2);
        assert_eq!(state.dumps.csv_bytes, Some(512));
    }
}
