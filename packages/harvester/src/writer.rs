//! Streaming XML output with size-based rotation.
//!
//! Records are appended to the open segment as they arrive. Each segment is a
//! complete document once finished:
//!
//! ```text
//! <?xml version="1.0" encoding="UTF-8"?>
//! <OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
//! <ListRecords>
//! <record>...</record>
//! </ListRecords>
//! </OAI-PMH>
//! ```
//!
//! Rotation is lazy: a new segment is opened only when a record arrives for
//! a segment that is already full, so `R` records at threshold `T` produce
//! `ceil(R / T)` segments and never an empty trailing one.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::checkpoint::SegmentPosition;
use crate::config::{self, HarvestRequest, OAI_NAMESPACE};
use crate::error::{HarvesterError, Result};
use crate::types::Verb;

/// Writes records into one or more well-formed segment files.
#[derive(Debug)]
pub struct SegmentWriter {
    output: PathBuf,
    verb: Verb,
    rotate_every: Option<u64>,
    file: BufWriter<File>,
    index: u32,
    segment_records: u64,
    segment_bytes: u64,
}

impl SegmentWriter {
    /// Start a new output, replacing any earlier segments of the same name.
    pub fn create(request: &HarvestRequest) -> Result<Self> {
        ensure_parent(&request.output)?;
        remove_segments_after(&request.output, 1)?;

        let file = File::create(&request.output)?;
        let mut writer = Self {
            output: request.output.clone(),
            verb: request.verb,
            rotate_every: request.rotate_every,
            file: BufWriter::new(file),
            index: 1,
            segment_records: 0,
            segment_bytes: 0,
        };
        writer.write_preamble()?;
        tracing::debug!(path = %request.output.display(), "output opened");
        Ok(writer)
    }

    /// Reopen the segment a checkpoint points at and cut it back to the
    /// checkpointed length.
    ///
    /// Anything written after the checkpoint (a partial page, the closing
    /// wrapper of an aborted run, later segments) is discarded.
    pub fn resume(request: &HarvestRequest, position: SegmentPosition) -> Result<Self> {
        if position.bytes == 0 {
            return Self::create(request);
        }

        let path = config::segment_path(&request.output, position.index);
        let on_disk = fs::metadata(&path)
            .map_err(|e| resume_error(&path, &format!("cannot read segment: {e}")))?
            .len();
        if on_disk < position.bytes {
            return Err(resume_error(
                &path,
                &format!(
                    "segment holds {on_disk} bytes but the checkpoint recorded {}",
                    position.bytes
                ),
            ));
        }

        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(position.bytes)?;
        file.seek(SeekFrom::End(0))?;
        remove_segments_after(&request.output, position.index)?;

        tracing::debug!(
            path = %path.display(),
            index = position.index,
            records = position.records,
            bytes = position.bytes,
            "output reopened"
        );

        Ok(Self {
            output: request.output.clone(),
            verb: request.verb,
            rotate_every: request.rotate_every,
            file: BufWriter::new(file),
            index: position.index,
            segment_records: position.records,
            segment_bytes: position.bytes,
        })
    }

    /// Append one record, rotating first if the open segment is full.
    pub fn write_record(&mut self, xml: &str) -> Result<()> {
        self.rotate_if_needed()?;
        self.write_str(xml)?;
        self.write_str("\n")?;
        self.segment_records += 1;
        Ok(())
    }

    /// Close the open segment and start the next one when the threshold is
    /// reached. Returns whether a rotation happened.
    pub fn rotate_if_needed(&mut self) -> Result<bool> {
        match self.rotate_every {
            Some(threshold) if self.segment_records >= threshold => {
                self.rotate()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Push buffered records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Position to record in a checkpoint. Only meaningful after `flush`.
    #[must_use]
    pub fn position(&self) -> SegmentPosition {
        SegmentPosition {
            index: self.index,
            records: self.segment_records,
            bytes: self.segment_bytes,
        }
    }

    #[must_use]
    pub fn current_path(&self) -> PathBuf {
        config::segment_path(&self.output, self.index)
    }

    /// Write the closing wrapper and return every segment path, in order.
    pub fn finish(mut self) -> Result<Vec<PathBuf>> {
        self.write_closing()?;
        self.flush()?;
        Ok((1..=self.index)
            .map(|i| config::segment_path(&self.output, i))
            .collect())
    }

    fn rotate(&mut self) -> Result<()> {
        self.write_closing()?;
        self.flush()?;

        self.index += 1;
        let path = self.current_path();
        self.file = BufWriter::new(File::create(&path)?);
        self.segment_records = 0;
        self.segment_bytes = 0;
        self.write_preamble()?;

        tracing::info!(path = %path.display(), segment = self.index, "rotated output");
        Ok(())
    }

    fn write_preamble(&mut self) -> Result<()> {
        let preamble = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<OAI-PMH xmlns=\"{OAI_NAMESPACE}\">\n<{}>\n",
            self.verb.as_str()
        );
        self.write_str(&preamble)
    }

    fn write_closing(&mut self) -> Result<()> {
        let closing = format!("</{}>\n</OAI-PMH>\n", self.verb.as_str());
        // Not counted: the checkpointed length always excludes the closing
        // wrapper so a resumed run can keep appending.
        self.file.write_all(closing.as_bytes())?;
        Ok(())
    }

    fn write_str(&mut self, s: &str) -> Result<()> {
        self.file.write_all(s.as_bytes())?;
        self.segment_bytes += s.len() as u64;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Delete consecutive segments numbered above `index`.
fn remove_segments_after(output: &Path, index: u32) -> Result<()> {
    let mut next = index.max(1) + 1;
    loop {
        let path = config::segment_path(output, next);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        next += 1;
    }
}

fn resume_error(path: &Path, reason: &str) -> HarvesterError {
    HarvesterError::InvalidConfig(format!(
        "cannot resume into {}: {reason}; rerun with --no-resume to start over",
        path.display()
    ))
}
