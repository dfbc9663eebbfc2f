//! The harvest walker: drives list requests page by page until the
//! repository runs out of resumptionTokens, the item limit is hit, or
//! something fails.
//!
//! ```text
//! Init ─▶ Fetching ─▶ Processing ─┬─▶ Fetching      (token present)
//!            │             │      ├─▶ Completed     (no token / limit / noRecordsMatch)
//!            └─────────────┴──────┴─▶ Aborted       (fatal error / interrupt)
//! ```
//!
//! Every page is flushed to the output and dumps before its checkpoint is
//! saved, and the checkpoint is saved before the next request goes out. A
//! run that stops anywhere can therefore be resumed from the last
//! checkpoint without losing or duplicating records.

use std::fs;
use std::path::PathBuf;

use crate::checkpoint::{CheckpointStore, HarvestState, MatchKey};
use crate::config::{HarvestRequest, PROGRESS_LOG_INTERVAL};
use crate::dump::DumpWriter;
use crate::error::{HarvesterError, Result};
use crate::http::{HttpTransport, Transport};
use crate::interrupt::InterruptFlag;
use crate::parser::parse_page;
use crate::preflight::run_preflight;
use crate::sanitize;
use crate::types::ParsedPage;
use crate::writer::SegmentWriter;

/// Why a harvest finished successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The last page carried no resumptionToken.
    Exhausted,
    /// The configured item limit was reached.
    LimitReached,
    /// The repository reported `noRecordsMatch`.
    NoRecordsMatch,
}

/// How a harvest ended.
#[derive(Debug)]
pub enum HarvestStatus {
    Completed(Completion),
    /// Stopped by `error`; the checkpoint (if any) is kept for a later
    /// resume.
    Aborted(HarvesterError),
}

/// Summary of one run.
#[derive(Debug)]
pub struct HarvestOutcome {
    pub status: HarvestStatus,
    /// Records in the output, including those from earlier resumed runs.
    pub records_written: u64,
    /// Pages processed, including those from earlier resumed runs.
    pub pages: u64,
    pub segments: Vec<PathBuf>,
    pub dumps: Vec<PathBuf>,
    /// Checkpoint left on disk, if the run did not complete.
    pub checkpoint: Option<PathBuf>,
    /// Whether the run continued from a checkpoint.
    pub resumed: bool,
}

impl HarvestOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.status, HarvestStatus::Completed(_))
    }

    /// The abort error, if the run did not complete.
    #[must_use]
    pub fn error(&self) -> Option<&HarvesterError> {
        match &self.status {
            HarvestStatus::Aborted(e) => Some(e),
            HarvestStatus::Completed(_) => None,
        }
    }
}

/// Progress snapshot passed to the progress callback after each page.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub records: u64,
    pub pages: u64,
    pub complete_list_size: Option<u64>,
}

/// Walker phases. Each carries the state it acts on; transitions consume
/// the phase and produce the next one.
enum Phase {
    Fetching(HarvestState),
    Processing(HarvestState, ParsedPage),
    Done(End),
}

/// Terminal phases.
enum End {
    Completed(HarvestState, Completion),
    Aborted(HarvestState, HarvesterError),
}

impl Phase {
    fn completed(state: HarvestState, completion: Completion) -> Self {
        Self::Done(End::Completed(state, completion))
    }

    fn aborted(state: HarvestState, error: HarvesterError) -> Self {
        Self::Done(End::Aborted(state, error))
    }
}

/// Open output files of a run.
struct Sinks {
    writer: SegmentWriter,
    dumps: DumpWriter,
}

/// Harvests one [`HarvestRequest`] through a [`Transport`].
pub struct Harvester<T: Transport> {
    transport: T,
    request: HarvestRequest,
    store: CheckpointStore,
    interrupt: InterruptFlag,
    on_progress: Option<Box<dyn FnMut(&Progress)>>,
    requests_sent: u64,
}

impl Harvester<HttpTransport> {
    /// Walker over HTTP, configured from the request's timeout and retry
    /// policy. Retry waits are cut short by `interrupt`.
    pub fn connect(request: HarvestRequest, interrupt: InterruptFlag) -> Result<Self> {
        let transport = HttpTransport::new(request.timeout, request.retry.clone())?
            .with_interrupt(interrupt.clone());
        Ok(Self::new(request, transport).with_interrupt(interrupt))
    }
}

impl<T: Transport> Harvester<T> {
    pub fn new(request: HarvestRequest, transport: T) -> Self {
        let store = CheckpointStore::for_request(&request);
        Self {
            transport,
            request,
            store,
            interrupt: InterruptFlag::new(),
            on_progress: None,
            requests_sent: 0,
        }
    }

    #[must_use]
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Call `callback` after every processed page.
    #[must_use]
    pub fn with_progress(mut self, callback: impl FnMut(&Progress) + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn request(&self) -> &HarvestRequest {
        &self.request
    }

    /// Run the harvest to completion or abort.
    ///
    /// `Err` means the run could not start (invalid request, output not
    /// writable). Anything that goes wrong once pages are flowing is reported
    /// as [`HarvestStatus::Aborted`] in the outcome.
    pub fn run(&mut self) -> Result<HarvestOutcome> {
        self.request.validate()?;

        let (state, resumed) = self.init()?;
        let mut sinks = if resumed {
            Sinks {
                writer: SegmentWriter::resume(&self.request, state.segment)?,
                dumps: DumpWriter::open(&self.request, Some(state.dumps))?,
            }
        } else {
            Sinks {
                writer: SegmentWriter::create(&self.request)?,
                dumps: DumpWriter::open(&self.request, None)?,
            }
        };

        if self.request.preflight {
            run_preflight(&self.transport, &self.request);
        }

        let mut phase = self.initial_phase(state);
        let end = loop {
            phase = match phase {
                Phase::Fetching(state) => self.fetch(state),
                Phase::Processing(state, page) => self.process(state, page, &mut sinks),
                Phase::Done(end) => break end,
            };
        };

        Ok(self.finish(end, sinks, resumed))
    }

    /// Load a matching checkpoint, or start fresh.
    fn init(&mut self) -> Result<(HarvestState, bool)> {
        if !self.request.resume {
            if self.store.exists() {
                tracing::info!(path = %self.store.path().display(), "discarding checkpoint");
            }
            self.store.clear()?;
            return Ok((HarvestState::fresh(&self.request), false));
        }

        match self.store.load(&MatchKey::from(&self.request))? {
            Some(state) => {
                tracing::info!(
                    records = state.records_written,
                    pages = state.pages,
                    segment = state.segment.index,
                    "resuming from checkpoint"
                );
                Ok((state, true))
            }
            None => Ok((HarvestState::fresh(&self.request), false)),
        }
    }

    /// A resumed state may already be terminal if the previous run stopped
    /// between saving its last checkpoint and clearing it.
    fn initial_phase(&self, state: HarvestState) -> Phase {
        if self.limit_reached(state.records_written) {
            return Phase::completed(state, Completion::LimitReached);
        }
        if state.pages > 0 && state.resumption_token.is_none() {
            return Phase::completed(state, Completion::Exhausted);
        }
        Phase::Fetching(state)
    }

    fn fetch(&mut self, state: HarvestState) -> Phase {
        if self.interrupt.is_triggered() {
            return Phase::aborted(state, HarvesterError::Interrupted);
        }
        if self.requests_sent > 0 && !self.interrupt.sleep(self.request.sleep) {
            return Phase::aborted(state, HarvesterError::Interrupted);
        }

        let params = self.request.list_params(state.resumption_token.as_deref());
        tracing::debug!(
            verb = %self.request.verb,
            token = state.resumption_token.as_deref().unwrap_or("-"),
            "requesting page"
        );
        self.requests_sent += 1;

        let fetched = match self.transport.fetch(&self.request.base_url, &params) {
            Ok(fetched) => fetched,
            Err(e) => return Phase::aborted(state, e),
        };

        let text = sanitize::repair(&fetched.body);
        match parse_page(&text, self.request.verb) {
            Ok(page) => Phase::Processing(state, page),
            Err(HarvesterError::MalformedResponse { message, .. }) => {
                let dump = self.save_response(&text);
                Phase::aborted(state, HarvesterError::MalformedResponse { message, dump })
            }
            Err(e) => Phase::aborted(state, e),
        }
    }

    fn process(&mut self, state: HarvestState, page: ParsedPage, sinks: &mut Sinks) -> Phase {
        if let Some(error) = page.error {
            if error.code.is_empty_result() {
                tracing::info!(message = %error.message, "repository reports noRecordsMatch");
                return Phase::completed(state, Completion::NoRecordsMatch);
            }
            return Phase::aborted(
                state,
                HarvesterError::Protocol {
                    code: error.code,
                    message: error.message,
                },
            );
        }

        if let Some(token) = &page.next_token {
            if state.resumption_token.as_ref() == Some(token) {
                return Phase::aborted(
                    state,
                    HarvesterError::RepeatedResumptionToken(token.clone()),
                );
            }
        }

        let mut written = state.records_written;
        let remaining = self
            .request
            .max_items
            .map(|max| usize::try_from(max.saturating_sub(written)).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);

        for record in page.records.iter().take(remaining) {
            if let Err(e) = sinks
                .writer
                .write_record(&record.xml)
                .and_then(|()| sinks.dumps.write(record))
            {
                return Phase::aborted(state, e);
            }
            written += 1;
            if written % PROGRESS_LOG_INTERVAL == 0 {
                tracing::info!(records = written, "records harvested");
            }
        }

        if let Err(e) = sinks.writer.flush() {
            return Phase::aborted(state, e);
        }
        let dump_position = match sinks.dumps.flush() {
            Ok(position) => position,
            Err(e) => return Phase::aborted(state, e),
        };

        let next = state.after_page(
            page.next_token,
            written,
            sinks.writer.position(),
            dump_position,
        );
        if let Err(e) = self.store.save(&next) {
            return Phase::aborted(next, e);
        }

        tracing::info!(
            page = next.pages,
            records = page.records.len(),
            total = written,
            complete_list_size = page.hints.complete_list_size,
            "page harvested"
        );
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&Progress {
                records: written,
                pages: next.pages,
                complete_list_size: page.hints.complete_list_size,
            });
        }

        if self.limit_reached(written) {
            Phase::completed(next, Completion::LimitReached)
        } else if next.resumption_token.is_none() {
            Phase::completed(next, Completion::Exhausted)
        } else {
            Phase::Fetching(next)
        }
    }

    fn finish(&mut self, end: End, sinks: Sinks, resumed: bool) -> HarvestOutcome {
        let dumps = sinks.dumps.paths();
        let segments = match sinks.writer.finish() {
            Ok(segments) => segments,
            Err(e) => {
                tracing::error!(error = %e, "failed to finalize output");
                Vec::new()
            }
        };

        let (state, status) = match end {
            End::Completed(state, completion) => {
                if let Err(e) = self.store.clear() {
                    tracing::warn!(error = %e, "failed to remove checkpoint");
                }
                tracing::info!(
                    records = state.records_written,
                    segments = segments.len(),
                    reason = ?completion,
                    "harvest completed"
                );
                (state, HarvestStatus::Completed(completion))
            }
            End::Aborted(state, error) => {
                tracing::error!(
                    error = %error,
                    records = state.records_written,
                    "harvest aborted"
                );
                (state, HarvestStatus::Aborted(error))
            }
        };

        HarvestOutcome {
            status,
            records_written: state.records_written,
            pages: state.pages,
            segments,
            dumps,
            checkpoint: self
                .store
                .exists()
                .then(|| self.store.path().to_path_buf()),
            resumed,
        }
    }

    fn limit_reached(&self, written: u64) -> bool {
        self.request.max_items.is_some_and(|max| written >= max)
    }

    /// Keep an unparseable body for inspection.
    fn save_response(&self, text: &str) -> Option<PathBuf> {
        let path = self.request.dump_path();
        match fs::write(&path, text) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not save response");
                None
            }
        }
    }
}

/// Harvest `request` over HTTP.
pub fn harvest(request: HarvestRequest, interrupt: InterruptFlag) -> Result<HarvestOutcome> {
    Harvester::connect(request, interrupt)?.run()
}
