//! Command-line interface for the harvester.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::{
    validate_base_url, DumpMode, HarvestRequest, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_BACKOFF,
    DEFAULT_RETRIES, HTTP_TIMEOUT_SECS,
};
use crate::error::{HarvesterError, Result};
use crate::harvester::{Completion, HarvestStatus, Harvester};
use crate::http::HttpTransport;
use crate::interrupt::InterruptFlag;
use crate::preflight::{identify, list_metadata_formats};
use crate::retry::RetryPolicy;
use crate::types::Verb;

/// OAI-PMH Harvester - Download a repository's records with resume and
/// rotation.
#[derive(Parser)]
#[command(name = "oaipmh-harvester")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Harvest records into one or more XML files.
    Harvest(HarvestArgs),

    /// Show what a repository reports about itself and its formats.
    Identify {
        /// Base URL of the OAI-PMH endpoint
        #[arg(long)]
        url: String,
    },
}

#[derive(Args, Debug)]
pub struct HarvestArgs {
    /// Base URL of the OAI-PMH endpoint (e.g., https://example.org/api/oai-pmh/)
    #[arg(long)]
    pub url: String,

    /// ListRecords or ListIdentifiers
    #[arg(long, default_value = "ListRecords")]
    pub verb: Verb,

    /// metadataPrefix (e.g., edm, oai_dc)
    #[arg(long)]
    pub prefix: String,

    /// Only harvest this set (setSpec)
    #[arg(long)]
    pub set: Option<String>,

    /// Output file name
    #[arg(long, default_value = "harvest.xml")]
    pub out: PathBuf,

    /// Output directory
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Pause between requests, in seconds
    #[arg(long, default_value_t = 0.3)]
    pub sleep: f64,

    /// Attempts per request, including the first
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Delay before the first retry, in seconds
    #[arg(long, default_value_t = 1.5)]
    pub backoff: f64,

    /// Factor the retry delay grows by after each failed attempt
    #[arg(long, default_value_t = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,

    /// Per-attempt HTTP timeout, in seconds
    #[arg(long, default_value_t = HTTP_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Stop after this many records
    #[arg(long)]
    pub max_items: Option<u64>,

    /// Start a new output file every N records
    #[arg(long)]
    pub rotate_every: Option<u64>,

    /// Flat export next to the XML: none, csv, jsonl or both
    #[arg(long, default_value = "none")]
    pub dump: DumpMode,

    /// Metadata field for the flat export (default: edm:isShownAt)
    #[arg(long)]
    pub edm_field: Option<String>,

    /// Ignore an existing checkpoint and start over
    #[arg(long)]
    pub no_resume: bool,

    /// Skip the Identify / ListMetadataFormats checks
    #[arg(long)]
    pub skip_preflight: bool,

    /// Also write the log to <out>.log next to the output
    #[arg(long)]
    pub log_file: bool,
}

impl HarvestArgs {
    /// Build the validated request these arguments describe.
    pub fn to_request(&self) -> Result<HarvestRequest> {
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(HarvesterError::InvalidConfig(
                "--backoff-multiplier must be a number of at least 1".to_string(),
            ));
        }
        let retry = RetryPolicy::new(
            self.retries,
            seconds("--backoff", self.backoff)?,
            DEFAULT_MAX_BACKOFF,
        )
        .with_multiplier(self.backoff_multiplier);

        let request = HarvestRequest::new(&self.url, self.verb, &self.prefix, self.output())?
            .with_set(self.set.clone())
            .with_max_items(self.max_items)
            .with_rotation(self.rotate_every)
            .with_dump(self.dump, self.edm_field.clone())
            .with_sleep(seconds("--sleep", self.sleep)?)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_retry(retry)
            .with_resume(!self.no_resume)
            .with_preflight(!self.skip_preflight);
        request.validate()?;
        Ok(request)
    }

    #[must_use]
    pub fn output(&self) -> PathBuf {
        self.dir.join(&self.out)
    }
}

impl Cli {
    /// Log file requested on the command line, if any.
    #[must_use]
    pub fn log_path(&self) -> Option<PathBuf> {
        match &self.command {
            Commands::Harvest(args) if args.log_file => {
                args.to_request().ok().map(|request| request.log_path())
            }
            _ => None,
        }
    }
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        HarvesterError::InvalidConfig(format!("{flag} must be a non-negative number of seconds"))
    })
}

/// Run the CLI.
pub fn run(cli: Cli, interrupt: InterruptFlag) -> Result<()> {
    match cli.command {
        Commands::Harvest(args) => harvest_command(&args, interrupt),
        Commands::Identify { url } => identify_command(&url),
    }
}

/// Execute the harvest command.
fn harvest_command(args: &HarvestArgs, interrupt: InterruptFlag) -> Result<()> {
    let request = args.to_request()?;

    println!(
        "{} {} ({}, prefix {}{})",
        style("Harvesting").bold(),
        style(request.base_url.as_str()).cyan(),
        request.verb,
        style(&request.metadata_prefix).green(),
        request
            .set
            .as_deref()
            .map(|s| format!(", set {s}"))
            .unwrap_or_default()
    );
    println!();

    // Create progress spinner
    let pb = ProgressBar::new_spinner();
    #[allow(clippy::expect_used)] // Static template string that is guaranteed to be valid
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .expect("valid template"),
    );
    pb.set_message("Connecting...");
    pb.enable_steady_tick(Duration::from_millis(100));

    let spinner = pb.clone();
    let mut harvester = Harvester::connect(request, interrupt)?.with_progress(move |progress| {
        let total = progress
            .complete_list_size
            .map(|size| format!(" of {size}"))
            .unwrap_or_default();
        spinner.set_message(format!(
            "{} records{total} (page {})",
            progress.records, progress.pages
        ));
    });

    let outcome = match harvester.run() {
        Ok(outcome) => outcome,
        Err(e) => {
            pb.finish_and_clear();
            return Err(e);
        }
    };
    pb.finish_and_clear();

    if outcome.resumed {
        println!("  Resumed from checkpoint");
    }
    println!("  Records: {}", outcome.records_written);
    println!("  Pages: {}", outcome.pages);
    println!("  Files:");
    for segment in &outcome.segments {
        println!("    {}", segment.display());
    }
    for dump in &outcome.dumps {
        println!("    {}", dump.display());
    }
    println!();

    match outcome.status {
        HarvestStatus::Completed(completion) => {
            let reason = match completion {
                Completion::Exhausted => "list exhausted",
                Completion::LimitReached => "item limit reached",
                Completion::NoRecordsMatch => "no records match",
            };
            println!("{} ({reason})", style("Harvest complete").green().bold());
            Ok(())
        }
        HarvestStatus::Aborted(error) => {
            if let Some(checkpoint) = &outcome.checkpoint {
                println!(
                    "{} {}",
                    style("Checkpoint kept:").yellow().bold(),
                    checkpoint.display()
                );
                println!("  {}", resume_hint(&error));
            }
            Err(error)
        }
    }
}

/// What to tell the operator after an aborted harvest.
fn resume_hint(error: &HarvesterError) -> &'static str {
    if error.is_network() {
        "The repository could not be reached; run the same command again to resume."
    } else if error.is_protocol() {
        "The repository rejected the request; check the arguments before resuming."
    } else {
        "Run the same command again to resume."
    }
}

/// Execute the identify command.
fn identify_command(url: &str) -> Result<()> {
    let base_url = validate_base_url(url)?;
    let transport = HttpTransport::new(
        Duration::from_secs(HTTP_TIMEOUT_SECS),
        RetryPolicy::default(),
    )?;

    let info = identify(&transport, &base_url)?;
    let or_dash = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

    println!(
        "{} {}",
        style("Repository:").bold(),
        style(or_dash(&info.repository_name)).green()
    );
    println!("  Base URL: {}", or_dash(&info.base_url));
    println!("  Protocol: {}", or_dash(&info.protocol_version));
    println!("  Granularity: {}", or_dash(&info.granularity));
    println!("  Earliest datestamp: {}", or_dash(&info.earliest_datestamp));
    if !info.admin_emails.is_empty() {
        println!("  Admin: {}", info.admin_emails.join(", "));
    }
    println!();

    match list_metadata_formats(&transport, &base_url) {
        Ok(formats) => {
            println!("{}", style("Metadata formats:").bold());
            for format in formats {
                println!(
                    "  {} {}",
                    style(&format.prefix).cyan(),
                    format.namespace.unwrap_or_default()
                );
            }
        }
        Err(e) => println!(
            "{} {e}",
            style("Could not list metadata formats:").yellow().bold()
        ),
    }

    Ok(())
}
