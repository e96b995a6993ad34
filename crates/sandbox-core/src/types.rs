// crates/sandbox-core/src/types.rs

use std::path::PathBuf;

use chrono::{Days, NaiveDate};
use serde::Serialize;

use crate::error::{ExportError, Result};

pub const DEFAULT_OUTPUT_CONVENTION: &str = "{pilot}_{message_type}_{sdate}_{edate}";
pub const DEFAULT_MAX_ROWS_PER_FILE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    JsonLines,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::JsonLines => "ndjson",
        }
    }
}

/// One export invocation. Created once, consumed by the exporter, never
/// mutated.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub pilot: String,
    pub message_type: String,
    pub start_date: NaiveDate,
    /// Exclusive end of the window; `None` means one day after the start.
    pub end_date: Option<NaiveDate>,
    pub where_clause: Option<String>,
    pub output_fields: Option<String>,
    pub limit: Option<u64>,
    pub format: OutputFormat,
    pub output_convention: String,
    pub output_dir: PathBuf,
    pub max_rows_per_file: usize,
    pub zip_output: bool,
    pub fail_on_empty: bool,
    pub max_retries: u32,
}

impl ExportRequest {
    pub fn new(pilot: &str, message_type: &str, start_date: NaiveDate) -> Self {
        Self {
            pilot: pilot.to_string(),
            message_type: message_type.to_string(),
            start_date,
            end_date: None,
            where_clause: None,
            output_fields: None,
            limit: None,
            format: OutputFormat::Csv,
            output_convention: DEFAULT_OUTPUT_CONVENTION.to_string(),
            output_dir: PathBuf::from("."),
            max_rows_per_file: DEFAULT_MAX_ROWS_PER_FILE,
            zip_output: false,
            fail_on_empty: false,
            max_retries: 3,
        }
    }

    pub fn resolved_end_date(&self) -> NaiveDate {
        self.end_date.unwrap_or_else(|| {
            self.start_date
                .checked_add_days(Days::new(1))
                .unwrap_or(NaiveDate::MAX)
        })
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(ExportError::InvalidRequest(format!(
                    "start date {} is after end date {}",
                    self.start_date, end
                )));
            }
        }
        if self.max_rows_per_file == 0 {
            return Err(ExportError::InvalidRequest(
                "max rows per file must be at least 1".to_string(),
            ));
        }
        if self.output_convention.trim().is_empty() {
            return Err(ExportError::InvalidRequest(
                "output naming convention cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Output file stem from the naming convention. A file number is always
    /// appended later by the writer, so two files from one run never collide.
    pub fn file_stem(&self) -> String {
        self.output_convention
            .replace("{pilot}", &self.pilot)
            .replace("{message_type}", &self.message_type.to_lowercase())
            .replace("{sdate}", &self.start_date.format("%Y%m%d").to_string())
            .replace(
                "{edate}",
                &self.resolved_end_date().format("%Y%m%d").to_string(),
            )
    }
}

/// End-of-run report surfaced to the caller and the CLI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub objects_listed: usize,
    pub objects_queried: usize,
    pub objects_failed: usize,
    pub records_written: u64,
    pub files: Vec<PathBuf>,
    pub archive: Option<PathBuf>,
    pub bytes_scanned: u64,
    pub bytes_returned: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CountSummary {
    pub total: u64,
    pub objects_listed: usize,
    pub objects_queried: usize,
    pub objects_failed: usize,
}
