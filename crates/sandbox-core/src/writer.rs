use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::flatten::{flatten, FlatRecord};
use crate::types::OutputFormat;

/// Accumulates records into size-split output files.
///
/// Tabular output buffers rows per file (memory is bounded by the split
/// size, never the whole export) because each file's header is the
/// first-seen-order union of dotted paths across that file's records and is
/// only known once the file rotates. Structured output streams straight to
/// disk, one compact JSON document per line.
pub struct OutputWriter {
    format: OutputFormat,
    dir: PathBuf,
    stem: String,
    max_rows: usize,
    file_index: usize,
    rows_in_file: usize,
    records_written: u64,
    header: Vec<String>,
    header_seen: HashSet<String>,
    rows: Vec<FlatRecord>,
    json_file: Option<BufWriter<File>>,
    produced: Vec<PathBuf>,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, dir: &Path, stem: &str, max_rows: usize) -> Self {
        Self {
            format,
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            max_rows,
            file_index: 0,
            rows_in_file: 0,
            records_written: 0,
            header: Vec::new(),
            header_seen: HashSet::new(),
            rows: Vec::new(),
            json_file: None,
            produced: Vec::new(),
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn write(&mut self, record: &Value) -> Result<()> {
        match self.format {
            OutputFormat::Csv => {
                let flat = flatten(record);
                for (path, _) in &flat {
                    if self.header_seen.insert(path.clone()) {
                        self.header.push(path.clone());
                    }
                }
                self.rows.push(flat);
            }
            OutputFormat::JsonLines => {
                if self.json_file.is_none() {
                    let path = self.next_path();
                    self.json_file = Some(BufWriter::new(File::create(&path)?));
                    self.produced.push(path);
                }
                if let Some(file) = self.json_file.as_mut() {
                    serde_json::to_writer(&mut *file, record)?;
                    file.write_all(b"\n")?;
                }
            }
        }
        self.rows_in_file += 1;
        self.records_written += 1;
        if self.rows_in_file >= self.max_rows {
            self.roll()?;
        }
        Ok(())
    }

    /// Closes the in-flight file and returns every produced path in
    /// creation order. Zero written records produce zero files.
    pub fn finalize(mut self) -> Result<Vec<PathBuf>> {
        if self.rows_in_file > 0 {
            self.roll()?;
        }
        Ok(self.produced)
    }

    fn next_path(&self) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.{}",
            self.stem,
            self.file_index,
            self.format.extension()
        ))
    }

    fn roll(&mut self) -> Result<()> {
        match self.format {
            OutputFormat::Csv => self.flush_csv()?,
            OutputFormat::JsonLines => self.finish_json_file()?,
        }
        self.rows_in_file = 0;
        Ok(())
    }

    fn flush_csv(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let path = self.next_path();
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&self.header)?;
        for row in &self.rows {
            let by_path: HashMap<&str, &str> = row
                .iter()
                .map(|(path, value)| (path.as_str(), value.as_str()))
                .collect();
            let cells: Vec<&str> = self
                .header
                .iter()
                .map(|column| by_path.get(column.as_str()).copied().unwrap_or(""))
                .collect();
            writer.write_record(&cells)?;
        }
        writer.flush()?;
        info!(path = %path.display(), rows = self.rows.len(), "wrote output file");

        self.produced.push(path);
        self.rows.clear();
        self.header.clear();
        self.header_seen.clear();
        self.file_index += 1;
        Ok(())
    }

    fn finish_json_file(&mut self) -> Result<()> {
        if let Some(mut file) = self.json_file.take() {
            file.flush()?;
            info!(rows = self.rows_in_file, "wrote output file");
            self.file_index += 1;
        }
        Ok(())
    }
}
