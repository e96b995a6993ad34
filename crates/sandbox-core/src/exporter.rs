use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sandbox_bucket::{RecordStream, SandboxStore, SelectQuery};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::archive;
use crate::error::{ExportError, Result};
use crate::locator;
use crate::types::{CountSummary, ExportRequest, RunSummary};
use crate::writer::OutputWriter;

const RETRY_BACKOFF: Duration = Duration::from_millis(400);

/// Drives the enumerate -> query -> write pipeline against a record store.
pub struct Exporter {
    store: Arc<dyn SandboxStore>,
}

impl Exporter {
    pub fn new(store: Arc<dyn SandboxStore>) -> Self {
        Self { store }
    }

    /// Runs one export end to end. Per-object query failures are logged,
    /// counted in the summary, and skipped; configuration, listing, and
    /// output-side errors abort the run.
    pub async fn export(&self, request: &ExportRequest) -> Result<RunSummary> {
        request.validate()?;
        let keys = self.enumerate(request).await?;
        if keys.is_empty() && request.fail_on_empty {
            return Err(ExportError::NoObjectsMatched);
        }

        let mut summary = RunSummary {
            objects_listed: keys.len(),
            ..RunSummary::default()
        };
        let stem = request.file_stem();
        let mut writer = OutputWriter::new(
            request.format,
            &request.output_dir,
            &stem,
            request.max_rows_per_file,
        );

        for key in &keys {
            if let Some(limit) = request.limit {
                if writer.records_written() >= limit {
                    info!(limit, "record limit reached; skipping remaining objects");
                    break;
                }
            }
            match self.drain_object(request, key, &mut writer).await {
                Ok(()) => summary.objects_queried += 1,
                Err(ExportError::Bucket(err)) => {
                    warn!(key = %key, error = %err, "skipping object after query failure");
                    summary.objects_failed += 1;
                }
                Err(other) => return Err(other),
            }
        }

        summary.records_written = writer.records_written();
        let files = writer.finalize()?;
        summary.archive = if request.zip_output && !files.is_empty() {
            Some(archive::zip_outputs(&files, &request.output_dir, &stem)?)
        } else {
            None
        };
        summary.files = files;

        let totals = self.store.scan_totals();
        summary.bytes_scanned = totals.bytes_scanned;
        summary.bytes_returned = totals.bytes_returned;

        info!(
            listed = summary.objects_listed,
            queried = summary.objects_queried,
            failed = summary.objects_failed,
            records = summary.records_written,
            "export complete"
        );
        Ok(summary)
    }

    /// Sums `count(*)` over every enumerated object without writing files.
    pub async fn count(&self, request: &ExportRequest) -> Result<CountSummary> {
        request.validate()?;
        let keys = self.enumerate(request).await?;
        if keys.is_empty() && request.fail_on_empty {
            return Err(ExportError::NoObjectsMatched);
        }

        let query = SelectQuery {
            where_clause: request.where_clause.clone(),
            count: true,
            ..SelectQuery::default()
        };
        let mut summary = CountSummary {
            objects_listed: keys.len(),
            ..CountSummary::default()
        };
        for key in &keys {
            match self.count_object(key, &query, request.max_retries).await {
                Ok(count) => {
                    summary.total += count;
                    summary.objects_queried += 1;
                }
                Err(ExportError::Bucket(err)) => {
                    warn!(key = %key, error = %err, "skipping object after count failure");
                    summary.objects_failed += 1;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(summary)
    }

    /// Object keys for every day partition in the request window,
    /// chronological. A day with no remote objects contributes nothing; a
    /// listing failure is fatal.
    async fn enumerate(&self, request: &ExportRequest) -> Result<Vec<String>> {
        let prefixes = locator::day_prefixes(
            &request.pilot,
            &request.message_type,
            request.start_date,
            request.resolved_end_date(),
        );
        let mut keys = Vec::new();
        for prefix in &prefixes {
            let mut listed = self.store.list_objects(prefix).await?;
            keys.append(&mut listed);
        }
        info!(
            prefixes = prefixes.len(),
            objects = keys.len(),
            "enumerated date partitions"
        );
        Ok(keys)
    }

    async fn drain_object(
        &self,
        request: &ExportRequest,
        key: &str,
        writer: &mut OutputWriter,
    ) -> Result<()> {
        let remaining = request
            .limit
            .map(|limit| limit.saturating_sub(writer.records_written()));
        let query = SelectQuery {
            output_fields: request.output_fields.clone(),
            where_clause: request.where_clause.clone(),
            limit: remaining,
            count: false,
        };

        let mut stream = self
            .select_with_retry(key, &query, request.max_retries)
            .await?;
        while let Some(record) = stream.next().await {
            // A mid-stream error marks the object failed without re-issuing
            // the query; records already consumed from it stay written.
            let record = record.map_err(ExportError::Bucket)?;
            writer.write(&record)?;
            if let Some(limit) = request.limit {
                if writer.records_written() >= limit {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn count_object(
        &self,
        key: &str,
        query: &SelectQuery,
        max_retries: u32,
    ) -> Result<u64> {
        let mut stream = self.select_with_retry(key, query, max_retries).await?;
        let mut total = 0;
        while let Some(record) = stream.next().await {
            let record = record.map_err(ExportError::Bucket)?;
            total += extract_count(&record);
        }
        Ok(total)
    }

    async fn select_with_retry(
        &self,
        key: &str,
        query: &SelectQuery,
        max_retries: u32,
    ) -> Result<RecordStream> {
        let mut attempt = 0;
        loop {
            match self.store.select(key, query).await {
                Ok(stream) => return Ok(stream),
                Err(err) if attempt < max_retries => {
                    attempt += 1;
                    warn!(key, attempt, error = %err, "select failed; retrying");
                    sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// The remote engine returns `count(*)` as a one-field record; in-memory
/// test stores may hand back a bare number.
fn extract_count(record: &Value) -> u64 {
    record
        .get("_1")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| record.as_u64().unwrap_or(0))
}
