//! S3-backed record source for the sandbox exporter: prefix listing plus
//! SELECT query pushdown over individual objects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::timeout::TimeoutConfig;
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::operation::select_object_content::SelectObjectContentOutput;
use aws_sdk_s3::types::{
    CompressionType, ExpressionType, InputSerialization, JsonInput, JsonOutput, JsonType,
    OutputSerialization, SelectObjectContentEventStream,
};
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub profile: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    pub request_timeout: Option<Duration>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "usdot-its-cvpilot-public-data".to_string(),
            region: "us-east-1".to_string(),
            profile: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            request_timeout: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("list request failed for {prefix}: {message}")]
    List { prefix: String, message: String },
    #[error("select request failed for {key}: {message}")]
    Select { key: String, message: String },
    #[error("undecodable record from {key}: {message}")]
    Decode { key: String, message: String },
}

/// Filter, projection, and limit forwarded to the remote SELECT engine.
/// The field and predicate expressions are opaque pass-throughs; the record
/// is bound to `s` on the remote side.
#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub output_fields: Option<String>,
    pub where_clause: Option<String>,
    pub limit: Option<u64>,
    pub count: bool,
}

impl SelectQuery {
    pub fn to_sql(&self) -> String {
        let mut sql = String::from("SELECT ");
        if self.count {
            sql.push_str("count(*)");
        } else if let Some(fields) = &self.output_fields {
            sql.push_str(fields);
        } else {
            sql.push('*');
        }
        sql.push_str(" FROM s3object s");
        if let Some(clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }
}

/// Cumulative SELECT usage reported by the remote service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub bytes_scanned: u64,
    pub bytes_returned: u64,
}

pub type RecordStream = BoxStream<'static, Result<Value, BucketError>>;

/// A queryable store of date-partitioned record objects. Implemented against
/// S3 in production and by in-memory fixtures in tests.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Keys of the non-empty objects beneath a partition prefix. A partition
    /// with no objects is an empty listing, not an error.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, BucketError>;

    /// Runs one SELECT over a single object and returns the lazy,
    /// single-pass stream of matching records.
    async fn select(&self, key: &str, query: &SelectQuery) -> Result<RecordStream, BucketError>;

    /// Usage metadata accumulated so far. Stores that do not report usage
    /// return zeros.
    fn scan_totals(&self) -> ScanStats {
        ScanStats::default()
    }
}

#[derive(Debug, Default)]
struct ScanCounters {
    bytes_scanned: AtomicU64,
    bytes_returned: AtomicU64,
}

impl ScanCounters {
    fn add(&self, scanned: u64, returned: u64) {
        self.bytes_scanned.fetch_add(scanned, Ordering::Relaxed);
        self.bytes_returned.fetch_add(returned, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ScanStats {
        ScanStats {
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            bytes_returned: self.bytes_returned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct S3SandboxStore {
    client: Client,
    bucket: String,
    counters: Arc<ScanCounters>,
}

impl S3SandboxStore {
    pub async fn new(config: S3Config) -> Result<Self, BucketError> {
        if config.bucket.is_empty() {
            return Err(BucketError::Configuration(
                "bucket name cannot be empty".into(),
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        if let Some(timeout) = config.request_timeout {
            loader = loader.timeout_config(
                TimeoutConfig::builder()
                    .operation_attempt_timeout(timeout)
                    .build(),
            );
        }

        let shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket: config.bucket,
            counters: Arc::new(ScanCounters::default()),
        })
    }

    fn input_serialization(key: &str) -> InputSerialization {
        let mut builder = InputSerialization::builder()
            .json(JsonInput::builder().r#type(JsonType::Document).build());
        if is_gzip_key(key) {
            builder = builder.compression_type(CompressionType::Gzip);
        }
        builder.build()
    }
}

fn is_gzip_key(key: &str) -> bool {
    key.to_ascii_lowercase().ends_with(".gz")
}

#[async_trait]
impl SandboxStore for S3SandboxStore {
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| BucketError::List {
                prefix: prefix.to_string(),
                message: err.to_string(),
            })?;
            for object in page.contents() {
                // Empty marker objects carry no records and the SELECT
                // deserializer rejects them.
                if object.size().unwrap_or(0) == 0 {
                    continue;
                }
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }
        debug!(prefix, count = keys.len(), "listed objects");
        Ok(keys)
    }

    async fn select(&self, key: &str, query: &SelectQuery) -> Result<RecordStream, BucketError> {
        let sql = query.to_sql();
        debug!(key, %sql, "issuing select");

        let output = self
            .client
            .select_object_content()
            .bucket(&self.bucket)
            .key(key)
            .expression_type(ExpressionType::Sql)
            .expression(&sql)
            .input_serialization(Self::input_serialization(key))
            .output_serialization(
                OutputSerialization::builder()
                    .json(JsonOutput::builder().record_delimiter("\n").build())
                    .build(),
            )
            .send()
            .await
            .map_err(|err| BucketError::Select {
                key: key.to_string(),
                message: err.to_string(),
            })?;

        let state = SelectDecoder {
            output,
            key: key.to_string(),
            carry: String::new(),
            pending: VecDeque::new(),
            counters: Arc::clone(&self.counters),
            end_seen: false,
            closed: false,
        };

        Ok(futures::stream::try_unfold(state, drive_select).boxed())
    }

    fn scan_totals(&self) -> ScanStats {
        self.counters.snapshot()
    }
}

/// Reassembles newline-delimited records across SELECT event boundaries.
/// Records events split payloads arbitrarily, so a trailing partial line is
/// carried into the next event.
struct SelectDecoder {
    output: SelectObjectContentOutput,
    key: String,
    carry: String,
    pending: VecDeque<Value>,
    counters: Arc<ScanCounters>,
    end_seen: bool,
    closed: bool,
}

impl SelectDecoder {
    fn decode_line(&self, line: &str) -> Result<Value, BucketError> {
        serde_json::from_str(line).map_err(|err| BucketError::Decode {
            key: self.key.clone(),
            message: err.to_string(),
        })
    }

    fn drain_complete_lines(&mut self) -> Result<(), BucketError> {
        while let Some(pos) = self.carry.find('\n') {
            let line = self.carry[..pos].to_string();
            self.carry.drain(..=pos);
            if !line.trim().is_empty() {
                let record = self.decode_line(line.trim())?;
                self.pending.push_back(record);
            }
        }
        Ok(())
    }
}

async fn drive_select(
    mut state: SelectDecoder,
) -> Result<Option<(Value, SelectDecoder)>, BucketError> {
    loop {
        if let Some(record) = state.pending.pop_front() {
            return Ok(Some((record, state)));
        }
        if state.closed {
            if state.end_seen {
                return Ok(None);
            }
            // Mirrors the remote contract: without the End event the
            // response may be truncated.
            return Err(BucketError::Select {
                key: state.key.clone(),
                message: "event stream ended before the End event".to_string(),
            });
        }

        match state.output.payload.recv().await {
            Ok(Some(SelectObjectContentEventStream::Records(event))) => {
                if let Some(blob) = event.payload() {
                    state.carry.push_str(&String::from_utf8_lossy(blob.as_ref()));
                    state.drain_complete_lines()?;
                }
            }
            Ok(Some(SelectObjectContentEventStream::Stats(event))) => {
                if let Some(details) = event.details() {
                    let scanned = details.bytes_scanned().unwrap_or(0).max(0) as u64;
                    let returned = details.bytes_returned().unwrap_or(0).max(0) as u64;
                    state.counters.add(scanned, returned);
                    debug!(
                        key = %state.key,
                        bytes_scanned = scanned,
                        bytes_returned = returned,
                        "select stats"
                    );
                }
            }
            Ok(Some(SelectObjectContentEventStream::End(_))) => {
                state.end_seen = true;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                state.closed = true;
                let rest = std::mem::take(&mut state.carry);
                let rest = rest.trim();
                if !rest.is_empty() {
                    let record = state.decode_line(rest)?;
                    state.pending.push_back(record);
                }
            }
            Err(err) => {
                return Err(BucketError::Select {
                    key: state.key.clone(),
                    message: err.to_string(),
                });
            }
        }
    }
}
