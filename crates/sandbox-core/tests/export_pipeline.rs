use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use sandbox_bucket::{BucketError, RecordStream, SandboxStore, SelectQuery};
use sandbox_core::error::ExportError;
use sandbox_core::exporter::Exporter;
use sandbox_core::types::{ExportRequest, OutputFormat};
use serde_json::{json, Value};
use std::sync::Arc;

/// In-memory store: objects keyed by full path, with optional injected
/// select failures and a log of every issued query.
#[derive(Default)]
struct MockStore {
    objects: BTreeMap<String, Vec<Value>>,
    failures: Mutex<HashMap<String, u32>>,
    listed_prefixes: Mutex<Vec<String>>,
    queried_keys: Mutex<Vec<String>>,
    queries: Mutex<Vec<SelectQuery>>,
}

impl MockStore {
    fn with_objects(objects: Vec<(&str, Vec<Value>)>) -> Self {
        Self {
            objects: objects
                .into_iter()
                .map(|(key, records)| (key.to_string(), records))
                .collect(),
            ..Self::default()
        }
    }

    fn fail_times(self, key: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(key.to_string(), times);
        self
    }

    fn queried_keys(&self) -> Vec<String> {
        self.queried_keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxStore for MockStore {
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        self.listed_prefixes.lock().unwrap().push(prefix.to_string());
        Ok(self
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn select(&self, key: &str, query: &SelectQuery) -> Result<RecordStream, BucketError> {
        self.queried_keys.lock().unwrap().push(key.to_string());
        self.queries.lock().unwrap().push(query.clone());

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BucketError::Select {
                    key: key.to_string(),
                    message: "simulated throttle".to_string(),
                });
            }
        }

        let mut records = self.objects.get(key).cloned().unwrap_or_default();
        if let Some(limit) = query.limit {
            records.truncate(limit as usize);
        }
        Ok(futures::stream::iter(records.into_iter().map(Ok)).boxed())
    }
}

fn request(start: (i32, u32, u32), dir: &Path) -> ExportRequest {
    let start = chrono::NaiveDate::from_ymd_opt(start.0, start.1, start.2).expect("valid date");
    let mut request = ExportRequest::new("wydot", "bsm", start);
    request.output_dir = dir.to_path_buf();
    request.max_retries = 0;
    request
}

fn bsm(id: u32) -> Value {
    json!({
        "metadata": { "bsmSource": "RV", "serialId": { "recordId": id } },
        "payload": { "data": { "coreData": { "speed": 10 + id } } }
    })
}

#[tokio::test]
async fn single_day_export_queries_one_partition() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MockStore::with_objects(vec![
        ("wydot/BSM/2020/01/22/00/shard-a", vec![bsm(1), bsm(2)]),
        ("wydot/BSM/2020/01/22/17/shard-b", vec![bsm(3)]),
        ("wydot/BSM/2020/01/23/00/next-day", vec![bsm(9)]),
    ]));
    let exporter = Exporter::new(store.clone());

    let summary = exporter
        .export(&request((2020, 1, 22), dir.path()))
        .await
        .expect("export");

    assert_eq!(
        store.listed_prefixes.lock().unwrap().clone(),
        vec!["wydot/BSM/2020/01/22/"]
    );
    assert_eq!(summary.objects_listed, 2);
    assert_eq!(summary.objects_queried, 2);
    assert_eq!(summary.objects_failed, 0);
    assert_eq!(summary.records_written, 3);
    assert_eq!(summary.files.len(), 1);

    let header = fs::read_to_string(&summary.files[0])
        .expect("readable csv")
        .lines()
        .next()
        .expect("header row")
        .to_string();
    assert!(header.contains("metadata.bsmSource"));
    assert!(header.contains("metadata.serialId.recordId"));
    assert!(header.contains("payload.data.coreData.speed"));
}

#[tokio::test]
async fn global_limit_short_circuits_remaining_objects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MockStore::with_objects(vec![
        ("wydot/BSM/2020/01/22/00/a", (0..5).map(bsm).collect()),
        ("wydot/BSM/2020/01/22/01/b", (5..10).map(bsm).collect()),
        ("wydot/BSM/2020/01/22/02/c", (10..15).map(bsm).collect()),
    ]));
    let exporter = Exporter::new(store.clone());

    let mut req = request((2020, 1, 22), dir.path());
    req.limit = Some(7);
    let summary = exporter.export(&req).await.expect("export");

    assert_eq!(summary.records_written, 7);
    // The third object is never queried once the limit is satisfied.
    assert_eq!(
        store.queried_keys(),
        vec!["wydot/BSM/2020/01/22/00/a", "wydot/BSM/2020/01/22/01/b"]
    );
    // The remaining record allowance is pushed down to the second query.
    assert_eq!(store.queries.lock().unwrap()[1].limit, Some(2));
}

#[tokio::test]
async fn failed_object_is_skipped_and_counted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        MockStore::with_objects(vec![
            ("wydot/BSM/2020/01/22/00/a", vec![bsm(1), bsm(2)]),
            ("wydot/BSM/2020/01/22/01/b", vec![bsm(3), bsm(4)]),
            ("wydot/BSM/2020/01/22/02/c", vec![bsm(5), bsm(6)]),
        ])
        .fail_times("wydot/BSM/2020/01/22/01/b", u32::MAX),
    );
    let exporter = Exporter::new(store.clone());

    let summary = exporter
        .export(&request((2020, 1, 22), dir.path()))
        .await
        .expect("run completes despite the failed object");

    assert_eq!(summary.objects_listed, 3);
    assert_eq!(summary.objects_queried, 2);
    assert_eq!(summary.objects_failed, 1);
    assert_eq!(summary.records_written, 4);

    let contents = fs::read_to_string(&summary.files[0]).expect("readable csv");
    assert!(!contents.contains("13")); // speed of the failed object's records
}

#[tokio::test]
async fn transient_failure_is_retried_before_skipping() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        MockStore::with_objects(vec![("wydot/BSM/2020/01/22/00/a", vec![bsm(1)])])
            .fail_times("wydot/BSM/2020/01/22/00/a", 1),
    );
    let exporter = Exporter::new(store.clone());

    let mut req = request((2020, 1, 22), dir.path());
    req.max_retries = 2;
    let summary = exporter.export(&req).await.expect("export");

    assert_eq!(summary.objects_failed, 0);
    assert_eq!(summary.records_written, 1);
    assert_eq!(store.queried_keys().len(), 2);
}

#[tokio::test]
async fn projection_limits_output_columns() {
    let dir = tempfile::tempdir().expect("tempdir");
    // The remote engine applies the projection; the store returns records
    // already cut down to the requested field.
    let store = Arc::new(MockStore::with_objects(vec![(
        "wydot/BSM/2020/01/22/00/a",
        vec![
            json!({ "metadata": { "bsmSource": "RV", "schemaVersion": 6 } }),
            json!({ "metadata": { "bsmSource": "EV" } }),
        ],
    )]));
    let exporter = Exporter::new(store.clone());

    let mut req = request((2020, 1, 22), dir.path());
    req.output_fields = Some("s.metadata".to_string());
    let summary = exporter.export(&req).await.expect("export");

    assert_eq!(
        store.queries.lock().unwrap()[0].output_fields.as_deref(),
        Some("s.metadata")
    );
    let header = fs::read_to_string(&summary.files[0])
        .expect("readable csv")
        .lines()
        .next()
        .expect("header row")
        .to_string();
    assert!(header
        .split(',')
        .all(|column| column.starts_with("metadata.")));
}

#[tokio::test]
async fn ndjson_export_round_trips_in_query_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MockStore::with_objects(vec![
        ("wydot/BSM/2020/01/22/00/a", vec![bsm(1), bsm(2)]),
        ("wydot/BSM/2020/01/22/01/b", vec![bsm(3)]),
    ]));
    let exporter = Exporter::new(store);

    let mut req = request((2020, 1, 22), dir.path());
    req.format = OutputFormat::JsonLines;
    let summary = exporter.export(&req).await.expect("export");

    let parsed: Vec<Value> = fs::read_to_string(&summary.files[0])
        .expect("readable ndjson")
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid json line"))
        .collect();
    assert_eq!(parsed, vec![bsm(1), bsm(2), bsm(3)]);
}

#[tokio::test]
async fn splits_across_files_by_row_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MockStore::with_objects(vec![(
        "wydot/BSM/2020/01/22/00/a",
        (0..5).map(bsm).collect(),
    )]));
    let exporter = Exporter::new(store);

    let mut req = request((2020, 1, 22), dir.path());
    req.max_rows_per_file = 2;
    let summary = exporter.export(&req).await.expect("export");

    assert_eq!(summary.files.len(), 3);
    for path in &summary.files {
        assert!(path.exists());
    }
}

#[tokio::test]
async fn empty_range_is_success_unless_configured_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let exporter = Exporter::new(Arc::new(MockStore::default()));

    let summary = exporter
        .export(&request((2020, 1, 22), dir.path()))
        .await
        .expect("empty export succeeds");
    assert_eq!(summary.objects_listed, 0);
    assert!(summary.files.is_empty());

    let mut req = request((2020, 1, 22), dir.path());
    req.fail_on_empty = true;
    let err = Exporter::new(Arc::new(MockStore::default()))
        .export(&req)
        .await
        .expect_err("empty export is fatal when configured");
    assert!(matches!(err, ExportError::NoObjectsMatched));
}

#[tokio::test]
async fn zip_archives_outputs_and_removes_loose_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MockStore::with_objects(vec![(
        "wydot/BSM/2020/01/22/00/a",
        vec![bsm(1), bsm(2)],
    )]));
    let exporter = Exporter::new(store);

    let mut req = request((2020, 1, 22), dir.path());
    req.zip_output = true;
    let summary = exporter.export(&req).await.expect("export");

    let archive = summary.archive.expect("archive path");
    assert!(archive.exists());
    for path in &summary.files {
        assert!(!path.exists());
    }
}

#[tokio::test]
async fn count_sums_per_object_results() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MockStore::with_objects(vec![
        ("wydot/BSM/2020/01/22/00/a", vec![json!({ "_1": 5 })]),
        ("wydot/BSM/2020/01/22/01/b", vec![json!({ "_1": 7 })]),
    ]));
    let exporter = Exporter::new(store.clone());

    let summary = exporter
        .count(&request((2020, 1, 22), dir.path()))
        .await
        .expect("count");

    assert_eq!(summary.total, 12);
    assert_eq!(summary.objects_queried, 2);
    assert!(store.queries.lock().unwrap().iter().all(|query| query.count));
}

#[tokio::test]
async fn inverted_date_range_fails_fast() {
    let dir = tempfile::tempdir().expect("tempdir");
    let exporter = Exporter::new(Arc::new(MockStore::default()));

    let mut req = request((2020, 1, 22), dir.path());
    req.end_date = chrono::NaiveDate::from_ymd_opt(2020, 1, 20);
    let err = exporter.export(&req).await.expect_err("invalid range");
    assert!(matches!(err, ExportError::InvalidRequest(_)));
}
