mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{error_document, property_document, MapSource};
use opa_scraper::{FetchError, Identifier, Pipeline, PipelineConfig, ResourceSource};

fn read_table(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader.headers().unwrap().iter().map(str::to_string).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    (header, rows)
}

fn config_in(dir: &Path, workers: usize) -> PipelineConfig {
    PipelineConfig::new(dir).with_workers(workers).with_download_dir(dir.join("downloads"))
}

#[test]
fn two_workers_two_identifiers() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(
        MapSource::new()
            .with_document(100, &property_document(100))
            .with_document(200, &property_document(200)),
    );
    let pipeline = Pipeline::new(config_in(dir.path(), 2), source.clone());
    let summary = pipeline.run(&[100, 200]).unwrap();

    assert_eq!(summary.workers, 2);
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.files_written, 2);
    assert_eq!(summary.transform.rows_written, 2);
    assert_eq!(summary.transform.valuation_rows_written, 4);
    assert_eq!(summary.dropped(), 0);

    let (header, rows) = read_table(&dir.path().join("opa.csv"));
    assert_eq!(header.len(), 27);
    let mut accounts: Vec<&str> = rows.iter().map(|r| r[1].as_str()).collect();
    accounts.sort();
    assert_eq!(accounts, vec!["100", "200"]);
    assert!(rows.iter().all(|r| r[22] == "2021-01-01"));

    let (val_header, val_rows) = read_table(&dir.path().join("opa-val.csv"));
    assert_eq!(val_header.last().unwrap(), "opa_id");
    assert_eq!(val_rows.len(), 4);
    assert_eq!(val_rows.iter().filter(|r| r[15] == "100").count(), 2);

    assert!(dir.path().join("downloads/100.json").exists());
    assert!(dir.path().join("downloads/200.json").exists());
    let mut requested = source.requested();
    requested.sort();
    assert_eq!(requested, vec![100, 200]);
}

#[test]
fn non_success_status_yields_no_row() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(
        MapSource::new()
            .with_document(100, &property_document(100))
            .with_document(200, &error_document()),
    );
    let summary = Pipeline::new(config_in(dir.path(), 2), source).run(&[100, 200]).unwrap();

    assert_eq!(summary.transform.rejected, vec![200]);
    let (_, rows) = read_table(&dir.path().join("opa.csv"));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][1], "100");
    // The raw body is kept even though it produced no row.
    assert!(dir.path().join("downloads/200.json").exists());
}

#[test]
fn raw_files_match_fetched_bodies() {
    let dir = tempfile::tempdir().unwrap();
    let odd_body = "{\"status\":\"success\",  \"data\":{}}\n\u{00e9}";
    let source = Arc::new(
        MapSource::new()
            .with_document(7, &property_document(7))
            .with_body(8, odd_body),
    );
    Pipeline::new(config_in(dir.path(), 1), source).run(&[7, 8]).unwrap();

    let expected = serde_json::to_vec(&property_document(7)).unwrap();
    assert_eq!(fs::read(dir.path().join("downloads/7.json")).unwrap(), expected);
    assert_eq!(fs::read(dir.path().join("downloads/8.json")).unwrap(), odd_body.as_bytes());
}

#[test]
fn more_workers_than_identifiers_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let ids: Vec<Identifier> = vec![1, 2, 3];
    let source = ids.iter().fold(MapSource::new(), |s, &id| s.with_document(id, &property_document(id)));
    let summary = Pipeline::new(config_in(dir.path(), 8), Arc::new(source)).run(&ids).unwrap();

    assert_eq!(summary.workers, 3);
    assert_eq!(summary.transform.rows_written, 3);
}

#[test]
fn empty_identifier_list_writes_headers_only() {
    let dir = tempfile::tempdir().unwrap();
    let summary = Pipeline::new(config_in(dir.path(), 4), Arc::new(MapSource::new())).run(&[]).unwrap();

    assert_eq!(summary.workers, 0);
    let (header, rows) = read_table(&dir.path().join("opa.csv"));
    assert_eq!(header[0], "property_id");
    assert!(rows.is_empty());
}

#[test]
fn fetch_failures_are_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MapSource::new().with_document(10, &property_document(10)));
    let summary = Pipeline::new(config_in(dir.path(), 2), source).run(&[10, 11, 12]).unwrap();

    assert_eq!(summary.fetch_failures, vec![11, 12]);
    assert_eq!(summary.transform.rows_written, 1);
    assert!(!dir.path().join("downloads/11.json").exists());
}

#[test]
fn single_worker_preserves_span_order() {
    let dir = tempfile::tempdir().unwrap();
    let ids: Vec<Identifier> = vec![30, 10, 20, 50, 40];
    let source = ids.iter().fold(MapSource::new(), |s, &id| s.with_document(id, &property_document(id)));
    Pipeline::new(config_in(dir.path(), 1), Arc::new(source)).run(&ids).unwrap();

    let (_, rows) = read_table(&dir.path().join("opa.csv"));
    let accounts: Vec<&str> = rows.iter().map(|r| r[1].as_str()).collect();
    assert_eq!(accounts, vec!["30", "10", "20", "50", "40"]);
}

#[test]
fn malformed_sections_produce_partial_rows() {
    let dir = tempfile::tempdir().unwrap();
    let doc = serde_json::json!({"status": "success", "data": {"property": {"account_number": "5", "ownership": "none"}}});
    let source = Arc::new(MapSource::new().with_document(5, &doc).with_body(6, "not json at all"));
    let summary = Pipeline::new(config_in(dir.path(), 1), source).run(&[5, 6]).unwrap();

    assert_eq!(summary.transform.rows_written, 1);
    assert_eq!(summary.transform.unparseable, vec![6]);
    let (_, rows) = read_table(&dir.path().join("opa.csv"));
    assert_eq!(rows[0][1], "5");
    assert!(rows[0][5..].iter().all(String::is_empty));
}

#[test]
fn cancelled_run_skips_all_requests() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MapSource::new().with_document(1, &property_document(1)));
    let pipeline = Pipeline::new(config_in(dir.path(), 2), source.clone());
    pipeline.cancellation_token().cancel();
    let summary = pipeline.run(&[1, 2, 3]).unwrap();

    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.transform.received, 0);
    assert!(source.requested().is_empty());
}

#[test]
fn unwritable_output_is_fatal_before_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, "x").unwrap();
    let source = Arc::new(MapSource::new());
    let config = PipelineConfig::new(blocker.join("out"));
    let err = Pipeline::new(config, source.clone()).run(&[1]).unwrap_err();

    assert!(err.to_string().contains("Failed to create output directory"));
    assert!(source.requested().is_empty());
}

/// Delegates to a `MapSource` but panics on one identifier.
struct PanicOn {
    id: Identifier,
    inner: MapSource,
}

impl ResourceSource for PanicOn {
    fn fetch(&self, id: Identifier) -> Result<Vec<u8>, FetchError> {
        if id == self.id {
            panic!("source failed on {}", id);
        }
        self.inner.fetch(id)
    }
}

#[test]
fn panicking_source_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(PanicOn {
        id: 200,
        inner: MapSource::new()
            .with_document(100, &property_document(100))
            .with_document(300, &property_document(300)),
    });
    let summary = Pipeline::new(config_in(dir.path(), 3), source).run(&[100, 200, 300]).unwrap();

    assert_eq!(summary.panicked_workers, vec![1]);
    assert_eq!(summary.unaccounted, 1);
    assert_eq!(summary.transform.rows_written, 2);
    assert_eq!(summary.dropped(), 1);
    let (_, rows) = read_table(&dir.path().join("opa.csv"));
    assert_eq!(rows.len(), 2);
}
