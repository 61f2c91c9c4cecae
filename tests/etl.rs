use anyhow::{Result, bail};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use snapflow::etl::CleanupStage;
use snapflow::io::parquet::read_parquet_vec;
use snapflow::testing::{TestRecord, write_gzip_jsonl};
use snapflow::{
    BatchTransform, ConfigError, ErrorPolicy, EtlConfig, InterruptHandle, OutputTable, PassthroughTransform,
    PipelineBuilder, Task, run_etl,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn record_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, true),
        Field::new("year", DataType::Int64, true),
    ]))
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct BatchId {
    id: u64,
}

/// Emits one row per batch holding the batch index.
struct BatchIdTransform;

impl BatchTransform for BatchIdTransform {
    fn name(&self) -> &str {
        "batch-id"
    }

    fn schema(&self) -> SchemaRef {
        record_schema()
    }

    fn transform(&self, batch_index: usize, _input: &[RecordBatch]) -> Result<Vec<OutputTable>> {
        Ok(vec![OutputTable::from_rows("ids", &[BatchId { id: batch_index as u64 }])?])
    }
}

/// Like [`BatchIdTransform`] but fails on one batch.
struct FailOn(usize);

impl BatchTransform for FailOn {
    fn name(&self) -> &str {
        "fail-on"
    }

    fn schema(&self) -> SchemaRef {
        record_schema()
    }

    fn transform(&self, batch_index: usize, input: &[RecordBatch]) -> Result<Vec<OutputTable>> {
        if batch_index == self.0 {
            bail!("no tables for batch {batch_index}");
        }
        BatchIdTransform.transform(batch_index, input)
    }
}

/// `files` snapshot files of `per_file` records each under `dir`.
fn snapshot(dir: &Path, files: usize, per_file: usize) -> Result<()> {
    for f in 0..files {
        let records: Vec<TestRecord> = (f * per_file..(f + 1) * per_file).map(TestRecord::numbered).collect();
        write_gzip_jsonl(dir, &format!("part_{f:02}"), &records)?;
    }
    Ok(())
}

fn config(in_dir: &Path, out_dir: &Path, batch_size: usize) -> EtlConfig {
    EtlConfig {
        in_dir: in_dir.to_path_buf(),
        out_dir: out_dir.to_path_buf(),
        batch_size,
        extract_parallelism: 2,
        poll_interval_ms: 10,
        progress: false,
        ..EtlConfig::default()
    }
}

fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            out.extend(files_under(&path)?);
        } else {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

#[test]
fn five_files_in_batches_of_two() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (in_dir, out_dir) = (tmp.path().join("in"), tmp.path().join("out"));
    snapshot(&in_dir, 5, 3)?;

    let summary = run_etl(&config(&in_dir, &out_dir, 2), Arc::new(BatchIdTransform), InterruptHandle::new())?;

    assert!(summary.is_success(), "{summary:?}");
    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, vec![0, 1, 2]);

    let parquets = files_under(&out_dir.join("parquets"))?;
    assert_eq!(
        parquets,
        vec![
            out_dir.join("parquets/ids_00000.parquet"),
            out_dir.join("parquets/ids_00001.parquet"),
            out_dir.join("parquets/ids_00002.parquet"),
        ]
    );
    for (i, path) in parquets.iter().enumerate() {
        let rows: Vec<BatchId> = read_parquet_vec(path)?;
        assert_eq!(rows, vec![BatchId { id: i as u64 }]);
    }

    assert!(files_under(&out_dir.join("extract"))?.is_empty(), "extracted files left behind");
    assert!(in_dir.join("part_00.jsonl.gz").exists(), "raw input must be untouched");
    Ok(())
}

#[test]
fn passthrough_keeps_every_record() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (in_dir, out_dir) = (tmp.path().join("in"), tmp.path().join("out"));
    snapshot(&in_dir, 4, 10)?;
    let mut cfg = config(&in_dir, &out_dir, 3);
    cfg.transform.workers = 2;
    cfg.transform.queue_capacity = 1;

    let summary = run_etl(&cfg, Arc::new(PassthroughTransform::new("works", record_schema())), InterruptHandle::new())?;
    assert!(summary.is_success());

    let mut records: Vec<TestRecord> = Vec::new();
    for path in files_under(&out_dir.join("parquets"))? {
        records.extend(read_parquet_vec::<TestRecord>(&path)?);
    }
    records.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(records, (0..40).map(TestRecord::numbered).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn max_batches_limits_the_run() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (in_dir, out_dir) = (tmp.path().join("in"), tmp.path().join("out"));
    snapshot(&in_dir, 6, 1)?;
    let mut cfg = config(&in_dir, &out_dir, 2);
    cfg.max_batches = Some(2);

    let summary = run_etl(&cfg, Arc::new(BatchIdTransform), InterruptHandle::new())?;

    assert_eq!(summary.total, 2);
    assert_eq!(files_under(&out_dir.join("parquets"))?.len(), 2);
    Ok(())
}

#[test]
fn corrupt_input_fails_only_its_batch() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (in_dir, out_dir) = (tmp.path().join("in"), tmp.path().join("out"));
    snapshot(&in_dir, 3, 2)?;
    fs::write(in_dir.join("part_01.jsonl.gz"), b"not gzip at all")?;
    let mut cfg = config(&in_dir, &out_dir, 1);
    cfg.error_policy = ErrorPolicy::SkipBatch;

    let summary = run_etl(&cfg, Arc::new(BatchIdTransform), InterruptHandle::new())?;

    assert_eq!(summary.failed_batches(), vec![1]);
    assert_eq!(summary.failures[0].stage, "extract");
    assert_eq!(summary.completed, vec![0, 2]);
    assert!(!out_dir.join("parquets/ids_00001.parquet").exists());
    Ok(())
}

#[test]
fn failed_batches_leave_no_extracted_files() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (in_dir, out_dir) = (tmp.path().join("in"), tmp.path().join("out"));
    snapshot(&in_dir, 6, 2)?;
    // Batch 1 is [part_02, part_03]; part_02 extracts fine before part_03 fails.
    fs::write(in_dir.join("part_03.jsonl.gz"), b"not gzip at all")?;

    let summary = run_etl(&config(&in_dir, &out_dir, 2), Arc::new(FailOn(0)), InterruptHandle::new())?;

    assert_eq!(summary.failed_batches(), vec![0, 1]);
    assert_eq!(summary.completed, vec![2]);
    assert!(files_under(&out_dir.join("extract"))?.is_empty(), "extracted files left behind");
    assert_eq!(files_under(&out_dir.join("parquets"))?, vec![out_dir.join("parquets/ids_00002.parquet")]);
    Ok(())
}

#[test]
fn rerun_replaces_earlier_output() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (in_dir, out_dir) = (tmp.path().join("in"), tmp.path().join("out"));
    snapshot(&in_dir, 6, 1)?;

    let first = run_etl(&config(&in_dir, &out_dir, 2), Arc::new(BatchIdTransform), InterruptHandle::new())?;
    assert_eq!(files_under(&out_dir.join("parquets"))?.len(), 3);
    assert!(first.is_success());
    fs::write(out_dir.join("extract/leftover.jsonl"), b"{}\n")?;

    let mut cfg = config(&in_dir, &out_dir, 3);
    cfg.max_batches = Some(1);
    let second = run_etl(&cfg, Arc::new(BatchIdTransform), InterruptHandle::new())?;

    assert!(second.is_success());
    let parquets = files_under(&out_dir.join("parquets"))?;
    assert_eq!(parquets, vec![out_dir.join("parquets/ids_00000.parquet")]);
    assert_eq!(read_parquet_vec::<BatchId>(&parquets[0])?, vec![BatchId { id: 0 }]);
    assert!(files_under(&out_dir.join("extract"))?.is_empty());
    Ok(())
}

#[test]
fn missing_input_directory_fails_before_starting() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(&tmp.path().join("nope"), &tmp.path().join("out"), 2);

    let err = run_etl(&cfg, Arc::new(BatchIdTransform), InterruptHandle::new()).unwrap_err();

    assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::NotADirectory(_))));
    assert!(!tmp.path().join("out").exists());
}

#[test]
fn missing_expected_items_are_listed() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path(), &tmp.path().join("out"), 2);
    cfg.expected_items = vec!["works".into(), "members".into()];
    fs::create_dir(tmp.path().join("works")).unwrap();

    let err = run_etl(&cfg, Arc::new(BatchIdTransform), InterruptHandle::new()).unwrap_err();

    match err.downcast_ref::<ConfigError>() {
        Some(ConfigError::MissingItems { missing, .. }) => assert_eq!(missing, &vec!["members".to_string()]),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn cleanup_tolerates_already_removed_files() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let files: Vec<PathBuf> = (0..3).map(|i| tmp.path().join(format!("{i}.jsonl"))).collect();
    for f in &files {
        fs::write(f, b"{}\n")?;
    }

    let mut removed = Vec::new();
    let summary = PipelineBuilder::new(0)
        .stage(CleanupStage, 1, 0)
        .poll_interval(Duration::from_millis(10))
        .build()?
        .run_with(vec![Task::new(0, files.clone()), Task::new(1, files)], |t| removed.push((t.batch_index, t.payload)))?;

    assert!(summary.is_success());
    removed.sort_unstable();
    assert_eq!(removed, vec![(0, 3), (1, 0)]);
    Ok(())
}
