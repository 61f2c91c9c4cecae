//! JSON Lines reading and writing.
//!
//! Snapshot records are newline-delimited JSON, possibly compressed. Two views
//! are offered:
//! - **columnar**: [`read_record_batches`] decodes straight into Arrow
//!   `RecordBatch`es against a declared schema. Fields not in the schema are
//!   ignored, missing nullable fields become null.
//! - **typed**: [`write_jsonl_vec`] serializes through Serde.
//!
//! Compression is detected from the extension or the magic bytes.

use crate::io::compression::{auto_detect_reader, auto_detect_writer};
use anyhow::{Context, Result};
use arrow::datatypes::SchemaRef;
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use serde::Serialize;
use std::fs::{File, create_dir_all};
use std::io::{BufReader, Write};
use std::path::Path;

/// Decode a JSONL file into record batches of at most `batch_size` rows.
///
/// # Errors
/// Fails if the file cannot be opened, a line is not valid JSON, or a value
/// cannot be coerced to its schema type.
pub fn read_record_batches(path: impl AsRef<Path>, schema: SchemaRef, batch_size: usize) -> Result<Vec<RecordBatch>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let rdr = auto_detect_reader(f, path).with_context(|| format!("setup decompression for {}", path.display()))?;
    let reader = ReaderBuilder::new(schema)
        .with_batch_size(batch_size.max(1))
        .build(BufReader::new(rdr))
        .with_context(|| format!("build JSON reader for {}", path.display()))?;

    reader
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("decode JSONL {}", path.display()))
}

/// Write `data` as JSONL, compressing according to the extension. Parent
/// directories are created. Returns the number of records written.
///
/// # Errors
/// Fails on I/O or serialization errors.
pub fn write_jsonl_vec<T: Serialize>(path: impl AsRef<Path>, data: &[T]) -> Result<usize> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = auto_detect_writer(f, path).with_context(|| format!("setup compression for {}", path.display()))?;
    for (i, item) in data.iter().enumerate() {
        serde_json::to_writer(&mut w, item).with_context(|| format!("serialize item #{} to {}", i, path.display()))?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn columnar_read_ignores_unknown_and_nulls_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("works.jsonl.gz");
        write_jsonl_vec(
            &path,
            &[
                json!({"doi": "10.1/a", "year": 2020, "extra": true}),
                json!({"doi": "10.1/b"}),
                json!({"doi": "10.1/c", "year": 2022}),
            ],
        )?;
        let schema = Arc::new(Schema::new(vec![
            Field::new("doi", DataType::Utf8, false),
            Field::new("year", DataType::Int64, true),
        ]));

        let batches = read_record_batches(&path, schema, 2)?;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.iter().map(RecordBatch::num_rows).sum::<usize>(), 3);

        let doi = batches[0].column(0).as_any().downcast_ref::<StringArray>().map(|a| a.value(1).to_string());
        assert_eq!(doi.as_deref(), Some("10.1/b"));
        let year = batches[0].column(1).as_any().downcast_ref::<Int64Array>().map(|a| a.is_null(1));
        assert_eq!(year, Some(true));
        Ok(())
    }
}
