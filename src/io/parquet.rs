//! Parquet tables: atomic writes, footer row counts and projected row streams.
//!
//! - [`write_table`] writes record batches with Snappy compression. The file
//!   is written next to its destination and renamed into place, so a reader
//!   never sees a half-written table.
//! - [`count_rows`] reads only the footer.
//! - [`stream_rows`] yields rows as JSON objects, reading only the requested
//!   columns, one record batch at a time.
//! - [`write_parquet_vec`] / [`read_parquet_vec`] map typed rows through
//!   `serde_arrow`.

use anyhow::{Context, Result, bail};
use arrow::datatypes::{FieldRef, SchemaRef};
use arrow::json::WriterBuilder;
use arrow::json::writer::JsonArray;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_arrow::schema::{SchemaLike, TracingOptions};
use serde_arrow::{from_record_batch, to_record_batch};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fs::{File, create_dir_all};
use std::path::Path;

/// A row decoded from Parquet.
pub type Row = Map<String, Value>;

/// Write `batches` to `path` as one Snappy-compressed Parquet file.
///
/// An empty `batches` still produces a valid zero-row file with `schema`.
/// Returns the number of rows written.
///
/// # Errors
/// Fails if a batch does not match `schema` or on I/O errors. On failure the
/// destination is left untouched.
pub fn write_table(path: impl AsRef<Path>, schema: SchemaRef, batches: &[RecordBatch]) -> Result<usize> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;

    let tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".parquet")
        .tempfile_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    let file = tmp.reopen().context("reopen temp file")?;

    let props = WriterProperties::builder().set_compression(Compression::SNAPPY).build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props)).context("create ArrowWriter")?;
    let mut rows = 0;
    for batch in batches {
        writer.write(batch).context("write batch to parquet")?;
        rows += batch.num_rows();
    }
    writer.close().context("close ArrowWriter")?;

    tmp.persist(path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(rows)
}

/// Write typed rows to a Parquet file, inferring the schema from `T`.
///
/// # Errors
/// Fails if schema tracing, conversion or writing fails.
pub fn write_parquet_vec<T: Serialize + Deserialize<'static>>(path: impl AsRef<Path>, data: &[T]) -> Result<usize> {
    let batch = rows_to_batch(data)?;
    write_table(path, batch.schema(), &[batch])
}

/// Convert typed rows to a single record batch, inferring the schema from `T`.
///
/// # Errors
/// Fails if `T` cannot be traced or a row does not fit the traced schema.
pub fn rows_to_batch<T: Serialize + Deserialize<'static>>(data: &[T]) -> Result<RecordBatch> {
    let fields: Vec<FieldRef> =
        Vec::<FieldRef>::from_type::<T>(TracingOptions::default()).context("infer Arrow schema from type T")?;
    to_record_batch(&fields, &data).context("convert rows to RecordBatch")
}

/// Read a whole Parquet file into typed rows.
///
/// # Errors
/// Fails on I/O errors or if a row does not deserialize into `T`.
pub fn read_parquet_vec<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("open ParquetRecordBatchReader")?
        .with_batch_size(64 * 1024)
        .build()
        .context("build ParquetRecordBatchReader")?;

    let mut out: Vec<T> = Vec::new();
    for batch in reader {
        let batch = batch.context("read next batch")?;
        let mut rows: Vec<T> = from_record_batch(&batch).context("deserialize RecordBatch rows to T")?;
        out.append(&mut rows);
    }
    Ok(out)
}

/// Number of rows in a Parquet file, from its footer.
///
/// # Errors
/// Fails if the file cannot be opened or its metadata is invalid.
pub fn count_rows(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(f).with_context(|| format!("read footer of {}", path.display()))?;
    Ok(u64::try_from(reader.metadata().file_metadata().num_rows()).unwrap_or(0))
}

/// Stream the rows of a Parquet file as JSON objects.
///
/// With `columns`, only those columns are decoded; naming a column the file
/// does not have is an error. Nulls are kept as explicit `null` values.
///
/// # Errors
/// Fails if the file cannot be opened or a requested column is missing.
/// Decoding errors surface per row from the iterator.
pub fn stream_rows(path: impl AsRef<Path>, columns: Option<&[String]>, batch_size: usize) -> Result<ParquetRows> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut builder = ParquetRecordBatchReaderBuilder::try_new(f)
        .with_context(|| format!("open ParquetRecordBatchReader for {}", path.display()))?
        .with_batch_size(batch_size.max(1));

    if let Some(cols) = columns {
        let schema = builder.schema();
        let missing: Vec<&str> =
            cols.iter().map(String::as_str).filter(|c| schema.field_with_name(c).is_err()).collect();
        if !missing.is_empty() {
            bail!("{} has no column(s): {}", path.display(), missing.join(", "));
        }
        let mask = ProjectionMask::columns(builder.parquet_schema(), cols.iter().map(String::as_str));
        builder = builder.with_projection(mask);
    }

    let reader = builder.build().context("build ParquetRecordBatchReader")?;
    Ok(ParquetRows { reader, pending: VecDeque::new() })
}

/// Row iterator returned by [`stream_rows`].
pub struct ParquetRows {
    reader: ParquetRecordBatchReader,
    pending: VecDeque<Row>,
}

impl Iterator for ParquetRows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending.is_empty() {
            let batch = match self.reader.next()? {
                Ok(b) => b,
                Err(e) => return Some(Err(anyhow::Error::new(e).context("read parquet batch"))),
            };
            match batch_to_rows(&batch) {
                Ok(rows) => self.pending.extend(rows),
                Err(e) => return Some(Err(e)),
            }
        }
        self.pending.pop_front().map(Ok)
    }
}

/// Convert a record batch to JSON objects, one per row.
///
/// # Errors
/// Fails for column types Arrow cannot render as JSON.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }
    let mut writer = WriterBuilder::new().with_explicit_nulls(true).build::<_, JsonArray>(Vec::new());
    writer.write(batch).context("encode batch as JSON")?;
    writer.finish().context("finish JSON array")?;
    let buf = writer.into_inner();
    serde_json::from_slice(&buf).context("parse JSON rows")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Work {
        doi: String,
        title: Option<String>,
        year: i64,
    }

    fn works() -> Vec<Work> {
        (0..5)
            .map(|i| Work { doi: format!("10.1/{i}"), title: (i % 2 == 0).then(|| format!("t{i}")), year: 2000 + i })
            .collect()
    }

    #[test]
    fn footer_count_matches_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("works_00000.parquet");
        assert_eq!(write_parquet_vec(&path, &works())?, 5);
        assert_eq!(count_rows(&path)?, 5);
        assert_eq!(read_parquet_vec::<Work>(&path)?, works());
        Ok(())
    }

    #[test]
    fn projection_keeps_only_requested_columns() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("w.parquet");
        write_parquet_vec(&path, &works())?;

        let cols = vec!["doi".to_string(), "title".to_string()];
        let rows: Vec<Row> = stream_rows(&path, Some(&cols), 2)?.collect::<Result<_>>()?;
        assert_eq!(rows.len(), 5);
        assert_eq!(Value::Object(rows[1].clone()), json!({"doi": "10.1/1", "title": null}));
        Ok(())
    }

    #[test]
    fn projection_rejects_unknown_column() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("w.parquet");
        write_parquet_vec(&path, &works())?;
        let cols = vec!["nope".to_string()];
        assert!(stream_rows(&path, Some(&cols), 16).is_err());
        Ok(())
    }

    #[test]
    fn no_partial_files_left_behind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_parquet_vec(dir.path().join("a.parquet"), &works())?;
        let names: Vec<_> = std::fs::read_dir(dir.path())?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        assert_eq!(names, vec!["a.parquet".to_string()]);
        Ok(())
    }
}
