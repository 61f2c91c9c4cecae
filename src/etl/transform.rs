//! Transformation: scan extracted JSONL against a schema, run the pluggable
//! [`BatchTransform`], and write its tables as Parquet.

use crate::etl::cleanup::remove_all;
use crate::io::jsonl::read_record_batches;
use crate::io::parquet::{rows_to_batch, write_table};
use crate::stage::Stage;
use anyhow::{Context, Result, bail};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const READ_BATCH_ROWS: usize = 64 * 1024;
const LOW_MEMORY_READ_BATCH_ROWS: usize = 1024;

/// A named table produced by a transform for one batch.
///
/// Written to `{out_dir}/parquets/{name}_{batch_index:05}.parquet`.
#[derive(Clone, Debug)]
pub struct OutputTable {
    pub name: String,
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl OutputTable {
    #[must_use]
    pub fn new(name: impl Into<String>, schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { name: name.into(), schema, batches }
    }

    /// Build a table from serde rows, tracing the schema from `T`.
    ///
    /// # Errors
    /// Fails if `T` cannot be mapped to Arrow.
    pub fn from_rows<T: Serialize + Deserialize<'static>>(name: impl Into<String>, rows: &[T]) -> Result<Self> {
        let batch = rows_to_batch(rows)?;
        Ok(Self { name: name.into(), schema: batch.schema(), batches: vec![batch] })
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// Source-specific mapping from scanned records to output tables.
pub trait BatchTransform: Send + Sync {
    fn name(&self) -> &str;

    /// Schema the extracted JSONL is coerced to while scanning.
    fn schema(&self) -> SchemaRef;

    /// Map every record of batch `batch_index` to zero or more tables.
    ///
    /// # Errors
    /// Any error fails the batch.
    fn transform(&self, batch_index: usize, input: &[RecordBatch]) -> Result<Vec<OutputTable>>;
}

pub struct TransformStage {
    transform: Arc<dyn BatchTransform>,
    parquet_dir: PathBuf,
    read_rows: usize,
}

impl TransformStage {
    #[must_use]
    pub fn new(transform: Arc<dyn BatchTransform>, out_dir: impl AsRef<Path>, low_memory: bool) -> Self {
        Self {
            transform,
            parquet_dir: out_dir.as_ref().join("parquets"),
            read_rows: if low_memory { LOW_MEMORY_READ_BATCH_ROWS } else { READ_BATCH_ROWS },
        }
    }

    fn write_tables(&self, batch_index: usize, files: &[PathBuf]) -> Result<()> {
        let schema = self.transform.schema();
        let mut input = Vec::new();
        for file in files {
            input.extend(read_record_batches(file, Arc::clone(&schema), self.read_rows)?);
        }
        let rows: usize = input.iter().map(RecordBatch::num_rows).sum();
        debug!(batch = batch_index, files = files.len(), rows, transform = self.transform.name(), "scanned");

        let tables = self
            .transform
            .transform(batch_index, &input)
            .with_context(|| format!("transform '{}' failed on batch {batch_index}", self.transform.name()))?;

        for table in tables {
            if table.name.is_empty() || table.name.contains(['/', '\\']) {
                bail!("invalid output table name '{}'", table.name);
            }
            let path = self.table_path(&table.name, batch_index);
            let written = write_table(&path, Arc::clone(&table.schema), &table.batches)?;
            debug!(batch = batch_index, table = %table.name, rows = written, path = %path.display(), "wrote table");
        }
        Ok(())
    }

    /// Output path of table `name` for batch `batch_index`.
    #[must_use]
    pub fn table_path(&self, name: &str, batch_index: usize) -> PathBuf {
        self.parquet_dir.join(format!("{name}_{batch_index:05}.parquet"))
    }
}

impl Stage for TransformStage {
    type Input = Vec<PathBuf>;
    /// The extracted files, handed on for cleanup.
    type Output = Vec<PathBuf>;
    type Worker = ();

    fn name(&self) -> &str {
        "transform"
    }

    fn open(&self, _worker_id: usize) -> Result<()> {
        Ok(())
    }

    fn handle(&self, _: &mut (), batch_index: usize, files: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
        match self.write_tables(batch_index, &files) {
            Ok(()) => Ok(files),
            Err(e) => {
                // A failed batch never reaches cleanup.
                remove_all(&files);
                Err(e)
            }
        }
    }
}
