//! Ready-made transform and converter used by the command-line tool.

use crate::etl::{BatchTransform, OutputTable};
use crate::io::parquet::Row;
use crate::sync::action::{ActionConverter, BulkAction};
use anyhow::{Result, bail};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde_json::Value;

/// Writes the scanned records unchanged as a single table.
pub struct PassthroughTransform {
    table: String,
    schema: SchemaRef,
}

impl PassthroughTransform {
    #[must_use]
    pub fn new(table: impl Into<String>, schema: SchemaRef) -> Self {
        Self { table: table.into(), schema }
    }
}

impl BatchTransform for PassthroughTransform {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn transform(&self, _batch_index: usize, input: &[RecordBatch]) -> Result<Vec<OutputTable>> {
        Ok(vec![OutputTable::new(&self.table, self.schema.clone(), input.to_vec())])
    }
}

/// Uses one column as the document id and the whole row as the document.
pub struct FieldIdConverter {
    id_field: String,
    columns: Option<Vec<String>>,
}

impl FieldIdConverter {
    #[must_use]
    pub fn new(id_field: impl Into<String>) -> Self {
        Self { id_field: id_field.into(), columns: None }
    }

    /// Read only `columns` (the id column is added if missing).
    #[must_use]
    pub fn with_columns(mut self, mut columns: Vec<String>) -> Self {
        if !columns.contains(&self.id_field) {
            columns.push(self.id_field.clone());
        }
        self.columns = Some(columns);
        self
    }
}

impl ActionConverter for FieldIdConverter {
    fn columns(&self) -> Option<Vec<String>> {
        self.columns.clone()
    }

    fn to_action(&self, index: &str, row: Row) -> Result<BulkAction> {
        let id = match row.get(&self.id_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Null | Value::String(_)) | None => bail!("row has no '{}' value", self.id_field),
            Some(other) => bail!("'{}' is not a scalar id: {other}", self.id_field),
        };
        Ok(BulkAction::upsert(index, id, row))
    }
}
