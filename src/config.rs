//! Run configuration for the ETL pipeline and the bulk sync engine.
//!
//! Every struct deserializes with `#[serde(default)]`, so a TOML file only
//! needs the keys it wants to change:
//!
//! ```toml
//! [etl]
//! in_dir = "/data/crossref"
//! out_dir = "/data/out"
//! batch_size = 16
//! extract = { workers = 1, queue_capacity = 2 }
//! transform = { workers = 2, queue_capacity = 2 }
//!
//! [sync]
//! workers = 4
//! chunk_size = 500
//!
//! [client]
//! url = "http://localhost:9200"
//! ```
//!
//! Nothing here is checked during deserialization. Call `validate()` before a
//! run starts; it reports the first problem as a [`ConfigError`].

use crate::error::ConfigError;
use crate::logging::LogConfig;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What a stage worker does when its handler fails (or panics) on a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log the failure, report the batch as failed and keep going.
    #[default]
    SkipBatch,
    /// Log the failure and stop the whole pipeline.
    Abort,
}

/// Worker count and input queue capacity of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub workers: usize,
    /// Capacity of the queue feeding this stage. `0` means unbounded.
    pub queue_capacity: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self { workers: 1, queue_capacity: 0 }
    }
}

impl StageConfig {
    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero { field });
        }
        Ok(())
    }
}

/// Configuration of the extract → transform → cleanup pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    /// Glob, relative to `in_dir`, selecting the raw input files.
    pub file_glob: String,
    /// Items that must exist directly under `in_dir` (pre-flight layout check).
    pub expected_items: Vec<String>,
    pub batch_size: usize,
    pub extract: StageConfig,
    pub transform: StageConfig,
    pub cleanup: StageConfig,
    /// Threads each extraction worker uses to decompress the files of one batch.
    pub extract_parallelism: usize,
    /// Process only the first N batches.
    pub max_batches: Option<usize>,
    /// Scan JSON in record batches of 1024 rows instead of 65536. This only
    /// bounds the reader's buffers: a batch is still handed to the transform
    /// as a whole.
    pub low_memory: bool,
    pub error_policy: ErrorPolicy,
    /// How often blocked workers and the orchestrator wake up to check for shutdown.
    pub poll_interval_ms: u64,
    pub progress: bool,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            in_dir: PathBuf::new(),
            out_dir: PathBuf::new(),
            file_glob: "**/*.gz".to_string(),
            expected_items: Vec::new(),
            batch_size: num_cpus::get(),
            extract: StageConfig::default(),
            transform: StageConfig::default(),
            cleanup: StageConfig::default(),
            extract_parallelism: num_cpus::get(),
            max_batches: None,
            low_memory: false,
            error_policy: ErrorPolicy::SkipBatch,
            poll_interval_ms: 1000,
            progress: true,
        }
    }
}

impl EtlConfig {
    /// # Errors
    /// Returns the first invalid option or a missing/ill-formed input directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch_size" });
        }
        if self.extract_parallelism == 0 {
            return Err(ConfigError::Zero { field: "extract_parallelism" });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero { field: "poll_interval_ms" });
        }
        if self.max_batches == Some(0) {
            return Err(ConfigError::Zero { field: "max_batches" });
        }
        self.extract.validate("extract.workers")?;
        self.transform.validate("transform.workers")?;
        self.cleanup.validate("cleanup.workers")?;
        if self.file_glob.trim().is_empty() {
            return Err(ConfigError::OutOfRange {
                field: "file_glob",
                reason: "pattern is empty".into(),
            });
        }
        for sub in ["parquets", "extract"] {
            let cleared = self.out_dir.join(sub);
            if self.in_dir.starts_with(&cleared) {
                return Err(ConfigError::OutOfRange {
                    field: "in_dir",
                    reason: format!("inside {}, which is emptied at the start of a run", cleared.display()),
                });
            }
        }
        validate_directory(&self.in_dir, &self.expected_items)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration of the bulk sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub workers: usize,
    /// Actions per bulk request.
    pub chunk_size: usize,
    /// Parquet rows decoded per read.
    pub read_batch_rows: usize,
    pub max_chunk_bytes: usize,
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Samples kept per failure class by each worker.
    pub max_error_samples: usize,
    pub staggered_start: bool,
    pub stagger_delay_secs: u64,
    pub dry_run: bool,
    pub measure_chunk_size: bool,
    pub poll_interval_ms: u64,
    pub progress: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            chunk_size: 1000,
            read_batch_rows: 1024,
            max_chunk_bytes: 100 * 1024 * 1024,
            max_retries: 10,
            initial_backoff_secs: 2,
            max_backoff_secs: 600,
            max_error_samples: 10,
            staggered_start: false,
            stagger_delay_secs: 60,
            dry_run: false,
            measure_chunk_size: false,
            poll_interval_ms: 1000,
            progress: true,
        }
    }
}

impl SyncConfig {
    /// # Errors
    /// Returns the first invalid option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero { field: "workers" });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Zero { field: "chunk_size" });
        }
        if self.read_batch_rows == 0 {
            return Err(ConfigError::Zero { field: "read_batch_rows" });
        }
        if self.max_chunk_bytes == 0 {
            return Err(ConfigError::Zero { field: "max_chunk_bytes" });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero { field: "poll_interval_ms" });
        }
        if self.initial_backoff_secs > self.max_backoff_secs {
            return Err(ConfigError::OutOfRange {
                field: "initial_backoff_secs",
                reason: format!(
                    "{} exceeds max_backoff_secs {}",
                    self.initial_backoff_secs, self.max_backoff_secs
                ),
            });
        }
        if self.dry_run && self.measure_chunk_size {
            return Err(ConfigError::OutOfRange {
                field: "dry_run",
                reason: "dry_run and measure_chunk_size are mutually exclusive".into(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    #[must_use]
    pub fn stagger_delay(&self) -> Duration {
        Duration::from_secs(self.stagger_delay_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Connection settings of the document-index service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    /// Gzip request bodies.
    pub http_compress: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            timeout_secs: 5 * 60,
            http_compress: true,
        }
    }
}

impl ClientConfig {
    /// # Errors
    /// Returns an error for an empty URL or a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::OutOfRange {
                field: "url",
                reason: format!("'{}' is not an http(s) URL", self.url),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Zero { field: "timeout_secs" });
        }
        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One declared field of an input schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// Declared schema used to coerce JSON records while scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub fields: Vec<FieldConfig>,
}

impl SchemaConfig {
    /// Build the Arrow schema.
    ///
    /// # Errors
    /// Returns [`ConfigError::UnsupportedType`] for an unknown type name.
    pub fn to_arrow(&self) -> Result<SchemaRef, ConfigError> {
        let fields = self
            .fields
            .iter()
            .map(|f| Ok(Field::new(&f.name, parse_data_type(&f.name, &f.data_type)?, f.nullable)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Arc::new(Schema::new(fields)))
    }
}

fn parse_data_type(field: &str, name: &str) -> Result<DataType, ConfigError> {
    let dt = match name.trim().to_lowercase().as_str() {
        "utf8" | "string" => DataType::Utf8,
        "int64" | "integer" => DataType::Int64,
        "float64" | "double" => DataType::Float64,
        "boolean" | "bool" => DataType::Boolean,
        "date32" | "date" => DataType::Date32,
        "timestamp" => DataType::Timestamp(TimeUnit::Millisecond, None),
        "list<utf8>" | "list<string>" => {
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)))
        }
        _ => {
            return Err(ConfigError::UnsupportedType {
                field: field.to_string(),
                data_type: name.to_string(),
            });
        }
    };
    Ok(dt)
}

/// Everything the CLI reads from its configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub etl: EtlConfig,
    pub schema: SchemaConfig,
    pub sync: SyncConfig,
    pub client: ClientConfig,
}

impl AppConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns [`ConfigError::File`] if the file cannot be read or parsed.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Check that `path` is a directory containing every name in `expected_items`.
///
/// # Errors
/// [`ConfigError::NotADirectory`] or [`ConfigError::MissingItems`].
pub fn validate_directory(path: &Path, expected_items: &[String]) -> Result<(), ConfigError> {
    if !path.is_dir() {
        return Err(ConfigError::NotADirectory(path.to_path_buf()));
    }
    let missing: Vec<String> = expected_items
        .iter()
        .filter(|item| !path.join(item.as_str()).exists())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ConfigError::MissingItems { path: path.to_path_buf(), missing });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_backoff() {
        let cfg = SyncConfig { initial_backoff_secs: 30, max_backoff_secs: 5, ..SyncConfig::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "initial_backoff_secs", .. })
        ));
    }

    #[test]
    fn etl_requires_existing_directory() {
        let cfg = EtlConfig { in_dir: PathBuf::from("/definitely/not/here"), ..EtlConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NotADirectory(_))));
    }

    #[test]
    fn input_must_not_live_in_a_cleared_output_dir() {
        let cfg = EtlConfig {
            in_dir: PathBuf::from("/data/out/extract/works"),
            out_dir: PathBuf::from("/data/out"),
            ..EtlConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { field: "in_dir", .. })));
    }

    #[test]
    fn schema_from_toml() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [[schema.fields]]
            name = "doi"
            type = "utf8"
            nullable = false

            [[schema.fields]]
            name = "authors"
            type = "list<utf8>"
            "#,
        )
        .unwrap();
        let schema = cfg.schema.to_arrow().unwrap();
        assert_eq!(schema.fields().len(), 2);
        assert!(!schema.field(0).is_nullable());
        assert!(matches!(schema.field(1).data_type(), DataType::List(_)));
    }

    #[test]
    fn unknown_schema_type_is_rejected() {
        let schema = SchemaConfig {
            fields: vec![FieldConfig { name: "x".into(), data_type: "decimal".into(), nullable: true }],
        };
        assert!(matches!(schema.to_arrow(), Err(ConfigError::UnsupportedType { .. })));
    }
}
