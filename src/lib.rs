//! # snapflow
//!
//! Staged batch processing for large bibliographic metadata snapshots, and
//! bulk sync of the resulting tables into a document index.
//!
//! ## ETL pipeline
//!
//! Raw snapshot files are partitioned into [`Batch`]es and pushed through a
//! chain of [`Stage`]s, each with its own worker pool, connected by bounded
//! [`Queue`]s:
//!
//! ```text
//! *.jsonl.gz ─▶ extract ─▶ transform ─▶ cleanup
//!               (rayon)    (BatchTransform → Parquet)
//! ```
//!
//! A full queue blocks its producer, so memory and scratch disk stay bounded
//! no matter how far apart the stage speeds are. Shutdown is explicit: the
//! orchestrator sends one [`Message::Shutdown`] per worker and joins every
//! thread, on success, on abort and on interrupt alike.
//!
//! ```no_run
//! use snapflow::{EtlConfig, InterruptHandle, PassthroughTransform, run_etl};
//! use arrow::datatypes::{DataType, Field, Schema};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let schema = Arc::new(Schema::new(vec![Field::new("doi", DataType::Utf8, false)]));
//! let config = EtlConfig { in_dir: "snapshot".into(), out_dir: "out".into(), ..EtlConfig::default() };
//! let summary = run_etl(&config, Arc::new(PassthroughTransform::new("works", schema)), InterruptHandle::new())?;
//! assert!(summary.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! Custom pipelines are assembled with [`PipelineBuilder`] from any types
//! implementing [`Stage`].
//!
//! ## Bulk sync
//!
//! [`SyncEngine`] streams Parquet files through an [`ActionConverter`] into
//! upsert actions, submits them in size-bounded chunks through a
//! [`BulkClient`] and retries transient failures with exponential backoff.
//! Failures are classified and sampled into an [`ErrorMap`].
//!
//! ```no_run
//! use snapflow::{ClientConfig, FieldIdConverter, HttpBulkClient, SyncConfig, SyncEngine};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let client = Arc::new(HttpBulkClient::new(&ClientConfig::default())?);
//! let engine = SyncEngine::new(SyncConfig::default(), client, Arc::new(FieldIdConverter::new("doi")));
//! let summary = engine.sync_dir("works", Path::new("out/parquets"))?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod builtin;
pub mod config;
pub mod error;
pub mod etl;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod stage;
pub mod sync;
pub mod testing;

pub use batch::{Batch, to_batches};
pub use builtin::{FieldIdConverter, PassthroughTransform};
pub use config::{AppConfig, ClientConfig, ErrorPolicy, EtlConfig, SchemaConfig, StageConfig, SyncConfig};
pub use error::{BulkError, ConfigError};
pub use etl::{BatchTransform, OutputTable, run_etl};
pub use logging::{LogConfig, LogFormat, LogLevel, init_logging};
pub use metrics::{PipelineMetrics, StageSnapshot};
pub use pipeline::{InterruptHandle, Pipeline, PipelineBuilder, RunSummary};
pub use queue::{Message, Queue, Task};
pub use stage::{BatchFailure, Stage};
pub use sync::{
    ActionConverter, BulkAction, BulkClient, ErrorMap, FailureClass, HttpBulkClient, SyncEngine, SyncSummary,
};
