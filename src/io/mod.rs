//! File formats used by the ETL and sync engines.

pub mod compression;
pub mod glob;
pub mod jsonl;
pub mod parquet;
