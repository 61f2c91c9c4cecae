//! Test doubles and fixtures for pipelines and bulk syncs.
//!
//! - [`InMemoryIndex`] is a [`BulkClient`] that applies upserts to a map,
//!   records the size of every request and can be scripted to reject
//!   documents or whole requests.
//! - The fixture writers lay down compressed JSONL snapshots and Parquet
//!   tables in a scratch directory.
//!
//! ```
//! use snapflow::testing::InMemoryIndex;
//!
//! let index = InMemoryIndex::new();
//! index.fail_document("10.1/bad", 409);
//! assert!(index.documents("works").is_empty());
//! ```

use crate::error::BulkError;
use crate::io::jsonl::write_jsonl_vec;
use crate::io::parquet::write_parquet_vec;
use crate::sync::action::Chunk;
use crate::sync::client::{BulkClient, BulkResponse, ItemResult};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Doc = Map<String, Value>;

#[derive(Default)]
struct IndexState {
    docs: HashMap<(String, String), Doc>,
    chunk_lengths: Vec<usize>,
    /// Per-document status and how many more times to return it (`None` = always).
    scripted: HashMap<String, (u16, Option<u32>)>,
    request_failures: VecDeque<BulkError>,
}

/// An in-memory document index with `update` + `doc_as_upsert` semantics.
#[derive(Default)]
pub struct InMemoryIndex {
    state: Mutex<IndexState>,
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject document `id` with `status` on every attempt.
    pub fn fail_document(&self, id: impl Into<String>, status: u16) {
        self.lock().scripted.insert(id.into(), (status, None));
    }

    /// Reject document `id` with `status` for the next `times` attempts, then accept it.
    pub fn fail_document_times(&self, id: impl Into<String>, status: u16, times: u32) {
        self.lock().scripted.insert(id.into(), (status, Some(times)));
    }

    /// Fail the next request as a whole with `error`.
    pub fn fail_next_request(&self, error: BulkError) {
        self.lock().request_failures.push_back(error);
    }

    /// Documents of `index`, ordered by id.
    #[must_use]
    pub fn documents(&self, index: &str) -> BTreeMap<String, Doc> {
        self.lock()
            .docs
            .iter()
            .filter(|((i, _), _)| i == index)
            .map(|((_, id), doc)| (id.clone(), doc.clone()))
            .collect()
    }

    #[must_use]
    pub fn document(&self, index: &str, id: &str) -> Option<Doc> {
        self.lock().docs.get(&(index.to_string(), id.to_string())).cloned()
    }

    /// Number of actions in every request received, in arrival order.
    #[must_use]
    pub fn chunk_lengths(&self) -> Vec<usize> {
        self.lock().chunk_lengths.clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.lock().chunk_lengths.len()
    }
}

impl BulkClient for InMemoryIndex {
    fn bulk(&self, chunk: &Chunk) -> Result<BulkResponse, BulkError> {
        let mut state = self.lock();
        state.chunk_lengths.push(chunk.len());
        if let Some(err) = state.request_failures.pop_front() {
            return Err(err);
        }

        let mut items = Vec::with_capacity(chunk.len());
        for action in chunk.actions() {
            if let Some((status, remaining)) = state.scripted.get_mut(&action.id) {
                let status = *status;
                let exhausted = match remaining {
                    Some(0) => true,
                    Some(n) => {
                        *n -= 1;
                        false
                    }
                    None => false,
                };
                if !exhausted {
                    items.push(ItemResult {
                        id: action.id.clone(),
                        status,
                        error: Some(json!({"type": format!("scripted_{status}"), "reason": "scripted failure"})),
                    });
                    continue;
                }
            }
            let doc = state.docs.entry((action.index.clone(), action.id.clone())).or_default();
            for (k, v) in &action.doc {
                doc.insert(k.clone(), v.clone());
            }
            items.push(ItemResult::ok(action.id.clone()));
        }
        Ok(BulkResponse { items })
    }
}

/// A small record used by the fixture writers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub title: String,
    pub year: i64,
}

impl TestRecord {
    #[must_use]
    pub fn numbered(n: usize) -> Self {
        Self { id: format!("doc-{n:04}"), title: format!("Title {n}"), year: 2000 + (n % 25) as i64 }
    }
}

/// Write `records` as gzip-compressed JSONL to `dir/name.jsonl.gz`.
///
/// # Errors
/// On I/O failure.
pub fn write_gzip_jsonl<T: Serialize>(dir: &Path, name: &str, records: &[T]) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.jsonl.gz"));
    write_jsonl_vec(&path, records)?;
    Ok(path)
}

/// Write `count` numbered records to `dir/name.parquet`, starting at `first`.
///
/// # Errors
/// On I/O failure.
pub fn write_numbered_parquet(dir: &Path, name: &str, first: usize, count: usize) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.parquet"));
    let rows: Vec<TestRecord> = (first..first + count).map(TestRecord::numbered).collect();
    write_parquet_vec(&path, &rows)?;
    Ok(path)
}
