//! Bulk actions and size-bounded chunks.
//!
//! Every document is sent as an upsert:
//!
//! ```text
//! {"update":{"_index":"works","_id":"10.1/abc"}}
//! {"doc":{...},"doc_as_upsert":true}
//! ```
//!
//! Replaying the same action leaves the index in the same state, which is what
//! makes whole-chunk retries safe.

use crate::io::parquet::Row;
use anyhow::Result;
use serde_json::{Map, Value, json};
use std::io::Write;

/// One upsert addressed by a stable document id.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkAction {
    pub index: String,
    pub id: String,
    pub doc: Map<String, Value>,
}

impl BulkAction {
    #[must_use]
    pub fn upsert(index: impl Into<String>, id: impl Into<String>, doc: Map<String, Value>) -> Self {
        Self { index: index.into(), id: id.into(), doc }
    }

    /// Append the two NDJSON lines of this action to `out`.
    ///
    /// # Errors
    /// Only if a document value cannot be serialized.
    pub fn write_ndjson(&self, out: &mut Vec<u8>) -> serde_json::Result<()> {
        serde_json::to_writer(&mut *out, &json!({"update": {"_index": self.index, "_id": self.id}}))?;
        out.push(b'\n');
        serde_json::to_writer(&mut *out, &json!({"doc": self.doc, "doc_as_upsert": true}))?;
        out.push(b'\n');
        Ok(())
    }
}

/// Turns rows read from Parquet into bulk actions.
pub trait ActionConverter: Send + Sync {
    /// Columns the converter reads. `None` reads every column.
    fn columns(&self) -> Option<Vec<String>> {
        None
    }

    /// # Errors
    /// A row that cannot be converted is counted as a conversion failure.
    fn to_action(&self, index: &str, row: Row) -> Result<BulkAction>;
}

/// A group of actions submitted in one request, with its encoded body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chunk {
    actions: Vec<BulkAction>,
    body: Vec<u8>,
}

impl Chunk {
    /// # Errors
    /// If an action cannot be serialized.
    pub fn from_actions(actions: Vec<BulkAction>) -> serde_json::Result<Self> {
        let mut body = Vec::new();
        for a in &actions {
            a.write_ndjson(&mut body)?;
        }
        Ok(Self { actions, body })
    }

    #[must_use]
    pub fn actions(&self) -> &[BulkAction] {
        &self.actions
    }

    /// NDJSON request body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.body.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(crate) fn into_actions(self) -> Vec<BulkAction> {
        self.actions
    }
}

/// Accumulates actions into chunks of at most `max_actions` actions and
/// `max_bytes` encoded bytes. An action larger than `max_bytes` on its own is
/// sent alone.
pub struct ChunkBuilder {
    max_actions: usize,
    max_bytes: usize,
    actions: Vec<BulkAction>,
    body: Vec<u8>,
    scratch: Vec<u8>,
}

impl ChunkBuilder {
    #[must_use]
    pub fn new(max_actions: usize, max_bytes: usize) -> Self {
        Self {
            max_actions: max_actions.max(1),
            max_bytes: max_bytes.max(1),
            actions: Vec::new(),
            body: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Add an action, returning the previous chunk if this one did not fit.
    ///
    /// # Errors
    /// If the action cannot be serialized; the builder is left unchanged.
    pub fn push(&mut self, action: BulkAction) -> serde_json::Result<Option<Chunk>> {
        self.scratch.clear();
        action.write_ndjson(&mut self.scratch)?;
        let full = !self.actions.is_empty()
            && (self.actions.len() >= self.max_actions || self.body.len() + self.scratch.len() > self.max_bytes);
        let flushed = full.then(|| self.take());
        // Infallible on a Vec.
        let _ = self.body.write_all(&self.scratch);
        self.actions.push(action);
        Ok(flushed)
    }

    /// Whatever is pending, if anything.
    pub fn finish(&mut self) -> Option<Chunk> {
        (!self.actions.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> Chunk {
        Chunk { actions: std::mem::take(&mut self.actions), body: std::mem::take(&mut self.body) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(i: usize) -> BulkAction {
        let mut doc = Map::new();
        doc.insert("n".into(), json!(i));
        BulkAction::upsert("works", i.to_string(), doc)
    }

    #[test]
    fn ndjson_shape() -> serde_json::Result<()> {
        let mut out = Vec::new();
        action(7).write_ndjson(&mut out)?;
        let text = String::from_utf8_lossy(&out);
        let lines: Vec<Value> = text.lines().map(serde_json::from_str).collect::<Result<_, _>>()?;
        assert_eq!(lines[0], json!({"update": {"_index": "works", "_id": "7"}}));
        assert_eq!(lines[1], json!({"doc": {"n": 7}, "doc_as_upsert": true}));
        Ok(())
    }

    #[test]
    fn chunks_by_count() -> serde_json::Result<()> {
        let mut b = ChunkBuilder::new(10, usize::MAX);
        let mut sizes = Vec::new();
        for i in 0..25 {
            if let Some(c) = b.push(action(i))? {
                sizes.push(c.len());
            }
        }
        sizes.extend(b.finish().map(|c| c.len()));
        assert_eq!(sizes, vec![10, 10, 5]);
        Ok(())
    }

    #[test]
    fn chunks_by_bytes() -> serde_json::Result<()> {
        let one = Chunk::from_actions(vec![action(1)])?.byte_len();
        let mut b = ChunkBuilder::new(100, one * 2);
        let mut chunks = Vec::new();
        for i in 1..6 {
            chunks.extend(b.push(action(i))?);
        }
        chunks.extend(b.finish());
        assert!(chunks.iter().all(|c| c.byte_len() <= one * 2));
        assert_eq!(chunks.iter().map(Chunk::len).sum::<usize>(), 5);
        Ok(())
    }

    #[test]
    fn body_matches_fresh_encoding() -> serde_json::Result<()> {
        let mut b = ChunkBuilder::new(3, usize::MAX);
        for i in 0..3 {
            assert!(b.push(action(i))?.is_none());
        }
        let chunk = b.finish().unwrap_or_default();
        assert_eq!(chunk, Chunk::from_actions((0..3).map(action).collect())?);
        Ok(())
    }
}
