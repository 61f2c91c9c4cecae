//! Submitting chunks to the index service.

use crate::config::ClientConfig;
use crate::error::BulkError;
use crate::sync::action::Chunk;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde_json::Value;
use std::io::Write;
use tracing::trace;

/// Per-document verdict, in request order.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemResult {
    pub id: String,
    pub status: u16,
    pub error: Option<Value>,
}

impl ItemResult {
    #[must_use]
    pub fn ok(id: impl Into<String>) -> Self {
        Self { id: id.into(), status: 200, error: None }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BulkResponse {
    pub items: Vec<ItemResult>,
}

/// Anything that accepts bulk requests.
pub trait BulkClient: Send + Sync {
    /// Submit one chunk.
    ///
    /// # Errors
    /// When the request as a whole failed. Per-document failures are reported
    /// in the response items instead; `items` has one entry per action.
    fn bulk(&self, chunk: &Chunk) -> Result<BulkResponse, BulkError>;
}

/// [`BulkClient`] talking to a `_bulk` HTTP endpoint.
pub struct HttpBulkClient {
    http: Client,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
    compress: bool,
}

impl HttpBulkClient {
    /// # Errors
    /// If the HTTP client cannot be constructed.
    pub fn new(config: &ClientConfig) -> Result<Self, BulkError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| BulkError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/_bulk", config.url.trim_end_matches('/')),
            username: config.username.clone(),
            password: config.password.clone(),
            compress: config.http_compress,
        })
    }

    fn encode_body(&self, chunk: &Chunk) -> Result<Vec<u8>, BulkError> {
        if !self.compress {
            return Ok(chunk.body().to_vec());
        }
        let mut enc = GzEncoder::new(Vec::with_capacity(chunk.byte_len() / 4), Compression::fast());
        enc.write_all(chunk.body())
            .and_then(|()| enc.finish())
            .map_err(|e| BulkError::Transport(format!("gzip request body: {e}")))
    }
}

impl BulkClient for HttpBulkClient {
    fn bulk(&self, chunk: &Chunk) -> Result<BulkResponse, BulkError> {
        let body = self.encode_body(chunk)?;
        let mut request = self.http.post(&self.endpoint).header(CONTENT_TYPE, "application/x-ndjson");
        if self.compress {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(ref username) = self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        trace!(actions = chunk.len(), bytes = body.len(), "sending bulk request");
        let response = request.body(body).send().map_err(transport_error)?;
        let status = response.status();
        let text = response.text().map_err(transport_error)?;
        if !status.is_success() {
            return Err(BulkError::Http { status: status.as_u16(), body: text });
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|e| BulkError::Decode(e.to_string()))?;
        let response = parse_response(&parsed)?;
        if response.items.len() != chunk.len() {
            return Err(BulkError::Decode(format!(
                "expected {} items, got {}",
                chunk.len(),
                response.items.len()
            )));
        }
        Ok(response)
    }
}

fn transport_error(e: reqwest::Error) -> BulkError {
    if e.is_timeout() { BulkError::Timeout } else { BulkError::Transport(e.to_string()) }
}

/// Parse a `_bulk` response body into per-item results.
///
/// # Errors
/// If the body has no `items` array or an item lacks a status.
pub fn parse_response(body: &Value) -> Result<BulkResponse, BulkError> {
    let items = body
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| BulkError::Decode("response has no items array".into()))?;

    items
        .iter()
        .map(|item| {
            // Each item is keyed by its operation: {"update": {...}}.
            let inner = item
                .as_object()
                .and_then(|o| o.values().next())
                .ok_or_else(|| BulkError::Decode(format!("unexpected item {item}")))?;
            let status = inner
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .ok_or_else(|| BulkError::Decode(format!("item without status {item}")))?;
            let id = inner.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
            Ok(ItemResult { id, status, error: inner.get("error").cloned() })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|items| BulkResponse { items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_mixed_items() -> Result<(), BulkError> {
        let body = json!({
            "took": 3,
            "errors": true,
            "items": [
                {"update": {"_index": "w", "_id": "a", "status": 200, "result": "updated"}},
                {"update": {"_index": "w", "_id": "b", "status": 409,
                    "error": {"type": "version_conflict_engine_exception"}}}
            ]
        });
        let r = parse_response(&body)?;
        assert_eq!(r.items.len(), 2);
        assert!(r.items[0].is_success());
        assert_eq!(r.items[1].status, 409);
        assert_eq!(r.items[1].error, Some(json!({"type": "version_conflict_engine_exception"})));
        Ok(())
    }

    #[test]
    fn missing_items_is_a_decode_error() {
        assert!(matches!(parse_response(&json!({"took": 1})), Err(BulkError::Decode(_))));
    }

    #[test]
    fn endpoint_strips_trailing_slash() -> Result<(), BulkError> {
        let cfg = ClientConfig { url: "http://search:9200/".into(), ..ClientConfig::default() };
        assert_eq!(HttpBulkClient::new(&cfg)?.endpoint, "http://search:9200/_bulk");
        Ok(())
    }
}
