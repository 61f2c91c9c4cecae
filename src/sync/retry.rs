//! Chunk submission with bounded exponential backoff.
//!
//! A chunk is retried as a whole when the request fails transiently
//! (transport error, timeout, HTTP 429/5xx). When the request succeeds but
//! some documents are rejected with 429/5xx, only those documents are resent.
//! Every other rejection is final. Before retry `n` (1-based) the worker
//! sleeps `initial_backoff * 2^(n-1)`, capped at `max_backoff`.

use crate::config::SyncConfig;
use crate::error::{BulkError, is_transient_status};
use crate::pipeline::InterruptHandle;
use crate::sync::action::{BulkAction, Chunk};
use crate::sync::client::BulkClient;
use crate::sync::errors::{ErrorSample, FailureClass};
use serde_json::{Value, json};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay before retry number `attempt` (starting at 1).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.checked_mul(factor).map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// A document that ended in a final failure.
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    pub class: FailureClass,
    pub sample: ErrorSample,
}

/// What happened to the documents of one chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkOutcome {
    pub acknowledged: u64,
    pub failures: Vec<Failure>,
    /// Retries performed, whole-chunk and partial.
    pub retries: u32,
}

/// Submit `chunk`, retrying per the policy. Every action ends up either
/// acknowledged or in `failures`.
///
/// An interrupt during a backoff sleep stops retrying; the documents still
/// pending are reported as transport failures.
pub fn submit_chunk(
    client: &dyn BulkClient,
    chunk: Chunk,
    policy: &RetryPolicy,
    interrupt: &InterruptHandle,
) -> ChunkOutcome {
    let mut outcome = ChunkOutcome::default();
    let mut pending = chunk;

    loop {
        let attempt = outcome.retries;
        let response = client.bulk(&pending).and_then(|r| {
            if r.items.len() == pending.len() {
                Ok(r)
            } else {
                Err(BulkError::Decode(format!("expected {} items, got {}", pending.len(), r.items.len())))
            }
        });

        let retry: Vec<BulkAction> = match response {
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                warn!(attempt = attempt + 1, max = policy.max_retries, actions = pending.len(), error = %e, "bulk request failed, retrying");
                pending.into_actions()
            }
            Err(e) => {
                warn!(actions = pending.len(), error = %e, "bulk request failed permanently");
                let detail = json!(e.to_string());
                fail_all(&mut outcome, pending.into_actions(), e.class(), &detail);
                return outcome;
            }
            Ok(resp) => {
                let mut retry = Vec::new();
                for (action, item) in pending.into_actions().into_iter().zip(resp.items) {
                    if item.is_success() {
                        outcome.acknowledged += 1;
                    } else if is_transient_status(item.status) && attempt < policy.max_retries {
                        retry.push(action);
                    } else {
                        outcome.failures.push(Failure {
                            class: FailureClass::Status(item.status),
                            sample: ErrorSample { doc_id: action.id, detail: item.error.unwrap_or(Value::Null) },
                        });
                    }
                }
                if retry.is_empty() {
                    return outcome;
                }
                debug!(attempt = attempt + 1, documents = retry.len(), "retrying rejected documents");
                retry
            }
        };

        outcome.retries += 1;
        if !sleep_unless_interrupted(policy.backoff(outcome.retries), interrupt) {
            fail_all(&mut outcome, retry, FailureClass::Transport, &json!("interrupted before retry"));
            return outcome;
        }
        let ids: Vec<String> = retry.iter().map(|a| a.id.clone()).collect();
        pending = match Chunk::from_actions(retry) {
            Ok(c) => c,
            Err(e) => {
                let detail = json!(e.to_string());
                for doc_id in ids {
                    outcome.failures.push(Failure {
                        class: FailureClass::Conversion,
                        sample: ErrorSample { doc_id, detail: detail.clone() },
                    });
                }
                return outcome;
            }
        };
    }
}

fn fail_all(outcome: &mut ChunkOutcome, actions: Vec<BulkAction>, class: FailureClass, detail: &Value) {
    outcome.failures.extend(
        actions
            .into_iter()
            .map(|a| Failure { class, sample: ErrorSample { doc_id: a.id, detail: detail.clone() } }),
    );
}

/// Sleep for `total`, returning `false` early if `interrupt` fires.
pub(crate) fn sleep_unless_interrupted(total: Duration, interrupt: &InterruptHandle) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if interrupt.is_triggered() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
