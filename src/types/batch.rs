//! Batch result types.

use serde::{Deserialize, Serialize};

use super::response::{CompletionResponse, FinishReason};

/// Outcome of one sub-request within a batch, tagged with its original
/// submission index.
///
/// On failure the `response` field carries a placeholder payload (empty
/// content, `finish_reason = error`) so that `responses` always has one
/// entry per submitted sub-request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub index: usize,
    pub response: CompletionResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    /// A successful sub-request outcome.
    pub(crate) fn ok(index: usize, response: CompletionResponse) -> Self {
        Self {
            index,
            response,
            error: None,
        }
    }

    /// A failed sub-request outcome with a placeholder payload.
    pub(crate) fn failed(index: usize, message: String) -> Self {
        Self {
            index,
            response: CompletionResponse {
                finish_reason: FinishReason::Error,
                ..CompletionResponse::default()
            },
            error: Some(message),
        }
    }

    /// Whether this sub-request completed successfully.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a fail-soft batch operation.
///
/// Invariants: `responses.len()` equals the number of submitted
/// sub-requests, ordered by original submission index;
/// `success_count + failure_count == responses.len()`; `errors` holds the
/// failed sub-requests' messages in index order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub responses: Vec<BatchItem>,
    pub success_count: usize,
    pub failure_count: usize,
    pub errors: Vec<String>,
    pub total_duration_ms: f64,
}

impl BatchResult {
    /// Result for an empty batch: no tasks launched, all counts zero.
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Number of sub-request outcomes.
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// Whether the batch contained no sub-requests.
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_item_carries_placeholder_payload() {
        let item = BatchItem::failed(3, "boom".into());
        assert!(!item.is_success());
        assert_eq!(item.index, 3);
        assert_eq!(item.response.content, "");
        assert_eq!(item.response.finish_reason, FinishReason::Error);
        assert_eq!(item.error.as_deref(), Some("boom"));
    }

    #[test]
    fn empty_result_has_zero_counts() {
        let result = BatchResult::empty();
        assert!(result.is_empty());
        assert_eq!(result.success_count, 0);
        assert_eq!(result.failure_count, 0);
        assert!(result.errors.is_empty());
    }
}
