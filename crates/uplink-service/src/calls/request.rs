use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::fingerprint::Fingerprint;
use super::outcome::{CallError, CallResult};

/// One logical invocation of an upstream operation.
///
/// A request is immutable once constructed: the operation name is validated
/// up front, and the parameters are only ever read afterwards. The same
/// normalized inputs always map to the same [`Fingerprint`], no matter in
/// which order the caller assembled them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    operation: String,
    params: serde_json::Map<String, Value>,
}

impl CallRequest {
    /// Creates a request for the given operation.
    ///
    /// Fails with [`CallError::InvalidRequest`] if the operation name is
    /// empty or whitespace-only.
    pub fn new(
        operation: impl Into<String>,
        params: serde_json::Map<String, Value>,
    ) -> CallResult<Self> {
        let operation = operation.into();
        if operation.trim().is_empty() {
            return Err(CallError::InvalidRequest(
                "operation name must not be empty".into(),
            ));
        }
        Ok(Self { operation, params })
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn params(&self) -> &serde_json::Map<String, Value> {
        &self.params
    }

    /// Derives the stable cache/dedup key for this request.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_request(self)
    }
}
