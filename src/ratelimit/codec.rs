//! Encoding of controller state for the quota store.
//!
//! State is stored as JSON with a `revision` field alongside the state's own
//! fields. The revision grows by one on every committed write, so two
//! distinct writes never produce the same bytes and the raw stored value can
//! serve as the expected value in a compare-and-swap.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;

/// State that can be persisted by a controller.
pub trait QuotaState: Serialize + DeserializeOwned + Send + Sync {
    /// Check the state's invariants after decoding.
    fn validate(&self) -> Result<(), String>;
}

/// A state value together with its write revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<S> {
    pub revision: u64,
    #[serde(flatten)]
    pub state: S,
}

impl<S> Stamped<S> {
    /// Wrap a state that has never been written.
    pub fn first(state: S) -> Self {
        Self { revision: 1, state }
    }

    /// Wrap `state` as the write that follows this one.
    pub fn succeed(&self, state: S) -> Self {
        Self {
            revision: self.revision + 1,
            state,
        }
    }
}

/// Serialize a stamped state to bytes.
pub fn encode<S: QuotaState>(stamped: &Stamped<S>) -> Result<Vec<u8>, QuotaError> {
    serde_json::to_vec(stamped)
        .map_err(|e| QuotaError::Decode(format!("failed to encode state: {}", e)))
}

/// Parse bytes from the store and check the state's invariants.
pub fn decode<S: QuotaState>(bytes: &[u8]) -> Result<Stamped<S>, QuotaError> {
    let stamped: Stamped<S> = serde_json::from_slice(bytes)
        .map_err(|e| QuotaError::Decode(format!("failed to parse state: {}", e)))?;
    stamped.state.validate().map_err(QuotaError::Decode)?;
    Ok(stamped)
}
