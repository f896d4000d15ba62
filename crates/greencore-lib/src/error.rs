//! Error taxonomy for the controller

use crate::models::{CoreId, HostId};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a host agent
///
/// The controller handles every variant the same way for state machine
/// purposes (revert to the prior confirmed state) but keeps the reason
/// for logs and callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("host rejected request: {0}")]
    Rejected(String),

    #[error("host agent timed out after {0:?}")]
    Timeout(Duration),
}

impl TransitionError {
    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            TransitionError::Unreachable(_) => "unreachable",
            TransitionError::Rejected(_) => "rejected",
            TransitionError::Timeout(_) => "timeout",
        }
    }
}

/// Errors from the core state table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown core {0}")]
    UnknownCore(CoreId),

    #[error("core {0} is pinned awake")]
    PinnedCore(CoreId),
}

/// Errors surfaced by controller operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("unknown core {0}")]
    UnknownCore(CoreId),

    #[error("core {0} is a stable core and cannot be toggled")]
    PinnedCore(CoreId),

    /// Another transition owns the core; retry later
    #[error("core {0} is already transitioning")]
    TransitionConflict(CoreId),

    #[error("transition of core {core} failed: {source}")]
    Transition {
        core: CoreId,
        #[source]
        source: TransitionError,
    },

    #[error("usage sampling failed on every host")]
    SamplerUnavailable,
}

impl ControllerError {
    /// Whether the failure is caused by the caller rather than the fleet
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ControllerError::UnknownCore(_) | ControllerError::PinnedCore(_)
        )
    }
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownCore(id) => ControllerError::UnknownCore(id),
            StoreError::PinnedCore(id) => ControllerError::PinnedCore(id),
        }
    }
}

/// A host that could not be sampled during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFailure {
    pub host: HostId,
    pub reason: String,
}

impl HostFailure {
    pub fn new(host: HostId, error: &TransitionError) -> Self {
        Self {
            host,
            reason: error.to_string(),
        }
    }
}
