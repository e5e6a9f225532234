use thiserror::Error;
use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("window not found: {0}")]
    NotFound(Ulid),
    #[error("window already booked: {0}")]
    AlreadyBooked(Ulid),
    /// The booking write failed after the window was held. `rolled_back`
    /// says whether the hold was released again; when false the window is
    /// left held until the reconciler frees it.
    #[error("booking for window {window_id} could not be persisted (rolled back: {rolled_back}): {source}")]
    PersistenceFailure {
        window_id: Ulid,
        rolled_back: bool,
        #[source]
        source: StoreError,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl EngineError {
    /// True for outcomes of the reservation rules themselves, false for
    /// infrastructure faults the caller may retry.
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            EngineError::PersistenceFailure { .. } | EngineError::Storage(_)
        )
    }

    /// Stable short name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyBooked(_) => "already_booked",
            EngineError::PersistenceFailure { .. } => "persistence_failure",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "storage",
        }
    }
}
