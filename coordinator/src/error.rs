//! Error taxonomy for the coordinator. Recoverable conditions are recorded
//! on a `Message` and returned to the caller via status; invariant
//! violations are never recovered — see `Executor::fatal`.

use ledger::LedgerError;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("insufficient available balance")]
    InsufficientAvailable,
    #[error("order not found or not owned by requester")]
    NotFoundOrNotOwned,
    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

impl From<LedgerError> for CoreError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientAvailable => CoreError::InsufficientAvailable,
            LedgerError::UnderflowBug(reason) => {
                CoreError::InternalInvariantViolation(format!("ledger: {reason}"))
            }
        }
    }
}

/// Chain submission outcomes. `Transient` is retried with backoff by the
/// outgoing processor; `Terminal` ends the retry loop immediately.
#[derive(Debug, Error, Clone)]
pub enum ChainError {
    #[error("transient chain error: {0}")]
    Transient(String),
    #[error("terminal chain error: {0}")]
    Terminal(String),
}
