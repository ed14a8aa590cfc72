//! Error taxonomy for the exchange core
//!
//! Four classes matter to callers:
//! - `Validation` — malformed request, rejected before any state change
//! - `InsufficientFunds` / `InsufficientHoldings` — business-rule
//!   rejection, surfaced to the user, never retried automatically
//! - `LockTimeout` / `Database` — transient store failures, retried by
//!   the caller or by the next sweep cycle
//! - `Consistency` — an invariant was observed broken; the operation
//!   aborts and the event must be escalated, never swallowed

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("insufficient holdings")]
    InsufficientHoldings,

    #[error("lock wait aborted")]
    LockTimeout,

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl ExchangeError {
    /// Transient errors may be retried; everything else is final for
    /// the request that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::LockTimeout | ExchangeError::Database(_))
    }
}

// Postgres reports a lock_timeout expiry as SQLSTATE 55P03
// (lock_not_available) and an aborted victim of deadlock detection as
// 40P01 (deadlock_detected). Both mean "lost a lock race, retry":
// admission reserves the buyer's wallet before settlement takes wallet
// locks in ascending user_id order, so two transactions on different
// instruments can still close a cycle over the same wallet pair.
fn is_lock_race(code: &str) -> bool {
    matches!(code, "55P03" | "40P01")
}

impl From<sqlx::Error> for ExchangeError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.code().as_deref().is_some_and(is_lock_race) {
                return ExchangeError::LockTimeout;
            }
        }
        ExchangeError::Database(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::LockTimeout.is_transient());
        assert!(!ExchangeError::InsufficientFunds.is_transient());
        assert!(!ExchangeError::Validation("bad".into()).is_transient());
        assert!(!ExchangeError::Consistency("drift".into()).is_transient());
    }

    #[test]
    fn test_lock_race_sqlstates() {
        // lock_timeout expiry and a detected deadlock both classify as
        // the retryable LockTimeout, never the terminal Database error
        assert!(is_lock_race("55P03"));
        assert!(is_lock_race("40P01"));
        assert!(!is_lock_race("23505"));
        assert!(!is_lock_race("40001"));
    }
}
