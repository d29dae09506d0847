//! Domain errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("charge point not found: {0}")]
    ChargePointNotFound(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(i64),
}

pub type DomainResult<T> = Result<T, DomainError>;
