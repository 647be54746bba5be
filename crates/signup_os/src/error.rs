#![forbid(unsafe_code)]

use signup_contracts::ContractViolation;
use signup_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignupError {
    #[error("invalid input: {0}")]
    Validation(#[from] ContractViolation),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl SignupError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Storage(StorageError::ContractViolation(_))
        )
    }
}
