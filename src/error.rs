use thiserror::Error;

/// Error taxonomy for reconciliation operations.
///
/// `Validation` covers malformed input records and bad request arguments,
/// `Consistency` covers operations that would corrupt reconciliation state
/// (amount mismatches, double-linking), and `Repository` wraps failures from
/// the backing store. Consistency and validation failures never leave
/// partially applied writes behind.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Validation error: {0}")]
    Validation(anyhow::Error),

    #[error("Consistency error: {0}")]
    Consistency(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Repository error: {0}")]
    Repository(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ReconError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ReconError::Validation(_))
    }

    pub fn is_consistency(&self) -> bool {
        matches!(self, ReconError::Consistency(_))
    }
}
