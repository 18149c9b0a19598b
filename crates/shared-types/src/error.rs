use thiserror::Error;

pub type IpamResult<T> = Result<T, IpamError>;

/// Error taxonomy for address-management operations.
///
/// `TransientStoreConflict` is the only retriable kind: it signals that a
/// concurrent writer interfered at the storage layer and the whole operation
/// should be re-run from validation onward. Everything else is surfaced to
/// the caller unmodified.
#[derive(Debug, Error)]
pub enum IpamError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource in use: {0}")]
    ResourceInUse(String),

    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("no free prefix of length /{prefix_len} left in subnet pool {pool_id}")]
    ResourceExhausted { pool_id: uuid::Uuid, prefix_len: u8 },

    #[error("concurrent store update detected, retry the operation")]
    TransientStoreConflict,
}

impl IpamError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        IpamError::InvalidInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        IpamError::Conflict(msg.into())
    }

    pub fn in_use(msg: impl Into<String>) -> Self {
        IpamError::ResourceInUse(msg.into())
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        IpamError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Whether the orchestration layer may retry the whole operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, IpamError::TransientStoreConflict)
    }
}
