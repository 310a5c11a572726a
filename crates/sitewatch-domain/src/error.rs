use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("Client batch id already exists: {0}")]
    DuplicateClientBatchId(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid emission quantity: {0}")]
    InvalidQuantity(String),

    #[error("Data integrity error: {0}")]
    Integrity(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
