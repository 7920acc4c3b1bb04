use thiserror::Error;

pub type AegisResult<T> = Result<T, AegisError>;

#[derive(Error, Debug)]
pub enum AegisError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid state: {0}")]
    State(String),
}

impl AegisError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }
}

impl From<serde_json::Error> for AegisError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization: {}", e))
    }
}

impl From<std::io::Error> for AegisError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(format!("io: {}", e))
    }
}
