use thiserror::Error;

/// Core error types for membership input handling
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid input: {field} {message}")]
    InvalidInput { field: String, message: String },

    #[error("Empty batch: at least one item is required")]
    EmptyBatch,

    #[error("Missing tenant id")]
    MissingTenant,
}

impl CoreError {
    /// Create a new InvalidInput error
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for errors caused by the caller's input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::EmptyBatch | Self::MissingTenant
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
