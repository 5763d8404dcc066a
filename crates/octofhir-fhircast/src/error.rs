use thiserror::Error;

/// Error types for FHIRcast operations
#[derive(Debug, Error)]
pub enum FhircastError {
    /// Structural or cross-field violation in a subscription request or event payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A connection was constructed from a request that cannot be connected.
    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl FhircastError {
    /// Create a new Validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new InvalidConnection error
    pub fn invalid_connection(message: impl Into<String>) -> Self {
        Self::InvalidConnection(message.into())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Check if this error was raised by a validator or payload builder
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::InvalidConnection(_) => ErrorCategory::Connection,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Io(_) | Self::Toml(_) | Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Connection,
    Serialization,
    Configuration,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Connection => write!(f, "connection"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Convenience result type for FHIRcast operations
pub type FhircastResult<T> = std::result::Result<T, FhircastError>;
