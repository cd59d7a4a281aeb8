#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Schema error on line {line}: {message}")]
    Schema { line: usize, message: String },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a schema error at a 1-based source line.
    pub fn schema(line: usize, message: impl Into<String>) -> Self {
        Self::Schema {
            line,
            message: message.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_display_includes_line() {
        let err = CoreError::schema(7, "expected '{'");
        assert_eq!(err.to_string(), "Schema error on line 7: expected '{'");
    }

    #[test]
    fn unknown_model_display() {
        let err = CoreError::UnknownModel("Drivers".into());
        assert_eq!(err.to_string(), "Unknown model: Drivers");
    }
}
