//! Error types shared across georef crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while reading ambient settings
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid value for {name}: '{value}' (expected {expected})")]
    InvalidSetting {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl CommonError {
    /// Build an [`CommonError::InvalidSetting`] for a rejected environment value
    pub fn invalid_setting(name: &'static str, value: impl Into<String>, expected: &'static str) -> Self {
        Self::InvalidSetting {
            name,
            value: value.into(),
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_setting_message() {
        let err = CommonError::invalid_setting("GEOREF_LOG_LEVEL", "loud", "trace|debug|info|warn|error");
        assert_eq!(
            err.to_string(),
            "Invalid value for GEOREF_LOG_LEVEL: 'loud' (expected trace|debug|info|warn|error)"
        );
    }
}
