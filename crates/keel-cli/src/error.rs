//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] keel_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// The operator chose to stop; the process exits cleanly
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Core(e) if e.is_stopped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_only_recognized_from_core() {
        assert!(Error::from(keel_common::Error::stopped("declined")).is_stopped());
        assert!(!Error::from(keel_common::Error::validation("bad")).is_stopped());
        assert!(!Error::validation("stopped").is_stopped());
    }

    #[test]
    fn test_core_errors_display_unchanged() {
        let err = Error::from(keel_common::Error::failed("helm charts", "boom"));
        assert_eq!(err.to_string(), "helm charts: boom");
    }
}
