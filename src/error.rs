use thiserror::Error;

/// Errors surfaced by the scoring, qualification and automation services.
///
/// Expected enrollment outcomes (duplicates, targeting mismatches) are not
/// errors; they come back as [`RejectReason`](crate::automation::RejectReason).
#[derive(Debug, Error)]
pub enum LeadflowError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LeadflowError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        LeadflowError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LeadflowError::NotFound { .. })
    }
}

pub type Result<T, E = LeadflowError> = std::result::Result<T, E>;

/// Failure inside one of the scoring sub-steps.
///
/// Never escapes [`ScoringEngine::score`](crate::scoring::ScoringEngine::score);
/// the engine logs it and falls back to the default result.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("predictor failed: {0}")]
    Predictor(String),

    #[error("{component} produced a non-finite value")]
    NonFinite { component: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = LeadflowError::not_found("lead", "42");
        assert_eq!(err.to_string(), "lead not found: 42");
        assert!(err.is_not_found());
    }

    #[test]
    fn validation_is_not_not_found() {
        let err = LeadflowError::Validation("window start must precede end".into());
        assert!(!err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Validation failed: window start must precede end"
        );
    }

    #[test]
    fn scoring_error_display() {
        let err = ScoringError::NonFinite {
            component: "contextual",
        };
        assert_eq!(err.to_string(), "contextual produced a non-finite value");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LeadflowError>();
        assert_send_sync::<ScoringError>();
    }
}
