//! Error taxonomy for feature extraction, baseline maintenance and scoring

/// Errors raised by the classification core.
///
/// `InsufficientData` is a defined "no opinion" state rather than a failure;
/// the review queue reports it separately from both labels.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Fewer observations (or a shorter span) than the minimum-data policy allows
    #[error("insufficient data for {person_id}: {reason}")]
    InsufficientData { person_id: String, reason: String },

    /// Negative or non-finite value, or a timestamp outside the evaluation window
    #[error("invalid transaction data: {0}")]
    InvalidTransaction(String),

    /// Person profile encodings missing or out of range
    #[error("invalid profile for {person_id}: {reason}")]
    InvalidProfile { person_id: String, reason: String },

    /// Feature vector and model schema disagree on names or order
    #[error("feature schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Corrupt, missing or internally inconsistent model artifact
    #[error("failed to load model artifact {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    /// The scorer failed or produced a value outside [0, 1]
    #[error("scoring failed under model {version}: {reason}")]
    Scoring { version: String, reason: String },

    /// The transaction source could not be read
    #[error("transaction source error: {0}")]
    Source(String),

    /// No profile or history is known for the person
    #[error("unknown person: {0}")]
    UnknownPerson(String),

    /// A classification worker panicked or was cancelled
    #[error("classification worker failed: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Failures worth retrying in batch mode.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Source(_) | PipelineError::Scoring { .. })
    }

    /// The "insufficient data, no classification attempted" state.
    pub fn is_no_opinion(&self) -> bool {
        matches!(self, PipelineError::InsufficientData { .. })
    }

    pub(crate) fn insufficient(person_id: &str, reason: impl Into<String>) -> Self {
        PipelineError::InsufficientData {
            person_id: person_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn model_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::ModelLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(PipelineError::Source("timeout".into()).is_retryable());
        assert!(PipelineError::Scoring {
            version: "v1".into(),
            reason: "NaN".into()
        }
        .is_retryable());
        assert!(!PipelineError::insufficient("p1", "3 transactions").is_retryable());
        assert!(!PipelineError::SchemaMismatch("order".into()).is_retryable());
    }

    #[test]
    fn test_no_opinion_state() {
        assert!(PipelineError::insufficient("p1", "too few").is_no_opinion());
        assert!(!PipelineError::InvalidTransaction("negative".into()).is_no_opinion());
    }
}
