//! Error types for the deployment engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling or operating workloads.
///
/// Validation and rollout failures are kept distinct so callers can decide
/// whether an operation is worth retrying: a `Validation` error never is,
/// a `RolloutTimeout` may be, an `ImagePull` or `PodFailed` means the
/// workload itself is broken.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("invalid quantity {0:?}")]
    QuantityParse(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("pod failed: {0}")]
    PodFailed(String),

    #[error("rollout timed out: {0}")]
    RolloutTimeout(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("exec error: {0}")]
    Exec(String),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

/// True if the API error is an "already exists" conflict from a create.
///
/// Treated as the update path by every get-or-create in the engine.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.reason == "AlreadyExists")
}

/// True if the API error is a 404 for a missing object.
///
/// Treated as the create path by every get-before-update in the engine.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True if the API error is an optimistic-concurrency conflict (stale
/// resource version on update).
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.reason == "Conflict")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_already_exists() {
        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
        assert!(!is_already_exists(&api_error(409, "Conflict")));
    }

    #[test]
    fn classifies_not_found() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(409, "AlreadyExists")));
    }

    #[test]
    fn classifies_conflict() {
        assert!(is_conflict(&api_error(409, "Conflict")));
        assert!(!is_conflict(&api_error(409, "AlreadyExists")));
    }
}
