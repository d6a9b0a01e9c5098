//! Error types of the container pool.

use crate::domain::RuntimeError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The daemon could not be reached; aborts pool start.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(#[source] RuntimeError),

    #[error("pull image {image}: {source}")]
    ImagePull {
        image: String,
        #[source]
        source: RuntimeError,
    },

    /// A container with the same name exists with an incompatible config.
    #[error("image: {image}: create conflict: {source}")]
    CreateConflict {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("image: {image}: create failed: {source}")]
    CreateFailure {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("image: {image}: start failed: {source}")]
    StartFailure {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("can't find custom hook: {0}")]
    UnknownHook(String),

    #[error("{container}: hook {hook} failed: {source:#}")]
    Hook {
        container: String,
        hook: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{container}: command {command:?} exited with code {exit_code}")]
    ExecFailed {
        container: String,
        command: Vec<String>,
        exit_code: i64,
        output: String,
    },

    /// The pool was closed while waiting; a normal shutdown path.
    #[error("health wait aborted: pool closed")]
    HealthPollAborted,

    #[error("containers not healthy after {waited:?}: {}", pending.join(", "))]
    HealthTimeout {
        pending: Vec<String>,
        waited: Duration,
    },

    #[error("invalid pool state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl PoolError {
    /// True for the shutdown path, which callers should not report as a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::HealthPollAborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_image_reference() {
        let err = PoolError::StartFailure {
            image: "redis:4".to_string(),
            source: RuntimeError::Api("port is already allocated".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "image: redis:4: start failed: runtime api error: port is already allocated"
        );
    }

    #[test]
    fn test_health_timeout_lists_pending_containers() {
        let err = PoolError::HealthTimeout {
            pending: vec!["db".to_string(), "cache".to_string()],
            waited: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "containers not healthy after 30s: db, cache");
    }

    #[test]
    fn test_only_health_abort_is_abort() {
        assert!(PoolError::HealthPollAborted.is_abort());
        assert!(!PoolError::UnknownHook("x".to_string()).is_abort());
    }
}
