//! B+Tree error types.

use thiserror::Error;

/// Failures surfaced by tree operations. Retryable conflicts never get here.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Tree is destroyed: {name}")]
    Destroyed { name: String },

    #[error("Tree operation was interrupted")]
    Interrupted,

    #[error("Tree invariant violated: {0}")]
    InvariantViolation(String),

    /// Any other failure, with the row or bounds the operation worked on.
    #[error("{context}")]
    Failure {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl TreeError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        TreeError::InvariantViolation(msg.into())
    }

    /// Adds operation context to `err`. Interrupts and destroyed-tree errors
    /// pass through untouched so callers can match on them directly.
    pub fn wrap(err: anyhow::Error, context: impl FnOnce() -> String) -> anyhow::Error {
        match err.downcast_ref::<TreeError>() {
            Some(TreeError::Interrupted | TreeError::Destroyed { .. }) => err,
            _ => TreeError::Failure {
                context: context(),
                source: err,
            }
            .into(),
        }
    }

    /// First tree error in the chain of `err` that is not a wrapper.
    pub fn cause(err: &anyhow::Error) -> Option<&TreeError> {
        err.chain()
            .filter_map(|e| e.downcast_ref::<TreeError>())
            .find(|e| !matches!(e, TreeError::Failure { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_wrap_keeps_interrupt_visible() {
        let err = TreeError::wrap(TreeError::Interrupted.into(), || "put 1".to_string());
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::Interrupted)
        ));
    }

    #[test]
    fn test_wrap_adds_context() {
        let err = TreeError::wrap(TreeError::invariant("bad order").into(), || {
            "Runtime failure on search row: 5".to_string()
        });
        assert_eq!(err.to_string(), "Runtime failure on search row: 5");
        assert!(matches!(
            TreeError::cause(&err),
            Some(TreeError::InvariantViolation(_))
        ));

        let err = TreeError::wrap(anyhow!("disk gone"), || "remove 5".to_string());
        assert!(TreeError::cause(&err).is_none());
        assert_eq!(format!("{:#}", err), "remove 5: disk gone");
    }
}
