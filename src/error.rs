//! Error types for the deployment engine
//!
//! Two classes of failure flow through the engine: contract violations
//! (illegal lifecycle calls, dependency cycles) which indicate a bug in the
//! caller or the engine itself, and deployment failures (a provider
//! rejecting a change, a timeout) which are reported back to the user.
//! [`Error::is_internal`] distinguishes the two.

use std::fmt;
use thiserror::Error;

/// One failed node of a deployment, with the action's detail and the
/// underlying cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    /// Description of the failing node (the action's detail)
    pub description: String,
    /// Underlying cause
    pub cause: String,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.description, self.cause)
    }
}

/// Errors that can occur during deployment operations
#[derive(Error, Debug)]
pub enum Error {
    /// Contract violation inside the engine or by a caller
    #[error("internal error: {0}")]
    Internal(String),

    /// Illegal plugin manager lifecycle call
    #[error("illegal call to plugin manager, attempting to go from {from} to {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The execution plan contains a dependency cycle
    #[error("execution plan contains a cycle: {0}")]
    Cycle(String),

    /// A declared dependency references an element absent from the plan
    #[error("dependency on {0} cannot be resolved by this deployment")]
    UnresolvedDependency(String),

    /// Two different plugins registered under the same key
    #[error("attempt to register two plugins with the same name from the same package: {0}")]
    DuplicatePlugin(String),

    /// No plugins registered with the manager
    #[error("no plugins registered")]
    NoPlugins,

    /// A plugin failed during a lifecycle phase
    #[error("plugin {key} failed during {phase}: {cause:#}")]
    Plugin {
        key: String,
        phase: &'static str,
        cause: anyhow::Error,
    },

    /// The deployment reached quiescence with failed nodes
    #[error("errors encountered during plugin action phase:\n{}", format_failures(.0))]
    DeployFailed(Vec<NodeFailure>),

    /// IO error (plugin data directories)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a programming/contract error rather than a
    /// user-facing deployment failure.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Internal(_)
                | Self::IllegalTransition { .. }
                | Self::Cycle(_)
                | Self::UnresolvedDependency(_)
        )
    }
}

fn format_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  - {f}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type for deployment operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_classification() {
        assert!(Error::Internal("bad".into()).is_internal());
        assert!(
            Error::IllegalTransition {
                from: "Initial",
                to: "Acting"
            }
            .is_internal()
        );
        assert!(Error::Cycle("a -> b -> a".into()).is_internal());
        assert!(!Error::DeployFailed(Vec::new()).is_internal());
        assert!(!Error::NoPlugins.is_internal());
    }

    #[test]
    fn test_deploy_failed_lists_every_failure() {
        let err = Error::DeployFailed(vec![
            NodeFailure {
                description: "Creating container web".into(),
                cause: "image not found".into(),
            },
            NodeFailure {
                description: "Creating volume data".into(),
                cause: "disk full".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("Creating container web: image not found"));
        assert!(msg.contains("Creating volume data: disk full"));
    }
}
