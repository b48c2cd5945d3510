//! Error types for agent configuration and supervision.
//!
//! Errors fall into three groups:
//!
//! - [`ConfigError`] / [`ConfigErrors`]: invariant violations found while
//!   building an [`Agent`](crate::Agent). Every violation is reported at once.
//! - [`RunError::Construction`]: a node controller could not be built. Fatal
//!   to the whole run; no node task is started.
//! - [`RunError::Nodes`]: one or more node controllers ended with an error.
//!   Reported only after every node task has terminated.

use std::fmt;

use thiserror::Error;

use crate::dial::DialError;

/// A single configuration invariant violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No clock was configured.
    #[error("no clock provided (see AgentOption::clock)")]
    NoClock,

    /// No nodes were configured.
    #[error("no nodes configured (see AgentOption::node)")]
    NoNodes,

    /// A node has neither the enactment nor the telemetry service enabled.
    #[error(
        "node {node_id:?} has no services enabled (see NodeOption::enactment_service and NodeOption::telemetry_service)"
    )]
    NoActiveServices { node_id: String },

    /// No controller factory was configured.
    #[error("no controller factory provided (see AgentOption::controller_factory)")]
    NoControllerFactory,
}

impl ConfigError {
    /// Returns a short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::NoClock => "config_no_clock",
            ConfigError::NoNodes => "config_no_nodes",
            ConfigError::NoActiveServices { .. } => "config_no_active_services",
            ConfigError::NoControllerFactory => "config_no_controller_factory",
        }
    }
}

/// Every configuration violation found by a single build.
///
/// Never empty: a build with no violations yields an agent instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors(Vec<ConfigError>);

impl ConfigErrors {
    pub(crate) fn new(errors: Vec<ConfigError>) -> Self {
        debug_assert!(!errors.is_empty());
        Self(errors)
    }

    /// The individual violations, in detection order.
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }

    /// Returns true if `err` is among the violations.
    pub fn contains(&self, err: &ConfigError) -> bool {
        self.0.contains(err)
    }

    /// Number of violations.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no violations.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Node ids reported as having no enabled service.
    pub fn nodes_without_services(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|e| match e {
            ConfigError::NoActiveServices { node_id } => Some(node_id.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

impl IntoIterator for ConfigErrors {
    type Item = ConfigError;
    type IntoIter = std::vec::IntoIter<ConfigError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Errors produced by a node controller, either while being built or while
/// running.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The controller failed with a message.
    #[error("controller failed: {0}")]
    Failed(String),

    /// A backend endpoint could not be prepared.
    #[error("dial error: {0}")]
    Dial(#[from] DialError),

    /// The controller task panicked.
    #[error("controller panicked: {0}")]
    Panicked(String),

    /// The controller task was aborted before it returned.
    #[error("controller task aborted: {0}")]
    Aborted(String),

    /// Any other collaborator-supplied error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControllerError {
    /// Shorthand for [`ControllerError::Failed`].
    pub fn failed(msg: impl Into<String>) -> Self {
        ControllerError::Failed(msg.into())
    }
}

/// The terminal error of a single node task.
#[derive(Debug, Error)]
#[error("node {node_id:?}: {error}")]
pub struct NodeFailure {
    /// Node the failing controller belonged to.
    pub node_id: String,

    /// The error the controller returned.
    #[source]
    pub error: ControllerError,
}

/// The aggregate of every node task that ended with an error.
///
/// Order follows termination order and carries no meaning.
#[derive(Debug)]
pub struct NodeFailures(Vec<NodeFailure>);

impl NodeFailures {
    /// Joins the failures, returning `None` when there are none.
    pub(crate) fn join(failures: Vec<NodeFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self(failures))
        }
    }

    /// Iterates over the per-node failures.
    pub fn iter(&self) -> std::slice::Iter<'_, NodeFailure> {
        self.0.iter()
    }

    /// Number of failed nodes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no node failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ids of the failed nodes, sorted.
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.0.iter().map(|f| f.node_id.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Consumes the aggregate, yielding the individual failures.
    pub fn into_failures(self) -> Vec<NodeFailure> {
        self.0
    }
}

impl fmt::Display for NodeFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for NodeFailures {}

impl<'a> IntoIterator for &'a NodeFailures {
    type Item = &'a NodeFailure;
    type IntoIter = std::slice::Iter<'a, NodeFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Errors returned by [`Agent::run`](crate::Agent::run).
#[derive(Debug, Error)]
pub enum RunError {
    /// A node controller could not be constructed; nothing was started.
    #[error("node {node_id:?}: {source}")]
    Construction {
        node_id: String,
        #[source]
        source: ControllerError,
    },

    /// One or more node controllers terminated with an error.
    #[error("{0}")]
    Nodes(NodeFailures),
}

impl RunError {
    /// Returns a short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunError::Construction { .. } => "run_controller_construction",
            RunError::Nodes(_) => "run_node_failures",
        }
    }

    /// The per-node runtime failures, if this is [`RunError::Nodes`].
    pub fn node_failures(&self) -> Option<&NodeFailures> {
        match self {
            RunError::Nodes(failures) => Some(failures),
            RunError::Construction { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_display_lists_every_violation() {
        let err = ConfigErrors::new(vec![
            ConfigError::NoClock,
            ConfigError::NoActiveServices {
                node_id: "delta".to_string(),
            },
        ]);

        let text = err.to_string();
        assert!(text.contains("no clock provided"));
        assert!(text.contains("\"delta\" has no services enabled"));
        assert_eq!(text.lines().count(), 2);
        assert!(!err.is_empty());
        assert_eq!(err.nodes_without_services().collect::<Vec<_>>(), ["delta"]);
    }

    #[test]
    fn test_node_failures_join_discards_nothing() {
        assert!(NodeFailures::join(vec![]).is_none());

        let failures = NodeFailures::join(vec![
            NodeFailure {
                node_id: "b".to_string(),
                error: ControllerError::failed("boom"),
            },
            NodeFailure {
                node_id: "a".to_string(),
                error: ControllerError::failed("bang"),
            },
        ])
        .unwrap();

        assert_eq!(failures.len(), 2);
        assert!(!failures.is_empty());
        assert_eq!(failures.node_ids(), ["a", "b"]);
        assert!(failures.to_string().contains("node \"b\": controller failed: boom"));
    }

    #[test]
    fn test_run_error_labels() {
        let err = RunError::Construction {
            node_id: "gamma".to_string(),
            source: ControllerError::failed("bad endpoint"),
        };
        assert_eq!(err.as_label(), "run_controller_construction");
        assert!(err.to_string().contains("gamma"));
        assert!(err.node_failures().is_none());
    }
}
