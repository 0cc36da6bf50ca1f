//! Core types for the deployment engine

use crate::error::NodeFailure;
use crate::record::{DeployOpId, Deployment};
use crate::tree::{Element, ElementId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Dependency relation keyed by element identity
pub type Relation = relation::Relation<ElementId>;

/// Element-level dependency map: element id to the ids it depends on
///
/// Persisted between runs so a destroy pass can invert the previous
/// deploy ordering.
pub type PrimitiveDependencies = std::collections::BTreeMap<String, Vec<String>>;

/// Target end-state of a deployment pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    /// Converge every element to deployed
    Deployed,
    /// Tear every element down
    Destroyed,
}

impl GoalStatus {
    /// Goal derived from whether a new tree exists
    pub fn from_new_tree(new_tree: Option<&Arc<Element>>) -> Self {
        if new_tree.is_none() {
            Self::Destroyed
        } else {
            Self::Deployed
        }
    }

    /// The terminal node status that satisfies this goal
    pub fn terminal(self) -> DeployStatus {
        match self {
            Self::Deployed => DeployStatus::Deployed,
            Self::Destroyed => DeployStatus::Destroyed,
        }
    }

    /// The deployment-wide status when this goal is fully reached
    pub fn op_status(self) -> DeployOpStatus {
        match self {
            Self::Deployed => DeployOpStatus::Deployed,
            Self::Destroyed => DeployOpStatus::Destroyed,
        }
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployed => write!(f, "Deployed"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// Lifecycle status of one plan node during one execution pass
///
/// Progression is strictly `Initial -> Waiting -> Proceeding -> terminal`;
/// terminal states are never left within the same plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    /// Not yet considered
    Initial,
    /// Dependencies not ready, or readiness still converging
    Waiting,
    /// Dispatched, action in flight
    Proceeding,
    /// Reached the deployed goal state
    Deployed,
    /// Reached the destroyed goal state
    Destroyed,
    /// Failed, directly or by propagation
    Failed,
}

impl DeployStatus {
    /// Check if this status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deployed | Self::Destroyed | Self::Failed)
    }

    /// Check if this node is mid-flight
    pub fn is_active(self) -> bool {
        matches!(self, Self::Waiting | Self::Proceeding)
    }

    /// Check if this status satisfies the given goal
    pub fn is_goal(self, goal: GoalStatus) -> bool {
        self == goal.terminal()
    }
}

impl fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "Initial",
            Self::Waiting => "Waiting",
            Self::Proceeding => "Proceeding",
            Self::Deployed => "Deployed",
            Self::Destroyed => "Destroyed",
            Self::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// Deployment-wide outcome of one execute pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployOpStatus {
    /// Goal fully reached, no failures
    Deployed,
    /// Destroy goal fully reached, no failures
    Destroyed,
    /// Actions altered persisted state; re-analysis required
    StateChanged,
    /// At least one node failed
    Failed,
}

impl DeployOpStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for DeployOpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deployed => "Deployed",
            Self::Destroyed => "Destroyed",
            Self::StateChanged => "StateChanged",
            Self::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// Kind of change an action applies to one element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    None,
}

/// A single create/modify/delete applied to one element as part of an action
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub element: Arc<Element>,
    pub detail: String,
}

impl Change {
    pub fn new(kind: ChangeKind, element: Arc<Element>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            element,
            detail: detail.into(),
        }
    }
}

/// Executable operation of an action: a zero-argument effectful call
pub type ActionOp = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// A plugin-proposed unit of work: one or more changes plus the operation
/// that applies them against the provider.
#[derive(Clone)]
pub struct Action {
    pub detail: String,
    pub changes: Vec<Change>,
    pub op: ActionOp,
}

impl Action {
    pub fn new(
        detail: impl Into<String>,
        changes: Vec<Change>,
        op: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            detail: detail.into(),
            changes,
            op: Arc::new(op),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("detail", &self.detail)
            .field("changes", &self.changes)
            .finish_non_exhaustive()
    }
}

/// Helpers handed to `Component::depends_on` for building dependency
/// relations owned by one element.
pub struct DeployHelpers {
    element: ElementId,
}

impl DeployHelpers {
    pub(crate) fn new(element: ElementId) -> Self {
        Self { element }
    }

    /// The element the relation is being built for
    pub fn element(&self) -> &ElementId {
        &self.element
    }

    /// Satisfied once every listed dependency is deployed
    pub fn all_of(&self, deps: impl IntoIterator<Item = ElementId>) -> Relation {
        relation::all_of(deps, |to| Relation::edge(self.element.clone(), to))
    }

    /// Satisfied once any listed dependency is deployed
    pub fn any_of(&self, deps: impl IntoIterator<Item = ElementId>) -> Relation {
        relation::any_of(deps, |to| Relation::edge(self.element.clone(), to))
    }

    /// Satisfied once the single dependency is deployed
    pub fn only(&self, dep: ElementId) -> Relation {
        Relation::edge(self.element.clone(), dep)
    }

    /// No dependencies
    pub fn none(&self) -> Relation {
        relation::none()
    }
}

/// Receives node status updates during one execute pass
///
/// A fresh listener is handed to each `act` call; the tracker is its only
/// caller.
pub trait ProgressListener: Send {
    /// A node's status changed
    fn on_status(&mut self, description: &str, status: DeployStatus, detail: Option<&str>);

    /// A node produced output worth surfacing
    fn on_output(&mut self, description: &str, line: &str);

    /// The whole pass completed
    fn on_complete(&mut self, status: DeployOpStatus);
}

/// No-op progress listener
pub struct NoProgress;

impl ProgressListener for NoProgress {
    fn on_status(&mut self, _description: &str, _status: DeployStatus, _detail: Option<&str>) {}
    fn on_output(&mut self, _description: &str, _line: &str) {}
    fn on_complete(&mut self, _status: DeployOpStatus) {}
}

/// Options for `PluginManager::start`
pub struct StartOptions {
    /// Root directory under which each plugin gets a private data directory
    pub data_dir: PathBuf,
    /// Handle to the deployment record
    pub deployment: Deployment,
    /// Identity of this deployment operation
    pub op_id: DeployOpId,
    /// Previously deployed tree, if any
    pub prev_tree: Option<Arc<Element>>,
    /// Desired tree; absent means destroy everything
    pub new_tree: Option<Arc<Element>>,
    /// Element-level dependencies recorded by the previous run
    pub prev_dependencies: PrimitiveDependencies,
}

/// Hook consulted once the graph reaches quiescence, reporting whether
/// component state persisted during the pass changed.
pub type StateUpdateFn = Box<dyn FnMut() -> anyhow::Result<bool> + Send>;

/// Options for `PluginManager::act`
pub struct ActOptions {
    /// Don't invoke operations, only walk the plan
    pub dry_run: bool,
    /// Downgrade failing delete changes to warnings
    pub ignore_delete_errors: bool,
    /// Give up on nodes still pending after this long
    pub timeout: Option<Duration>,
    /// Pause between polling passes that made no progress
    pub poll_delay: Duration,
    /// Fresh progress listener for this pass
    pub listener: Box<dyn ProgressListener>,
    /// Optional persisted-state-change hook
    pub state_updates: Option<StateUpdateFn>,
}

impl Default for ActOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            ignore_delete_errors: false,
            timeout: None,
            poll_delay: Duration::from_millis(100),
            listener: Box::new(NoProgress),
            state_updates: None,
        }
    }
}

impl fmt::Debug for ActOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActOptions")
            .field("dry_run", &self.dry_run)
            .field("ignore_delete_errors", &self.ignore_delete_errors)
            .field("timeout", &self.timeout)
            .field("poll_delay", &self.poll_delay)
            .finish_non_exhaustive()
    }
}

/// Result of one `PluginManager::act` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActComplete {
    /// The goal status was fully reached
    pub deploy_complete: bool,
    /// Persisted component state changed during the pass
    pub state_changed: bool,
}

/// Result of one engine execute pass
#[derive(Debug)]
pub struct ExecuteComplete {
    /// Deployment-wide outcome
    pub status: DeployOpStatus,
    /// Persisted component state changed during the pass
    pub state_changed: bool,
    /// Every directly failing node, with detail and cause
    pub failures: Vec<NodeFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testutil::leaf;

    #[test]
    fn test_goal_from_new_tree() {
        let tree = leaf("root");
        assert_eq!(
            GoalStatus::from_new_tree(Some(&tree)),
            GoalStatus::Deployed
        );
        assert_eq!(GoalStatus::from_new_tree(None), GoalStatus::Destroyed);
    }

    #[test]
    fn test_status_progression_helpers() {
        assert!(!DeployStatus::Initial.is_terminal());
        assert!(DeployStatus::Waiting.is_active());
        assert!(DeployStatus::Proceeding.is_active());
        assert!(DeployStatus::Deployed.is_terminal());
        assert!(DeployStatus::Destroyed.is_terminal());
        assert!(DeployStatus::Failed.is_terminal());

        assert!(DeployStatus::Deployed.is_goal(GoalStatus::Deployed));
        assert!(!DeployStatus::Deployed.is_goal(GoalStatus::Destroyed));
        assert!(DeployStatus::Destroyed.is_goal(GoalStatus::Destroyed));
        assert!(!DeployStatus::Failed.is_goal(GoalStatus::Deployed));
    }

    #[test]
    fn test_helpers_build_edges_from_owner() {
        let helpers = DeployHelpers::new(ElementId::new("web"));
        let rel = helpers.all_of([ElementId::new("db"), ElementId::new("cache")]);
        assert_eq!(
            rel.to_dependencies(),
            vec![ElementId::new("db"), ElementId::new("cache")]
        );

        let only = helpers.only(ElementId::new("db"));
        assert_eq!(
            only,
            Relation::edge(ElementId::new("web"), ElementId::new("db"))
        );

        assert!(helpers.none().ready(&|_| false).is_ready());
    }
}
