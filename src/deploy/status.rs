//! Per-node deployment status tracking
//!
//! One tracker is created for each analyzed plan and consumed by exactly
//! one execute pass. Status transitions are monotonic: a node that
//! reached a terminal status never leaves it within the same pass.

use crate::deploy::plan::{ExecutionPlan, NodeIdx};
use crate::deploy::types::{
    DeployOpStatus, DeployStatus, ExecuteComplete, GoalStatus, NoProgress, ProgressListener,
};
use crate::error::{Error, NodeFailure, Result};
use crate::record::{DeployOpId, Deployment};
use serde::Serialize;

/// Running totals of nodes by status
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusCounts {
    pub initial: usize,
    pub waiting: usize,
    pub proceeding: usize,
    pub deployed: usize,
    pub destroyed: usize,
    pub failed: usize,
}

impl StatusCounts {
    fn slot(&mut self, status: DeployStatus) -> &mut usize {
        match status {
            DeployStatus::Initial => &mut self.initial,
            DeployStatus::Waiting => &mut self.waiting,
            DeployStatus::Proceeding => &mut self.proceeding,
            DeployStatus::Deployed => &mut self.deployed,
            DeployStatus::Destroyed => &mut self.destroyed,
            DeployStatus::Failed => &mut self.failed,
        }
    }

    /// Count of nodes currently at the given status
    pub fn of(&self, status: DeployStatus) -> usize {
        match status {
            DeployStatus::Initial => self.initial,
            DeployStatus::Waiting => self.waiting,
            DeployStatus::Proceeding => self.proceeding,
            DeployStatus::Deployed => self.deployed,
            DeployStatus::Destroyed => self.destroyed,
            DeployStatus::Failed => self.failed,
        }
    }

    /// Count of nodes at any terminal status
    pub fn terminal(&self) -> usize {
        self.deployed + self.destroyed + self.failed
    }
}

/// Owns per-node status for one execute pass
pub struct StatusTracker {
    statuses: Vec<DeployStatus>,
    details: Vec<Option<String>>,
    descriptions: Vec<String>,
    goals: Vec<GoalStatus>,
    counts: StatusCounts,
    goal: GoalStatus,
    dry_run: bool,
    deployment: Deployment,
    op_id: DeployOpId,
    listener: Box<dyn ProgressListener>,
    failures: Vec<NodeFailure>,
}

impl StatusTracker {
    pub fn new(plan: &ExecutionPlan, deployment: Deployment, op_id: DeployOpId) -> Self {
        let n = plan.len();
        let counts = StatusCounts {
            initial: n,
            ..StatusCounts::default()
        };
        Self {
            statuses: vec![DeployStatus::Initial; n],
            details: vec![None; n],
            descriptions: plan
                .nodes()
                .iter()
                .map(|node| node.description().to_string())
                .collect(),
            goals: plan.nodes().iter().map(|node| node.goal).collect(),
            counts,
            goal: plan.goal(),
            dry_run: false,
            deployment,
            op_id,
            listener: Box::new(NoProgress),
            failures: Vec::new(),
        }
    }

    pub(crate) fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub(crate) fn set_listener(&mut self, listener: Box<dyn ProgressListener>) {
        self.listener = listener;
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn goal(&self) -> GoalStatus {
        self.goal
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn get(&self, n: NodeIdx) -> DeployStatus {
        self.statuses[n.0]
    }

    /// Waiting or failure detail last recorded for the node
    pub fn detail(&self, n: NodeIdx) -> Option<&str> {
        self.details[n.0].as_deref()
    }

    pub fn is_final(&self, n: NodeIdx) -> bool {
        self.statuses[n.0].is_terminal()
    }

    /// Whether the node reached its own goal status
    pub fn goal_reached(&self, n: NodeIdx) -> bool {
        self.statuses[n.0] == self.goals[n.0].terminal()
    }

    pub fn counts(&self) -> StatusCounts {
        self.counts
    }

    pub fn all_terminal(&self) -> bool {
        self.counts.terminal() == self.statuses.len()
    }

    pub fn failures(&self) -> &[NodeFailure] {
        &self.failures
    }

    /// Record a status change for a node.
    ///
    /// Returns `Ok(false)` when the status is unchanged (the detail is
    /// still refreshed). Attempting to leave a terminal status is a
    /// contract violation.
    pub fn set(&mut self, n: NodeIdx, status: DeployStatus, detail: Option<String>) -> Result<bool> {
        let current = self.statuses[n.0];
        if current == status {
            self.details[n.0] = detail;
            return Ok(false);
        }
        if current.is_terminal() {
            return Err(Error::Internal(format!(
                "cannot transition {} from terminal status {current} to {status}",
                self.descriptions[n.0]
            )));
        }

        *self.counts.slot(current) -= 1;
        *self.counts.slot(status) += 1;
        self.statuses[n.0] = status;
        self.details[n.0] = detail;
        self.listener
            .on_status(&self.descriptions[n.0], status, self.details[n.0].as_deref());
        log::debug!(
            "{}: {current} -> {status}{}",
            self.descriptions[n.0],
            self.details[n.0]
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        );
        Ok(true)
    }

    /// Fail a node and record it in the deployment failure summary
    pub fn fail(&mut self, n: NodeIdx, cause: String) -> Result<bool> {
        let changed = self.set(n, DeployStatus::Failed, Some(cause.clone()))?;
        if changed {
            self.failures.push(NodeFailure {
                description: self.descriptions[n.0].clone(),
                cause,
            });
        }
        Ok(changed)
    }

    /// Surface a line of node output through the progress listener
    pub fn output(&mut self, n: NodeIdx, line: &str) {
        self.listener.on_output(&self.descriptions[n.0], line);
    }

    /// Compute the deployment-wide outcome once the graph is quiescent
    pub fn complete(mut self, state_changed: bool) -> ExecuteComplete {
        let status = if self.counts.failed > 0 {
            DeployOpStatus::Failed
        } else if state_changed {
            DeployOpStatus::StateChanged
        } else {
            self.goal.op_status()
        };

        self.listener.on_complete(status);
        if let Err(err) = self.deployment.record_op_status(self.op_id, status) {
            log::warn!("Failed to record deployment status: {err:#}");
        }

        ExecuteComplete {
            status,
            state_changed,
            failures: self.failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::types::PrimitiveDependencies;
    use crate::tree::testutil::{leaf, node};
    use crate::tree::TreeDiff;
    use std::sync::{Arc, Mutex};

    fn tracker_for(ids: &[&str]) -> (ExecutionPlan, StatusTracker) {
        let tree = node("root", ids.iter().copied().map(leaf).collect());
        let diff = TreeDiff::between(None, Some(&tree));
        let plan = ExecutionPlan::build(
            &[],
            &PrimitiveDependencies::new(),
            &diff,
            Some(&tree),
            GoalStatus::Deployed,
        )
        .unwrap();
        let deployment = Deployment::ephemeral("test");
        let op_id = deployment.new_op(GoalStatus::Deployed).unwrap();
        let tracker = StatusTracker::new(&plan, deployment, op_id);
        (plan, tracker)
    }

    #[test]
    fn test_counts_follow_transitions() {
        let (_plan, mut tracker) = tracker_for(&["a"]);
        assert_eq!(tracker.counts().initial, 2);

        tracker
            .set(NodeIdx(0), DeployStatus::Proceeding, None)
            .unwrap();
        assert_eq!(tracker.counts().initial, 1);
        assert_eq!(tracker.counts().proceeding, 1);

        tracker
            .set(NodeIdx(0), DeployStatus::Deployed, None)
            .unwrap();
        assert_eq!(tracker.counts().deployed, 1);
        assert!(tracker.goal_reached(NodeIdx(0)));
        assert!(!tracker.all_terminal());
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let (_plan, mut tracker) = tracker_for(&["a"]);
        tracker
            .set(NodeIdx(0), DeployStatus::Deployed, None)
            .unwrap();

        let err = tracker
            .set(NodeIdx(0), DeployStatus::Waiting, None)
            .unwrap_err();
        assert!(err.is_internal());

        // Re-setting the same terminal status is a no-op, not an error.
        assert!(
            !tracker
                .set(NodeIdx(0), DeployStatus::Deployed, None)
                .unwrap()
        );
    }

    #[test]
    fn test_fail_records_failure_once() {
        let (_plan, mut tracker) = tracker_for(&["a"]);
        tracker.fail(NodeIdx(0), "boom".into()).unwrap();
        tracker.fail(NodeIdx(0), "boom again".into()).unwrap();

        assert_eq!(tracker.failures().len(), 1);
        assert_eq!(tracker.failures()[0].cause, "boom");
        assert_eq!(tracker.get(NodeIdx(0)), DeployStatus::Failed);
    }

    #[test]
    fn test_complete_outcomes() {
        let (_plan, mut tracker) = tracker_for(&["a"]);
        tracker
            .set(NodeIdx(0), DeployStatus::Deployed, None)
            .unwrap();
        tracker
            .set(NodeIdx(1), DeployStatus::Deployed, None)
            .unwrap();
        let complete = tracker.complete(false);
        assert_eq!(complete.status, DeployOpStatus::Deployed);

        let (_plan, mut tracker) = tracker_for(&["a"]);
        tracker.fail(NodeIdx(0), "boom".into()).unwrap();
        let complete = tracker.complete(false);
        assert_eq!(complete.status, DeployOpStatus::Failed);
        assert_eq!(complete.failures.len(), 1);

        let (_plan, tracker) = tracker_for(&["a"]);
        let complete = tracker.complete(true);
        assert_eq!(complete.status, DeployOpStatus::StateChanged);
    }

    #[test]
    fn test_listener_sees_status_changes() {
        struct Recording(Arc<Mutex<Vec<(String, DeployStatus)>>>);
        impl ProgressListener for Recording {
            fn on_status(&mut self, description: &str, status: DeployStatus, _detail: Option<&str>) {
                self.0.lock().unwrap().push((description.into(), status));
            }
            fn on_output(&mut self, _description: &str, _line: &str) {}
            fn on_complete(&mut self, _status: DeployOpStatus) {}
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let (_plan, mut tracker) = tracker_for(&["a"]);
        tracker.set_listener(Box::new(Recording(Arc::clone(&events))));

        tracker
            .set(NodeIdx(1), DeployStatus::Proceeding, None)
            .unwrap();
        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("a".to_string(), DeployStatus::Proceeding));
    }

    #[test]
    fn test_complete_records_op_status() {
        let tree = node("root", vec![leaf("a")]);
        let diff = TreeDiff::between(None, Some(&tree));
        let plan = ExecutionPlan::build(
            &[],
            &PrimitiveDependencies::new(),
            &diff,
            Some(&tree),
            GoalStatus::Deployed,
        )
        .unwrap();

        let deployment = Deployment::ephemeral("test");
        let op_id = deployment.new_op(GoalStatus::Deployed).unwrap();
        let mut tracker = StatusTracker::new(&plan, deployment.clone(), op_id);
        for idx in 0..plan.len() {
            tracker
                .set(NodeIdx(idx), DeployStatus::Deployed, None)
                .unwrap();
        }
        tracker.complete(false);

        let record = deployment.record();
        assert_eq!(record.ops[0].status, Some(DeployOpStatus::Deployed));
    }
}
