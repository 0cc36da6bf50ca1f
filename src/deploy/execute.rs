//! Execution engine - cohort-based concurrent plan walker
//!
//! A single coordinating pass re-evaluates every pending node's
//! dependencies against the status tracker, dispatches the runnable
//! acting nodes concurrently as one cohort, waits for the cohort to
//! settle, and only then writes status updates. The tracker is the only
//! shared mutable state and has exactly one writer, so cohort sequencing
//! is the whole locking story.
//!
//! Action failures never unwind the coordinator: they become the node's
//! `Failed` status and propagate as unmet dependencies. Independent
//! branches of the graph keep running to completion.

use crate::deploy::plan::{EPNode, ExecutionPlan, NodeIdx};
use crate::deploy::status::StatusTracker;
use crate::deploy::types::{ChangeKind, DeployStatus, ExecuteComplete, StateUpdateFn};
use crate::error::{Error, Result};
use crate::tree::ElementId;
use relation::Readiness;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Options for one engine execute pass
pub struct ExecuteOptions {
    /// Downgrade failing delete changes to warnings
    pub ignore_delete_errors: bool,
    /// Give up on nodes still pending after this long
    pub timeout: Option<Duration>,
    /// Pause between polling passes that made no progress
    pub poll_delay: Duration,
    /// Optional persisted-state-change hook, consulted at quiescence
    pub state_updates: Option<StateUpdateFn>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            ignore_delete_errors: false,
            timeout: None,
            poll_delay: Duration::from_millis(100),
            state_updates: None,
        }
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("ignore_delete_errors", &self.ignore_delete_errors)
            .field("timeout", &self.timeout)
            .field("poll_delay", &self.poll_delay)
            .finish_non_exhaustive()
    }
}

enum NodeReadiness {
    /// All dependencies satisfied
    Ready,
    /// Not satisfied yet, but still possible
    Blocked(String),
    /// Can never be satisfied: a dependency failed
    Doomed(String),
}

/// Drive the plan to quiescence under its goal status.
///
/// Returns the deployment-wide outcome; node failures are aggregated in
/// the result, not raised. Only structural problems (deadlock despite the
/// acyclic check) surface as errors.
pub fn execute(
    plan: &ExecutionPlan,
    mut tracker: StatusTracker,
    mut opts: ExecuteOptions,
) -> Result<ExecuteComplete> {
    let deadline = opts.timeout.map(|t| Instant::now() + t);
    let mut dispatched = vec![false; plan.len()];

    while !tracker.all_terminal() {
        let mut progressed = false;
        let mut awaiting_external = false;
        let mut cohort: Vec<NodeIdx> = Vec::new();
        let mut ready_elements: Vec<NodeIdx> = Vec::new();

        for idx in 0..plan.len() {
            let n = NodeIdx(idx);
            if tracker.is_final(n) {
                continue;
            }
            match node_readiness(plan, &tracker, n) {
                NodeReadiness::Ready => {
                    if plan.node(n).is_action() {
                        if !dispatched[idx] {
                            cohort.push(n);
                        }
                    } else {
                        ready_elements.push(n);
                    }
                }
                NodeReadiness::Blocked(detail) => {
                    progressed |= tracker.set(n, DeployStatus::Waiting, Some(detail))?;
                }
                NodeReadiness::Doomed(detail) => {
                    tracker.set(n, DeployStatus::Failed, Some(detail))?;
                    progressed = true;
                }
            }
        }

        if !cohort.is_empty() {
            progressed = true;
            for &n in &cohort {
                dispatched[n.0] = true;
                if plan.node(n).wait_info.log_action {
                    log::info!("Doing {}...", plan.node(n).description());
                }
                tracker.set(n, DeployStatus::Proceeding, None)?;
            }

            let results = if tracker.dry_run() {
                cohort.iter().map(|&n| (n, Ok(()))).collect()
            } else {
                run_cohort(plan, &cohort)
            };

            for (n, result) in results {
                let node = plan.node(n);
                match result {
                    Ok(()) => {
                        tracker.set(n, node.goal.terminal(), None)?;
                    }
                    Err(err) if opts.ignore_delete_errors && is_delete_only(node) => {
                        log::warn!("Ignoring delete error for {}: {err:#}", node.description());
                        tracker.output(n, &format!("Ignored delete error: {err:#}"));
                        tracker.set(n, node.goal.terminal(), None)?;
                    }
                    Err(err) => {
                        log::error!("Error during {}: {err:#}", node.description());
                        tracker.fail(n, format!("{err:#}"))?;
                    }
                }
            }
        }

        for n in ready_elements {
            let node = plan.node(n);
            let readiness = if tracker.dry_run() {
                Readiness::Ready
            } else {
                match &node.element {
                    Some(el) => el.component().deployed_when(node.goal),
                    None => Readiness::Ready,
                }
            };
            match readiness {
                Readiness::Ready => {
                    tracker.set(n, node.goal.terminal(), None)?;
                    progressed = true;
                }
                Readiness::Waiting(w) => {
                    progressed |= tracker.set(n, DeployStatus::Waiting, Some(w.status))?;
                    awaiting_external = true;
                }
            }
        }

        if tracker.all_terminal() {
            break;
        }

        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            timeout_pending(plan, &mut tracker)?;
            break;
        }

        if !progressed {
            if awaiting_external {
                std::thread::sleep(opts.poll_delay);
            } else {
                // The plan was validated acyclic, so a stalled graph is an
                // engine bug, not a user failure.
                return Err(Error::Internal(format!(
                    "deployment deadlocked with {} nodes unresolved",
                    plan.len() - tracker.counts().terminal()
                )));
            }
        }
    }

    let state_changed = match opts.state_updates.as_mut() {
        Some(hook) => hook()
            .map_err(|err| Error::Internal(format!("state update hook failed: {err:#}")))?,
        None => false,
    };
    Ok(tracker.complete(state_changed))
}

/// Evaluate one node's dependencies against the current tracker snapshot
fn node_readiness(plan: &ExecutionPlan, tracker: &StatusTracker, n: NodeIdx) -> NodeReadiness {
    let node = plan.node(n);

    for &dep in &node.hard_deps {
        if tracker.get(dep) == DeployStatus::Failed {
            return NodeReadiness::Doomed(format!(
                "Dependency failed: {}",
                plan.node(dep).description()
            ));
        }
    }
    if let Some(&pending) = node
        .hard_deps
        .iter()
        .find(|&&dep| !tracker.goal_reached(dep))
    {
        return NodeReadiness::Blocked(format!("Waiting for {}", plan.node(pending).description()));
    }

    let Some(rel) = &node.wait_info.depends_on else {
        return NodeReadiness::Ready;
    };

    let is_deployed =
        |id: &ElementId| plan.node_of(id).is_some_and(|dep| tracker.goal_reached(dep));
    match rel.ready(&is_deployed) {
        Readiness::Ready => NodeReadiness::Ready,
        Readiness::Waiting(w) => {
            // Would the relation resolve if every non-failed dependency
            // eventually reached its goal? If not, the node can never run.
            let optimistic = |id: &ElementId| {
                plan.node_of(id)
                    .is_some_and(|dep| tracker.get(dep) != DeployStatus::Failed)
            };
            if rel.ready(&optimistic).is_ready() {
                NodeReadiness::Blocked(w.status)
            } else {
                NodeReadiness::Doomed(w.status)
            }
        }
    }
}

/// Invoke one cohort's operations concurrently and collect their results
fn run_cohort(
    plan: &ExecutionPlan,
    cohort: &[NodeIdx],
) -> Vec<(NodeIdx, anyhow::Result<()>)> {
    let results = Mutex::new(Vec::with_capacity(cohort.len()));

    rayon::scope(|s| {
        for &n in cohort {
            let Some(op) = plan.node(n).wait_info.action.clone() else {
                continue;
            };
            let results = &results;
            s.spawn(move |_| {
                let outcome = op();
                push_result(results, (n, outcome));
            });
        }
    });

    into_results(results)
}

fn push_result<T>(results: &Mutex<Vec<T>>, value: T) {
    match results.lock() {
        Ok(mut locked) => locked.push(value),
        Err(poisoned) => poisoned.into_inner().push(value),
    }
}

fn into_results<T>(results: Mutex<Vec<T>>) -> Vec<T> {
    match results.into_inner() {
        Ok(collected) => collected,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fail every still-pending node with a timeout summary
fn timeout_pending(plan: &ExecutionPlan, tracker: &mut StatusTracker) -> Result<()> {
    for idx in 0..plan.len() {
        let n = NodeIdx(idx);
        if tracker.is_final(n) {
            continue;
        }
        let cause = match tracker.detail(n) {
            Some(detail) => format!("Deployment timed out: {detail}"),
            None => "Deployment timed out".to_string(),
        };
        log::warn!("{}: {cause}", plan.node(n).description());
        tracker.fail(n, cause)?;
    }
    Ok(())
}

fn is_delete_only(node: &EPNode) -> bool {
    node.wait_info.acting_for.as_ref().is_some_and(|changes| {
        !changes.is_empty() && changes.iter().all(|c| c.kind == ChangeKind::Delete)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::types::{
        Action, Change, DeployHelpers, DeployOpStatus, GoalStatus, PrimitiveDependencies, Relation,
    };
    use crate::record::Deployment;
    use crate::tree::testutil::node;
    use crate::tree::{Component, Element, TreeDiff};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct Needs(Vec<&'static str>);

    impl Component for Needs {
        fn kind(&self) -> &str {
            "svc"
        }
        fn depends_on(&self, _goal: GoalStatus, helpers: &DeployHelpers) -> Option<Relation> {
            match self.0.as_slice() {
                [] => None,
                [only] => Some(helpers.only(ElementId::new(*only))),
                many => Some(helpers.all_of(many.iter().map(|id| ElementId::new(*id)))),
            }
        }
    }

    fn element(id: &str, needs: &[&'static str]) -> Arc<Element> {
        Element::new(id, Arc::new(Needs(needs.to_vec())), Vec::new())
    }

    fn create_action(
        detail: &str,
        el: &Arc<Element>,
        op: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Action {
        Action::new(
            detail,
            vec![Change::new(
                ChangeKind::Create,
                Arc::clone(el),
                format!("create {}", el.id()),
            )],
            op,
        )
    }

    fn run(
        actions: &[Action],
        tree: &Arc<Element>,
        opts: ExecuteOptions,
        dry_run: bool,
    ) -> Result<ExecuteComplete> {
        let diff = TreeDiff::between(None, Some(tree));
        let plan = ExecutionPlan::build(
            actions,
            &PrimitiveDependencies::new(),
            &diff,
            Some(tree),
            GoalStatus::Deployed,
        )
        .unwrap();
        plan.check().unwrap();

        let deployment = Deployment::ephemeral("test");
        let op_id = deployment.new_op(GoalStatus::Deployed).unwrap();
        let mut tracker = StatusTracker::new(&plan, deployment, op_id);
        tracker.set_dry_run(dry_run);
        execute(&plan, tracker, opts)
    }

    #[test]
    fn test_empty_plan_completes_immediately() {
        let plan = ExecutionPlan::build(
            &[],
            &PrimitiveDependencies::new(),
            &TreeDiff::default(),
            None,
            GoalStatus::Destroyed,
        )
        .unwrap();
        let deployment = Deployment::ephemeral("test");
        let op_id = deployment.new_op(GoalStatus::Destroyed).unwrap();
        let tracker = StatusTracker::new(&plan, deployment, op_id);

        let complete = execute(&plan, tracker, ExecuteOptions::default()).unwrap();
        assert_eq!(complete.status, DeployOpStatus::Destroyed);
        assert!(complete.failures.is_empty());
    }

    #[test]
    fn test_dependencies_run_before_dependents() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let db = element("db", &[]);
        let web = element("web", &["db"]);
        let tree = node("root", vec![Arc::clone(&web), Arc::clone(&db)]);

        let order_db = Arc::clone(&order);
        let order_web = Arc::clone(&order);
        let actions = [
            create_action("Creating web", &web, move || {
                order_web.lock().unwrap().push("web");
                Ok(())
            }),
            create_action("Creating db", &db, move || {
                order_db.lock().unwrap().push("db");
                Ok(())
            }),
        ];

        let complete = run(&actions, &tree, ExecuteOptions::default(), false).unwrap();
        assert_eq!(complete.status, DeployOpStatus::Deployed);
        assert_eq!(*order.lock().unwrap(), vec!["db", "web"]);
    }

    #[test]
    fn test_failed_dependency_blocks_dependent() {
        let _ = env_logger::builder().is_test(true).try_init();
        let web_ran = Arc::new(AtomicBool::new(false));
        let db = element("db", &[]);
        let web = element("web", &["db"]);
        let tree = node("root", vec![Arc::clone(&web), Arc::clone(&db)]);

        let web_flag = Arc::clone(&web_ran);
        let actions = [
            create_action("Creating db", &db, || anyhow::bail!("connection refused")),
            create_action("Creating web", &web, move || {
                web_flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ];

        let complete = run(&actions, &tree, ExecuteOptions::default(), false).unwrap();
        assert_eq!(complete.status, DeployOpStatus::Failed);
        assert!(!web_ran.load(Ordering::SeqCst));

        // Only the db action failed directly; the web action settled by
        // propagation and reports the unmet dependency.
        assert_eq!(complete.failures.len(), 1);
        assert_eq!(complete.failures[0].description, "Creating db");
        assert!(complete.failures[0].cause.contains("connection refused"));
    }

    #[test]
    fn test_propagated_failure_names_the_dependency() {
        struct LastStatus(Arc<Mutex<Vec<(String, DeployStatus, Option<String>)>>>);
        impl crate::deploy::types::ProgressListener for LastStatus {
            fn on_status(&mut self, description: &str, status: DeployStatus, detail: Option<&str>) {
                self.0.lock().unwrap().push((
                    description.to_string(),
                    status,
                    detail.map(str::to_string),
                ));
            }
            fn on_output(&mut self, _description: &str, _line: &str) {}
            fn on_complete(&mut self, _status: DeployOpStatus) {}
        }

        let db = element("db", &[]);
        let web = element("web", &["db"]);
        let tree = node("root", vec![Arc::clone(&web), Arc::clone(&db)]);

        let actions = [
            create_action("Creating db", &db, || anyhow::bail!("boom")),
            create_action("Creating web", &web, || Ok(())),
        ];

        let diff = TreeDiff::between(None, Some(&tree));
        let plan = ExecutionPlan::build(
            &actions,
            &PrimitiveDependencies::new(),
            &diff,
            Some(&tree),
            GoalStatus::Deployed,
        )
        .unwrap();
        let deployment = Deployment::ephemeral("test");
        let op_id = deployment.new_op(GoalStatus::Deployed).unwrap();
        let mut tracker = StatusTracker::new(&plan, deployment, op_id);

        let events = Arc::new(Mutex::new(Vec::new()));
        tracker.set_listener(Box::new(LastStatus(Arc::clone(&events))));

        let complete = execute(&plan, tracker, ExecuteOptions::default()).unwrap();
        assert_eq!(complete.status, DeployOpStatus::Failed);

        let events = events.lock().unwrap();
        let (_, status, detail) = events
            .iter()
            .rev()
            .find(|(description, _, _)| description == "Creating web")
            .expect("web acting node must settle");
        assert_eq!(*status, DeployStatus::Failed);
        assert!(
            detail
                .as_deref()
                .unwrap_or_default()
                .contains("Waiting for dependency db")
        );
    }

    #[test]
    fn test_independent_branches_run_to_completion() {
        let b_ran = Arc::new(AtomicBool::new(false));
        let a = element("a", &[]);
        let b = element("b", &[]);
        let tree = node("root", vec![Arc::clone(&a), Arc::clone(&b)]);

        let b_flag = Arc::clone(&b_ran);
        let actions = [
            create_action("Creating a", &a, || anyhow::bail!("disk full")),
            create_action("Creating b", &b, move || {
                b_flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ];

        let complete = run(&actions, &tree, ExecuteOptions::default(), false).unwrap();
        assert_eq!(complete.status, DeployOpStatus::Failed);
        assert!(b_ran.load(Ordering::SeqCst));
        assert_eq!(complete.failures.len(), 1);
        assert_eq!(complete.failures[0].description, "Creating a");
    }

    #[test]
    fn test_dry_run_never_invokes_operations() {
        let ran = Arc::new(AtomicBool::new(false));
        let a = element("a", &[]);
        let tree = node("root", vec![Arc::clone(&a)]);

        let flag = Arc::clone(&ran);
        let actions = [create_action("Creating a", &a, move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })];

        let complete = run(&actions, &tree, ExecuteOptions::default(), true).unwrap();
        assert_eq!(complete.status, DeployOpStatus::Deployed);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(complete.failures.is_empty());
    }

    #[test]
    fn test_ignored_delete_errors_do_not_fail_the_deployment() {
        let a = element("a", &[]);
        let stale = element("stale", &[]);
        let tree = node("root", vec![Arc::clone(&a)]);

        let delete_action = Action::new(
            "Deleting stale",
            vec![Change::new(
                ChangeKind::Delete,
                Arc::clone(&stale),
                "delete stale",
            )],
            || anyhow::bail!("already gone"),
        );
        let create = create_action("Creating a", &a, || Ok(()));

        let prev = node("root", vec![Arc::clone(&a), Arc::clone(&stale)]);
        let diff = TreeDiff::between(Some(&prev), Some(&tree));
        let plan = ExecutionPlan::build(
            &[delete_action, create],
            &PrimitiveDependencies::new(),
            &diff,
            Some(&tree),
            GoalStatus::Deployed,
        )
        .unwrap();
        plan.check().unwrap();

        let deployment = Deployment::ephemeral("test");
        let op_id = deployment.new_op(GoalStatus::Deployed).unwrap();
        let tracker = StatusTracker::new(&plan, deployment, op_id);

        let opts = ExecuteOptions {
            ignore_delete_errors: true,
            ..ExecuteOptions::default()
        };
        let complete = execute(&plan, tracker, opts).unwrap();
        assert_eq!(complete.status, DeployOpStatus::Deployed);
        assert!(complete.failures.is_empty());
    }

    #[test]
    fn test_timeout_fails_pending_nodes() {
        #[derive(Debug)]
        struct NeverReady;
        impl Component for NeverReady {
            fn kind(&self) -> &str {
                "svc"
            }
            fn deployed_when(&self, _goal: GoalStatus) -> Readiness {
                Readiness::Waiting(relation::Waiting::new("resource still converging"))
            }
        }

        let slow = Element::new("slow", Arc::new(NeverReady), Vec::new());
        let tree = node("root", vec![Arc::clone(&slow)]);

        let opts = ExecuteOptions {
            timeout: Some(Duration::from_millis(50)),
            poll_delay: Duration::from_millis(5),
            ..ExecuteOptions::default()
        };
        let complete = run(&[], &tree, opts, false).unwrap();
        assert_eq!(complete.status, DeployOpStatus::Failed);
        assert!(
            complete
                .failures
                .iter()
                .any(|f| f.cause.contains("timed out"))
        );
    }

    #[test]
    fn test_state_update_hook_triggers_state_changed() {
        let a = element("a", &[]);
        let tree = node("root", vec![Arc::clone(&a)]);
        let actions = [create_action("Creating a", &a, || Ok(()))];

        let opts = ExecuteOptions {
            state_updates: Some(Box::new(|| Ok(true))),
            ..ExecuteOptions::default()
        };
        let complete = run(&actions, &tree, opts, false).unwrap();
        assert_eq!(complete.status, DeployOpStatus::StateChanged);
        assert!(complete.state_changed);
    }
}
