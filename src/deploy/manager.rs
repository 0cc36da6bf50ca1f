//! Plugin manager - drives registered plugins through one deployment pass
//!
//! The manager is a strict linear state machine: `start -> observe ->
//! analyze -> act -> finish`, with exactly two branch points. After a dry
//! run `act` loops back to pre-analyze (the plan is single-use and must be
//! rebuilt); from pre-act a pass with nothing to do may finish directly.
//! Every operation first validates its transition - an illegal call is a
//! contract violation and mutates nothing.

use crate::deploy::execute::{ExecuteOptions, execute};
use crate::deploy::plan::ExecutionPlan;
use crate::deploy::plugin::{
    Observation, Plugin, PluginKey, PluginRegistration, PluginRegistry, PluginStartOptions,
};
use crate::deploy::status::StatusTracker;
use crate::deploy::types::{
    ActComplete, ActOptions, Action, DeployOpStatus, GoalStatus, PrimitiveDependencies,
    StartOptions,
};
use crate::error::{Error, Result};
use crate::record::{DeployOpId, Deployment};
use crate::tree::{Element, ElementId, TreeDiff};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Initial,
    Starting,
    PreObserve,
    Observing,
    PreAnalyze,
    Analyzing,
    PreAct,
    Acting,
    PreFinish,
    Finishing,
}

impl ManagerState {
    fn name(self) -> &'static str {
        match self {
            Self::Initial => "Initial",
            Self::Starting => "Starting",
            Self::PreObserve => "PreObserve",
            Self::Observing => "Observing",
            Self::PreAnalyze => "PreAnalyze",
            Self::Analyzing => "Analyzing",
            Self::PreAct => "PreAct",
            Self::Acting => "Acting",
            Self::PreFinish => "PreFinish",
            Self::Finishing => "Finishing",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn legal_transition(prev: ManagerState, next: ManagerState) -> bool {
    use ManagerState::{
        Acting, Analyzing, Finishing, Initial, Observing, PreAct, PreAnalyze, PreFinish,
        PreObserve, Starting,
    };
    match prev {
        Initial => next == Starting,
        Starting => next == PreObserve,
        PreObserve => next == Observing,
        Observing => next == PreAnalyze,
        PreAnalyze => matches!(next, Analyzing | Finishing),
        Analyzing => next == PreAct,
        // Finish without acting when there is nothing to act on.
        PreAct => matches!(next, Acting | Finishing),
        // Dry runs loop back to re-analyze; real runs proceed to finish.
        Acting => matches!(next, PreAnalyze | PreFinish),
        PreFinish => next == Finishing,
        Finishing => next == Initial,
    }
}

struct PluginInstance {
    key: PluginKey,
    registration: PluginRegistration,
    plugin: Box<dyn Plugin>,
}

struct Session {
    deployment: Deployment,
    op_id: DeployOpId,
    goal: GoalStatus,
    prev_tree: Option<Arc<Element>>,
    new_tree: Option<Arc<Element>>,
    prev_dependencies: PrimitiveDependencies,
}

/// Result of one `analyze` call
#[derive(Debug)]
pub struct AnalyzeResult {
    /// Combined actions of all plugins, in registration order
    pub actions: Vec<Action>,
    /// Element-level dependency map of the built plan
    pub dependencies: PrimitiveDependencies,
}

/// Drives a set of registered plugins through a single deployment pass
pub struct PluginManager {
    plugins: Vec<PluginInstance>,
    state: ManagerState,
    session: Option<Session>,
    observations: BTreeMap<PluginKey, String>,
    actions: Vec<Action>,
    plan: Option<(ExecutionPlan, StatusTracker)>,
}

impl PluginManager {
    /// Instantiate every plugin in the registry
    pub fn new(registry: &PluginRegistry) -> Result<Self> {
        let plugins = registry
            .instantiate()?
            .into_iter()
            .map(|(registration, plugin)| PluginInstance {
                key: registration.key(),
                registration,
                plugin,
            })
            .collect();
        Ok(Self {
            plugins,
            state: ManagerState::Initial,
            session: None,
            observations: BTreeMap::new(),
            actions: Vec::new(),
            plan: None,
        })
    }

    fn transition_to(&mut self, next: ManagerState) -> Result<()> {
        if !legal_transition(self.state, next) {
            return Err(Error::IllegalTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        Ok(())
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::Internal("must call start before this operation".into()))
    }

    /// Start every plugin concurrently, creating its private data
    /// directory first. Any plugin failure aborts the whole operation.
    pub fn start(&mut self, options: StartOptions) -> Result<()> {
        self.transition_to(ManagerState::Starting)?;

        let goal = GoalStatus::from_new_tree(options.new_tree.as_ref());
        let deploy_id = options.deployment.deploy_id();

        let start_opts: Vec<PluginStartOptions> = self
            .plugins
            .iter()
            .map(|inst| PluginStartOptions {
                data_dir: inst.registration.data_dir(&options.data_dir),
                deploy_id: deploy_id.clone(),
            })
            .collect();
        for opts in &start_opts {
            fs::create_dir_all(&opts.data_dir)?;
        }

        self.plugins
            .par_iter_mut()
            .zip(start_opts.par_iter())
            .map(|(inst, opts)| {
                inst.plugin.start(opts).map_err(|cause| Error::Plugin {
                    key: inst.key.clone(),
                    phase: "start",
                    cause,
                })
            })
            .collect::<Result<Vec<()>>>()?;

        self.session = Some(Session {
            deployment: options.deployment,
            op_id: options.op_id,
            goal,
            prev_tree: options.prev_tree,
            new_tree: options.new_tree,
            prev_dependencies: options.prev_dependencies,
        });
        self.observations.clear();
        self.actions.clear();
        self.plan = None;

        self.transition_to(ManagerState::PreObserve)
    }

    /// Ask every plugin to observe the tree pair concurrently.
    ///
    /// Observations are serialized to a canonical JSON string per plugin
    /// key and round-tripped back through that form in `analyze`.
    pub fn observe(&mut self) -> Result<BTreeMap<PluginKey, Observation>> {
        self.transition_to(ManagerState::Observing)?;
        let session = self.session()?;
        let prev_tree = session.prev_tree.clone();
        let new_tree = session.new_tree.clone();

        let observed: Vec<(PluginKey, Observation)> = self
            .plugins
            .par_iter_mut()
            .map(|inst| {
                let obs = inst
                    .plugin
                    .observe(prev_tree.as_ref(), new_tree.as_ref())
                    .map_err(|cause| Error::Plugin {
                        key: inst.key.clone(),
                        phase: "observe",
                        cause,
                    })?;
                Ok((inst.key.clone(), obs))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut ret = BTreeMap::new();
        for (key, obs) in observed {
            let canonical = serde_json::to_string(&obs).map_err(|err| Error::Plugin {
                key: key.clone(),
                phase: "observe",
                cause: err.into(),
            })?;
            self.observations.insert(key.clone(), canonical);
            ret.insert(key, obs);
        }

        self.transition_to(ManagerState::PreAnalyze)?;
        Ok(ret)
    }

    /// Collect every plugin's proposed actions, cross-check them against
    /// the structural diff, and build and validate the execution plan.
    pub fn analyze(&mut self) -> Result<AnalyzeResult> {
        self.transition_to(ManagerState::Analyzing)?;
        let session = self.session()?;
        let prev_tree = session.prev_tree.clone();
        let new_tree = session.new_tree.clone();

        let mut actions: Vec<Action> = Vec::new();
        for inst in &mut self.plugins {
            let canonical = self.observations.get(&inst.key).ok_or_else(|| {
                Error::Internal(format!("no observation recorded for {}", inst.key))
            })?;
            let obs: Observation =
                serde_json::from_str(canonical).map_err(|err| Error::Plugin {
                    key: inst.key.clone(),
                    phase: "analyze",
                    cause: err.into(),
                })?;
            let proposed = inst
                .plugin
                .analyze(prev_tree.as_ref(), new_tree.as_ref(), obs)
                .map_err(|cause| Error::Plugin {
                    key: inst.key.clone(),
                    phase: "analyze",
                    cause,
                })?;
            actions.extend(proposed);
        }
        self.actions = actions;

        let diff = TreeDiff::between(prev_tree.as_ref(), new_tree.as_ref());
        let claims = check_claimed_elements(&diff, &self.actions);
        claims.log_warnings();

        let session = self.session()?;
        let plan = ExecutionPlan::build(
            &self.actions,
            &session.prev_dependencies,
            &diff,
            session.new_tree.as_ref(),
            session.goal,
        )?;
        plan.check()?;

        let tracker = StatusTracker::new(&plan, session.deployment.clone(), session.op_id);
        let dependencies = plan.primitive_dependencies();
        self.plan = Some((plan, tracker));

        self.transition_to(ManagerState::PreAct)?;
        Ok(AnalyzeResult {
            actions: self.actions.clone(),
            dependencies,
        })
    }

    /// Execute the analyzed plan.
    ///
    /// The plan and its tracker are consumed; a dry run returns the
    /// manager to the pre-analyze state so a fresh plan gets built. A
    /// failed deployment surfaces as [`Error::DeployFailed`] listing every
    /// failing action.
    pub fn act(&mut self, options: ActOptions) -> Result<ActComplete> {
        self.transition_to(ManagerState::Acting)?;
        let (plan, mut tracker) = self.plan.take().ok_or_else(|| {
            Error::Internal("a fresh execution plan is required; call analyze before act".into())
        })?;
        let goal = self.session()?.goal;

        tracker.set_dry_run(options.dry_run);
        tracker.set_listener(options.listener);

        let complete = execute(
            &plan,
            tracker,
            ExecuteOptions {
                ignore_delete_errors: options.ignore_delete_errors,
                timeout: options.timeout,
                poll_delay: options.poll_delay,
                state_updates: options.state_updates,
            },
        )?;

        if complete.status == DeployOpStatus::Failed {
            return Err(Error::DeployFailed(complete.failures));
        }
        let deploy_complete = complete.status == goal.op_status();
        if !deploy_complete && complete.status != DeployOpStatus::StateChanged {
            return Err(Error::Internal(format!(
                "unexpected deployment status {} from execute",
                complete.status
            )));
        }

        if options.dry_run {
            self.transition_to(ManagerState::PreAnalyze)?;
        } else {
            self.transition_to(ManagerState::PreFinish)?;
        }
        Ok(ActComplete {
            deploy_complete,
            state_changed: complete.state_changed,
        })
    }

    /// Finish every plugin concurrently and clear all per-pass state
    pub fn finish(&mut self) -> Result<()> {
        self.transition_to(ManagerState::Finishing)?;

        self.plugins
            .par_iter_mut()
            .map(|inst| {
                inst.plugin.finish().map_err(|cause| Error::Plugin {
                    key: inst.key.clone(),
                    phase: "finish",
                    cause,
                })
            })
            .collect::<Result<Vec<()>>>()?;

        self.session = None;
        self.observations.clear();
        self.actions.clear();
        self.plan = None;

        self.transition_to(ManagerState::Initial)
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("state", &self.state)
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

/// Elements the diff expected some plugin to claim, but none did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClaimCheck {
    /// New or updated elements no change referenced
    pub unclaimed_new: Vec<ElementId>,
    /// Deleted elements no change referenced
    pub unclaimed_deleted: Vec<ElementId>,
    /// Changes referencing elements absent from both trees, with the
    /// change's detail
    pub unknown: Vec<(ElementId, String)>,
}

impl ClaimCheck {
    pub fn is_clean(&self) -> bool {
        self.unclaimed_new.is_empty() && self.unclaimed_deleted.is_empty() && self.unknown.is_empty()
    }

    /// Emit the diagnostic warnings. Never blocks execution.
    pub fn log_warnings(&self) {
        for (id, detail) in &self.unknown {
            log::warn!(
                "Element {id} was specified as affected by a plugin action but was not \
                 found in the old or new tree as expected (change: {detail})"
            );
        }
        if !self.unclaimed_new.is_empty() {
            log::warn!(
                "The following new or updated elements were not claimed by any deployment \
                 plugin and will probably not be correctly deployed: {}",
                join_ids(&self.unclaimed_new)
            );
        }
        if !self.unclaimed_deleted.is_empty() {
            log::warn!(
                "The following deleted elements were not claimed by any deployment \
                 plugin and will probably not be correctly deleted: {}",
                join_ids(&self.unclaimed_deleted)
            );
        }
    }
}

fn join_ids(ids: &[ElementId]) -> String {
    ids.iter()
        .map(ElementId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cross-check the structural diff against the combined plugin actions.
///
/// Every added or retained element and every deleted element should be
/// referenced by exactly one change, unless its component type opts out
/// of plugin handling. Each element is checked once even when several
/// changes reference it.
pub fn check_claimed_elements(diff: &TreeDiff, actions: &[Action]) -> ClaimCheck {
    fn has_plugin(el: &Element) -> bool {
        !el.component().no_plugin()
    }

    let mut expected_new: BTreeSet<ElementId> = diff
        .added
        .iter()
        .chain(diff.common_new.iter())
        .filter(|el| has_plugin(el))
        .map(|el| el.id().clone())
        .collect();
    let mut expected_deleted: BTreeSet<ElementId> = diff
        .deleted
        .iter()
        .filter(|el| has_plugin(el))
        .map(|el| el.id().clone())
        .collect();

    let mut check = ClaimCheck::default();
    let mut done: HashSet<ElementId> = HashSet::new();

    for change in actions.iter().flat_map(|a| &a.changes) {
        let el = &change.element;
        if !has_plugin(el) {
            continue;
        }
        if !done.insert(el.id().clone()) {
            continue;
        }
        if !expected_new.remove(el.id()) && !expected_deleted.remove(el.id()) {
            check.unknown.push((el.id().clone(), change.detail.clone()));
        }
    }

    check.unclaimed_new = expected_new.into_iter().collect();
    check.unclaimed_deleted = expected_deleted.into_iter().collect();
    check
}
