//! Execution plan - a DAG of element and action nodes
//!
//! The plan owns every node in a single arena; all references between
//! nodes are stable integer indices, so the graph carries no ownership
//! cycles. Element nodes wait on structural containment edges; acting
//! nodes carry a plugin's operation plus the dependencies of every element
//! they claim. Claimed element nodes hold a hard edge on their acting
//! node - an element is not ready until its action ran.

use crate::deploy::types::{
    Action, ActionOp, Change, DeployHelpers, GoalStatus, PrimitiveDependencies, Relation,
};
use crate::error::{Error, Result};
use crate::tree::{Element, ElementId, TreeDiff};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Stable index of a node within its plan's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(pub usize);

impl fmt::Display for NodeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

/// Readiness and execution info for one plan node
pub struct WaitInfo {
    /// Human-readable description (element id or action detail)
    pub description: String,
    /// Changes this node applies, for acting nodes
    pub acting_for: Option<Vec<Change>>,
    /// The operation to invoke, for acting nodes
    pub action: Option<ActionOp>,
    /// Declared dependencies, re-evaluated every polling pass
    pub depends_on: Option<Relation>,
    /// Log the action's detail when dispatching
    pub log_action: bool,
}

impl fmt::Debug for WaitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitInfo")
            .field("description", &self.description)
            .field("acting_for", &self.acting_for)
            .field("depends_on", &self.depends_on)
            .field("log_action", &self.log_action)
            .finish_non_exhaustive()
    }
}

/// One vertex of the execution plan
#[derive(Debug)]
pub struct EPNode {
    /// The element this node stands for; acting nodes have none
    pub element: Option<Arc<Element>>,
    /// Terminal status this node drives toward
    pub goal: GoalStatus,
    /// Structural children, by index
    pub children: Vec<NodeIdx>,
    /// Nodes that must reach their goal before this one, by index
    ///
    /// Carries the element-to-acting-node claim links; everything else is
    /// expressed through `wait_info.depends_on`.
    pub hard_deps: Vec<NodeIdx>,
    pub wait_info: WaitInfo,
}

impl EPNode {
    /// Whether this node carries an operation to invoke
    pub fn is_action(&self) -> bool {
        self.wait_info.action.is_some()
    }

    pub fn description(&self) -> &str {
        &self.wait_info.description
    }
}

/// The validated execution graph for one deployment pass
#[derive(Debug)]
pub struct ExecutionPlan {
    nodes: Vec<EPNode>,
    by_element: HashMap<ElementId, NodeIdx>,
    goal: GoalStatus,
}

impl ExecutionPlan {
    /// Build a plan from the combined plugin actions, the previous run's
    /// dependency map, the structural diff, and the new tree.
    ///
    /// Every element of the new tree becomes a node with the plan goal;
    /// every deleted element becomes a node with goal `Destroyed`.
    pub fn build(
        actions: &[Action],
        prev_dependencies: &PrimitiveDependencies,
        diff: &TreeDiff,
        new_tree: Option<&Arc<Element>>,
        goal: GoalStatus,
    ) -> Result<Self> {
        let mut builder = Builder::new(goal);

        if let Some(tree) = new_tree {
            for el in Element::walk(tree) {
                builder.add_element(el, goal)?;
            }
        }
        for el in &diff.deleted {
            builder.add_element(Arc::clone(el), GoalStatus::Destroyed)?;
        }

        builder.link_structure();
        builder.link_prev_dependencies(prev_dependencies);
        for action in actions {
            builder.add_action(action);
        }

        Ok(builder.finish())
    }

    /// Validate the graph: no cycles, no dependency on an element absent
    /// from the plan. Both are fatal planning errors, reported before any
    /// action runs.
    pub fn check(&self) -> Result<()> {
        for node in &self.nodes {
            if let Some(rel) = &node.wait_info.depends_on {
                for dep in rel.to_dependencies() {
                    if !self.by_element.contains_key(&dep) {
                        return Err(Error::UnresolvedDependency(dep.to_string()));
                    }
                }
            }
        }
        self.check_cycles()
    }

    fn check_cycles(&self) -> Result<()> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path: Vec<usize> = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                return Err(Error::Cycle(cycle));
            }
        }
        Ok(())
    }

    fn visit(&self, idx: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<String> {
        marks[idx] = Mark::InProgress;
        path.push(idx);

        for dep in self.dependency_indices(NodeIdx(idx)) {
            match marks[dep.0] {
                Mark::Done => {}
                Mark::InProgress => {
                    let mut names: Vec<&str> = path
                        .iter()
                        .skip_while(|i| **i != dep.0)
                        .map(|i| self.nodes[*i].description())
                        .collect();
                    names.push(self.nodes[dep.0].description());
                    return Some(names.join(" -> "));
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep.0, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        marks[idx] = Mark::Done;
        None
    }

    /// Indices of every node this node depends on, hard edges and
    /// relation edges combined. Relation targets absent from the plan are
    /// skipped here; `check` reports them.
    pub(crate) fn dependency_indices(&self, idx: NodeIdx) -> Vec<NodeIdx> {
        let node = &self.nodes[idx.0];
        let mut deps = node.hard_deps.clone();
        if let Some(rel) = &node.wait_info.depends_on {
            for dep in rel.to_dependencies() {
                if let Some(target) = self.by_element.get(&dep) {
                    deps.push(*target);
                }
            }
        }
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    pub fn nodes(&self) -> &[EPNode] {
        &self.nodes
    }

    pub fn node(&self, idx: NodeIdx) -> &EPNode {
        &self.nodes[idx.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn goal(&self) -> GoalStatus {
        self.goal
    }

    /// Node standing for the given element, if it participates
    pub fn node_of(&self, id: &ElementId) -> Option<NodeIdx> {
        self.by_element.get(id).copied()
    }

    /// Element-level dependency map of this plan, for persistence and
    /// display. Acting-node dependencies are attributed to the elements
    /// the action claims.
    pub fn primitive_dependencies(&self) -> PrimitiveDependencies {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for node in &self.nodes {
            let Some(el) = &node.element else { continue };
            let entry = map.entry(el.id().to_string()).or_default();
            if let Some(rel) = &node.wait_info.depends_on {
                for dep in rel.to_dependencies() {
                    if dep != *el.id() {
                        entry.insert(dep.to_string());
                    }
                }
            }
        }

        for node in &self.nodes {
            let (Some(changes), Some(rel)) =
                (&node.wait_info.acting_for, &node.wait_info.depends_on)
            else {
                continue;
            };
            let deps = rel.to_dependencies();
            for change in changes {
                let id = change.element.id();
                let entry = map.entry(id.to_string()).or_default();
                for dep in &deps {
                    if dep != id {
                        entry.insert(dep.to_string());
                    }
                }
            }
        }

        map.into_iter()
            .map(|(id, deps)| (id, deps.into_iter().collect()))
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

struct Builder {
    nodes: Vec<EPNode>,
    rels: Vec<Vec<Relation>>,
    by_element: HashMap<ElementId, NodeIdx>,
    parent_of: HashMap<ElementId, ElementId>,
    goal: GoalStatus,
}

impl Builder {
    fn new(goal: GoalStatus) -> Self {
        Self {
            nodes: Vec::new(),
            rels: Vec::new(),
            by_element: HashMap::new(),
            parent_of: HashMap::new(),
            goal,
        }
    }

    fn add_element(&mut self, el: Arc<Element>, goal: GoalStatus) -> Result<NodeIdx> {
        if self.by_element.contains_key(el.id()) {
            return Err(Error::Internal(format!(
                "duplicate element {} in execution plan",
                el.id()
            )));
        }
        let idx = NodeIdx(self.nodes.len());
        self.by_element.insert(el.id().clone(), idx);
        self.nodes.push(EPNode {
            goal,
            children: Vec::new(),
            hard_deps: Vec::new(),
            wait_info: WaitInfo {
                description: el.id().to_string(),
                acting_for: None,
                action: None,
                depends_on: None,
                log_action: false,
            },
            element: Some(el),
        });
        self.rels.push(Vec::new());
        Ok(idx)
    }

    /// Turn parent/child containment into ordering edges.
    ///
    /// Deploying, a parent waits on each child; destroying, the edge is
    /// inverted so the child waits on its parent.
    fn link_structure(&mut self) {
        for idx in 0..self.nodes.len() {
            let Some(el) = self.nodes[idx].element.clone() else {
                continue;
            };
            for child in el.children() {
                let Some(child_idx) = self.by_element.get(child.id()).copied() else {
                    continue;
                };
                self.nodes[idx].children.push(child_idx);
                self.parent_of
                    .entry(child.id().clone())
                    .or_insert_with(|| el.id().clone());

                let edge = Relation::edge(el.id().clone(), child.id().clone());
                match self.nodes[idx].goal {
                    GoalStatus::Deployed => self.rels[idx].push(edge),
                    GoalStatus::Destroyed => self.rels[child_idx.0].push(edge.inverse()),
                }
            }
        }
    }

    /// Invert the previous run's deploy-order dependencies for the nodes
    /// being destroyed.
    fn link_prev_dependencies(&mut self, prev: &PrimitiveDependencies) {
        for idx in 0..self.nodes.len() {
            let Some(el) = self.nodes[idx].element.clone() else {
                continue;
            };
            if self.nodes[idx].goal != GoalStatus::Destroyed {
                continue;
            }
            let Some(deps) = prev.get(el.id().as_str()) else {
                continue;
            };
            for dep in deps {
                let dep_id = ElementId::new(dep.clone());
                match self.by_element.get(&dep_id).copied() {
                    Some(dep_idx) => {
                        let edge = Relation::edge(el.id().clone(), dep_id);
                        self.rels[dep_idx.0].push(edge.inverse());
                    }
                    None => log::debug!(
                        "dropping previous dependency {dep} of {}: not in this deployment",
                        el.id()
                    ),
                }
            }
        }
    }

    /// One acting node per action. Its dependencies are the union of the
    /// claimed components' declared relations and the claimed elements'
    /// structural edges; each claimed element waits on the acting node.
    fn add_action(&mut self, action: &Action) {
        let action_idx = NodeIdx(self.nodes.len());
        self.nodes.push(EPNode {
            element: None,
            goal: self.goal,
            children: Vec::new(),
            hard_deps: Vec::new(),
            wait_info: WaitInfo {
                description: action.detail.clone(),
                acting_for: Some(action.changes.clone()),
                action: Some(Arc::clone(&action.op)),
                depends_on: None,
                log_action: true,
            },
        });
        self.rels.push(Vec::new());

        let mut claimed: HashSet<ElementId> = HashSet::new();
        for change in &action.changes {
            let el = &change.element;
            if !claimed.insert(el.id().clone()) {
                continue;
            }
            let Some(el_idx) = self.by_element.get(el.id()).copied() else {
                log::debug!(
                    "action {:?} references element {} outside this deployment",
                    action.detail,
                    el.id()
                );
                continue;
            };

            let el_goal = self.nodes[el_idx.0].goal;
            let helpers = DeployHelpers::new(el.id().clone());
            if let Some(rel) = el.component().depends_on(el_goal, &helpers) {
                self.rels[action_idx.0].push(rel);
            }

            match el_goal {
                GoalStatus::Deployed => {
                    for child in el.children() {
                        if self.by_element.contains_key(child.id()) {
                            self.rels[action_idx.0]
                                .push(Relation::edge(el.id().clone(), child.id().clone()));
                        }
                    }
                }
                GoalStatus::Destroyed => {
                    if let Some(parent) = self.parent_of.get(el.id()) {
                        if self.by_element.contains_key(parent) {
                            self.rels[action_idx.0].push(
                                Relation::edge(parent.clone(), el.id().clone()).inverse(),
                            );
                        }
                    }
                }
            }

            self.nodes[el_idx.0].hard_deps.push(action_idx);
        }
    }

    fn finish(mut self) -> ExecutionPlan {
        for (idx, rels) in self.rels.into_iter().enumerate() {
            self.nodes[idx].wait_info.depends_on = match rels.len() {
                0 => None,
                1 => rels.into_iter().next(),
                _ => Some(Relation::And(rels)),
            };
        }
        ExecutionPlan {
            nodes: self.nodes,
            by_element: self.by_element,
            goal: self.goal,
        }
    }
}
