//! Element tree model and structural diff sets
//!
//! The mounted element tree is built by an external reconciler; the engine
//! treats it as opaque and immutable. Every element carries a behavior
//! object implementing [`Component`], the narrow capability contract the
//! plan builder and status machinery consult.

use crate::deploy::types::{DeployHelpers, GoalStatus, Relation};
use relation::Readiness;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Stable identity of an element within the tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ElementId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ElementId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Query surface handed to [`Component::status`] probes
pub trait ObserveQuery {
    /// Run a provider query and return its result
    fn query(&self, request: &serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// Per-element behavior contract
///
/// Components decide when an element counts as deployed, which other
/// elements it depends on, and how to probe its provider-side status.
/// The defaults suit elements with no readiness conditions of their own.
pub trait Component: Send + Sync + fmt::Debug {
    /// Provider-defined component type name (e.g., "container", "volume")
    fn kind(&self) -> &str;

    /// Whether this element is handled outside the plugin layer
    ///
    /// Opts the element out of the diff cross-check in
    /// [`check_claimed_elements`](crate::deploy::manager::check_claimed_elements).
    fn no_plugin(&self) -> bool {
        false
    }

    /// Readiness of this element toward the given goal
    ///
    /// Re-evaluated every polling pass; return `Waiting` while the
    /// provider-side resource is still converging.
    fn deployed_when(&self, goal: GoalStatus) -> Readiness {
        let _ = goal;
        Readiness::Ready
    }

    /// Dependencies this element declares on other elements
    fn depends_on(&self, goal: GoalStatus, helpers: &DeployHelpers) -> Option<Relation> {
        let _ = (goal, helpers);
        None
    }

    /// Probe the provider for this element's current status
    fn status(&self, observe: &dyn ObserveQuery) -> anyhow::Result<serde_json::Value> {
        let _ = observe;
        Ok(serde_json::Value::Null)
    }
}

/// A node in the mounted element tree
///
/// Equality and hashing are by identity; the component and children are
/// fixed at construction.
#[derive(Debug, Clone)]
pub struct Element {
    id: ElementId,
    component: Arc<dyn Component>,
    children: Vec<Arc<Element>>,
}

impl Element {
    pub fn new(
        id: impl Into<ElementId>,
        component: Arc<dyn Component>,
        children: Vec<Arc<Element>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            component,
            children,
        })
    }

    pub fn id(&self) -> &ElementId {
        &self.id
    }

    pub fn component(&self) -> &dyn Component {
        self.component.as_ref()
    }

    pub fn children(&self) -> &[Arc<Element>] {
        &self.children
    }

    /// All elements of the subtree rooted at `this`, in preorder
    pub fn walk(this: &Arc<Self>) -> Vec<Arc<Element>> {
        let mut out = Vec::new();
        Self::walk_into(this, &mut out);
        out
    }

    fn walk_into(this: &Arc<Self>, out: &mut Vec<Arc<Element>>) {
        out.push(Arc::clone(this));
        for child in &this.children {
            Self::walk_into(child, out);
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Element {}

impl std::hash::Hash for Element {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Structural diff between the previous and new element trees
///
/// The engine consumes these sets as a given; [`TreeDiff::between`] is a
/// by-identity walk for callers that do not bring their own differ.
#[derive(Debug, Clone, Default)]
pub struct TreeDiff {
    /// Elements present only in the new tree
    pub added: Vec<Arc<Element>>,
    /// Elements present only in the previous tree
    pub deleted: Vec<Arc<Element>>,
    /// Elements present in both trees, previous-tree instances
    pub common_old: Vec<Arc<Element>>,
    /// Elements present in both trees, new-tree instances
    pub common_new: Vec<Arc<Element>>,
}

impl TreeDiff {
    /// Diff two trees by element identity
    pub fn between(prev: Option<&Arc<Element>>, new: Option<&Arc<Element>>) -> Self {
        let prev_els = prev.map(Element::walk).unwrap_or_default();
        let new_els = new.map(Element::walk).unwrap_or_default();

        let prev_ids: HashSet<&ElementId> = prev_els.iter().map(|e| e.id()).collect();
        let new_ids: HashSet<&ElementId> = new_els.iter().map(|e| e.id()).collect();

        Self {
            added: new_els
                .iter()
                .filter(|e| !prev_ids.contains(e.id()))
                .cloned()
                .collect(),
            deleted: prev_els
                .iter()
                .filter(|e| !new_ids.contains(e.id()))
                .cloned()
                .collect(),
            common_old: prev_els
                .iter()
                .filter(|e| new_ids.contains(e.id()))
                .cloned()
                .collect(),
            common_new: new_els
                .iter()
                .filter(|e| prev_ids.contains(e.id()))
                .cloned()
                .collect(),
        }
    }

    /// Check if the diff contains no elements at all
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.deleted.is_empty()
            && self.common_old.is_empty()
            && self.common_new.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Minimal component for tree fixtures
    #[derive(Debug)]
    pub struct TestComponent {
        pub kind: &'static str,
        pub no_plugin: bool,
    }

    impl TestComponent {
        pub fn arc(kind: &'static str) -> Arc<dyn Component> {
            Arc::new(Self {
                kind,
                no_plugin: false,
            })
        }
    }

    impl Component for TestComponent {
        fn kind(&self) -> &str {
            self.kind
        }

        fn no_plugin(&self) -> bool {
            self.no_plugin
        }
    }

    pub fn leaf(id: &str) -> Arc<Element> {
        Element::new(id, TestComponent::arc("test"), Vec::new())
    }

    pub fn node(id: &str, children: Vec<Arc<Element>>) -> Arc<Element> {
        Element::new(id, TestComponent::arc("test"), children)
    }
}
