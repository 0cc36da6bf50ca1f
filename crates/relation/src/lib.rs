//! # Relation
//!
//! Composable boolean-readiness expressions over dependencies.
//!
//! A [`Relation`] answers one question: "is this set of dependencies
//! satisfied yet?" Relations are plain value objects - evaluating one is
//! side-effect-free, and unreadiness is data ([`Waiting`]), never an error.
//! The caller supplies the dependency lookup at evaluation time, so the
//! same relation can be re-evaluated against changing state on every
//! polling pass.
//!
//! ## Example
//!
//! ```
//! use relation::Relation;
//!
//! let rel = Relation::and([
//!     Relation::edge("db", "network"),
//!     Relation::edge("db", "volume"),
//! ]);
//!
//! // Nothing deployed yet: both edges report waiting.
//! let status = rel.ready(&|_dep: &&str| false);
//! assert!(!status.is_ready());
//!
//! // Everything deployed: the relation is satisfied.
//! assert!(rel.ready(&|_dep: &&str| true).is_ready());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a relation is not ready yet.
///
/// Carries a human-readable status line plus the not-ready sub-relations,
/// so diagnostics can show exactly which dependencies are still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waiting {
    /// Human-readable status line
    pub status: String,
    /// Not-ready sub-relations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<Waiting>,
}

impl Waiting {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            related: Vec::new(),
        }
    }

    pub fn with_related(status: impl Into<String>, related: Vec<Waiting>) -> Self {
        Self {
            status: status.into(),
            related,
        }
    }
}

impl fmt::Display for Waiting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)
    }
}

/// Result of evaluating a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The relation is satisfied
    Ready,
    /// The relation is not satisfied yet
    Waiting(Waiting),
}

impl Readiness {
    /// Check if the result represents readiness
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Get the waiting detail, if not ready
    pub fn waiting(&self) -> Option<&Waiting> {
        match self {
            Self::Ready => None,
            Self::Waiting(w) => Some(w),
        }
    }

    /// Consume into the waiting detail, if not ready
    pub fn into_waiting(self) -> Option<Waiting> {
        match self {
            Self::Ready => None,
            Self::Waiting(w) => Some(w),
        }
    }
}

/// A composable readiness predicate over dependencies of type `D`.
///
/// `Edge` is the only variant that consults the dependency lookup; all
/// other variants combine the readiness of their children. [`inverse`]
/// swaps the direction of every edge, which is how a destroy-order graph
/// is derived from a deploy-order graph.
///
/// [`inverse`]: Relation::inverse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation<D> {
    /// Always ready
    True,
    /// Never ready
    False,
    /// Passes through the child's readiness
    Identity(Box<Relation<D>>),
    /// Ready only if the child is not ready
    Not(Box<Relation<D>>),
    /// Ready iff all children are ready
    And(Vec<Relation<D>>),
    /// Ready iff any child is ready
    Or(Vec<Relation<D>>),
    /// Ready iff the target dependency is deployed
    Edge { from: D, to: D },
}

impl<D> Relation<D> {
    pub fn identity(child: Self) -> Self {
        Self::Identity(Box::new(child))
    }

    pub fn not(child: Self) -> Self {
        Self::Not(Box::new(child))
    }

    pub fn and(children: impl IntoIterator<Item = Self>) -> Self {
        Self::And(children.into_iter().collect())
    }

    pub fn or(children: impl IntoIterator<Item = Self>) -> Self {
        Self::Or(children.into_iter().collect())
    }

    pub fn edge(from: D, to: D) -> Self {
        Self::Edge { from, to }
    }

    /// Short name of this combinator, for diagnostics
    pub fn description(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Identity(_) => "Identity",
            Self::Not(_) => "Not",
            Self::And(_) => "And",
            Self::Or(_) => "Or",
            Self::Edge { .. } => "Edge",
        }
    }

    /// Swap the direction of every edge in this relation
    pub fn inverse(self) -> Self {
        match self {
            Self::True => Self::True,
            Self::False => Self::False,
            Self::Identity(r) => Self::identity(r.inverse()),
            Self::Not(r) => Self::not(r.inverse()),
            Self::And(rs) => Self::And(rs.into_iter().map(Self::inverse).collect()),
            Self::Or(rs) => Self::Or(rs.into_iter().map(Self::inverse).collect()),
            Self::Edge { from, to } => Self::Edge { from: to, to: from },
        }
    }
}

impl<D: Clone + fmt::Display> Relation<D> {
    /// Evaluate this relation against the given dependency lookup.
    ///
    /// Children are evaluated bottom-up; the lookup is consulted once per
    /// edge. Evaluation never fails - unreadiness is reported as data.
    pub fn ready(&self, is_deployed: &dyn Fn(&D) -> bool) -> Readiness {
        match self {
            Self::True => Readiness::Ready,
            Self::False => Readiness::Waiting(Waiting::new("False is never ready")),
            Self::Identity(r) => r.ready(is_deployed),
            Self::Not(r) => {
                if r.ready(is_deployed).is_ready() {
                    Readiness::Waiting(Waiting::new("Not ready because child relation is ready"))
                } else {
                    Readiness::Ready
                }
            }
            Self::And(rs) => {
                let not_ready: Vec<Waiting> = rs
                    .iter()
                    .filter_map(|r| r.ready(is_deployed).into_waiting())
                    .collect();
                if not_ready.is_empty() {
                    Readiness::Ready
                } else {
                    Readiness::Waiting(Waiting::with_related(
                        format!("Waiting for {}", n_depends(not_ready.len())),
                        not_ready,
                    ))
                }
            }
            Self::Or(rs) => {
                let not_ready: Vec<Waiting> = rs
                    .iter()
                    .filter_map(|r| r.ready(is_deployed).into_waiting())
                    .collect();
                if not_ready.len() < rs.len() {
                    Readiness::Ready
                } else {
                    Readiness::Waiting(Waiting::with_related(
                        format!("Waiting for any of {}", n_depends(not_ready.len())),
                        not_ready,
                    ))
                }
            }
            Self::Edge { to, .. } => {
                if is_deployed(to) {
                    Readiness::Ready
                } else {
                    Readiness::Waiting(Waiting::new(format!("Waiting for dependency {to}")))
                }
            }
        }
    }

    /// Collect the target of every edge in this relation
    pub fn to_dependencies(&self) -> Vec<D> {
        let mut deps = Vec::new();
        self.collect_dependencies(&mut deps);
        deps
    }

    fn collect_dependencies(&self, deps: &mut Vec<D>) {
        match self {
            Self::True | Self::False => {}
            Self::Identity(r) | Self::Not(r) => r.collect_dependencies(deps),
            Self::And(rs) | Self::Or(rs) => {
                for r in rs {
                    r.collect_dependencies(deps);
                }
            }
            Self::Edge { to, .. } => deps.push(to.clone()),
        }
    }
}

/// Relation that is satisfied once every dependency is satisfied.
///
/// Sugar over [`Relation::And`]: each raw dependency is adapted through
/// `to_relation`.
pub fn all_of<D, I, F>(deps: I, to_relation: F) -> Relation<D>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Relation<D>,
{
    Relation::And(deps.into_iter().map(to_relation).collect())
}

/// Relation that is satisfied once any dependency is satisfied.
pub fn any_of<D, I, F>(deps: I, to_relation: F) -> Relation<D>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Relation<D>,
{
    Relation::Or(deps.into_iter().map(to_relation).collect())
}

/// Relation with no dependencies - always satisfied.
pub fn none<D>() -> Relation<D> {
    Relation::True
}

fn n_depends(n: usize) -> String {
    if n == 1 {
        "1 dependency".to_string()
    } else {
        format!("{n} dependencies")
    }
}
