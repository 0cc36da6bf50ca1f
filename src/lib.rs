//! # Stratus
//!
//! A declarative infrastructure deployment engine: callers hand it a
//! previous and a new tree of resource elements plus a set of provider
//! plugins, and it drives the plugins through a strict lifecycle, builds a
//! dependency-ordered execution plan from their proposed actions, and
//! executes the plan concurrently while tracking per-node status.
//!
//! ## Core Concepts
//!
//! - **Element**: an addressable node in the externally-built resource
//!   tree, carrying a [`Component`] behavior object
//! - **Plugin**: a provider backend that observes the world and proposes
//!   [`Action`]s for the diff between the two trees
//! - **ExecutionPlan**: the validated DAG of element and acting nodes
//! - **StatusTracker**: per-node deployment status for one execute pass
//! - **Relation**: a composable readiness expression over dependencies
//!   (the `relation` workspace crate)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stratus::{
//!     ActOptions, Deployment, GoalStatus, PluginManager, PluginRegistration,
//!     PluginRegistry, StartOptions,
//! };
//!
//! let mut registry = PluginRegistry::new();
//! registry.register(PluginRegistration {
//!     name: "containers".into(),
//!     package: "provider-local".into(),
//!     version: "0.1.0".into(),
//!     create: Arc::new(|| Box::new(ContainerPlugin::default())),
//! })?;
//!
//! let deployment = Deployment::ephemeral("my-app");
//! let op_id = deployment.new_op(GoalStatus::Deployed)?;
//!
//! let mut manager = PluginManager::new(&registry)?;
//! manager.start(StartOptions {
//!     data_dir: data_dir.into(),
//!     deployment,
//!     op_id,
//!     prev_tree: None,
//!     new_tree: Some(tree),
//!     prev_dependencies: Default::default(),
//! })?;
//! manager.observe()?;
//! manager.analyze()?;
//! manager.act(ActOptions::default())?;
//! manager.finish()?;
//! ```

pub mod deploy;
pub mod error;
pub mod record;
pub mod tree;

// Re-export main types at crate root
pub use deploy::{
    ActComplete, ActOptions, Action, ActionOp, AnalyzeResult, Change, ChangeKind, DeployHelpers,
    DeployOpStatus, DeployStatus, EPNode, ExecuteComplete, ExecuteOptions, ExecutionPlan,
    GoalStatus, NoProgress, NodeIdx, Observation, Plugin, PluginManager, PluginRegistration,
    PluginRegistry, PrimitiveDependencies, ProgressListener, Relation, StartOptions,
    StatusTracker, WaitInfo, execute,
};
pub use error::{Error, NodeFailure, Result};
pub use record::{DeployOpId, Deployment, DeploymentRecord, DeploymentStore, OpRecord};
pub use relation::{Readiness, Waiting};
pub use tree::{Component, Element, ElementId, ObserveQuery, TreeDiff};
