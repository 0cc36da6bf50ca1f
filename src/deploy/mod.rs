//! Deployment engine
//!
//! The engine turns a set of plugin-proposed change actions into a
//! correctly ordered, partially concurrent, failure-tolerant execution:
//! 1. Plugin manager - drive plugins through observe/analyze/act/finish
//! 2. Plan builder - combine actions, diff, and dependency relations into
//!    a validated DAG
//! 3. Status tracker - per-node status with monotonic transitions
//! 4. Execute - walk the plan in concurrent cohorts

pub mod execute;
pub mod manager;
pub mod plan;
pub mod plugin;
pub mod status;
pub mod types;

pub use execute::{ExecuteOptions, execute};
pub use manager::{AnalyzeResult, ClaimCheck, PluginManager, check_claimed_elements};
pub use plan::{EPNode, ExecutionPlan, NodeIdx, WaitInfo};
pub use plugin::{
    Observation, Plugin, PluginFactory, PluginKey, PluginRegistration, PluginRegistry,
    PluginStartOptions,
};
pub use status::{StatusCounts, StatusTracker};
pub use types::{
    ActComplete, ActOptions, Action, ActionOp, Change, ChangeKind, DeployHelpers, DeployOpStatus,
    DeployStatus, ExecuteComplete, GoalStatus, NoProgress, PrimitiveDependencies,
    ProgressListener, Relation, StartOptions, StateUpdateFn,
};
