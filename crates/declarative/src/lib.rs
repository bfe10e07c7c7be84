//! # Declarative
//!
//! Declarative resource graphs for identity-and-access resources.
//!
//! This crate turns a set of resource declarations into a dependency graph,
//! plans the difference against recorded state, and converges the remote
//! system through a [`Provider`] with bounded parallelism.
//!
//! ## Core Concepts
//!
//! - **ResourceDeclaration**: Desired state of one remote object (user, policy, role, ...)
//! - **Reference**: An attribute whose value is another resource's attribute, `${kind.name.attribute}`
//! - **DependencyGraph**: Declarations ordered so every node comes after what it references
//! - **ExecutionPlan**: Per-node create/update/replace/delete decisions
//! - **StateStore**: What was applied last time, keyed by resource identity
//! - **Executor**: Applies or destroys a graph in dependency order
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     Configuration, DependencyGraph, ExecuteOptions, MemoryStateStore,
//!     ResourceDeclaration, ResourceKind, apply_simple,
//! };
//!
//! let config = Configuration::new(vec![
//!     ResourceDeclaration::new(ResourceKind::User, "lb").with("name", "loadbalancer"),
//!     ResourceDeclaration::new(ResourceKind::Policy, "ro")
//!         .with("name", "lb-ro")
//!         .with("policy", r#"{"Version":"2012-10-17","Statement":[]}"#),
//!     ResourceDeclaration::new(ResourceKind::UserPolicyAttachment, "lb_ro")
//!         .with_ref("user", "${user.lb.name}")?
//!         .with_ref("policy_arn", "${policy.ro.arn}")?,
//! ])?;
//!
//! let graph = DependencyGraph::from_configuration(&config)?;
//! let state = MemoryStateStore::new();
//! let summary = apply_simple(&graph, &state, &my_provider, &ExecuteOptions::default())?;
//! assert_eq!(summary.created, 3);
//! ```
//!
//! ## Provider Traits
//!
//! The crate uses traits for dependency injection:
//!
//! - [`Provider`]: Create/read/update/delete against the remote API
//! - [`StateStore`]: Persistence of applied state
//! - [`ProgressCallback`]: Receives progress updates
//! - [`ConfirmCallback`]: Handles user confirmations
//!
//! This allows the crate to be used without hard dependencies on
//! specific cloud SDKs, storage backends or UI frameworks.

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod output;
pub mod planner;
pub mod reference;
pub mod resource;
pub mod retry;
pub mod state;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use context::{
    AbortSignal, ApplyContext, AutoConfirm, AutoDecline, ConfirmCallback, Created, FileLoader,
    FsLoader, NoProgress, Phase, ProgressCallback, Provider,
};
pub use diff::{AttributeChange, DesiredValue, DiffSummary, group_by_kind};
pub use error::{Error, ErrorCategory, PartialApplyReport, ProviderError, Result};
pub use executor::{apply, apply_simple, destroy, destroy_simple, refresh};
pub use graph::{DependencyGraph, Direction};
pub use output::{
    MASK, OutputDeclaration, OutputEntry, OutputValue, SensitiveOutput, collect_outputs,
    output_value,
};
pub use planner::{ExecutionPlan, PlannedAction, PlannedNode, Target, plan, plan_destroy};
pub use reference::{Reference, check_outputs, resolve_references};
pub use resource::{AttributeRef, Configuration, FileContent, KindSchema, ResourceDeclaration, Value};
pub use retry::RetryConfig;
pub use state::{MemoryStateStore, RemoteResourceState, StateStore};
pub use types::{
    ApplyResult, Attributes, ExecuteOptions, ExecuteSummary, FailurePolicy, Literal, NodeReport,
    NodeStatus, Operation, ResourceId, ResourceKind,
};
