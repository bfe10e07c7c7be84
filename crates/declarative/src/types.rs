//! Core types for declarative resource management

use crate::context::AbortSignal;
use crate::error::{Error, NodeFailure, PartialApplyReport, Result};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The closed set of resource kinds the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    User,
    Policy,
    Role,
    UserPolicyAttachment,
    RolePolicyAttachment,
    AccessKey,
    LoginProfile,
}

impl ResourceKind {
    /// Every kind, in a stable order
    pub const ALL: [Self; 7] = [
        Self::User,
        Self::Policy,
        Self::Role,
        Self::UserPolicyAttachment,
        Self::RolePolicyAttachment,
        Self::AccessKey,
        Self::LoginProfile,
    ];

    /// Name used in configuration and identities
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Policy => "policy",
            Self::Role => "role",
            Self::UserPolicyAttachment => "user_policy_attachment",
            Self::RolePolicyAttachment => "role_policy_attachment",
            Self::AccessKey => "access_key",
            Self::LoginProfile => "login_profile",
        }
    }

    /// Whether this kind only binds two other resources
    pub fn is_attachment(&self) -> bool {
        matches!(
            self,
            Self::UserPolicyAttachment | Self::RolePolicyAttachment
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownKind(s.to_string()))
    }
}

/// Identity of a declared resource: (kind, logical name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    /// Parse `kind.name`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidExpression {
            expression: s.to_string(),
            message: message.to_string(),
        };

        let (kind, name) = s
            .split_once('.')
            .ok_or_else(|| invalid("expected `kind.name`"))?;
        if name.is_empty() || name.contains('.') {
            return Err(invalid("expected `kind.name`"));
        }
        Ok(Self::new(kind.parse()?, name))
    }
}

/// A concrete attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Literal {
    /// Borrow the value as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a bool, if it is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the value as an integer, if it is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Fully resolved attribute map, as sent to and returned by a provider
pub type Attributes = BTreeMap<String, Literal>;

/// A provider operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single resource node
///
/// `Absent -> Pending -> Created -> (Updated)* -> Destroying -> Absent`,
/// plus `Failed`, entered from any in-flight transition. A failed node may
/// only retry the operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Absent,
    Pending,
    Created,
    Updated,
    Destroying,
    Failed { operation: Operation },
}

impl NodeStatus {
    /// Initial status for a node given whether it has a state entry
    pub fn initial(has_state: bool) -> Self {
        if has_state { Self::Created } else { Self::Absent }
    }

    /// Whether `self -> next` is permitted
    pub fn can_transition(&self, next: &Self) -> bool {
        const CREATE: Operation = Operation::Create;
        const UPDATE: Operation = Operation::Update;
        const DELETE: Operation = Operation::Delete;

        match (self, next) {
            (Self::Absent, Self::Pending) => true,
            (Self::Pending, Self::Created) => true,
            (Self::Pending, Self::Failed { operation: CREATE }) => true,
            (Self::Created | Self::Updated, Self::Updated) => true,
            (Self::Created | Self::Updated, Self::Failed { operation: UPDATE }) => true,
            (Self::Created | Self::Updated, Self::Destroying) => true,
            (Self::Destroying, Self::Absent) => true,
            (Self::Destroying, Self::Failed { operation: DELETE }) => true,
            // Retry of the operation that failed, nothing else
            (Self::Failed { operation: CREATE }, Self::Pending) => true,
            (Self::Failed { operation: UPDATE }, Self::Updated) => true,
            (Self::Failed { operation: UPDATE }, Self::Failed { operation: UPDATE }) => true,
            (Self::Failed { operation: DELETE }, Self::Destroying) => true,
            _ => false,
        }
    }

    /// Move to `next`, or report the forbidden transition
    pub fn advance(&mut self, resource: &ResourceId, next: Self) -> Result<()> {
        if !self.can_transition(&next) {
            return Err(Error::InvalidTransition {
                resource: resource.clone(),
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Pending => write!(f, "pending"),
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Destroying => write!(f, "destroying"),
            Self::Failed { operation } => write!(f, "failed({operation})"),
        }
    }
}

/// Result of processing one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    /// No changes needed
    NoChange,
    /// Resource was created
    Created,
    /// Resource was updated in place
    Updated,
    /// Resource was destroyed and recreated
    Replaced,
    /// Resource was deleted
    Deleted,
    /// Provider call failed
    Failed { error: String },
    /// Never scheduled
    NotAttempted { reason: String },
}

impl ApplyResult {
    /// Check if the result represents success (dependents may proceed)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. } | Self::NotAttempted { .. })
    }

    /// Check if the result represents a change
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted
        )
    }
}

/// Per-node entry of an execution summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: ResourceId,
    pub result: ApplyResult,
    pub status: NodeStatus,
}

/// Summary of execution results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub no_change: usize,
    pub failed: usize,
    pub not_attempted: usize,
    /// Nodes declined at the confirmation prompt
    pub skipped: usize,
    /// Whether scheduling stopped on a user abort
    pub aborted: bool,
    /// Per-node results in completion order
    pub nodes: Vec<NodeReport>,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Check if execution was fully successful
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.not_attempted == 0 && !self.aborted
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.no_change + self.failed + self.not_attempted + self.skipped
    }

    /// Add a node result to the summary
    pub fn add_result(&mut self, id: ResourceId, result: ApplyResult, status: NodeStatus) {
        match &result {
            ApplyResult::NoChange => self.no_change += 1,
            ApplyResult::Created => self.created += 1,
            ApplyResult::Updated => self.updated += 1,
            ApplyResult::Replaced => self.replaced += 1,
            ApplyResult::Deleted => self.deleted += 1,
            ApplyResult::Failed { .. } => self.failed += 1,
            ApplyResult::NotAttempted { .. } => self.not_attempted += 1,
        }
        self.nodes.push(NodeReport { id, result, status });
    }

    /// Result recorded for a node
    pub fn result_of(&self, id: &ResourceId) -> Option<&ApplyResult> {
        self.nodes.iter().find(|n| &n.id == id).map(|n| &n.result)
    }

    /// Order in which nodes finished
    pub fn completion_order(&self) -> Vec<&ResourceId> {
        self.nodes
            .iter()
            .filter(|n| !matches!(n.result, ApplyResult::NotAttempted { .. }))
            .map(|n| &n.id)
            .collect()
    }

    /// Succeeded, failed and never-attempted nodes
    pub fn partial_report(&self) -> PartialApplyReport {
        let mut report = PartialApplyReport {
            aborted: self.aborted,
            ..PartialApplyReport::default()
        };
        for node in &self.nodes {
            match &node.result {
                ApplyResult::Failed { error } => report.failed.push(NodeFailure {
                    resource: node.id.clone(),
                    error: error.clone(),
                }),
                ApplyResult::NotAttempted { .. } => report.not_attempted.push(node.id.clone()),
                _ => report.succeeded.push(node.id.clone()),
            }
        }
        report
    }

    /// `Ok` if every node succeeded, otherwise [`Error::PartialApply`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::PartialApply(Box::new(self.partial_report())))
        }
    }
}

/// What happens to the rest of a run when one node fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop scheduling every node not yet started
    #[default]
    AbortAll,
    /// Stop only the failed node's dependency chain
    AbortBranch,
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Don't make changes, just compute the plan
    pub dry_run: bool,
    /// Maximum number of provider calls in flight
    pub jobs: usize,
    /// Log every attribute change at info level instead of debug
    pub verbose: bool,
    /// Failure handling; `None` uses the operation's default
    pub on_failure: Option<FailurePolicy>,
    /// Whether state entries no longer declared are deleted
    pub prune_orphans: bool,
    /// Retry policy for throttled provider calls
    pub retry: RetryConfig,
    /// Raised to stop scheduling nodes that have not started
    pub abort: AbortSignal,
}

impl ExecuteOptions {
    /// Failure policy for apply, defaulting to aborting everything
    pub fn apply_policy(&self) -> FailurePolicy {
        self.on_failure.unwrap_or(FailurePolicy::AbortAll)
    }

    /// Failure policy for destroy, defaulting to aborting the branch
    pub fn destroy_policy(&self) -> FailurePolicy {
        self.on_failure.unwrap_or(FailurePolicy::AbortBranch)
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            verbose: false,
            on_failure: None,
            prune_orphans: true,
            retry: RetryConfig::default(),
            abort: AbortSignal::default(),
        }
    }
}
