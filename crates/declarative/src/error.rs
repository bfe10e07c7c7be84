//! Error types for graph construction and execution.
//!
//! Static errors ([`Error::UnresolvedReference`], [`Error::CyclicDependency`]
//! and the validation variants) are raised before any provider call.
//! Runtime failures are wrapped per resource and operation, and a run that
//! did not complete is summarized as [`Error::PartialApply`].

use crate::types::{NodeStatus, Operation, ResourceId, ResourceKind};
use std::fmt;
use thiserror::Error;

/// Categories of provider errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The remote object does not exist
    NotFound,
    /// The request conflicts with existing remote state
    Conflict,
    /// Rate limited; the request was not processed
    Throttled,
    /// The request was understood and refused
    Rejected,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this error category is transient and worth retrying.
    ///
    /// Only throttling qualifies: a throttled request was never processed,
    /// so repeating it cannot duplicate a remote object.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotFound => "Remote object not found",
            Self::Conflict => "Conflicting remote state",
            Self::Throttled => "Request throttled",
            Self::Rejected => "Request rejected",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::NotFound => "Run `refresh` to drop state entries for objects removed out of band",
            Self::Conflict => "Remove the conflicting object or its dependents first",
            Self::Throttled => "Lower the number of parallel jobs and try again",
            Self::Rejected => "Check the attribute values of the resource",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors reported by a [`Provider`](crate::context::Provider).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with existing remote state
    #[error("conflict: {0}")]
    Conflict(String),

    /// The remote API rate limited the request
    #[error("throttled: {0}")]
    Throttled(String),

    /// The remote API refused the request
    #[error("rejected: {0}")]
    Rejected(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Conflict(_) => ErrorCategory::Conflict,
            Self::Throttled(_) => ErrorCategory::Throttled,
            Self::Rejected(_) => ErrorCategory::Rejected,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether the remote object is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Why a reference could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// No declaration has the target identity
    UndeclaredResource,
    /// The target kind has no such input or output attribute
    UnknownAttribute,
    /// The attribute is an input the target does not set
    UnsetInput,
    /// The output only exists when the target sets the named input
    ConditionalOutput(&'static str),
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndeclaredResource => write!(f, "resource is not declared"),
            Self::UnknownAttribute => write!(f, "attribute does not exist on that kind"),
            Self::UnsetInput => write!(f, "input is not set on that resource"),
            Self::ConditionalOutput(input) => {
                write!(f, "output is only computed when `{input}` is set")
            }
        }
    }
}

/// A node that failed during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub resource: ResourceId,
    pub error: String,
}

/// Outcome of a run that did not complete: which nodes succeeded, which
/// failed, and which were never attempted.
///
/// Succeeded nodes keep the state they reached; nothing is rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialApplyReport {
    /// Nodes whose operation completed (including no-ops)
    pub succeeded: Vec<ResourceId>,
    /// Nodes whose provider call failed
    pub failed: Vec<NodeFailure>,
    /// Nodes never scheduled because a dependency failed or the run stopped
    pub not_attempted: Vec<ResourceId>,
    /// Whether scheduling stopped because of a user abort
    pub aborted: bool,
}

impl fmt::Display for PartialApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} not attempted",
            self.succeeded.len(),
            self.failed.len(),
            self.not_attempted.len()
        )?;
        if self.aborted {
            write!(f, " (aborted)")?;
        }
        for failure in &self.failed {
            write!(f, "\n  {}: {}", failure.resource, failure.error)?;
        }
        Ok(())
    }
}

fn shown_remote_id<'a>(resource: &ResourceId, remote_id: &'a str) -> &'a str {
    resource.kind.schema().display_remote_id(remote_id)
}

/// Errors that can occur while building or executing a resource graph.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown resource kind name
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// Malformed identity or reference expression
    #[error("invalid expression `{expression}`: {message}")]
    InvalidExpression { expression: String, message: String },

    /// Two declarations share a (kind, name) identity
    #[error("duplicate resource declaration: {0}")]
    DuplicateResource(ResourceId),

    /// An attribute the kind does not accept
    #[error("{resource}: unknown attribute `{attribute}` for kind {kind}")]
    UnknownAttribute {
        resource: ResourceId,
        kind: ResourceKind,
        attribute: String,
    },

    /// A required attribute was not declared
    #[error("{resource}: missing required attribute `{attribute}`")]
    MissingAttribute {
        resource: ResourceId,
        attribute: String,
    },

    /// A reference points at something that is not declared
    #[error("{from}.{field}: unresolved reference to {target}.{attribute} ({reason})")]
    UnresolvedReference {
        from: ResourceId,
        field: String,
        target: ResourceId,
        attribute: String,
        reason: UnresolvedReason,
    },

    /// A named output points at something that is not declared
    #[error("output `{output}`: unresolved reference to {target}.{attribute} ({reason})")]
    UnresolvedOutput {
        output: String,
        target: ResourceId,
        attribute: String,
        reason: UnresolvedReason,
    },

    /// The references between resources form a cycle
    #[error("dependency cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<ResourceId> },

    /// A provider call failed
    #[error("{resource}: {operation} failed: {source}")]
    ProviderCall {
        resource: ResourceId,
        operation: Operation,
        #[source]
        source: ProviderError,
    },

    /// Informational: an immutable field changed, the node will be replaced
    #[error("{resource}: immutable field(s) {} changed, resource must be replaced", .fields.join(", "))]
    ImmutableFieldReplaceRequired {
        resource: ResourceId,
        fields: Vec<String>,
    },

    /// A run stopped before every node reached its target state
    #[error("run incomplete: {0}")]
    PartialApply(Box<PartialApplyReport>),

    /// A referenced value is not present in the dependency's state entry
    #[error("{resource}: value for {target}.{attribute} is not available")]
    MissingReferenceValue {
        resource: ResourceId,
        target: ResourceId,
        attribute: String,
    },

    /// A node lifecycle transition that the state machine forbids
    #[error("{resource}: invalid transition {from} -> {to}")]
    InvalidTransition {
        resource: ResourceId,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// A target selector matched nothing
    #[error("target `{0}` matches no declared resource")]
    UnknownTarget(String),

    /// A named output does not exist
    #[error("output `{0}` is not declared")]
    UnknownOutput(String),

    /// State store failure
    #[error("state store: {0}")]
    StateStore(String),

    /// The provider created an object but its state entry could not be
    /// written; the next run does not know the object exists
    #[error(
        "{resource}: created remotely as {} but not recorded in state: {message}",
        shown_remote_id(.resource, .remote_id)
    )]
    UnrecordedCreate {
        resource: ResourceId,
        remote_id: String,
        message: String,
    },

    /// Worker pool could not be created
    #[error("failed to create worker pool: {0}")]
    ThreadPool(String),

    /// A progress or confirmation callback failed
    #[error(transparent)]
    Callback(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error was detected before any provider call.
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            Self::UnknownKind(_)
                | Self::InvalidExpression { .. }
                | Self::DuplicateResource(_)
                | Self::UnknownAttribute { .. }
                | Self::MissingAttribute { .. }
                | Self::UnresolvedReference { .. }
                | Self::UnresolvedOutput { .. }
                | Self::CyclicDependency { .. }
                | Self::UnknownTarget(_)
        )
    }

    /// The partial-run report, if this error carries one.
    pub fn partial_report(&self) -> Option<&PartialApplyReport> {
        match self {
            Self::PartialApply(report) => Some(report),
            _ => None,
        }
    }
}

fn format_cycle(cycle: &[ResourceId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, Error>;
