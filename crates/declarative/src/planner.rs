//! Execution planner - decides what each node needs before anything runs

use crate::diff::{AttributeChange, DesiredAttributes, DesiredValue, compute_changes, resolve_desired};
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::state::{RemoteResourceState, StateStore};
use crate::types::{ResourceId, ResourceKind};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// What will happen to one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Create,
    Update,
    /// Delete then create; `fields` are the immutable inputs that changed
    Replace { fields: Vec<String> },
    NoOp,
    Delete,
}

impl PlannedAction {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Marker used in plan listings
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace { .. } => "-/+",
            Self::NoOp => " ",
            Self::Delete => "-",
        }
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Create => "create",
            Self::Update => "update in place",
            Self::Replace { .. } => "replace",
            Self::NoOp => "no changes",
            Self::Delete => "destroy",
        };
        f.write_str(verb)
    }
}

/// One node of a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    pub id: ResourceId,
    pub action: PlannedAction,
    pub changes: Vec<AttributeChange>,
}

impl PlannedNode {
    fn new(id: ResourceId, action: PlannedAction, changes: Vec<AttributeChange>) -> Self {
        Self {
            id,
            action,
            changes,
        }
    }

    /// The informational error explaining a replace
    pub fn replace_reason(&self) -> Option<Error> {
        match &self.action {
            PlannedAction::Replace { fields } => Some(Error::ImmutableFieldReplaceRequired {
                resource: self.id.clone(),
                fields: fields.clone(),
            }),
            _ => None,
        }
    }
}

/// The planned actions of a run
///
/// `orphans` are state entries no longer declared, in deletion order; they
/// run before `nodes`, which are in execution order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub orphans: Vec<PlannedNode>,
    pub nodes: Vec<PlannedNode>,
}

impl ExecutionPlan {
    /// Orphans first, then declared nodes
    pub fn all_nodes(&self) -> impl Iterator<Item = &PlannedNode> {
        self.orphans.iter().chain(&self.nodes)
    }

    pub fn get(&self, id: &ResourceId) -> Option<&PlannedNode> {
        self.all_nodes().find(|n| &n.id == id)
    }

    /// Number of nodes that will change
    pub fn change_count(&self) -> usize {
        self.all_nodes().filter(|n| n.action.is_change()).count()
    }

    pub fn has_changes(&self) -> bool {
        self.change_count() > 0
    }

    /// Total number of nodes in the plan
    pub fn total_resources(&self) -> usize {
        self.orphans.len() + self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty() && self.nodes.is_empty()
    }

    /// Declared nodes that will be deleted and recreated
    pub fn replacements(&self) -> impl Iterator<Item = &ResourceId> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.action, PlannedAction::Replace { .. }))
            .map(|n| &n.id)
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.all_nodes().filter(|n| n.action.is_change()) {
            writeln!(f, "{:>3} {} ({})", node.action.symbol(), node.id, node.action)?;
            for change in &node.changes {
                writeln!(f, "      {change}")?;
            }
        }
        Ok(())
    }
}

/// A `--target` selector: `kind` or `kind.name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: ResourceKind,
    pub name: Option<String>,
}

impl Target {
    pub fn matches(&self, id: &ResourceId) -> bool {
        id.kind == self.kind && self.name.as_ref().is_none_or(|n| *n == id.name)
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [kind] => Ok(Self {
                kind: kind.parse()?,
                name: None,
            }),
            [kind, name] if !name.is_empty() => Ok(Self {
                kind: kind.parse()?,
                name: Some((*name).to_string()),
            }),
            _ => Err(Error::InvalidExpression {
                expression: s.to_string(),
                message: "expected `kind` or `kind.name`".to_string(),
            }),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}.{name}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// State entries with no declaration, in an order that is safe to delete
///
/// Ordering uses the dependencies recorded at apply time: an entry is
/// deleted before anything it depended on.
pub fn orphans_in_deletion_order(
    graph: &DependencyGraph,
    entries: &[RemoteResourceState],
) -> Vec<RemoteResourceState> {
    let orphans: Vec<&RemoteResourceState> =
        entries.iter().filter(|e| !graph.contains(&e.id)).collect();
    let index: HashMap<&ResourceId, usize> =
        orphans.iter().enumerate().map(|(i, e)| (&e.id, i)).collect();

    // dependents[i]: orphans that recorded a dependency on orphan i
    let mut dependents = vec![Vec::new(); orphans.len()];
    let mut remaining = vec![0usize; orphans.len()];
    for (i, entry) in orphans.iter().enumerate() {
        for dependency in &entry.dependencies {
            if let Some(&j) = index.get(dependency) {
                dependents[j].push(i);
                remaining[i] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..orphans.len())
        .filter(|&i| remaining[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(orphans.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.push(Reverse(d));
            }
        }
    }
    // Recorded dependencies can only form a cycle if state was edited by
    // hand; whatever is left goes last.
    order.extend((0..orphans.len()).filter(|&i| remaining[i] > 0));

    order.reverse();
    order.into_iter().map(|i| orphans[i].clone()).collect()
}

/// Plan an apply of `graph` against recorded state
///
/// Nodes come out in topological order. A node referencing an output of a
/// node being created or replaced sees that value as unknown, so it is
/// planned as an update, or a replace when the field is immutable.
pub fn plan(
    graph: &DependencyGraph,
    state: &dyn StateStore,
    include_orphans: bool,
) -> Result<ExecutionPlan> {
    let entries = state.list()?;
    let recorded: HashMap<&ResourceId, &RemoteResourceState> =
        entries.iter().map(|e| (&e.id, e)).collect();

    let mut desired_by: HashMap<ResourceId, DesiredAttributes> = HashMap::new();
    let mut pending: HashSet<ResourceId> = HashSet::new();
    let mut nodes = Vec::with_capacity(graph.len());

    for id in graph.topological_order() {
        let Some(declaration) = graph.get(id) else {
            continue;
        };
        let prior = recorded.get(id).copied();

        let desired = resolve_desired(declaration, |reference| {
            let target = &reference.target;
            let schema = target.kind.schema();
            if schema.is_input(&reference.attribute)
                && let Some(value) = desired_by
                    .get(target)
                    .and_then(|attrs| attrs.get(&reference.attribute))
            {
                return value.clone();
            }
            if pending.contains(target) {
                return DesiredValue::Unknown { sensitive: false };
            }
            recorded
                .get(target)
                .and_then(|entry| entry.value(&reference.attribute))
                .map_or(DesiredValue::Unknown { sensitive: false }, |value| {
                    DesiredValue::known(value.clone())
                })
        });

        let changes = compute_changes(id.kind, &desired, prior.map(|p| &p.inputs));
        let action = match prior {
            None => PlannedAction::Create,
            Some(_) if changes.is_empty() => PlannedAction::NoOp,
            Some(_) => {
                let fields: Vec<String> = changes
                    .iter()
                    .filter(|c| c.forces_replace)
                    .map(|c| c.attribute.clone())
                    .collect();
                if fields.is_empty() {
                    PlannedAction::Update
                } else {
                    PlannedAction::Replace { fields }
                }
            }
        };

        if matches!(action, PlannedAction::Create | PlannedAction::Replace { .. }) {
            pending.insert(id.clone());
        }
        let node = PlannedNode::new(id.clone(), action, changes);
        if let Some(reason) = node.replace_reason() {
            log::info!("{reason}");
        }
        desired_by.insert(id.clone(), desired);
        nodes.push(node);
    }

    let orphans = if include_orphans {
        orphans_in_deletion_order(graph, &entries)
            .into_iter()
            .map(|entry| PlannedNode::new(entry.id, PlannedAction::Delete, Vec::new()))
            .collect()
    } else {
        Vec::new()
    };

    let plan = ExecutionPlan { orphans, nodes };
    log::debug!(
        "planned {} change(s) across {} node(s)",
        plan.change_count(),
        plan.total_resources()
    );
    Ok(plan)
}

/// Plan a destroy of `graph`: every node with a state entry is deleted, in
/// reverse topological order
pub fn plan_destroy(
    graph: &DependencyGraph,
    state: &dyn StateStore,
    include_orphans: bool,
) -> Result<ExecutionPlan> {
    let entries = state.list()?;
    let recorded: HashSet<&ResourceId> = entries.iter().map(|e| &e.id).collect();

    let nodes = graph
        .reverse_topological_order()
        .into_iter()
        .map(|id| {
            let action = if recorded.contains(id) {
                PlannedAction::Delete
            } else {
                PlannedAction::NoOp
            };
            PlannedNode::new(id.clone(), action, Vec::new())
        })
        .collect();

    let orphans = if include_orphans {
        orphans_in_deletion_order(graph, &entries)
            .into_iter()
            .map(|entry| PlannedNode::new(entry.id, PlannedAction::Delete, Vec::new()))
            .collect()
    } else {
        Vec::new()
    };

    Ok(ExecutionPlan { orphans, nodes })
}
