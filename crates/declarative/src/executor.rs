//! Execution engine - drives provider calls in dependency order
//!
//! A coordinator on the calling thread keeps a ready queue of nodes whose
//! prerequisites have finished and dispatches up to `jobs` of them onto a
//! rayon pool. Completions come back over a channel; each one releases the
//! nodes waiting on it, or, on failure, stops the run or the branch
//! depending on the [`FailurePolicy`].

use crate::context::{ApplyContext, ConfirmCallback, Phase, ProgressCallback, Provider};
use crate::diff::{DesiredAttributes, DesiredValue, compute_changes, resolve_concrete, sensitive_fields};
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::planner::{PlannedAction, orphans_in_deletion_order, plan, plan_destroy};
use crate::state::{RemoteResourceState, StateStore};
use crate::types::{
    ApplyResult, Attributes, ExecuteOptions, ExecuteSummary, FailurePolicy, NodeStatus, Operation,
    ResourceId,
};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

/// Final result and lifecycle status of one node task
#[derive(Debug, Clone)]
struct Outcome {
    result: ApplyResult,
    status: NodeStatus,
}

/// Precedence constraints for one phase
struct Schedule {
    ids: Vec<ResourceId>,
    /// Nodes that must finish before this one starts
    waits_for: Vec<Vec<usize>>,
    /// Inverse of `waits_for`
    unlocks: Vec<Vec<usize>>,
    /// Ready-queue priority, lowest first
    rank: Vec<usize>,
    /// Inactive nodes do no work but still pass ordering through
    active: Vec<bool>,
}

impl Schedule {
    fn new(ids: Vec<ResourceId>, waits_for: Vec<Vec<usize>>, rank: Vec<usize>, active: Vec<bool>) -> Self {
        let mut unlocks = vec![Vec::new(); ids.len()];
        for (node, prerequisites) in waits_for.iter().enumerate() {
            for &p in prerequisites {
                unlocks[p].push(node);
            }
        }
        Self {
            ids,
            waits_for,
            unlocks,
            rank,
            active,
        }
    }

    fn graph_ids(graph: &DependencyGraph) -> Vec<ResourceId> {
        graph.nodes().iter().map(|n| n.id.clone()).collect()
    }

    /// Dependencies first; ties go to the earliest declaration
    fn forward(graph: &DependencyGraph, active: Vec<bool>) -> Self {
        let waits_for = (0..graph.len())
            .map(|i| graph.dependency_indices(i).to_vec())
            .collect();
        Self::new(Self::graph_ids(graph), waits_for, (0..graph.len()).collect(), active)
    }

    /// Dependents first; ties follow the reversed topological order
    fn backward(graph: &DependencyGraph, active: Vec<bool>) -> Self {
        let mut rank = vec![0; graph.len()];
        for (position, node) in graph.topological_indices().into_iter().rev().enumerate() {
            rank[node] = position;
        }
        let waits_for = (0..graph.len())
            .map(|i| graph.dependent_indices(i).to_vec())
            .collect();
        Self::new(Self::graph_ids(graph), waits_for, rank, active)
    }

    /// Orphaned entries, already in deletion order
    fn orphans(entries: &[RemoteResourceState]) -> Self {
        let ids: Vec<ResourceId> = entries.iter().map(|e| e.id.clone()).collect();
        let waits_for = ids
            .iter()
            .map(|id| {
                entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.dependencies.contains(id))
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();
        let len = ids.len();
        Self::new(ids, waits_for, (0..len).collect(), vec![true; len])
    }

    /// Independent nodes
    fn unordered(ids: Vec<ResourceId>) -> Self {
        let len = ids.len();
        Self::new(ids, vec![Vec::new(); len], (0..len).collect(), vec![true; len])
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }
}

/// What happened to the nodes of one phase
struct RunReport {
    /// Finished nodes, in completion order
    completed: Vec<(usize, Outcome)>,
    /// Active nodes never dispatched, with the reason
    not_attempted: Vec<(usize, String)>,
    aborted: bool,
}

impl RunReport {
    fn has_failures(&self) -> bool {
        self.aborted
            || !self.not_attempted.is_empty()
            || self.completed.iter().any(|(_, o)| !o.result.is_success())
    }
}

/// Coordinator state for one phase
struct Dispatcher<'s> {
    schedule: &'s Schedule,
    remaining: Vec<usize>,
    blocked: Vec<bool>,
    ready: BinaryHeap<Reverse<(usize, usize)>>,
}

impl<'s> Dispatcher<'s> {
    fn new(schedule: &'s Schedule) -> Self {
        let remaining: Vec<usize> = schedule.waits_for.iter().map(Vec::len).collect();
        let ready = (0..schedule.len())
            .filter(|&i| remaining[i] == 0)
            .map(|i| Reverse((schedule.rank[i], i)))
            .collect();
        Self {
            schedule,
            remaining,
            blocked: vec![false; schedule.len()],
            ready,
        }
    }

    fn next(&mut self) -> Option<usize> {
        self.ready.pop().map(|Reverse((_, node))| node)
    }

    /// A node finished successfully; wake what waited on it
    fn release(&mut self, node: usize) {
        for &next in &self.schedule.unlocks[node] {
            self.remaining[next] -= 1;
            if self.remaining[next] == 0 && !self.blocked[next] {
                self.ready.push(Reverse((self.schedule.rank[next], next)));
            }
        }
    }

    /// A node failed; nothing downstream of it may start
    fn block_downstream(&mut self, node: usize) {
        let mut stack = self.schedule.unlocks[node].clone();
        while let Some(next) = stack.pop() {
            if !self.blocked[next] {
                self.blocked[next] = true;
                stack.extend(&self.schedule.unlocks[next]);
            }
        }
    }
}

/// Run one phase: dispatch `work` for every active node, respecting the
/// schedule, at most `jobs` at a time.
fn run<P, F>(
    schedule: &Schedule,
    phase: Phase,
    opts: &ExecuteOptions,
    policy: FailurePolicy,
    progress: &mut P,
    describe: impl Fn(usize) -> String,
    work: F,
) -> Result<RunReport>
where
    P: ProgressCallback + ?Sized,
    F: Fn(usize) -> Outcome + Sync,
{
    let jobs = opts.jobs.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .map_err(|e| Error::ThreadPool(e.to_string()))?;

    let mut dispatcher = Dispatcher::new(schedule);
    let mut outcomes: Vec<Option<Outcome>> = vec![None; schedule.len()];
    let mut completed = Vec::new();
    let mut stopped = false;
    let mut aborted = false;
    // `None` reports a task that panicked
    let (tx, rx) = mpsc::channel::<(usize, Option<Outcome>)>();
    let work = &work;

    progress.on_batch_start(schedule.active_count(), phase);
    log::debug!("{phase}: {} node(s), {jobs} job(s)", schedule.active_count());

    pool.in_place_scope(|scope| {
        let mut in_flight = 0;
        loop {
            while !stopped && in_flight < jobs {
                if opts.abort.is_aborted() {
                    log::warn!("{phase}: abort requested, waiting for {in_flight} in-flight call(s)");
                    aborted = true;
                    stopped = true;
                    break;
                }
                let Some(node) = dispatcher.next() else {
                    break;
                };
                if !schedule.active[node] {
                    dispatcher.release(node);
                    continue;
                }

                progress.on_resource_start(&schedule.ids[node], &describe(node));
                let tx = tx.clone();
                scope.spawn(move |_| {
                    // The receiver outlives the scope
                    match panic::catch_unwind(AssertUnwindSafe(|| work(node))) {
                        Ok(outcome) => {
                            let _ = tx.send((node, Some(outcome)));
                        }
                        Err(payload) => {
                            let _ = tx.send((node, None));
                            panic::resume_unwind(payload);
                        }
                    }
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }
            let Ok((node, outcome)) = rx.recv() else {
                break;
            };
            in_flight -= 1;
            // The scope re-raises the panic once in-flight work drains
            let Some(outcome) = outcome else {
                log::error!("{}: task panicked, stopping the run", schedule.ids[node]);
                stopped = true;
                continue;
            };

            progress.on_resource_complete(&schedule.ids[node], &outcome.result);
            if outcome.result.is_success() {
                dispatcher.release(node);
            } else {
                match policy {
                    FailurePolicy::AbortAll => stopped = true,
                    FailurePolicy::AbortBranch => dispatcher.block_downstream(node),
                }
            }
            completed.push((node, outcome.clone()));
            outcomes[node] = Some(outcome);
        }
    });

    progress.on_batch_complete();

    let mut not_attempted: Vec<(usize, String)> = (0..schedule.len())
        .filter(|&i| schedule.active[i] && outcomes[i].is_none())
        .map(|i| {
            let reason = if dispatcher.blocked[i] {
                "a dependency failed"
            } else if aborted {
                "aborted"
            } else {
                "run stopped after a failure"
            };
            (i, reason.to_string())
        })
        .collect();
    not_attempted.sort_by_key(|&(i, _)| schedule.rank[i]);

    Ok(RunReport {
        completed,
        not_attempted,
        aborted,
    })
}

/// Record a phase's results; `keep_success` drops successful outcomes
/// that a later phase reports on
fn record(summary: &mut ExecuteSummary, schedule: &Schedule, report: &RunReport, keep_success: bool) {
    for (node, outcome) in &report.completed {
        if keep_success || !outcome.result.is_success() {
            summary.add_result(schedule.ids[*node].clone(), outcome.result.clone(), outcome.status);
        }
    }
    for (node, reason) in &report.not_attempted {
        summary.add_result(
            schedule.ids[*node].clone(),
            ApplyResult::NotAttempted {
                reason: reason.clone(),
            },
            NodeStatus::Absent,
        );
    }
    summary.aborted |= report.aborted;
}

/// Mark every active node of `schedule` not attempted
fn skip_all(summary: &mut ExecuteSummary, schedule: &Schedule, statuses: &[NodeStatus], reason: &str) {
    for node in (0..schedule.len()).filter(|&i| schedule.active[i]) {
        summary.add_result(
            schedule.ids[node].clone(),
            ApplyResult::NotAttempted {
                reason: reason.to_string(),
            },
            statuses[node],
        );
    }
}

/// Turn a task's result into an outcome, logging failures
fn finish(id: &ResourceId, status: NodeStatus, result: Result<ApplyResult>) -> Outcome {
    match result {
        Ok(result) => Outcome { result, status },
        Err(e) => {
            log::error!("{e}");
            match &e {
                Error::ProviderCall { source, .. } => {
                    log::debug!("{id}: {}", source.category().advice());
                }
                Error::UnrecordedCreate { .. } => {
                    log::warn!("{id}: delete the remote object or restore state before the next apply");
                }
                _ => {}
            }
            Outcome {
                result: ApplyResult::Failed {
                    error: e.to_string(),
                },
                status,
            }
        }
    }
}

fn provider_error(id: &ResourceId, operation: Operation, source: crate::error::ProviderError) -> Error {
    Error::ProviderCall {
        resource: id.clone(),
        operation,
        source,
    }
}

/// Delete the remote object recorded for `id` and drop its state entry.
///
/// A remote object that is already gone counts as deleted.
fn destroy_node(ctx: &ApplyContext<'_>, id: &ResourceId, status: &mut NodeStatus) -> Result<ApplyResult> {
    let Some(entry) = ctx.state.get(id)? else {
        return Ok(ApplyResult::NoChange);
    };

    status.advance(id, NodeStatus::Destroying)?;
    match ctx.delete(id, &entry.remote_id) {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            log::debug!("{id}: already deleted remotely");
        }
        Err(e) => {
            status.advance(
                id,
                NodeStatus::Failed {
                    operation: Operation::Delete,
                },
            )?;
            return Err(provider_error(id, Operation::Delete, e));
        }
    }

    ctx.state.delete(id)?;
    status.advance(id, NodeStatus::Absent)?;
    log::info!("{id}: deleted ({})", entry.display_remote_id());
    Ok(ApplyResult::Deleted)
}

fn create_node(
    ctx: &ApplyContext<'_>,
    id: &ResourceId,
    attributes: Attributes,
    dependencies: Vec<ResourceId>,
    status: &mut NodeStatus,
) -> Result<()> {
    status.advance(id, NodeStatus::Pending)?;
    let created = match ctx.create(id, &attributes) {
        Ok(created) => created,
        Err(e) => {
            status.advance(
                id,
                NodeStatus::Failed {
                    operation: Operation::Create,
                },
            )?;
            return Err(provider_error(id, Operation::Create, e));
        }
    };

    let entry = RemoteResourceState::new(id.clone(), created.remote_id, attributes, created.attributes)
        .with_dependencies(dependencies);
    log::info!("{id}: created ({})", entry.display_remote_id());
    // The object exists remotely whether or not it gets recorded
    status.advance(id, NodeStatus::Created)?;
    ctx.record_created(&entry)
}

/// Bring one declared node to its desired state.
///
/// The action is decided from values substituted now, after every
/// dependency finished, so a dependency that was replaced earlier in the
/// run is seen with its new outputs.
fn apply_node(
    ctx: &ApplyContext<'_>,
    graph: &DependencyGraph,
    node: usize,
    recreated: bool,
    verbose: bool,
    status: &mut NodeStatus,
) -> Result<ApplyResult> {
    let declaration = graph.node(node);
    let id = &declaration.id;
    let attributes = resolve_concrete(declaration, ctx.state)?;
    let dependencies: Vec<ResourceId> = graph
        .dependency_indices(node)
        .iter()
        .map(|&d| graph.node(d).id.clone())
        .collect();

    let Some(prior) = ctx.state.get(id)? else {
        create_node(ctx, id, attributes, dependencies, status)?;
        return Ok(if recreated {
            ApplyResult::Replaced
        } else {
            ApplyResult::Created
        });
    };

    // Values copied from a secret stay masked in the change log
    let secret = sensitive_fields(declaration);
    let desired: DesiredAttributes = attributes
        .iter()
        .map(|(k, v)| {
            let value = DesiredValue::Known {
                value: v.clone(),
                sensitive: secret.contains(k.as_str()),
            };
            (k.clone(), value)
        })
        .collect();
    let changes = compute_changes(id.kind, &desired, Some(&prior.inputs));
    if changes.is_empty() {
        return Ok(ApplyResult::NoChange);
    }

    if changes.iter().any(|c| c.forces_replace) {
        log::info!("{id}: replacing in place");
        destroy_node(ctx, id, status)?;
        create_node(ctx, id, attributes, dependencies, status)?;
        return Ok(ApplyResult::Replaced);
    }

    for change in &changes {
        if verbose {
            log::info!("{id}: {change}");
        } else {
            log::debug!("{id}: {change}");
        }
    }
    let outputs = match ctx.update(id, &prior.remote_id, &attributes) {
        Ok(outputs) => outputs,
        Err(e) => {
            status.advance(
                id,
                NodeStatus::Failed {
                    operation: Operation::Update,
                },
            )?;
            return Err(provider_error(id, Operation::Update, e));
        }
    };

    ctx.state.update(id, &mut |entry| {
        entry.map(|e| {
            let mut e = e.updated(attributes.clone(), outputs.clone());
            e.dependencies.clone_from(&dependencies);
            e
        })
    })?;
    status.advance(id, NodeStatus::Updated)?;
    log::info!("{id}: updated");
    Ok(ApplyResult::Updated)
}

/// Delete state entries no longer declared. Returns whether every
/// deletion succeeded.
fn prune_orphans<P: ProgressCallback + ?Sized>(
    ctx: &ApplyContext<'_>,
    graph: &DependencyGraph,
    opts: &ExecuteOptions,
    policy: FailurePolicy,
    progress: &mut P,
    summary: &mut ExecuteSummary,
) -> Result<bool> {
    let orphans = orphans_in_deletion_order(graph, &ctx.state.list()?);
    if orphans.is_empty() {
        return Ok(true);
    }

    let schedule = Schedule::orphans(&orphans);
    let report = run(
        &schedule,
        Phase::Prune,
        opts,
        policy,
        progress,
        |_| "delete".to_string(),
        |node| {
            let id = &schedule.ids[node];
            let mut status = NodeStatus::Created;
            let result = destroy_node(ctx, id, &mut status);
            finish(id, status, result)
        },
    )?;
    record(summary, &schedule, &report, true);
    Ok(!report.has_failures())
}

/// Ask before changing anything; `false` means the caller should stop
fn confirm_run<C: ConfirmCallback + ?Sized>(
    opts: &ExecuteOptions,
    confirm: &mut C,
    prompt: &str,
    changes: usize,
    summary: &mut ExecuteSummary,
) -> Result<bool> {
    if opts.dry_run {
        summary.skipped = changes;
        return Ok(false);
    }
    if !confirm.confirm(prompt)? {
        summary.skipped = changes;
        return Ok(false);
    }
    Ok(true)
}

/// Apply `graph` against recorded state
///
/// Runs in up to three phases: delete undeclared state entries (when
/// `prune_orphans` is set), tear down nodes planned for replacement in
/// reverse order, then create/update every declared node in dependency
/// order. A run that does not finish cleanly returns
/// [`Error::PartialApply`]; whatever succeeded stays recorded in `state`.
pub fn apply<P, C>(
    graph: &DependencyGraph,
    state: &dyn StateStore,
    provider: &dyn Provider,
    opts: &ExecuteOptions,
    progress: &mut P,
    confirm: &mut C,
) -> Result<ExecuteSummary>
where
    P: ProgressCallback + ?Sized,
    C: ConfirmCallback + ?Sized,
{
    let plan = plan(graph, state, opts.prune_orphans)?;
    let mut summary = ExecuteSummary::default();

    if !plan.has_changes() {
        for node in &plan.nodes {
            summary.add_result(node.id.clone(), ApplyResult::NoChange, NodeStatus::Created);
        }
        return Ok(summary);
    }

    let prompt = format!("Apply {} change(s)?", plan.change_count());
    if !confirm_run(opts, confirm, &prompt, plan.change_count(), &mut summary)? {
        return Ok(summary);
    }

    let ctx = ApplyContext::new(provider, state, &opts.retry);
    let policy = opts.apply_policy();
    let mut statuses: Vec<NodeStatus> = graph
        .nodes()
        .iter()
        .map(|n| state.contains(&n.id).map(NodeStatus::initial))
        .collect::<Result<_>>()?;
    let everything = Schedule::forward(graph, vec![true; graph.len()]);

    if opts.prune_orphans && !plan.orphans.is_empty() {
        let pruned = prune_orphans(&ctx, graph, opts, policy, progress, &mut summary)?;
        if !pruned {
            skip_all(&mut summary, &everything, &statuses, "removing undeclared resources failed");
            return summary.into_result();
        }
    }

    let replacing: Vec<bool> = graph
        .nodes()
        .iter()
        .map(|n| {
            plan.get(&n.id)
                .is_some_and(|p| matches!(p.action, PlannedAction::Replace { .. }))
        })
        .collect();

    if replacing.iter().any(|&r| r) {
        let teardown = Schedule::backward(graph, replacing.clone());
        let report = run(
            &teardown,
            Phase::Teardown,
            opts,
            policy,
            progress,
            |_| "delete for replacement".to_string(),
            |node| {
                let id = &teardown.ids[node];
                let mut status = statuses[node];
                let result = destroy_node(&ctx, id, &mut status);
                finish(id, status, result)
            },
        )?;
        for (node, outcome) in &report.completed {
            statuses[*node] = outcome.status;
        }
        record(&mut summary, &teardown, &report, false);
        if report.has_failures() {
            let rest: Vec<bool> = (0..graph.len())
                .map(|i| summary.result_of(&graph.node(i).id).is_none())
                .collect();
            let rest = Schedule::forward(graph, rest);
            skip_all(&mut summary, &rest, &statuses, "removing resources to replace failed");
            return summary.into_result();
        }
    }

    let report = run(
        &everything,
        Phase::Apply,
        opts,
        policy,
        progress,
        |node| {
            plan.get(&everything.ids[node])
                .map_or_else(|| "apply".to_string(), |p| p.action.to_string())
        },
        |node| {
            let id = &everything.ids[node];
            let mut status = statuses[node];
            let result = apply_node(&ctx, graph, node, replacing[node], opts.verbose, &mut status);
            finish(id, status, result)
        },
    )?;
    record(&mut summary, &everything, &report, true);

    log::info!(
        "apply finished: {} created, {} updated, {} replaced, {} deleted, {} failed",
        summary.created,
        summary.updated,
        summary.replaced,
        summary.deleted,
        summary.failed
    );
    summary.into_result()
}

/// Destroy every node of `graph` that has a state entry, dependents first
///
/// A failed delete stops the failed node's dependency chain; unrelated
/// branches keep going (unless `opts.on_failure` says otherwise).
pub fn destroy<P, C>(
    graph: &DependencyGraph,
    state: &dyn StateStore,
    provider: &dyn Provider,
    opts: &ExecuteOptions,
    progress: &mut P,
    confirm: &mut C,
) -> Result<ExecuteSummary>
where
    P: ProgressCallback + ?Sized,
    C: ConfirmCallback + ?Sized,
{
    let plan = plan_destroy(graph, state, opts.prune_orphans)?;
    let mut summary = ExecuteSummary::default();
    if !plan.has_changes() {
        return Ok(summary);
    }

    let prompt = format!("Destroy {} resource(s)?", plan.change_count());
    if !confirm_run(opts, confirm, &prompt, plan.change_count(), &mut summary)? {
        return Ok(summary);
    }

    let ctx = ApplyContext::new(provider, state, &opts.retry);
    let policy = opts.destroy_policy();

    if opts.prune_orphans && !plan.orphans.is_empty() {
        prune_orphans(&ctx, graph, opts, policy, progress, &mut summary)?;
    }

    let recorded: Vec<bool> = graph
        .nodes()
        .iter()
        .map(|n| {
            plan.get(&n.id)
                .is_some_and(|p| p.action == PlannedAction::Delete)
        })
        .collect();
    let schedule = Schedule::backward(graph, recorded);
    let report = run(
        &schedule,
        Phase::Destroy,
        opts,
        policy,
        progress,
        |_| "destroy".to_string(),
        |node| {
            let id = &schedule.ids[node];
            let mut status = NodeStatus::Created;
            let result = destroy_node(&ctx, id, &mut status);
            finish(id, status, result)
        },
    )?;
    record(&mut summary, &schedule, &report, true);

    log::info!(
        "destroy finished: {} deleted, {} failed, {} not attempted",
        summary.deleted,
        summary.failed,
        summary.not_attempted
    );
    summary.into_result()
}

/// Check every state entry still exists remotely; drop the ones that don't
///
/// Only existence is reconciled. Attribute drift is not detected.
pub fn refresh<P>(
    state: &dyn StateStore,
    provider: &dyn Provider,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> Result<ExecuteSummary>
where
    P: ProgressCallback + ?Sized,
{
    let entries = state.list()?;
    let mut summary = ExecuteSummary::default();
    if entries.is_empty() {
        return Ok(summary);
    }

    let ctx = ApplyContext::new(provider, state, &opts.retry);
    let schedule = Schedule::unordered(entries.iter().map(|e| e.id.clone()).collect());
    let report = run(
        &schedule,
        Phase::Refresh,
        opts,
        FailurePolicy::AbortBranch,
        progress,
        |_| "read".to_string(),
        |node| {
            let entry = &entries[node];
            let id = &entry.id;
            let result = match ctx.read(id, &entry.remote_id) {
                Ok(_) => Ok(ApplyResult::NoChange),
                Err(e) if e.is_not_found() => {
                    log::warn!("{id}: no longer exists remotely, dropping from state");
                    ctx.state.delete(id).map(|_| ApplyResult::Deleted)
                }
                Err(e) => Err(provider_error(id, Operation::Read, e)),
            };
            let status = match result {
                Ok(ApplyResult::Deleted) => NodeStatus::Absent,
                _ => NodeStatus::Created,
            };
            finish(id, status, result)
        },
    )?;
    record(&mut summary, &schedule, &report, true);
    summary.into_result()
}

/// Apply without progress reporting or confirmation
pub fn apply_simple(
    graph: &DependencyGraph,
    state: &dyn StateStore,
    provider: &dyn Provider,
    opts: &ExecuteOptions,
) -> Result<ExecuteSummary> {
    use crate::context::{AutoConfirm, NoProgress};

    apply(graph, state, provider, opts, &mut NoProgress, &mut AutoConfirm)
}

/// Destroy without progress reporting or confirmation
pub fn destroy_simple(
    graph: &DependencyGraph,
    state: &dyn StateStore,
    provider: &dyn Provider,
    opts: &ExecuteOptions,
) -> Result<ExecuteSummary> {
    use crate::context::{AutoConfirm, NoProgress};

    destroy(graph, state, provider, opts, &mut NoProgress, &mut AutoConfirm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AutoDecline, NoProgress};
    use crate::error::ProviderError;
    use crate::output::{MASK, collect_outputs};
    use crate::resource::{Configuration, ResourceDeclaration};
    use crate::retry::RetryConfig;
    use crate::state::MemoryStateStore;
    use crate::testing::{Event, FakeProvider, FlakyStateStore, positions};
    use crate::types::{Literal, ResourceKind};
    use std::time::Duration;

    fn opts(jobs: usize) -> ExecuteOptions {
        ExecuteOptions {
            jobs,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(2),
            },
            ..ExecuteOptions::default()
        }
    }

    fn user(name: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(ResourceKind::User, name).with("name", name)
    }

    fn policy(name: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(ResourceKind::Policy, name)
            .with("name", name)
            .with("policy", "{\"Version\":\"2012-10-17\"}")
    }

    fn attachment(name: &str, user: &str, policy: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(ResourceKind::UserPolicyAttachment, name)
            .with_ref("user", &format!("${{user.{user}.name}}"))
            .unwrap()
            .with_ref("policy_arn", &format!("${{policy.{policy}.arn}}"))
            .unwrap()
    }

    fn access_key(user: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(ResourceKind::AccessKey, user)
            .with_ref("user", &format!("${{user.{user}.name}}"))
            .unwrap()
    }

    fn graph(decls: Vec<ResourceDeclaration>) -> DependencyGraph {
        DependencyGraph::from_configuration(&Configuration::new(decls).unwrap()).unwrap()
    }

    fn scenario() -> DependencyGraph {
        graph(vec![user("lb"), policy("ro"), attachment("lb_ro", "lb", "ro")])
    }

    fn id(s: &str) -> ResourceId {
        s.parse().unwrap()
    }

    fn ids(order: &[&ResourceId]) -> Vec<String> {
        order.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_end_to_end_user_policy_attachment() {
        let graph = scenario();
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();

        let summary = apply_simple(&graph, &state, &provider, &opts(4)).unwrap();
        assert_eq!(summary.created, 3);
        assert!(summary.nodes.iter().all(|n| n.status == NodeStatus::Created));

        let creates = provider.labels(Operation::Create);
        let at = positions(&provider.calls());
        let attach = creates.iter().find(|l| l.contains('+')).unwrap();
        assert!(at["lb"] < at[attach.as_str()]);
        assert!(at["ro"] < at[attach.as_str()]);

        assert_eq!(state.len(), 3);
        let entry = state.get(&id("user_policy_attachment.lb_ro")).unwrap().unwrap();
        assert_eq!(
            entry.inputs["policy_arn"],
            Literal::from("arn:aws:iam::123456789012:policy/ro")
        );
        assert_eq!(entry.dependencies.len(), 2);

        let summary = destroy_simple(&graph, &state, &provider, &opts(4)).unwrap();
        assert_eq!(summary.deleted, 3);
        let deletes = provider.labels(Operation::Delete);
        assert!(deletes[0].contains('+'), "attachment goes first: {deletes:?}");
        assert!(state.is_empty());
        assert_eq!(provider.object_count(), 0);
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let graph = graph(vec![
            user("lb"),
            policy("ro"),
            attachment("lb_ro", "lb", "ro"),
            access_key("lb"),
        ]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();

        apply_simple(&graph, &state, &provider, &opts(2)).unwrap();
        provider.clear_calls();

        let second = apply_simple(&graph, &state, &provider, &opts(2)).unwrap();
        assert_eq!(second.total_changes(), 0);
        assert_eq!(second.no_change, 4);
        assert_eq!(provider.count(Operation::Create), 0);
        assert_eq!(provider.count(Operation::Update), 0);
    }

    #[test]
    fn test_every_node_once_after_dependencies() {
        // a diamond plus an independent chain
        let graph = graph(vec![
            user("a"),
            policy("p"),
            attachment("a_p", "a", "p"),
            access_key("a"),
            user("b"),
            access_key("b"),
        ]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new().with_delay(Duration::from_millis(5));

        let summary = apply_simple(&graph, &state, &provider, &opts(3)).unwrap();
        let order = summary.completion_order();
        assert_eq!(order.len(), graph.len());

        let position = |id: &ResourceId| order.iter().position(|o| *o == id).unwrap();
        for node in graph.nodes() {
            for dependency in graph.dependencies_of(&node.id) {
                assert!(position(dependency) < position(&node.id));
            }
        }

        // no provider call for a node starts before its dependencies ended
        let events = provider.events();
        let start_of = |label: &str| events.iter().position(|e| *e == Event::Start(label.into()));
        let end_of = |label: &str| events.iter().position(|e| *e == Event::End(label.into()));
        assert!(end_of("a").unwrap() < start_of("a+arn:aws:iam::123456789012:policy/p").unwrap());
        assert!(end_of("p").unwrap() < start_of("a+arn:aws:iam::123456789012:policy/p").unwrap());
        assert!(provider.max_in_flight() <= 3);
    }

    #[test]
    fn test_single_job_follows_topological_order() {
        let graph = graph(vec![
            attachment("a_p", "a", "p"),
            user("a"),
            access_key("a"),
            policy("p"),
        ]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();

        let summary = apply_simple(&graph, &state, &provider, &opts(1)).unwrap();
        assert_eq!(
            ids(&summary.completion_order()),
            ids(&graph.topological_order())
        );

        let summary = destroy_simple(&graph, &state, &provider, &opts(1)).unwrap();
        assert_eq!(
            ids(&summary.completion_order()),
            ids(&graph.reverse_topological_order())
        );
    }

    #[test]
    fn test_concurrency_limit() {
        let decls: Vec<_> = (0..12).map(|i| user(&format!("u{i}"))).collect();
        let graph = graph(decls);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new().with_delay(Duration::from_millis(10));

        apply_simple(&graph, &state, &provider, &opts(3)).unwrap();
        assert!(provider.max_in_flight() <= 3);
        assert!(provider.max_in_flight() >= 2);
        assert_eq!(state.len(), 12);
    }

    #[test]
    fn test_cycle_makes_no_provider_calls() {
        let config = Configuration::new(vec![
            user("a").with_ref("path", "${user.b.arn}").unwrap(),
            user("b").with_ref("path", "${user.a.arn}").unwrap(),
        ])
        .unwrap();
        let provider = FakeProvider::new();

        let err = DependencyGraph::from_configuration(&config).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_failed_dependency_blocks_dependent() {
        let graph = graph(vec![user("a"), access_key("a"), user("b")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        provider.fail(
            Operation::Create,
            ResourceKind::User,
            Some("a"),
            ProviderError::Rejected("invalid name".into()),
        );

        let err = apply_simple(&graph, &state, &provider, &opts(1)).unwrap_err();
        let report = err.partial_report().unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].resource, id("user.a"));
        assert!(report.not_attempted.contains(&id("access_key.a")));
        assert!(provider.count(Operation::Create) >= 1);
        assert!(!provider.calls().iter().any(|c| c.kind == ResourceKind::AccessKey));
    }

    #[test]
    fn test_apply_failure_aborts_remaining_but_keeps_state() {
        let graph = graph(vec![user("a"), user("b"), user("c")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        provider.fail(
            Operation::Create,
            ResourceKind::User,
            Some("b"),
            ProviderError::Conflict("exists".into()),
        );

        let err = apply_simple(&graph, &state, &provider, &opts(1)).unwrap_err();
        let report = err.partial_report().unwrap();
        assert_eq!(report.succeeded, vec![id("user.a")]);
        assert_eq!(report.not_attempted, vec![id("user.c")]);
        assert!(state.contains(&id("user.a")).unwrap());
        assert!(!state.contains(&id("user.c")).unwrap());

        // the next run picks up where this one stopped
        let provider = FakeProvider::new();
        let summary = apply_simple(&graph, &state, &provider, &opts(1)).unwrap();
        assert_eq!(summary.no_change, 1);
        assert_eq!(summary.created, 2);
        assert!(!provider.labels(Operation::Create).contains(&"a".to_string()));
    }

    #[test]
    fn test_continue_on_error_applies_independent_branches() {
        let graph = graph(vec![user("a"), access_key("a"), user("b"), access_key("b")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        provider.fail(
            Operation::Create,
            ResourceKind::User,
            Some("a"),
            ProviderError::Rejected("nope".into()),
        );

        let mut options = opts(2);
        options.on_failure = Some(FailurePolicy::AbortBranch);
        let err = apply_simple(&graph, &state, &provider, &options).unwrap_err();
        let report = err.partial_report().unwrap();
        assert_eq!(report.not_attempted, vec![id("access_key.a")]);
        assert!(state.contains(&id("access_key.b")).unwrap());
    }

    #[test]
    fn test_destroy_failure_halts_only_its_chain() {
        let graph = graph(vec![user("a"), access_key("a"), user("b"), access_key("b")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        apply_simple(&graph, &state, &provider, &opts(2)).unwrap();

        provider.fail(
            Operation::Delete,
            ResourceKind::AccessKey,
            Some("a"),
            ProviderError::Other("boom".into()),
        );
        let err = destroy_simple(&graph, &state, &provider, &opts(2)).unwrap_err();
        let report = err.partial_report().unwrap();
        assert_eq!(report.failed[0].resource, id("access_key.a"));
        assert_eq!(report.not_attempted, vec![id("user.a")]);

        assert!(state.contains(&id("access_key.a")).unwrap());
        assert!(state.contains(&id("user.a")).unwrap());
        assert!(!state.contains(&id("access_key.b")).unwrap());
        assert!(!state.contains(&id("user.b")).unwrap());
    }

    #[test]
    fn test_throttled_calls_are_retried() {
        let graph = graph(vec![user("a")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        provider.fail_times(
            Operation::Create,
            ResourceKind::User,
            None,
            ProviderError::Throttled("rate exceeded".into()),
            2,
        );

        let summary = apply_simple(&graph, &state, &provider, &opts(1)).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(provider.count(Operation::Create), 3);
    }

    #[test]
    fn test_update_in_place() {
        let graph_v1 = graph(vec![policy("ro")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        apply_simple(&graph_v1, &state, &provider, &opts(1)).unwrap();

        let graph_v2 = graph(vec![policy("ro").with("policy", "{\"Version\":\"2012-10-17\",\"Statement\":[]}")]);
        let summary = apply_simple(&graph_v2, &state, &provider, &opts(1)).unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(provider.count(Operation::Update), 1);
        assert_eq!(summary.nodes[0].status, NodeStatus::Updated);
    }

    #[test]
    fn test_replace_recreates_node_and_dependents() {
        let v1 = scenario();
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        apply_simple(&v1, &state, &provider, &opts(2)).unwrap();
        provider.clear_calls();

        // renaming the policy changes its arn, which the attachment consumes
        let v2 = graph(vec![
            user("lb"),
            policy("ro").with("name", "ro-v2"),
            attachment("lb_ro", "lb", "ro"),
        ]);
        let summary = apply_simple(&v2, &state, &provider, &opts(2)).unwrap();
        assert_eq!(summary.replaced, 2);
        assert_eq!(summary.no_change, 1);

        let calls = provider.calls();
        let deletes: Vec<_> = calls.iter().filter(|c| c.operation == Operation::Delete).collect();
        assert_eq!(deletes[0].kind, ResourceKind::UserPolicyAttachment);
        assert_eq!(deletes[1].kind, ResourceKind::Policy);

        let entry = state.get(&id("user_policy_attachment.lb_ro")).unwrap().unwrap();
        assert_eq!(
            entry.inputs["policy_arn"],
            Literal::from("arn:aws:iam::123456789012:policy/ro-v2")
        );
    }

    #[test]
    fn test_orphans_are_pruned() {
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        apply_simple(&graph(vec![user("a"), access_key("a"), user("b")]), &state, &provider, &opts(1))
            .unwrap();

        let summary = apply_simple(&graph(vec![user("b")]), &state, &provider, &opts(1)).unwrap();
        assert_eq!(summary.deleted, 2);
        assert_eq!(provider.labels(Operation::Delete), vec!["a", "a"]);
        assert_eq!(
            provider.calls().iter().filter(|c| c.operation == Operation::Delete).map(|c| c.kind).collect::<Vec<_>>(),
            vec![ResourceKind::AccessKey, ResourceKind::User]
        );
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_dry_run_and_decline_make_no_calls() {
        let graph = scenario();
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();

        let mut dry = opts(1);
        dry.dry_run = true;
        let summary = apply_simple(&graph, &state, &provider, &dry).unwrap();
        assert_eq!(summary.skipped, 3);

        let summary = apply(&graph, &state, &provider, &opts(1), &mut NoProgress, &mut AutoDecline).unwrap();
        assert_eq!(summary.skipped, 3);
        assert!(provider.calls().is_empty());
        assert!(state.is_empty());
    }

    #[test]
    fn test_abort_stops_scheduling() {
        struct AbortAfterFirst(crate::context::AbortSignal);

        impl ProgressCallback for AbortAfterFirst {
            fn on_batch_start(&mut self, _count: usize, _phase: Phase) {}
            fn on_resource_start(&mut self, _id: &ResourceId, _description: &str) {}
            fn on_resource_complete(&mut self, _id: &ResourceId, _result: &ApplyResult) {
                self.0.abort();
            }
            fn on_batch_complete(&mut self) {}
        }

        let graph = graph(vec![user("a"), user("b"), user("c")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        let options = opts(1);
        let mut progress = AbortAfterFirst(options.abort.clone());

        let err = apply(
            &graph,
            &state,
            &provider,
            &options,
            &mut progress,
            &mut crate::context::AutoConfirm,
        )
        .unwrap_err();
        let report = err.partial_report().unwrap();
        assert!(report.aborted);
        assert_eq!(report.succeeded, vec![id("user.a")]);
        assert_eq!(report.not_attempted.len(), 2);
        assert_eq!(provider.count(Operation::Create), 1);
    }

    #[test]
    fn test_refresh_drops_missing_objects() {
        let graph = graph(vec![user("a"), user("b")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        apply_simple(&graph, &state, &provider, &opts(1)).unwrap();

        provider.delete(ResourceKind::User, "a").unwrap();
        let summary = refresh(&state, &provider, &opts(2), &mut NoProgress).unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.no_change, 1);
        assert!(!state.contains(&id("user.a")).unwrap());

        // the next apply recreates it
        let summary = apply_simple(&graph, &state, &provider, &opts(1)).unwrap();
        assert_eq!(summary.created, 1);
    }

    #[test]
    fn test_secrets_never_reach_logs_or_diffs() {
        let graph = graph(vec![user("lb"), access_key("lb")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new();
        let summary = apply_simple(&graph, &state, &provider, &opts(1)).unwrap();

        let entry = state.get(&id("access_key.lb")).unwrap().unwrap();
        let secret = entry.outputs["secret"].as_str().unwrap().to_string();
        assert!(!format!("{entry:?}").contains(&secret));
        assert!(!format!("{summary:?}").contains(&secret));

        let config = Configuration::new(vec![user("lb"), access_key("lb")])
            .unwrap()
            .with_outputs(vec![crate::output::OutputDeclaration::new(
                "secret",
                "${access_key.lb.secret}".parse::<crate::resource::AttributeRef>().unwrap(),
            )]);
        let outputs = collect_outputs(&config, &state).unwrap();
        let value = outputs[0].value.as_ref().unwrap();
        assert_eq!(value.to_string(), MASK);
        assert_eq!(value.reveal().as_str(), Some(secret.as_str()));

        // a dependent consuming the secret shows it masked in the plan
        let leaky = DependencyGraph::from_configuration(
            &Configuration::new(vec![
                user("lb"),
                access_key("lb"),
                user("odd").with_ref("path", "${access_key.lb.secret}").unwrap(),
            ])
            .unwrap(),
        )
        .unwrap();
        let text = plan(&leaky, &state, false).unwrap().to_string();
        assert!(!text.contains(&secret));
        assert!(text.contains(MASK));
    }

    #[test]
    fn test_abort_all_lets_in_flight_siblings_finish() {
        let graph = graph(vec![user("a"), user("b"), user("c"), user("d"), user("e")]);
        let state = MemoryStateStore::new();
        let provider = FakeProvider::new()
            .with_slow("a", Duration::from_millis(60))
            .with_slow("c", Duration::from_millis(60));
        provider.fail(
            Operation::Create,
            ResourceKind::User,
            Some("b"),
            ProviderError::Rejected("invalid name".into()),
        );

        let err = apply_simple(&graph, &state, &provider, &opts(3)).unwrap_err();
        let report = err.partial_report().unwrap();
        let mut succeeded = report.succeeded.clone();
        succeeded.sort();
        assert_eq!(succeeded, vec![id("user.a"), id("user.c")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].resource, id("user.b"));
        assert_eq!(report.not_attempted, vec![id("user.d"), id("user.e")]);

        assert!(state.contains(&id("user.a")).unwrap());
        assert!(state.contains(&id("user.c")).unwrap());
        assert!(!state.contains(&id("user.b")).unwrap());
        assert_eq!(provider.count(Operation::Create), 3);
    }

    #[test]
    fn test_state_write_is_retried_after_create() {
        let graph = graph(vec![user("lb")]);
        let state = FlakyStateStore::failing(id("user.lb"), 2);
        let provider = FakeProvider::new();

        let summary = apply_simple(&graph, &state, &provider, &opts(1)).unwrap();
        assert_eq!(summary.created, 1);
        assert!(state.contains(&id("user.lb")).unwrap());
        assert_eq!(provider.count(Operation::Create), 1);
    }

    #[test]
    fn test_unrecorded_create_keeps_remote_id() {
        let state = FlakyStateStore::failing(id("user.lb"), usize::MAX);
        let provider = FakeProvider::new();
        let retry = opts(1).retry;
        let ctx = ApplyContext::new(&provider, &state, &retry);
        let entry = RemoteResourceState::new(id("user.lb"), "lb", Attributes::new(), Attributes::new());

        let err = ctx.record_created(&entry).unwrap_err();
        assert!(matches!(&err, Error::UnrecordedCreate { remote_id, .. } if remote_id == "lb"));
        assert!(err.to_string().contains("created remotely as lb"));

        // Through a run, an access key id stays masked
        let graph = graph(vec![user("lb"), access_key("lb")]);
        let state = FlakyStateStore::failing(id("access_key.lb"), usize::MAX);
        let err = apply_simple(&graph, &state, &provider, &opts(1)).unwrap_err();
        let report = err.partial_report().unwrap();
        assert_eq!(report.succeeded, vec![id("user.lb")]);
        assert_eq!(report.failed[0].resource, id("access_key.lb"));
        let text = &report.failed[0].error;
        assert!(text.contains("not recorded in state"));
        assert!(text.contains(MASK));
        assert!(!text.contains("AKIA"));
        assert_eq!(provider.count(Operation::Create), 2);
    }

    #[test]
    fn test_panicking_task_ends_the_run() {
        let schedule = Schedule::unordered(vec![id("user.a"), id("user.b"), id("user.c")]);
        let options = opts(2);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run(
                &schedule,
                Phase::Apply,
                &options,
                FailurePolicy::AbortAll,
                &mut NoProgress,
                |_| String::new(),
                |node| {
                    if node == 1 {
                        panic!("provider client crashed");
                    }
                    Outcome {
                        result: ApplyResult::Created,
                        status: NodeStatus::Created,
                    }
                },
            )
        }));
        assert!(result.is_err());
    }
}
