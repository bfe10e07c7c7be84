//! `apply`, `destroy` and `refresh`

use anyhow::{Result, bail};
use declarative::{AbortSignal, ExecuteOptions, ExecuteSummary, FailurePolicy, RetryConfig};

use super::Workspace;
use super::plan::compute;
use crate::Context;
use crate::cli::{ApplyArgs, DestroyArgs};
use crate::engine::{
    DialoguerConfirm, UiProgress, display_plan, install_abort_handler, print_partial,
    print_summary,
};
use crate::provider;
use crate::ui;

fn options(
    ctx: &Context,
    ws: &Workspace,
    jobs: Option<usize>,
    target: Option<&str>,
) -> Result<ExecuteOptions> {
    let jobs = jobs.unwrap_or(ws.config.settings.jobs);
    if jobs == 0 {
        bail!("--jobs must be at least 1");
    }

    let abort = AbortSignal::new();
    // Only one handler per process
    if let Err(e) = install_abort_handler(abort.clone()) {
        log::debug!("{e:#}");
    }

    Ok(ExecuteOptions {
        dry_run: false,
        jobs,
        verbose: ctx.verbose > 0,
        on_failure: None,
        prune_orphans: target.is_none(),
        retry: RetryConfig::default(),
        abort,
    })
}

/// Print the outcome; a partial run is reported and turned into an error exit
fn finish(result: declarative::Result<ExecuteSummary>, what: &str) -> Result<()> {
    match result {
        Ok(summary) => {
            print_summary(&summary, what);
            Ok(())
        }
        Err(err) => match err.partial_report() {
            Some(report) => {
                print_partial(report);
                bail!("{what} did not complete");
            }
            None => Err(err.into()),
        },
    }
}

// ============================================================================
// Apply
// ============================================================================

pub fn apply(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let target = args.target.as_deref();
    let (graph, plan) = compute(&ws, target, false)?;

    display_plan(&plan, "Execution Plan");
    if !plan.has_changes() {
        return Ok(());
    }
    if args.dry_run {
        println!();
        ui::info("Dry run - no changes made");
        return Ok(());
    }

    let mut opts = options(ctx, &ws, args.jobs, target)?;
    if args.continue_on_error {
        opts.on_failure = Some(FailurePolicy::AbortBranch);
    }

    let iam = provider::open(&ws.config)?;
    let mut progress = UiProgress::new(ctx.quiet, ctx.verbose > 0);
    let mut confirm = DialoguerConfirm { yes: args.yes };

    let result = declarative::apply(&graph, &ws.state, &iam, &opts, &mut progress, &mut confirm);
    finish(result, "Apply")
}

// ============================================================================
// Destroy
// ============================================================================

pub fn destroy(ctx: &Context, args: &DestroyArgs) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let target = args.target.as_deref();
    let (graph, plan) = compute(&ws, target, true)?;

    display_plan(&plan, "Destroy Plan");
    if !plan.has_changes() {
        return Ok(());
    }
    if args.dry_run {
        println!();
        ui::info("Dry run - no changes made");
        return Ok(());
    }

    let opts = options(ctx, &ws, args.jobs, target)?;
    let iam = provider::open(&ws.config)?;
    let mut progress = UiProgress::new(ctx.quiet, ctx.verbose > 0);
    let mut confirm = DialoguerConfirm { yes: args.yes };

    let result = declarative::destroy(&graph, &ws.state, &iam, &opts, &mut progress, &mut confirm);
    finish(result, "Destroy")
}

// ============================================================================
// Refresh
// ============================================================================

pub fn refresh(ctx: &Context, jobs: Option<usize>) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let opts = options(ctx, &ws, jobs, None)?;
    let iam = provider::open(&ws.config)?;
    let mut progress = UiProgress::new(ctx.quiet, ctx.verbose > 0);

    let summary = match declarative::refresh(&ws.state, &iam, &opts, &mut progress) {
        Ok(summary) => summary,
        Err(err) => return finish(Err(err), "Refresh"),
    };

    if summary.deleted == 0 {
        ui::success(&format!(
            "All {} still exist",
            ui::plural(summary.no_change, "resource")
        ));
    } else {
        ui::warn(&format!(
            "Dropped {} from state that no longer exist remotely",
            ui::plural(summary.deleted, "resource")
        ));
    }
    Ok(())
}
