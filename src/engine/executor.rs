//! Execution engine - terminal integration for the declarative executor

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use declarative::{
    AbortSignal, ApplyResult, ConfirmCallback, ExecuteSummary, PartialApplyReport, Phase,
    ProgressCallback, ResourceId,
};
use indicatif::ProgressBar;

use crate::progress;

// ============================================================================
// Progress
// ============================================================================

/// Progress bar per phase, one tick per finished node
pub struct UiProgress {
    bar: Option<ProgressBar>,
    quiet: bool,
    verbose: bool,
    finished: usize,
}

impl UiProgress {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self {
            bar: None,
            quiet,
            verbose,
            finished: 0,
        }
    }

    /// Nodes finished across all phases
    pub fn finished(&self) -> usize {
        self.finished
    }
}

fn result_symbol(result: &ApplyResult) -> &'static str {
    match result {
        ApplyResult::NoChange => "○",
        ApplyResult::Created
        | ApplyResult::Updated
        | ApplyResult::Replaced
        | ApplyResult::Deleted => "✓",
        ApplyResult::Failed { .. } => "✗",
        ApplyResult::NotAttempted { .. } => "⊘",
    }
}

impl ProgressCallback for UiProgress {
    fn on_batch_start(&mut self, count: usize, phase: Phase) {
        let bar = if self.quiet {
            progress::hidden()
        } else {
            progress::bar(count as u64, &phase.to_string())
        };
        self.bar = Some(bar);
    }

    fn on_resource_start(&mut self, _id: &ResourceId, description: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(description.to_string());
        }
    }

    fn on_resource_complete(&mut self, id: &ResourceId, result: &ApplyResult) {
        self.finished += 1;
        let Some(bar) = &self.bar else {
            return;
        };
        if self.verbose || matches!(result, ApplyResult::Failed { .. }) {
            let line = format!("    {} {id}", result_symbol(result));
            let line = match result {
                ApplyResult::Failed { error } => format!("{} {}", line.red(), error.dimmed()),
                _ => line,
            };
            bar.println(line);
        }
        bar.set_message(format!("{} {id}", result_symbol(result)));
        bar.inc(1);
    }

    fn on_batch_complete(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

// ============================================================================
// Confirmation
// ============================================================================

/// Asks on the terminal unless `--yes` was given
pub struct DialoguerConfirm {
    pub yes: bool,
}

impl ConfirmCallback for DialoguerConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        if self.yes {
            return Ok(true);
        }

        use dialoguer::Confirm;

        println!();
        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?;

        Ok(confirmed)
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Raise `signal` on the first Ctrl-C, exit on the second
pub fn install_abort_handler(signal: AbortSignal) -> Result<()> {
    ctrlc::set_handler(move || {
        if signal.is_aborted() {
            eprintln!();
            eprintln!("  {} Interrupted", "✗".red());
            std::process::exit(130);
        }
        signal.abort();
        eprintln!();
        eprintln!(
            "  {} Stopping after in-flight calls finish (Ctrl-C again to quit now)",
            "⚠".yellow()
        );
    })
    .context("Failed to install Ctrl-C handler")
}

// ============================================================================
// Summaries
// ============================================================================

/// Print final summary
pub fn print_summary(summary: &ExecuteSummary, what: &str) {
    println!();
    if summary.skipped > 0 && summary.total_changes() == 0 {
        println!("  {} Aborted, nothing was changed", "✗".red());
        return;
    }
    if summary.is_success() {
        println!("  {} {what} complete", "✓".green().bold());
    } else {
        println!("  {} {what} incomplete", "⚠".yellow().bold());
    }

    if summary.created > 0 {
        println!("    • {} created", summary.created);
    }
    if summary.updated > 0 {
        println!("    • {} updated in place", summary.updated);
    }
    if summary.replaced > 0 {
        println!("    • {} replaced", summary.replaced);
    }
    if summary.deleted > 0 {
        println!("    • {} destroyed", summary.deleted);
    }
    if summary.no_change > 0 {
        println!("    • {} unchanged", summary.no_change);
    }
    if summary.failed > 0 {
        println!("    • {} {}", summary.failed, "failed".red());
    }
    if summary.not_attempted > 0 {
        println!("    • {} not attempted", summary.not_attempted);
    }
}

/// Print what a stopped run left behind
pub fn print_partial(report: &PartialApplyReport) {
    println!();
    let headline = if report.aborted {
        "Run aborted"
    } else {
        "Run stopped after a failure"
    };
    println!("  {} {headline}", "✗".red().bold());
    println!(
        "    {} succeeded, {} failed, {} not attempted",
        report.succeeded.len().to_string().green(),
        report.failed.len().to_string().red(),
        report.not_attempted.len()
    );

    for failure in &report.failed {
        println!("    {} {}: {}", "✗".red(), failure.resource, failure.error);
    }
    for id in &report.not_attempted {
        println!("    {} {}", "⊘".dimmed(), id.to_string().dimmed());
    }
    println!();
    println!(
        "  {}",
        "Completed resources were recorded in state; run apply again to resume.".dimmed()
    );
}
